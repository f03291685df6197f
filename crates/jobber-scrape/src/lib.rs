//! Source adapter contract and the registered job portal scrapers.
//!
//! A [`Source`] turns one `(query, source)` pair into offer parameters
//! ready for insertion. Partial success is part of the contract: an
//! adapter may hand back offers it already collected together with the
//! error that stopped it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use jobber_core::{OfferParams, QueryView};
use jobber_metrics::AppMetrics;
use reqwest::StatusCode;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod glassdoor;
pub mod linkedin;
pub mod mock;
pub mod retry;
pub mod stepstone;

use retry::RetryError;

pub const CRATE_NAME: &str = "jobber-scrape";

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Retry(#[from] RetryError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to decode payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("scrape cancelled")]
    Cancelled,
    #[error("{0}")]
    Message(String),
    #[error("{}", format_errors(.0))]
    Multi(Vec<ScrapeError>),
}

impl ScrapeError {
    /// Leaf errors, with [`ScrapeError::Multi`] nodes flattened out, so a
    /// combined fan-out error stays inspectable.
    pub fn flatten(&self) -> Vec<&ScrapeError> {
        match self {
            ScrapeError::Multi(errs) => errs.iter().flat_map(|e| e.flatten()).collect(),
            other => vec![other],
        }
    }

    pub fn is_retries_exhausted(&self) -> bool {
        self.flatten()
            .iter()
            .any(|e| matches!(e, ScrapeError::Retry(RetryError::RetriesExhausted { .. })))
    }
}

fn format_errors(errs: &[ScrapeError]) -> String {
    errs.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Collapse collected fan-out errors into a single combined error.
pub fn combine_errors(mut errs: Vec<ScrapeError>) -> Option<ScrapeError> {
    match errs.len() {
        0 => None,
        1 => errs.pop(),
        _ => Some(ScrapeError::Multi(errs)),
    }
}

/// One pluggable scraper for an external job portal.
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &'static str;

    /// Scrape offers for the query. A non-empty offer list may accompany
    /// an error: the caller ingests the offers and logs the error.
    async fn scrape(
        &self,
        cancel: CancellationToken,
        query: &QueryView,
    ) -> (Vec<OfferParams>, Option<ScrapeError>);
}

/// Name-keyed mapping of registered sources.
#[derive(Clone, Default)]
pub struct Registry {
    sources: HashMap<&'static str, Arc<dyn Source>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every real portal adapter.
    pub fn production(metrics: Arc<AppMetrics>) -> Self {
        Self::new()
            .with_source(Arc::new(linkedin::LinkedIn::new(metrics)))
            .with_source(Arc::new(stepstone::Stepstone::new()))
            .with_source(Arc::new(glassdoor::Glassdoor::new()))
    }

    pub fn with_source(mut self, source: Arc<dyn Source>) -> Self {
        self.sources.insert(source.name(), source);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Source>> {
        self.sources.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.sources.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Fan out to every registered source in parallel and aggregate the
    /// partial results. Individual errors are collected and combined; the
    /// original kinds stay reachable through [`ScrapeError::flatten`].
    pub async fn scrape_all(
        &self,
        cancel: CancellationToken,
        query: &QueryView,
    ) -> (Vec<OfferParams>, Option<ScrapeError>) {
        let runs = self.sources.values().map(|source| {
            let cancel = cancel.clone();
            async move { source.scrape(cancel, query).await }
        });

        let mut offers = Vec::new();
        let mut errs = Vec::new();
        for (partial, err) in futures::future::join_all(runs).await {
            offers.extend(partial);
            if let Some(err) = err {
                errs.push(err);
            }
        }

        (offers, combine_errors(errs))
    }
}
