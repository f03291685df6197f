//! Deterministic source doubles for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jobber_core::{OfferParams, QueryView};
use tokio_util::sync::CancellationToken;

use crate::{ScrapeError, Source};

type ErrorFactory = Arc<dyn Fn() -> ScrapeError + Send + Sync>;

/// A scripted source. Depending on construction it produces one synthetic
/// offer per call (with an id stable across calls, so repeat scrapes
/// exercise idempotent inserts), a fixed offer list, an error, or any
/// combination for partial-success scenarios.
pub struct MockSource {
    name: &'static str,
    offers: Option<Vec<OfferParams>>,
    error: Option<ErrorFactory>,
    calls: AtomicUsize,
}

impl MockSource {
    /// One synthetic offer per call, derived from the query.
    pub fn synthetic(name: &'static str) -> Self {
        Self {
            name,
            offers: None,
            error: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// A fixed offer list on every call.
    pub fn returning(name: &'static str, offers: Vec<OfferParams>) -> Self {
        Self {
            name,
            offers: Some(offers),
            error: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// No offers, only an error.
    pub fn failing(name: &'static str) -> Self {
        Self::returning(name, Vec::new())
            .with_error(|| ScrapeError::Message("mock scrape failed".to_string()))
    }

    /// Attach an error emitted alongside whatever offers are configured.
    pub fn with_error(mut self, factory: impl Fn() -> ScrapeError + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(factory));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for MockSource {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn scrape(
        &self,
        _cancel: CancellationToken,
        query: &QueryView,
    ) -> (Vec<OfferParams>, Option<ScrapeError>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let offers = match &self.offers {
            Some(offers) => offers.clone(),
            None => vec![OfferParams {
                id: format!("{}:{}:{}", self.name, query.keywords, query.location),
                title: format!("{} jobs in {}", query.keywords, query.location),
                company: "Mock GmbH".to_string(),
                location: query.location.clone(),
                posted_at: Utc::now(),
                description: String::new(),
                source: self.name.to_string(),
                url: format!("https://example.com/{}", self.name),
            }],
        };
        (offers, self.error.as_ref().map(|factory| factory()))
    }
}

/// Sleeps before answering, for deadline tests. Observes cancellation.
pub struct DelaySource {
    name: &'static str,
    delay: Duration,
}

impl DelaySource {
    pub fn new(name: &'static str, delay: Duration) -> Self {
        Self { name, delay }
    }
}

#[async_trait]
impl Source for DelaySource {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn scrape(
        &self,
        cancel: CancellationToken,
        _query: &QueryView,
    ) -> (Vec<OfferParams>, Option<ScrapeError>) {
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => (Vec::new(), None),
            _ = cancel.cancelled() => (Vec::new(), Some(ScrapeError::Cancelled)),
        }
    }
}
