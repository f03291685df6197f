//! Query lifecycle orchestration.
//!
//! [`Jobber`] owns the scheduled scraping of job offers for user-defined
//! search queries: it creates queries and runs their initial scrape with a
//! deadline, keeps one hourly cron job per `(query, source)` pair,
//! persists deduplicated offers, expires queries whose feed nobody reads,
//! and prunes offers that fell out of the feed window.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use jobber_core::{Offer, Query, QUERY_TTL_DAYS};
use jobber_metrics::AppMetrics;
use jobber_scrape::Registry;
use jobber_store::{Store, StoreError};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub mod sched;

use sched::{AfterRunHook, CronScheduler, JobOptions, SchedulerError, Task};

pub const CRATE_NAME: &str = "jobber-engine";

/// Every day at 2:00 am.
const PRUNE_CRON: &str = "0 2 * * *";

const DEFAULT_INITIAL_SCRAPE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("query not found")]
    NotFound,
    #[error("initial scrape timed out")]
    TimedOut,
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => EngineError::NotFound,
            other => EngineError::Store(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobberConfig {
    /// How long `create_query` blocks its caller on the initial scrape.
    pub initial_scrape_timeout: Duration,
}

impl Default for JobberConfig {
    fn default() -> Self {
        Self {
            initial_scrape_timeout: DEFAULT_INITIAL_SCRAPE_TIMEOUT,
        }
    }
}

pub struct Jobber {
    cancel: CancellationToken,
    store: Arc<Store>,
    sched: CronScheduler,
    sources: Registry,
    metrics: Arc<AppMetrics>,
    initial_scrape_timeout: Duration,
    closed: AtomicBool,
    /// Handle to ourselves for job closures. Weak, so the scheduler's
    /// jobs never keep the orchestrator alive.
    me: Weak<Jobber>,
}

impl Jobber {
    /// Build the orchestrator, reschedule every persisted query, register
    /// the nightly offer pruning job and start the scheduler.
    pub async fn start(
        store: Arc<Store>,
        sources: Registry,
        metrics: Arc<AppMetrics>,
        config: JobberConfig,
    ) -> Result<Arc<Self>, EngineError> {
        let sched = CronScheduler::new().await?;
        let jobber = Arc::new_cyclic(|me| Self {
            cancel: CancellationToken::new(),
            store,
            sched,
            sources,
            metrics,
            initial_scrape_timeout: config.initial_scrape_timeout,
            closed: AtomicBool::new(false),
            me: me.clone(),
        });

        match jobber.store.list_queries(&jobber.cancel).await {
            Ok(queries) => {
                for query in &queries {
                    jobber.schedule_query(query, false, None).await;
                }
            }
            Err(err) => error!(error = %err, "unable to list queries for initial scheduling"),
        }
        jobber.schedule_prune().await;
        jobber.sched.start().await?;

        Ok(jobber)
    }

    /// Stop accepting background work: cancel in-flight scrapes and drain
    /// the scheduler. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        if let Err(err) = self.sched.shutdown().await {
            error!(error = %err, "failed to shutdown scheduler");
        }
    }

    /// A token tied to the process lifetime, for request-scoped work that
    /// should stop when the orchestrator does.
    pub fn child_cancellation(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Create a new query, run it immediately and schedule it for future
    /// runs. Creating a query that already exists is not an error: the
    /// caller can form the feed URL either way.
    ///
    /// Blocks until every source finished its first run or the configured
    /// deadline passed. A deadline does not cancel the scrapes; they keep
    /// populating the feed for the next reader.
    pub async fn create_query(&self, keywords: &str, location: &str) -> Result<(), EngineError> {
        let query = match self.store.create_query(&self.cancel, keywords, location).await {
            Err(StoreError::UniqueViolation) => return Ok(()),
            Err(err) => return Err(err.into()),
            Ok(query) => query,
        };
        info!(query_id = query.id, keywords, location, "created new query");
        self.metrics
            .new_queries_total
            .with_label_values(&[keywords, location])
            .inc();

        if self.sources.is_empty() {
            return Ok(());
        }

        let pending = Arc::new(AtomicUsize::new(self.sources.len()));
        let done = Arc::new(Notify::new());
        let hook: AfterRunHook = {
            let pending = pending.clone();
            let done = done.clone();
            // The hook stays attached to the job and fires on every later
            // cron tick too; the saturating decrement keeps those no-ops.
            Arc::new(move || {
                let left = pending.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    n.checked_sub(1)
                });
                if left == Ok(1) {
                    done.notify_one();
                }
            })
        };

        self.schedule_query(&query, true, Some(hook)).await;

        tokio::select! {
            _ = done.notified() => Ok(()),
            _ = tokio::time::sleep(self.initial_scrape_timeout) => {
                info!(keywords, location, "initial scrape exceeded its deadline");
                Err(EngineError::TimedOut)
            }
            _ = self.cancel.cancelled() => Err(EngineError::TimedOut),
        }
    }

    /// The offers posted in the last week for a query's keywords and
    /// location, newest first, together with the query's freshness
    /// timestamp. An unknown query is [`EngineError::NotFound`].
    pub async fn list_offers(
        &self,
        cancel: &CancellationToken,
        keywords: &str,
        location: &str,
    ) -> Result<(Vec<Offer>, Option<DateTime<Utc>>), EngineError> {
        let query = self.store.get_query(cancel, keywords, location).await?;
        if let Err(err) = self.store.update_queried_at(cancel, query.id).await {
            error!(query_id = query.id, error = %err, "unable to update query timestamp");
        }
        let offers = self.store.list_offers(cancel, query.id).await?;
        Ok((offers, query.updated_at))
    }

    /// One scheduled tick for a `(query, source)` pair.
    async fn run_query(&self, query_id: i64, source_name: &str) {
        let Some(source) = self.sources.get(source_name) else {
            error!(query_id, source = source_name, "unable to find source for scheduled run");
            return;
        };

        let query = match self
            .store
            .get_query_with_source_status(&self.cancel, query_id, source_name)
            .await
        {
            Ok(query) => query,
            Err(err) => {
                error!(query_id, source = source_name, error = %err, "unable to load query for scheduled run");
                return;
            }
        };

        // Queries whose feed nobody read for a week are removed together
        // with their scheduled jobs.
        if Utc::now() - query.queried_at > ChronoDuration::days(QUERY_TTL_DAYS) {
            if let Err(err) = self.store.delete_query(&self.cancel, query.id).await {
                error!(query_id = query.id, error = %err, "unable to delete expired query");
            }
            self.sched.remove_by_tag(&query.tag()).await;
            self.metrics
                .scheduled_queries
                .with_label_values(&[&query.id.to_string(), &query.tag(), ""])
                .dec();
            info!(
                query_id = query.id,
                keywords = %query.keywords,
                location = %query.location,
                "deleting unused query",
            );
            return;
        }

        let (offers, err) = source.scrape(self.cancel.clone(), &query).await;
        if let Some(err) = err {
            // Scrapers can return partial results; the error is logged and
            // whatever offers came back are ingested anyway.
            error!(query_id = query.id, source = source_name, error = %err, "scrape failed");
        }

        if !offers.is_empty() {
            for offer in &offers {
                if let Err(err) = self.store.create_offer(&self.cancel, offer).await {
                    error!(query_id = query.id, offer_id = %offer.id, error = %err, "unable to create offer");
                    continue;
                }
                if let Err(err) = self
                    .store
                    .create_query_offer_assoc(&self.cancel, query.id, &offer.id)
                    .await
                {
                    error!(query_id = query.id, offer_id = %offer.id, error = %err, "unable to create query offer association");
                }
            }
            if let Err(err) = self
                .store
                .update_source_scraped_at(&self.cancel, query.id, source_name)
                .await
            {
                error!(query_id = query.id, source = source_name, error = %err, "unable to update scrape timestamp");
            }
        }

        debug!(
            query_id = query.id,
            keywords = %query.keywords,
            location = %query.location,
            source = source_name,
            "completed scheduled scrape run",
        );
    }

    /// Register one cron job per source for the query, all placed on the
    /// minute derived from `created_at` so load spreads over the hour
    /// while each pair still runs once per hour.
    async fn schedule_query(
        &self,
        query: &Query,
        start_immediately: bool,
        after_run: Option<AfterRunHook>,
    ) {
        let cron = cron_expression(query.created_at);

        for name in self.sources.names() {
            let me = self.me.clone();
            let query_id = query.id;
            let task: Task = Arc::new(move || {
                let me = me.clone();
                Box::pin(async move {
                    if let Some(jobber) = me.upgrade() {
                        jobber.run_query(query_id, name).await;
                    }
                })
            });
            let options = JobOptions {
                start_immediately,
                tags: vec![query.tag(), name.to_string()],
                after_run: after_run.clone(),
            };

            match self.sched.new_cron_job(&cron, task, options).await {
                Ok(_) => {
                    self.metrics
                        .scheduled_queries
                        .with_label_values(&[&query.id.to_string(), &query.tag(), &cron])
                        .inc();
                    info!(query_id = query.id, source = name, cron = %cron, "scheduled query");
                }
                Err(err) => {
                    // The query stays persisted; a restart reschedules it.
                    error!(query_id = query.id, source = name, error = %err, "unable to schedule query");
                }
            }
        }
    }

    async fn schedule_prune(&self) {
        let me = self.me.clone();
        let task: Task = Arc::new(move || {
            let me = me.clone();
            Box::pin(async move {
                let Some(jobber) = me.upgrade() else { return };
                match jobber.store.delete_old_offers(&jobber.cancel).await {
                    Ok(deleted) if deleted > 0 => info!(deleted, "pruned old offers"),
                    Ok(_) => {}
                    Err(err) => error!(error = %err, "unable to delete old offers"),
                }
            })
        });
        let options = JobOptions {
            start_immediately: true,
            ..Default::default()
        };
        if let Err(err) = self.sched.new_cron_job(PRUNE_CRON, task, options).await {
            error!(error = %err, "unable to schedule the offer pruning job");
        }
    }
}

fn cron_expression(created_at: DateTime<Utc>) -> String {
    format!("{} * * * *", created_at.minute())
}
