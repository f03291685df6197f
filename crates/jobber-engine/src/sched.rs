//! Cron scheduler facade.
//!
//! Wraps [`tokio_cron_scheduler::JobScheduler`] with the features the
//! engine needs on top: a tag index for bulk removal, an option to run a
//! job once at registration, and an after-run hook fired after every
//! completed run.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::error;
use uuid::Uuid;

/// The unit of scheduled work. Each invocation builds a fresh future, so
/// one job can run concurrently with its own previous tick.
pub type Task = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub type AfterRunHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Default)]
pub struct JobOptions {
    /// Run the task once at registration, in addition to the cron schedule.
    pub start_immediately: bool,
    /// Strings attached to the job, used for bulk removal.
    pub tags: Vec<String>,
    /// Invoked after each run completes, including the immediate one.
    pub after_run: Option<AfterRunHook>,
}

#[derive(Debug, Error)]
#[error("scheduler error: {0}")]
pub struct SchedulerError(#[from] JobSchedulerError);

pub struct CronScheduler {
    inner: JobScheduler,
    tags: Mutex<HashMap<Uuid, Vec<String>>>,
}

impl CronScheduler {
    pub async fn new() -> Result<Self, SchedulerError> {
        Ok(Self {
            inner: JobScheduler::new().await?,
            tags: Mutex::new(HashMap::new()),
        })
    }

    /// Install a job triggering at every match of a standard 5-field cron
    /// expression (no seconds field).
    pub async fn new_cron_job(
        &self,
        expression: &str,
        task: Task,
        options: JobOptions,
    ) -> Result<Uuid, SchedulerError> {
        let after_run = options.after_run.clone();
        let run: Task = Arc::new(move || {
            let task = task.clone();
            let after_run = after_run.clone();
            Box::pin(async move {
                task().await;
                if let Some(hook) = &after_run {
                    hook();
                }
            })
        });

        // The installed tokio-cron-scheduler always requires a seconds
        // field; our callers use standard 5-field expressions, so prepend
        // a "run at second 0" field rather than changing every caller.
        let expression = format!("0 {expression}");
        let job_run = run.clone();
        let job = Job::new_async(expression.as_str(), move |_id, _sched| job_run())?;
        let id = self.inner.add(job).await?;
        self.tags.lock().await.insert(id, options.tags);

        if options.start_immediately {
            tokio::spawn(run());
        }

        Ok(id)
    }

    /// Remove every job whose tag set contains `tag`.
    pub async fn remove_by_tag(&self, tag: &str) {
        let ids: Vec<Uuid> = {
            let mut tags = self.tags.lock().await;
            let ids: Vec<Uuid> = tags
                .iter()
                .filter(|(_, set)| set.iter().any(|t| t == tag))
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                tags.remove(id);
            }
            ids
        };

        for id in ids {
            if let Err(err) = self.inner.remove(&id).await {
                error!(job_id = %id, error = %err, "failed to remove scheduled job");
            }
        }
    }

    pub async fn job_count(&self) -> usize {
        self.tags.lock().await.len()
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        Ok(self.inner.start().await?)
    }

    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        Ok(self.inner.clone().shutdown().await?)
    }
}
