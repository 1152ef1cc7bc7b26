//! Registration of recurring jobs at startup.
//!
//! Recurring jobs are stored as repeatable entries in the broker keyed by job type and interval, so
//! every worker process can run [`Scheduler::ensure`] at boot without creating duplicates. Once
//! registered, each claimed iteration enqueues the next one; nothing here runs on a timer.
use chrono::TimeDelta;
use serde_json::Value;

use crate::{
    job::{JobId, Repeat},
    queue::{JobOptions, Queue},
    DroverError,
};

/// A job that runs every `every`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurringJob {
    pub type_name: String,
    pub payload: Value,
    pub every: TimeDelta,
    pub priority: Option<u32>,
}

impl RecurringJob {
    pub fn new(type_name: impl Into<String>, every: TimeDelta) -> Self {
        Self {
            type_name: type_name.into(),
            payload: Value::Null,
            every,
            priority: None,
        }
    }

    pub fn with_payload(self, payload: Value) -> Self {
        Self { payload, ..self }
    }

    pub fn with_priority(self, priority: u32) -> Self {
        Self {
            priority: Some(priority),
            ..self
        }
    }

    pub fn repeat(&self) -> Repeat {
        Repeat::every(self.every)
    }
}

/// The set of recurring jobs a process needs.
///
/// # Example
///
/// ```
/// # use drover::prelude::*;
/// # use drover::backend::memory::InMemoryBackend;
/// # use chrono::TimeDelta;
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let queue = Queue::new("example", InMemoryBackend::new());
/// let scheduler = Scheduler::new()
///     .with_job(RecurringJob::new("sync-read-positions", TimeDelta::seconds(60)));
///
/// let first = scheduler.ensure(&queue).await.unwrap();
/// let again = scheduler.ensure(&queue).await.unwrap();
///
/// assert_eq!(first, again);
/// assert_eq!(queue.repeatables().await.unwrap().len(), 1);
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    jobs: Vec<RecurringJob>,
}

impl Scheduler {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_job(mut self, job: RecurringJob) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn jobs(&self) -> &[RecurringJob] {
        &self.jobs
    }

    /// Registers every recurring job that is not registered yet. Returns the id of the pending
    /// iteration of each job, in registration order.
    pub async fn ensure(&self, queue: &Queue) -> Result<Vec<JobId>, DroverError> {
        let mut ids = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            let id = queue
                .enqueue(
                    &job.type_name,
                    job.payload.clone(),
                    JobOptions {
                        priority: job.priority,
                        repeat: Some(job.repeat()),
                        ..Default::default()
                    },
                )
                .await
                .inspect_err(|err| {
                    tracing::error!(
                        ?err,
                        type_name = %job.type_name,
                        "Failed to register recurring job {}, error: {err}",
                        job.type_name
                    )
                })?;
            tracing::info!(
                type_name = %job.type_name,
                every_ms = job.repeat().interval_ms(),
                job_id = %id,
                "Recurring job registered"
            );
            ids.push(id);
        }
        Ok(ids)
    }

    /// Unregisters a recurring job. Returns `false` if it was not registered.
    pub async fn remove(
        queue: &Queue,
        type_name: &str,
        every: TimeDelta,
    ) -> Result<bool, DroverError> {
        let removed = queue.remove_repeatable(type_name, Repeat::every(every)).await?;
        if removed {
            tracing::info!(type_name, "Recurring job removed");
        }
        Ok(removed)
    }
}
