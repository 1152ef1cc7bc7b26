//! The queue client shared by producers and workers.
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::{
    backend::{Backend, EnqueuableJob, ExecutionError, Page, Stalled, StateCounts},
    backoff::{Backoff, Strategy},
    events::QueueEvent,
    job::{
        builder::JobBuilder, Job, JobId, JobState, Repeat, RepeatableEntry, RetentionPolicy,
        MAX_PRIORITY,
    },
    DroverError,
};

type Result<T> = std::result::Result<T, DroverError>;

/// Defaults applied to every job enqueued through a [`Queue`] unless overridden per job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDefaults {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub retention: RetentionPolicy,
    /// How long a claim is held before the job is considered stalled.
    pub lock_duration: TimeDelta,
}

impl JobDefaults {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    pub const DEFAULT_LOCK_DURATION: TimeDelta = TimeDelta::seconds(30);
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::DEFAULT,
            retention: RetentionPolicy::DEFAULT,
            lock_duration: Self::DEFAULT_LOCK_DURATION,
        }
    }
}

/// Per job options for [`Queue::enqueue`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOptions {
    /// `0` or `None` for no priority, otherwise lower runs first. At most [`MAX_PRIORITY`].
    pub priority: Option<u32>,
    /// Do not run before this much time has passed.
    pub delay: Option<TimeDelta>,
    /// Run repeatedly on this interval. Takes precedence over `owner` and `id`.
    pub repeat: Option<Repeat>,
    /// Derive a deterministic id from the job type and this owner with [`JobId::derive`].
    pub owner: Option<String>,
    /// An explicit id. Takes precedence over `owner`.
    pub id: Option<JobId>,
    pub max_attempts: Option<u32>,
    pub backoff: Option<Backoff>,
    pub retention: Option<RetentionPolicy>,
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { retry_at: DateTime<Utc> },
    Failed,
}

/// A handle to a named queue on a [`Backend`].
///
/// Cheap to clone, clones share the backend connection.
#[derive(Clone)]
pub struct Queue {
    name: Arc<str>,
    backend: Arc<dyn Backend>,
    defaults: Arc<JobDefaults>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl Queue {
    pub fn new(name: impl Into<String>, backend: impl Backend + 'static) -> Self {
        Self::with_backend(name, Arc::new(backend))
    }

    pub fn with_backend(name: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self {
            name: name.into().into(),
            backend,
            defaults: Default::default(),
        }
    }

    pub fn with_defaults(self, defaults: JobDefaults) -> Self {
        Self {
            defaults: Arc::new(defaults),
            ..self
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn defaults(&self) -> &JobDefaults {
        &self.defaults
    }

    /// Starts building a job of `type_name`.
    pub fn job(&self, type_name: impl Into<String>, payload: serde_json::Value) -> JobBuilder<'_> {
        JobBuilder::new(self, type_name.into(), payload)
    }

    /// Starts building a job of `type_name` whose payload is `data` encoded as json.
    pub fn job_with_data<T: Serialize>(
        &self,
        type_name: impl Into<String>,
        data: &T,
    ) -> Result<JobBuilder<'_>> {
        Ok(self.job(type_name, serde_json::to_value(data)?))
    }

    /// Adds a job and returns its id.
    ///
    /// When the job carries an id (explicit or derived from an owner) and a pending job with the
    /// same id exists, nothing is added and the existing id is returned.
    ///
    /// A repeating job registers a repeatable entry keyed by type and interval and enqueues its
    /// first iteration at the next interval boundary. Registering the same entry again returns the
    /// id of its pending iteration, enqueuing it again if it went missing.
    #[tracing::instrument(skip(self, payload, options), fields(queue = %self.name))]
    pub async fn enqueue(
        &self,
        type_name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId> {
        let priority = options.priority.unwrap_or_default();
        if priority > MAX_PRIORITY {
            return Err(DroverError::InvalidOptions(format!(
                "priority {priority} exceeds the maximum of {MAX_PRIORITY}"
            )));
        }
        let max_attempts = options.max_attempts.unwrap_or(self.defaults.max_attempts);
        if max_attempts == 0 {
            return Err(DroverError::InvalidOptions(
                "max_attempts must be at least 1".to_owned(),
            ));
        }
        if options.delay.is_some_and(|delay| delay < TimeDelta::zero()) {
            return Err(DroverError::InvalidOptions(
                "delay must not be negative".to_owned(),
            ));
        }

        let now = Utc::now();
        let mut job = EnqueuableJob {
            id: options
                .id
                .or_else(|| options.owner.map(|owner| JobId::derive(type_name, &owner))),
            type_name: type_name.to_owned(),
            payload,
            priority,
            max_attempts,
            backoff: options.backoff.unwrap_or(self.defaults.backoff),
            repeat: options.repeat,
            retention: options.retention.unwrap_or(self.defaults.retention),
            scheduled_at: options
                .delay
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(now),
        };

        if let Some(repeat) = options.repeat {
            if repeat.interval_ms() == 0 {
                return Err(DroverError::InvalidOptions(
                    "repeat interval must be at least 1ms".to_owned(),
                ));
            }
            let mut entry =
                RepeatableEntry::new(type_name, repeat, repeat.next_after(job.scheduled_at));
            if !self.backend.add_repeatable(entry.clone()).await? {
                tracing::debug!(key = %entry.key, "Repeatable job already registered");
                if let Some(existing) = self.backend.repeatable(&entry.key).await? {
                    entry = existing;
                }
            }
            // A pending iteration deduplicates, a missing one is enqueued again.
            job.id = Some(entry.next_job_id());
            job.scheduled_at = entry.next_run_at;
        }

        let enqueued = self.backend.enqueue(job).await?;
        if !enqueued.inserted {
            tracing::debug!(job_id = %enqueued.id, "Job already pending, not enqueued again");
        }
        Ok(enqueued.id)
    }

    /// Claims the next ready job for processing.
    ///
    /// Claiming an iteration of a repeatable job enqueues the following iteration, unless the
    /// entry has been removed in the meantime.
    pub async fn dequeue_next(&self) -> Result<Option<Job>> {
        let Some(job) = self.backend.claim_next(self.defaults.lock_duration).await? else {
            return Ok(None);
        };
        if let Some(repeat) = job.repeat {
            if let Err(error) = self.schedule_next_iteration(&job, repeat).await {
                tracing::error!(?error, job_id = %job.id, "Failed to schedule next iteration: {error}");
            }
        }
        Ok(Some(job))
    }

    async fn schedule_next_iteration(&self, job: &Job, repeat: Repeat) -> Result<()> {
        let key = repeat.key(&job.type_name);
        let next_run_at = repeat.next_after(Utc::now().max(job.scheduled_at));
        if !self.backend.advance_repeatable(&key, next_run_at).await? {
            tracing::debug!(%key, "Repeatable entry removed, not scheduling another iteration");
            return Ok(());
        }
        let enqueued = self
            .backend
            .enqueue(EnqueuableJob {
                id: Some(JobId::repeat_iteration(&key, next_run_at)),
                type_name: job.type_name.clone(),
                payload: job.payload.clone(),
                priority: job.priority,
                max_attempts: job.max_attempts,
                backoff: job.backoff,
                repeat: Some(repeat),
                retention: job.retention,
                scheduled_at: next_run_at,
            })
            .await?;
        tracing::debug!(job_id = %enqueued.id, %next_run_at, "Scheduled next iteration");
        Ok(())
    }

    /// Marks a claimed job as completed with `return_value`.
    pub async fn report_success(&self, job: &Job, return_value: serde_json::Value) -> Result<()> {
        Ok(self
            .backend
            .mark_job_complete(&job.id, job.attempts_made, return_value)
            .await?)
    }

    /// Records a failed attempt of a claimed job.
    ///
    /// The job is retried after its backoff delay while attempts remain, otherwise it is failed.
    pub async fn report_failure(&self, job: &Job, error: ExecutionError) -> Result<FailureOutcome> {
        if job.is_final_attempt() {
            self.backend
                .mark_job_failed(&job.id, job.attempts_made, error)
                .await?;
            return Ok(FailureOutcome::Failed);
        }
        let delay = job.backoff.backoff(job.attempts_made);
        let retry_at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.backend
            .mark_job_retryable(&job.id, job.attempts_made, retry_at, error)
            .await?;
        Ok(FailureOutcome::Retrying { retry_at })
    }

    /// Extends the claim on an active job by the lock duration. Returns `false` once the claim
    /// is lost.
    pub async fn extend_lock(&self, job: &Job) -> Result<bool> {
        Ok(self
            .backend
            .extend_lock(&job.id, job.attempts_made, self.defaults.lock_duration)
            .await?)
    }

    /// Requeues or fails active jobs whose lock expired.
    pub async fn recover_stalled(&self) -> Result<Vec<Stalled>> {
        Ok(self.backend.recover_stalled(Utc::now()).await?)
    }

    /// When the earliest delayed job becomes due.
    pub async fn next_scheduled_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.backend.next_scheduled_at().await?)
    }

    pub async fn counts(&self, states: &[JobState]) -> Result<StateCounts> {
        Ok(self.backend.counts(states).await?)
    }

    pub async fn jobs(&self, state: JobState, page: Page) -> Result<Vec<Job>> {
        Ok(self.backend.jobs(state, page).await?)
    }

    /// The age of the job that would be claimed first from `state`.
    pub async fn oldest_age(&self, state: JobState) -> Result<Option<TimeDelta>> {
        let now = Utc::now();
        Ok(self
            .jobs(state, Page::first(1))
            .await?
            .first()
            .map(|job| job.age(now)))
    }

    pub async fn job_by_id(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.backend.job(id).await?)
    }

    pub async fn remove(&self, id: &JobId) -> Result<bool> {
        Ok(self.backend.remove(id).await?)
    }

    /// Removes finished jobs past their retention.
    pub async fn prune(&self) -> Result<u64> {
        Ok(self.backend.prune(Utc::now()).await?)
    }

    pub async fn repeatables(&self) -> Result<Vec<RepeatableEntry>> {
        Ok(self.backend.repeatables().await?)
    }

    /// Removes the repeatable entry of `type_name` with `repeat` and its pending iteration.
    pub async fn remove_repeatable(&self, type_name: &str, repeat: Repeat) -> Result<bool> {
        let Some(entry) = self
            .backend
            .remove_repeatable(&repeat.key(type_name))
            .await?
        else {
            return Ok(false);
        };
        let pending = entry.next_job_id();
        if let Some(job) = self.backend.job(&pending).await? {
            if !matches!(job.state, JobState::Active) && !job.state.is_finished() {
                self.backend.remove(&pending).await?;
            }
        }
        Ok(true)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.backend.subscribe()
    }

    pub async fn ping(&self) -> Result<()> {
        Ok(self.backend.ping().await?)
    }

    /// Closes the broker connection.
    pub async fn close(&self) -> Result<()> {
        tracing::debug!(queue = %self.name, "Closing queue");
        Ok(self.backend.close().await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{backend::memory::InMemoryBackend, job::Keep};
    use assert_matches::assert_matches;
    use serde_json::json;

    fn queue() -> Queue {
        Queue::new("test", InMemoryBackend::new())
    }

    async fn claim(queue: &Queue) -> Job {
        queue.dequeue_next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn enqueue_applies_defaults() {
        let queue = queue();
        let id = queue
            .enqueue("type", json!(1), JobOptions::default())
            .await
            .unwrap();

        let job = queue.job_by_id(&id).await.unwrap().unwrap();
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.backoff, Backoff::DEFAULT);
        assert_eq!(job.retention, RetentionPolicy::DEFAULT);
        assert_eq!(job.state, JobState::Waiting);
    }

    #[tokio::test]
    async fn enqueue_rejects_invalid_options() {
        let queue = queue();

        assert_matches!(
            queue
                .enqueue(
                    "type",
                    json!(null),
                    JobOptions {
                        priority: Some(MAX_PRIORITY + 1),
                        ..Default::default()
                    }
                )
                .await,
            Err(DroverError::InvalidOptions(_))
        );
        assert_matches!(
            queue
                .enqueue(
                    "type",
                    json!(null),
                    JobOptions {
                        max_attempts: Some(0),
                        ..Default::default()
                    }
                )
                .await,
            Err(DroverError::InvalidOptions(_))
        );
        assert_matches!(
            queue
                .enqueue(
                    "type",
                    json!(null),
                    JobOptions {
                        repeat: Some(Repeat::every_ms(0)),
                        ..Default::default()
                    }
                )
                .await,
            Err(DroverError::InvalidOptions(_))
        );
        assert!(queue.counts(&JobState::ALL).await.unwrap().iter().all(|(_, n)| n == 0));
    }

    #[tokio::test]
    async fn owner_derived_ids_deduplicate() {
        let queue = queue();
        let options = JobOptions {
            owner: Some("user-1".to_owned()),
            ..Default::default()
        };

        let first = queue
            .enqueue("sync", json!(1), options.clone())
            .await
            .unwrap();
        let second = queue.enqueue("sync", json!(2), options).await.unwrap();

        assert_eq!(first, JobId::derive("sync", "user-1"));
        assert_eq!(first, second);
        let job = queue.job_by_id(&first).await.unwrap().unwrap();
        assert_eq!(job.payload, json!(1));
    }

    #[tokio::test]
    async fn delayed_jobs_wait() {
        let queue = queue();
        let id = queue
            .enqueue(
                "type",
                json!(null),
                JobOptions {
                    delay: Some(TimeDelta::hours(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(
            queue.job_by_id(&id).await.unwrap().unwrap().state,
            JobState::Delayed
        );
        assert!(queue.dequeue_next().await.unwrap().is_none());
        assert!(queue.next_scheduled_at().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failure_retries_with_backoff_until_exhausted() {
        let queue = queue();
        let id = queue
            .enqueue(
                "type",
                json!(null),
                JobOptions {
                    max_attempts: Some(2),
                    backoff: Some(Backoff::fixed(0)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let error = || ExecutionError::new("handler", "boom");

        let job = claim(&queue).await;
        let before = Utc::now();
        assert_matches!(
            queue.report_failure(&job, error()).await.unwrap(),
            FailureOutcome::Retrying { retry_at } if retry_at >= before
        );

        let job = claim(&queue).await;
        assert_eq!(job.attempts_made, 2);
        assert_eq!(
            queue.report_failure(&job, error()).await.unwrap(),
            FailureOutcome::Failed
        );

        let job = queue.job_by_id(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.errors.len(), 2);
        assert_eq!(job.errors[1].attempt, 2);
    }

    #[tokio::test]
    async fn first_retry_uses_base_backoff() {
        let queue = queue();
        queue
            .enqueue("type", json!(null), JobOptions::default())
            .await
            .unwrap();

        let job = claim(&queue).await;
        let before = Utc::now();
        let outcome = queue
            .report_failure(&job, ExecutionError::new("handler", "boom"))
            .await
            .unwrap();

        let FailureOutcome::Retrying { retry_at } = outcome else {
            panic!("expected a retry, got {outcome:?}");
        };
        let delay = retry_at - before;
        assert!(delay >= TimeDelta::milliseconds(2_000));
        assert!(delay < TimeDelta::milliseconds(2_500));
    }

    #[tokio::test]
    async fn success_is_recorded() {
        let queue = queue();
        let id = queue
            .enqueue("type", json!(null), JobOptions::default())
            .await
            .unwrap();

        let job = claim(&queue).await;
        queue.report_success(&job, json!("ok")).await.unwrap();

        let job = queue.job_by_id(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.return_value, Some(json!("ok")));
    }

    #[tokio::test]
    async fn repeatable_registration_is_idempotent() {
        let queue = queue();
        let options = JobOptions {
            repeat: Some(Repeat::every(TimeDelta::minutes(1))),
            ..Default::default()
        };

        let first = queue
            .enqueue("sync", json!(null), options.clone())
            .await
            .unwrap();
        let second = queue.enqueue("sync", json!(null), options).await.unwrap();

        assert_eq!(first, second);
        assert!(first.as_str().starts_with("repeat:sync::60000:"));
        assert_eq!(queue.repeatables().await.unwrap().len(), 1);
        assert_eq!(
            queue
                .counts(&[JobState::Delayed])
                .await
                .unwrap()
                .get(JobState::Delayed),
            1
        );
    }

    #[tokio::test]
    async fn claiming_an_iteration_schedules_the_next() {
        let queue = queue();
        let repeat = Repeat::every(TimeDelta::hours(1));
        let backend_job = EnqueuableJob {
            repeat: Some(repeat),
            ..EnqueuableJob::mock_job().with_id("repeat:job-type::3600000:0")
        };
        queue
            .backend
            .add_repeatable(RepeatableEntry::new(
                EnqueuableJob::DEFAULT_TYPE,
                repeat,
                Utc::now(),
            ))
            .await
            .unwrap();
        queue.backend.enqueue(backend_job).await.unwrap();

        let job = claim(&queue).await;

        assert_eq!(job.id.as_str(), "repeat:job-type::3600000:0");
        let delayed = queue
            .jobs(JobState::Delayed, Page::first(10))
            .await
            .unwrap();
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].repeat, Some(repeat));
        assert_ne!(delayed[0].id, job.id);
    }

    #[tokio::test]
    async fn removed_repeatable_stops_iterating() {
        let queue = queue();
        let repeat = Repeat::every(TimeDelta::minutes(1));
        queue
            .enqueue(
                "sync",
                json!(null),
                JobOptions {
                    repeat: Some(repeat),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(queue.remove_repeatable("sync", repeat).await.unwrap());
        assert!(!queue.remove_repeatable("sync", repeat).await.unwrap());

        assert!(queue.repeatables().await.unwrap().is_empty());
        assert_eq!(
            queue
                .counts(&[JobState::Delayed])
                .await
                .unwrap()
                .get(JobState::Delayed),
            0
        );
    }

    #[tokio::test]
    async fn prune_uses_retention() {
        let queue = queue();
        let id = queue
            .enqueue(
                "type",
                json!(null),
                JobOptions {
                    retention: Some(RetentionPolicy {
                        on_complete: Keep::Nothing,
                        on_fail: Keep::Nothing,
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let job = claim(&queue).await;
        queue.report_success(&job, json!(null)).await.unwrap();

        assert_eq!(queue.prune().await.unwrap(), 1);
        assert!(queue.job_by_id(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oldest_age_follows_claim_order() {
        let queue = queue();
        assert_eq!(queue.oldest_age(JobState::Prioritized).await.unwrap(), None);
        queue
            .enqueue(
                "type",
                json!(null),
                JobOptions {
                    priority: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let age = queue
            .oldest_age(JobState::Prioritized)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let later = queue
            .oldest_age(JobState::Prioritized)
            .await
            .unwrap()
            .unwrap();
        assert!(age > TimeDelta::zero());
        assert!(later > age);
    }

    #[tokio::test]
    async fn closed_queue_reports_broker_unavailable() {
        let queue = queue();
        queue.close().await.unwrap();

        assert_matches!(queue.ping().await, Err(DroverError::BrokerUnavailable(_)));
        assert_matches!(
            queue.enqueue("type", json!(null), JobOptions::default()).await,
            Err(DroverError::BrokerUnavailable(_))
        );
    }
}
