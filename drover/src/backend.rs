//! The broker abstraction.
//!
//! A [`Backend`] stores jobs and moves them between states atomically. Everything above it (the
//! [`crate::queue::Queue`] client, the worker, the pruner) is written against this trait, so the
//! same engine runs on the in-process [`memory::InMemoryBackend`] and on Redis.
//!
//! Implementors should run the conformance suite generated by [`crate::test_suite`].
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::{
    backoff::Backoff,
    events::QueueEvent,
    job::{Job, JobError, JobId, JobState, Repeat, RepeatableEntry, RetentionPolicy},
};

pub mod memory;
#[doc(hidden)]
pub mod testing;

/// The storage and state transition primitives of a queue.
///
/// Every method must be atomic with respect to concurrent callers: two concurrent calls to
/// [`Backend::claim_next`] never return the same job.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Adds a job, or returns the id of the pending job that already carries the requested id.
    ///
    /// A finished job with the requested id is replaced.
    async fn enqueue(&self, job: EnqueuableJob) -> Result<Enqueued, BackendError>;

    /// Atomically claims the next ready job, moving it to [`JobState::Active`] and incrementing
    /// its attempt counter. The claim holds a lock for `lock` which must be extended with
    /// [`Backend::extend_lock`] for long running jobs.
    ///
    /// Delayed jobs that are due are promoted before a job is chosen. Waiting jobs are claimed in
    /// enqueue order, then prioritized jobs ordered by priority and then enqueue order.
    async fn claim_next(&self, lock: TimeDelta) -> Result<Option<Job>, BackendError>;

    /// When the earliest delayed job becomes due.
    async fn next_scheduled_at(&self) -> Result<Option<DateTime<Utc>>, BackendError>;

    /// Extends the lock of an active job. Returns `false` if the job is no longer active under
    /// the claim of `attempt`.
    ///
    /// The lock extension and the `mark_job_*` methods identify a claim by the job id and the
    /// `attempts_made` the claim returned. Once a lock expired and the job was claimed again,
    /// only the new claim may extend or finish the attempt.
    async fn extend_lock(
        &self,
        id: &JobId,
        attempt: u32,
        lock: TimeDelta,
    ) -> Result<bool, BackendError>;

    /// Moves the job to [`JobState::Completed`]. Fails with [`BackendError::NotActive`] if the
    /// claim of `attempt` no longer holds the job.
    async fn mark_job_complete(
        &self,
        id: &JobId,
        attempt: u32,
        return_value: serde_json::Value,
    ) -> Result<(), BackendError>;

    /// Records the error and schedules the job to run again at `retry_at`.
    async fn mark_job_retryable(
        &self,
        id: &JobId,
        attempt: u32,
        retry_at: DateTime<Utc>,
        error: ExecutionError,
    ) -> Result<(), BackendError>;

    /// Records the error and moves the job to [`JobState::Failed`].
    async fn mark_job_failed(
        &self,
        id: &JobId,
        attempt: u32,
        error: ExecutionError,
    ) -> Result<(), BackendError>;

    /// Returns every active job whose lock expired before `now` to the ready states, or fails it
    /// when it has no attempts left.
    async fn recover_stalled(&self, now: DateTime<Utc>) -> Result<Vec<Stalled>, BackendError>;

    async fn counts(&self, states: &[JobState]) -> Result<StateCounts, BackendError>;

    /// Lists the jobs in `state` in claim order (waiting and prioritized), due order (delayed),
    /// lock expiry order (active) or finishing order (completed and failed).
    async fn jobs(&self, state: JobState, page: Page) -> Result<Vec<Job>, BackendError>;

    async fn job(&self, id: &JobId) -> Result<Option<Job>, BackendError>;

    /// Removes a job in any state. Returns `false` if there was no such job.
    async fn remove(&self, id: &JobId) -> Result<bool, BackendError>;

    /// Removes the finished jobs whose retention expired before `now`.
    async fn prune(&self, now: DateTime<Utc>) -> Result<u64, BackendError>;

    /// Stores a repeatable entry unless one with the same key exists. Returns whether it was
    /// inserted.
    async fn add_repeatable(&self, entry: RepeatableEntry) -> Result<bool, BackendError>;

    /// Moves the next run of an existing entry. Returns `false` if the entry was removed.
    async fn advance_repeatable(
        &self,
        key: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, BackendError>;

    async fn repeatable(&self, key: &str) -> Result<Option<RepeatableEntry>, BackendError>;

    async fn repeatables(&self) -> Result<Vec<RepeatableEntry>, BackendError>;

    async fn remove_repeatable(&self, key: &str)
        -> Result<Option<RepeatableEntry>, BackendError>;

    async fn ping(&self) -> Result<(), BackendError>;

    /// Subscribes to the lifecycle events of jobs changed through this backend.
    fn subscribe(&self) -> broadcast::Receiver<QueueEvent>;

    /// Releases the connection. Every later call fails with [`BackendError::BrokerUnavailable`].
    async fn close(&self) -> Result<(), BackendError>;
}

/// A job ready to be handed to [`Backend::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueuableJob {
    /// An explicit id, or `None` to have the backend allocate one.
    pub id: Option<JobId>,
    pub type_name: String,
    pub payload: serde_json::Value,
    pub priority: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub repeat: Option<Repeat>,
    pub retention: RetentionPolicy,
    pub scheduled_at: DateTime<Utc>,
}

impl EnqueuableJob {
    /// The state a job enqueued at `now` starts in.
    pub fn initial_state(&self, now: DateTime<Utc>) -> JobState {
        if self.scheduled_at > now {
            JobState::Delayed
        } else {
            Self::ready_state(self.priority)
        }
    }

    pub(crate) fn ready_state(priority: u32) -> JobState {
        if priority > 0 {
            JobState::Prioritized
        } else {
            JobState::Waiting
        }
    }

    pub(crate) fn into_job(self, id: JobId, now: DateTime<Utc>) -> Job {
        Job {
            state: self.initial_state(now),
            id,
            type_name: self.type_name,
            payload: self.payload,
            priority: self.priority,
            attempts_made: 0,
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            repeat: self.repeat,
            retention: self.retention,
            errors: vec![],
            return_value: None,
            created_at: now,
            scheduled_at: self.scheduled_at,
            processed_at: None,
            finished_at: None,
        }
    }
}

/// The outcome of [`Backend::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    pub id: JobId,
    /// `false` when a pending job with the same id already existed.
    pub inserted: bool,
}

/// The error of a failed attempt as handed to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionError {
    pub error_type: String,
    pub message: String,
}

impl ExecutionError {
    pub const STALLED: &'static str = "stalled";

    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn stalled() -> Self {
        Self::new(Self::STALLED, "job lock expired and no attempts remain")
    }

    pub fn into_job_error(self, attempt: u32, recorded_at: DateTime<Utc>) -> JobError {
        JobError {
            attempt,
            error_type: self.error_type,
            message: self.message,
            recorded_at,
        }
    }
}

/// A job recovered by [`Backend::recover_stalled`] and the state it was moved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stalled {
    pub id: JobId,
    pub moved_to: JobState,
}

/// Number of jobs per state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateCounts(HashMap<JobState, u64>);

impl StateCounts {
    /// The count of `state`, `0` if it was not requested.
    pub fn get(&self, state: JobState) -> u64 {
        self.0.get(&state).copied().unwrap_or_default()
    }

    pub fn set(&mut self, state: JobState, count: u64) {
        self.0.insert(state, count);
    }

    pub fn iter(&self) -> impl Iterator<Item = (JobState, u64)> + '_ {
        self.0.iter().map(|(state, count)| (*state, *count))
    }
}

impl FromIterator<(JobState, u64)> for StateCounts {
    fn from_iter<T: IntoIterator<Item = (JobState, u64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A window over a state listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
    /// Oldest first when `true`.
    pub ascending: bool,
}

impl Page {
    pub const fn first(limit: usize) -> Self {
        Self {
            offset: 0,
            limit,
            ascending: true,
        }
    }

    pub const fn descending(mut self) -> Self {
        self.ascending = false;
        self
    }

    pub const fn skip(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub(crate) fn apply<T>(&self, mut items: Vec<T>) -> Vec<T> {
        if !self.ascending {
            items.reverse();
        }
        items.into_iter().skip(self.offset).take(self.limit).collect()
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    /// The job is not active, or it was claimed again after the lock of the reporting claim
    /// expired.
    #[error("Job {0} is not active")]
    NotActive(JobId),
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("System in bad state")]
    BadState,
    #[error("Broker error: {0}")]
    Broker(String),
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    mockall::mock! {
        pub Broker {}

        #[async_trait]
        impl Backend for Broker {
            async fn enqueue(&self, job: EnqueuableJob) -> Result<Enqueued, BackendError>;
            async fn claim_next(&self, lock: TimeDelta) -> Result<Option<Job>, BackendError>;
            async fn next_scheduled_at(&self) -> Result<Option<DateTime<Utc>>, BackendError>;
            async fn extend_lock(
                &self,
                id: &JobId,
                attempt: u32,
                lock: TimeDelta,
            ) -> Result<bool, BackendError>;
            async fn mark_job_complete(
                &self,
                id: &JobId,
                attempt: u32,
                return_value: serde_json::Value,
            ) -> Result<(), BackendError>;
            async fn mark_job_retryable(
                &self,
                id: &JobId,
                attempt: u32,
                retry_at: DateTime<Utc>,
                error: ExecutionError,
            ) -> Result<(), BackendError>;
            async fn mark_job_failed(
                &self,
                id: &JobId,
                attempt: u32,
                error: ExecutionError,
            ) -> Result<(), BackendError>;
            async fn recover_stalled(&self, now: DateTime<Utc>) -> Result<Vec<Stalled>, BackendError>;
            async fn counts(&self, states: &[JobState]) -> Result<StateCounts, BackendError>;
            async fn jobs(&self, state: JobState, page: Page) -> Result<Vec<Job>, BackendError>;
            async fn job(&self, id: &JobId) -> Result<Option<Job>, BackendError>;
            async fn remove(&self, id: &JobId) -> Result<bool, BackendError>;
            async fn prune(&self, now: DateTime<Utc>) -> Result<u64, BackendError>;
            async fn add_repeatable(&self, entry: RepeatableEntry) -> Result<bool, BackendError>;
            async fn advance_repeatable(
                &self,
                key: &str,
                next_run_at: DateTime<Utc>,
            ) -> Result<bool, BackendError>;
            async fn repeatable(&self, key: &str) -> Result<Option<RepeatableEntry>, BackendError>;
            async fn repeatables(&self) -> Result<Vec<RepeatableEntry>, BackendError>;
            async fn remove_repeatable(
                &self,
                key: &str,
            ) -> Result<Option<RepeatableEntry>, BackendError>;
            async fn ping(&self) -> Result<(), BackendError>;
            fn subscribe(&self) -> broadcast::Receiver<QueueEvent>;
            async fn close(&self) -> Result<(), BackendError>;
        }
    }

    pub(crate) fn unavailable() -> BackendError {
        BackendError::BrokerUnavailable("connection refused".to_owned())
    }

    #[test]
    fn initial_state() {
        let now = Utc::now();
        let job = EnqueuableJob::mock_job();

        assert_eq!(job.initial_state(now), JobState::Waiting);
        assert_eq!(
            job.clone().with_priority(4).initial_state(now),
            JobState::Prioritized
        );
        assert_eq!(
            job.with_priority(4)
                .with_scheduled_at(now + TimeDelta::seconds(1))
                .initial_state(now),
            JobState::Delayed
        );
    }

    #[test]
    fn page_windows() {
        let items = vec![1, 2, 3, 4, 5];

        assert_eq!(Page::first(2).apply(items.clone()), vec![1, 2]);
        assert_eq!(Page::first(2).skip(1).apply(items.clone()), vec![2, 3]);
        assert_eq!(Page::first(2).descending().apply(items.clone()), vec![5, 4]);
        assert_eq!(Page::first(10).skip(10).apply(items), Vec::<i32>::new());
    }

    #[test]
    fn missing_counts_are_zero() {
        let counts: StateCounts = [(JobState::Waiting, 3)].into_iter().collect();

        assert_eq!(counts.get(JobState::Waiting), 3);
        assert_eq!(counts.get(JobState::Failed), 0);
    }
}
