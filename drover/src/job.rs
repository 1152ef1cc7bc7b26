//! The job record and its value types.
//!
//! A [`Job`] is one unit of enqueued work. It is created by a producer through
//! [`crate::queue::Queue::enqueue`] (or the fluent [`builder::JobBuilder`]), mutated by the
//! worker as it moves between [`JobState`]s, and destroyed either by the retention pruner or by
//! an explicit removal.
use std::fmt::Display;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;

pub mod builder;

/// The schema version baked into derived job ids.
///
/// Bumping this lets a new release enqueue work for an owner even while jobs created by an older
/// release are still pending.
pub const SCHEMA_VERSION: &str = "v001";

/// The largest accepted job priority.
///
/// Priorities are packed together with a sequence number into a single sortable score by the
/// brokers, which limits the usable range.
pub const MAX_PRIORITY: u32 = 2_097_152;

/// The identifier of a job, unique within a queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Wraps an explicit id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives the deterministic id of the logical unit of work `type_name` performed for
    /// `owner_id`.
    ///
    /// Enqueuing a job with a derived id while another job with the same id is still pending
    /// does not create a second job.
    ///
    /// # Example
    ///
    /// ```
    /// # use drover::job::JobId;
    /// let id = JobId::derive("sync-read-positions", "user-42");
    /// assert_eq!(id.as_str(), "sync-read-positions_user-42_v001");
    /// ```
    pub fn derive(type_name: &str, owner_id: &str) -> Self {
        Self::derive_versioned(type_name, owner_id, SCHEMA_VERSION)
    }

    /// Like [`JobId::derive`] with an explicit schema version.
    pub fn derive_versioned(type_name: &str, owner_id: &str, version: &str) -> Self {
        Self(format!("{type_name}_{owner_id}_{version}"))
    }

    pub(crate) fn repeat_iteration(key: &str, run_at: DateTime<Utc>) -> Self {
        Self(format!("repeat:{key}:{}", run_at.timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The state a job currently occupies. A job is in exactly one state at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Ready to run, without a priority. Claimed in enqueue order before any prioritized job.
    Waiting,
    /// Ready to run with a priority. Lower priorities are claimed first.
    Prioritized,
    /// Scheduled to become ready in the future, either on enqueue or after a failed attempt.
    Delayed,
    /// Claimed by a worker.
    Active,
    /// Finished successfully.
    Completed,
    /// Failed its final attempt.
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Waiting,
        JobState::Prioritized,
        JobState::Delayed,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Prioritized => "prioritized",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the job has reached a terminal state.
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownState(s.to_owned()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown job state `{0}`")]
pub struct UnknownState(pub String);

/// A fixed recurrence interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Repeat {
    every_ms: u64,
}

impl Repeat {
    /// Repeat every `interval`. Intervals below one millisecond are rounded up to one.
    pub fn every(interval: TimeDelta) -> Self {
        Self::every_ms(interval.num_milliseconds().max(1) as u64)
    }

    pub const fn every_ms(every_ms: u64) -> Self {
        Self { every_ms }
    }

    pub fn interval(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.every_ms as i64)
    }

    pub const fn interval_ms(&self) -> u64 {
        self.every_ms
    }

    /// The key identifying the repeatable entry of `type_name` with this interval.
    pub fn key(&self, type_name: &str) -> String {
        format!("{type_name}::{}", self.every_ms)
    }

    /// The first interval boundary strictly after `now`.
    ///
    /// Boundaries are multiples of the interval since the unix epoch, so every process computes
    /// the same next run for the same entry.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let every = self.every_ms.max(1) as i64;
        let next = (now.timestamp_millis().div_euclid(every) + 1) * every;
        Utc.timestamp_millis_opt(next).single().unwrap_or(now)
    }
}

/// A recurring job registration.
///
/// There is at most one entry per key and at most one pending iteration per entry: the next
/// iteration is only enqueued once the current one is claimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatableEntry {
    pub key: String,
    pub type_name: String,
    pub repeat: Repeat,
    pub next_run_at: DateTime<Utc>,
}

impl RepeatableEntry {
    pub fn new(type_name: impl Into<String>, repeat: Repeat, next_run_at: DateTime<Utc>) -> Self {
        let type_name = type_name.into();
        Self {
            key: repeat.key(&type_name),
            type_name,
            repeat,
            next_run_at,
        }
    }

    /// The id of the iteration scheduled at [`RepeatableEntry::next_run_at`].
    pub fn next_job_id(&self) -> JobId {
        JobId::repeat_iteration(&self.key, self.next_run_at)
    }
}

/// How long a finished job is kept before the pruner removes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Keep {
    /// Never pruned.
    Forever,
    /// Pruned on the next sweep.
    Nothing,
    /// Pruned once older than the given number of milliseconds.
    MaxAgeMs(u64),
}

impl Keep {
    pub fn max_age(age: TimeDelta) -> Self {
        Self::MaxAgeMs(age.num_milliseconds().max(0) as u64)
    }

    /// When a job finished at `finished_at` becomes eligible for pruning.
    pub fn expires_at(&self, finished_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Forever => None,
            Self::Nothing => Some(finished_at),
            Self::MaxAgeMs(ms) => Some(
                finished_at
                    .checked_add_signed(TimeDelta::milliseconds(*ms as i64))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            ),
        }
    }

    /// The retention in milliseconds, `-1` standing for [`Keep::Forever`].
    pub fn as_millis(&self) -> i64 {
        match self {
            Self::Forever => -1,
            Self::Nothing => 0,
            Self::MaxAgeMs(ms) => *ms as i64,
        }
    }
}

/// Independent retention for successful and failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub on_complete: Keep,
    pub on_fail: Keep,
}

impl RetentionPolicy {
    /// Keep completed jobs for up to 24 hours and failed jobs for up to 7 days.
    pub const DEFAULT: RetentionPolicy = RetentionPolicy {
        on_complete: Keep::MaxAgeMs(24 * 3600 * 1000),
        on_fail: Keep::MaxAgeMs(7 * 24 * 3600 * 1000),
    };

    pub fn for_state(&self, state: JobState) -> Keep {
        match state {
            JobState::Completed => self.on_complete,
            JobState::Failed => self.on_fail,
            _ => Keep::Forever,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A record of one failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// The attempt that failed.
    pub attempt: u32,
    /// A short classification such as `handler`, `panic` or `stalled`.
    pub error_type: String,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// One unit of enqueued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Selects the handler in the [`crate::dispatch::DispatchTable`].
    pub type_name: String,
    pub payload: serde_json::Value,
    /// `0` for no priority, otherwise lower runs first.
    pub priority: u32,
    pub state: JobState,
    /// Incremented every time the job is claimed.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub repeat: Option<Repeat>,
    pub retention: RetentionPolicy,
    pub errors: Vec<JobError>,
    pub return_value: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether a failure of the current attempt is terminal.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }

    /// Time since the job was created.
    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.created_at
    }

    /// The key of the repeatable entry this job is an iteration of.
    pub fn repeat_key(&self) -> Option<String> {
        self.repeat.map(|repeat| repeat.key(&self.type_name))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn derived_ids_are_stable() {
        let first = JobId::derive("refresh-feed", "owner");
        let second = JobId::derive("refresh-feed", "owner");
        assert_eq!(first, second);
        assert_ne!(first, JobId::derive("refresh-feed", "other-owner"));
        assert_ne!(
            first,
            JobId::derive_versioned("refresh-feed", "owner", "v002")
        );
    }

    #[test]
    fn state_round_trips_through_its_name() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("paused".parse::<JobState>().is_err());
    }

    #[test]
    fn repeat_aligns_to_interval_boundaries() {
        let repeat = Repeat::every(TimeDelta::seconds(60));
        let now = Utc.timestamp_millis_opt(120_500).unwrap();

        assert_eq!(repeat.next_after(now).timestamp_millis(), 180_000);

        let on_boundary = Utc.timestamp_millis_opt(180_000).unwrap();
        assert_eq!(repeat.next_after(on_boundary).timestamp_millis(), 240_000);
        assert_eq!(repeat.key("sync"), "sync::60000");
    }

    #[test]
    fn keep_expiry() {
        let finished = Utc::now();
        assert_eq!(Keep::Forever.expires_at(finished), None);
        assert_eq!(Keep::Nothing.expires_at(finished), Some(finished));
        assert_eq!(
            Keep::max_age(TimeDelta::hours(1)).expires_at(finished),
            Some(finished + TimeDelta::hours(1))
        );
    }

    #[test]
    fn default_retention() {
        let policy = RetentionPolicy::default();
        assert_eq!(
            policy.for_state(JobState::Completed),
            Keep::max_age(TimeDelta::hours(24))
        );
        assert_eq!(
            policy.for_state(JobState::Failed),
            Keep::max_age(TimeDelta::days(7))
        );
        assert_eq!(policy.for_state(JobState::Active), Keep::Forever);
    }
}
