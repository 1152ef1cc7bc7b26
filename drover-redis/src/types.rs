use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use drover::{
    backend::{BackendError, EnqueuableJob},
    job::{Job, JobError, JobId, JobState, RepeatableEntry},
};
use serde::{Deserialize, Serialize};

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, BackendError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(BackendError::BadState)
}

/// Scores come back from redis as doubles.
pub(crate) fn from_score(score: f64) -> Result<DateTime<Utc>, BackendError> {
    from_millis(score.round() as i64)
}

/// The `ARGV` of the enqueue script, after the id.
pub(crate) struct EnqueueArgs {
    pub scheduled_at: i64,
    pub priority: u32,
    pub type_name: String,
    pub payload: String,
    pub max_attempts: u32,
    pub backoff: String,
    pub repeat: String,
    pub retention: String,
    pub keep_completed_ms: i64,
    pub keep_failed_ms: i64,
}

impl TryFrom<EnqueuableJob> for EnqueueArgs {
    type Error = BackendError;

    fn try_from(job: EnqueuableJob) -> Result<Self, Self::Error> {
        Ok(Self {
            scheduled_at: to_millis(job.scheduled_at),
            priority: job.priority,
            payload: serde_json::to_string(&job.payload)?,
            max_attempts: job.max_attempts,
            backoff: serde_json::to_string(&job.backoff)?,
            repeat: match job.repeat {
                Some(repeat) => serde_json::to_string(&repeat)?,
                None => String::new(),
            },
            retention: serde_json::to_string(&job.retention)?,
            keep_completed_ms: job.retention.on_complete.as_millis(),
            keep_failed_ms: job.retention.on_fail.as_millis(),
            type_name: job.type_name,
        })
    }
}

/// An error as recorded by the scripts.
#[derive(Debug, Deserialize)]
struct StoredError {
    attempt: u32,
    error_type: String,
    message: String,
    recorded_at: i64,
}

impl TryFrom<StoredError> for JobError {
    type Error = BackendError;

    fn try_from(value: StoredError) -> Result<Self, Self::Error> {
        Ok(Self {
            attempt: value.attempt,
            error_type: value.error_type,
            message: value.message,
            recorded_at: from_millis(value.recorded_at)?,
        })
    }
}

/// The fields of a job hash and its error list.
#[derive(Debug, Default)]
pub(crate) struct StoredJob {
    pub fields: HashMap<String, String>,
    pub errors: Vec<String>,
}

impl StoredJob {
    fn field(&self, name: &str) -> Result<&str, BackendError> {
        self.fields.get(name).map(String::as_str).ok_or_else(|| {
            tracing::error!(field = name, "Job hash is missing the field {name}");
            BackendError::BadState
        })
    }

    fn optional(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    fn number<T: std::str::FromStr>(&self, name: &str) -> Result<T, BackendError> {
        self.field(name)?
            .parse()
            .map_err(|_| BackendError::BadState)
    }

    fn timestamp(&self, name: &str) -> Result<Option<DateTime<Utc>>, BackendError> {
        self.optional(name)
            .map(|value| {
                value
                    .parse::<f64>()
                    .map_err(|_| BackendError::BadState)
                    .and_then(from_score)
            })
            .transpose()
    }

    pub fn into_job(self, id: JobId) -> Result<Job, BackendError> {
        let state = self
            .field("state")?
            .parse::<JobState>()
            .map_err(|_| BackendError::BadState)?;
        let errors = self
            .errors
            .iter()
            .map(|error| JobError::try_from(serde_json::from_str::<StoredError>(error)?))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Job {
            id,
            type_name: self.field("type_name")?.to_owned(),
            payload: serde_json::from_str(self.field("payload")?)?,
            priority: self.number("priority")?,
            state,
            attempts_made: self.number("attempts_made")?,
            max_attempts: self.number("max_attempts")?,
            backoff: serde_json::from_str(self.field("backoff")?)?,
            repeat: self.optional("repeat").map(serde_json::from_str).transpose()?,
            retention: serde_json::from_str(self.field("retention")?)?,
            errors,
            return_value: self
                .optional("return_value")
                .map(serde_json::from_str)
                .transpose()?,
            created_at: self.timestamp("created_at")?.ok_or(BackendError::BadState)?,
            scheduled_at: self
                .timestamp("scheduled_at")?
                .ok_or(BackendError::BadState)?,
            processed_at: self.timestamp("processed_at")?,
            finished_at: self.timestamp("finished_at")?,
        })
    }
}

/// A repeatable entry as stored in the `repeat` hash. The next run lives in a sorted set so it can
/// be moved without rewriting the entry.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StoredRepeatable {
    pub type_name: String,
    pub repeat: drover::job::Repeat,
}

impl StoredRepeatable {
    pub fn into_entry(self, next_run_at: f64) -> Result<RepeatableEntry, BackendError> {
        Ok(RepeatableEntry::new(
            self.type_name,
            self.repeat,
            from_score(next_run_at)?,
        ))
    }
}

impl From<&RepeatableEntry> for StoredRepeatable {
    fn from(entry: &RepeatableEntry) -> Self {
        Self {
            type_name: entry.type_name.clone(),
            repeat: entry.repeat,
        }
    }
}
