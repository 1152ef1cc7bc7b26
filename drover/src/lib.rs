//! A background job engine over a shared broker.
//!
//! Producers enqueue typed [`job::Job`]s through a [`queue::Queue`]. A [`worker::Worker`] claims
//! ready jobs one at a time up to a configurable concurrency, routes each to the handler registered
//! for its type in a [`dispatch::DispatchTable`], and records the outcome: completed, retried with
//! [`backoff`], or failed once its attempts are exhausted.
//!
//! The broker itself sits behind the [`backend::Backend`] trait. An in memory implementation is
//! provided in [`backend::memory`], a Redis implementation lives in the `drover-redis` crate.
//!
//! # Example
//!
//! ```
//! # use drover::prelude::*;
//! # use drover::backend::memory::InMemoryBackend;
//! # use serde_json::{json, Value};
//! # tokio_test_runtime(async {
//! let queue = Queue::new("example", InMemoryBackend::new());
//! let dispatch = DispatchTable::builder()
//!     .with_fn("greet", |payload: Value, _attempt| async move {
//!         Ok::<_, std::io::Error>(json!({ "greeted": payload["name"] }))
//!     })
//!     .build()
//!     .unwrap();
//!
//! let id = queue
//!     .job("greet", json!({ "name": "world" }))
//!     .enqueue()
//!     .await
//!     .unwrap();
//!
//! let worker = Worker::new(queue.clone(), dispatch).spawn();
//! # let _ = id;
//! worker.close().await;
//! # });
//! # fn tokio_test_runtime(future: impl std::future::Future<Output = ()>) {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(future)
//! # }
//! ```
use thiserror::Error;

pub mod admission;
pub mod backend;
pub mod backoff;
pub mod dispatch;
pub mod events;
pub mod job;
pub mod lifecycle;
pub mod metrics;
pub mod prelude;
pub mod pruner;
pub mod queue;
pub mod scheduler;
pub mod worker;

use backend::BackendError;
use job::JobId;

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum DroverError {
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),
    #[error("Job {job_id} failed on attempt {attempt}: {message}")]
    HandlerExecutionFailure {
        job_id: JobId,
        attempt: u32,
        error_type: String,
        message: String,
    },
    #[error("No handler registered for job type `{0}`")]
    UnknownJobType(String),
    #[error("Worker is shutting down, no new jobs are claimed")]
    ShutdownInProgress,
    #[error("A handler is already registered for job type `{0}`")]
    DuplicateHandler(String),
    #[error("Invalid job options: {0}")]
    InvalidOptions(String),
    #[error(transparent)]
    Backend(BackendError),
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
}

impl From<BackendError> for DroverError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::BrokerUnavailable(reason) => Self::BrokerUnavailable(reason),
            other => Self::Backend(other),
        }
    }
}

/// When an error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// While the process is starting up.
    Startup,
    /// While serving.
    Running,
}

/// What the process should do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Log and exit with a non zero status.
    Fatal,
    /// Log and leave recovery to the retry machinery or a later attempt.
    Retry,
    /// Log and carry on.
    LogAndIgnore,
}

impl DroverError {
    /// How the process reacts to this error during `phase`.
    ///
    /// A broker that cannot be reached at startup is fatal. Once running the connection is
    /// expected to recover. Programming errors in the dispatch table are always fatal.
    pub fn policy(&self, phase: Phase) -> ErrorPolicy {
        match (self, phase) {
            (Self::BrokerUnavailable(_), Phase::Startup) => ErrorPolicy::Fatal,
            (Self::BrokerUnavailable(_), Phase::Running) => ErrorPolicy::Retry,
            (Self::HandlerExecutionFailure { .. }, _) => ErrorPolicy::Retry,
            (Self::UnknownJobType(_), _) => ErrorPolicy::LogAndIgnore,
            (Self::ShutdownInProgress, _) => ErrorPolicy::LogAndIgnore,
            (Self::DuplicateHandler(_), _) => ErrorPolicy::Fatal,
            (Self::InvalidOptions(_), _) => ErrorPolicy::LogAndIgnore,
            (Self::Backend(_) | Self::EncodeDecode(_), Phase::Startup) => ErrorPolicy::Fatal,
            (Self::Backend(_) | Self::EncodeDecode(_), Phase::Running) => ErrorPolicy::Retry,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn broker_unavailable_is_mapped() {
        let error: DroverError = BackendError::BrokerUnavailable("refused".to_owned()).into();
        assert_matches!(error, DroverError::BrokerUnavailable(reason) if reason == "refused");

        let error: DroverError = BackendError::BadState.into();
        assert_matches!(error, DroverError::Backend(BackendError::BadState));
    }

    #[test]
    fn policy_depends_on_phase() {
        let unavailable = DroverError::BrokerUnavailable("down".to_owned());
        assert_eq!(unavailable.policy(Phase::Startup), ErrorPolicy::Fatal);
        assert_eq!(unavailable.policy(Phase::Running), ErrorPolicy::Retry);

        let unknown = DroverError::UnknownJobType("mystery".to_owned());
        assert_eq!(unknown.policy(Phase::Running), ErrorPolicy::LogAndIgnore);

        let duplicate = DroverError::DuplicateHandler("twice".to_owned());
        assert_eq!(duplicate.policy(Phase::Startup), ErrorPolicy::Fatal);

        let failure = DroverError::HandlerExecutionFailure {
            job_id: "1".into(),
            attempt: 1,
            error_type: "handler".to_owned(),
            message: "boom".to_owned(),
        };
        assert_eq!(failure.policy(Phase::Running), ErrorPolicy::Retry);
        assert_eq!(
            DroverError::ShutdownInProgress.policy(Phase::Running),
            ErrorPolicy::LogAndIgnore
        );
    }
}
