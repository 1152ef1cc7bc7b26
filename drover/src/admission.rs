//! Admission control for fan-out jobs.
//!
//! A controller job that enqueues one child job per item can flood the queue when it runs faster
//! than the children are processed. Wrapping its handler in [`Backpressure`] skips the controller
//! while the backlog is above a threshold. The next scheduled run tries again.
use async_trait::async_trait;

use crate::{
    dispatch::{ExecutionResult, Handler, JobContext},
    job::JobState,
};

/// Skips the inner handler while too many jobs are queued.
///
/// # Example
///
/// ```
/// # use drover::prelude::*;
/// # use serde_json::Value;
/// let dispatch = DispatchTable::builder()
///     .with_handler(
///         "refresh-all-feeds",
///         Backpressure::new(FanOut).with_threshold(500),
///     )
///     .build()
///     .unwrap();
/// # struct FanOut;
/// # #[async_trait::async_trait]
/// # impl Handler for FanOut {
/// #     async fn handle(&self, _context: JobContext) -> ExecutionResult {
/// #         ExecutionResult::done()
/// #     }
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Backpressure<H> {
    inner: H,
    state: JobState,
    threshold: u64,
}

impl<H: Handler> Backpressure<H> {
    pub const DEFAULT_THRESHOLD: u64 = 1000;

    /// Watches the [`JobState::Prioritized`] backlog with the default threshold.
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            state: JobState::Prioritized,
            threshold: Self::DEFAULT_THRESHOLD,
        }
    }

    pub fn with_threshold(self, threshold: u64) -> Self {
        Self { threshold, ..self }
    }

    /// Watch a different state.
    pub fn watching(self, state: JobState) -> Self {
        Self { state, ..self }
    }
}

#[async_trait]
impl<H: Handler> Handler for Backpressure<H> {
    async fn handle(&self, context: JobContext) -> ExecutionResult {
        match context.queue().counts(&[self.state]).await {
            Ok(counts) if counts.get(self.state) > self.threshold => {
                let backlog = counts.get(self.state);
                tracing::info!(
                    job_id = %context.id(),
                    backlog,
                    threshold = self.threshold,
                    "Too many {} jobs, skipping fan-out",
                    self.state
                );
                return ExecutionResult::skipped(format!(
                    "{backlog} {} jobs exceed the threshold of {}",
                    self.state, self.threshold
                ));
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(
                ?error,
                job_id = %context.id(),
                "Failed to read the {} backlog, running anyway: {error}",
                self.state
            ),
        }
        self.inner.handle(context).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        backend::{
            memory::InMemoryBackend,
            test::{unavailable, MockBroker},
            Backend, EnqueuableJob,
        },
        queue::Queue,
    };
    use assert_matches::assert_matches;
    use chrono::TimeDelta;
    use serde_json::json;

    struct Controller;

    #[async_trait]
    impl Handler for Controller {
        async fn handle(&self, _context: JobContext) -> ExecutionResult {
            ExecutionResult::Done(json!("fanned out"))
        }
    }

    async fn context_with_backlog(backlog: u32) -> JobContext {
        let backend = InMemoryBackend::new();
        let queue = Queue::new("test", backend.clone());
        queue
            .job("refresh-all-feeds", json!(null))
            .enqueue()
            .await
            .unwrap();
        let job = queue.dequeue_next().await.unwrap().unwrap();
        for _ in 0..backlog {
            backend
                .enqueue(EnqueuableJob::mock_job().with_priority(100))
                .await
                .unwrap();
        }
        JobContext::new(job, queue)
    }

    #[tokio::test]
    async fn runs_below_the_threshold() {
        let handler = Backpressure::new(Controller).with_threshold(3);

        let result = handler.handle(context_with_backlog(3).await).await;

        assert_matches!(result, ExecutionResult::Done(value) if value == json!("fanned out"));
    }

    #[tokio::test]
    async fn skips_above_the_threshold() {
        let handler = Backpressure::new(Controller).with_threshold(3);

        let result = handler.handle(context_with_backlog(4).await).await;

        assert_matches!(result, ExecutionResult::Skipped { reason } if reason.starts_with("4 prioritized"));
    }

    #[tokio::test]
    async fn default_threshold() {
        let handler = Backpressure::new(Controller);

        assert_matches!(
            handler.handle(context_with_backlog(1000).await).await,
            ExecutionResult::Done(_)
        );
        assert_matches!(
            handler.handle(context_with_backlog(1001).await).await,
            ExecutionResult::Skipped { .. }
        );
    }

    #[tokio::test]
    async fn runs_when_the_backlog_cannot_be_read() {
        let job = {
            let backend = InMemoryBackend::new();
            backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
            backend
                .claim_next(TimeDelta::seconds(30))
                .await
                .unwrap()
                .unwrap()
        };
        let mut broker = MockBroker::new();
        broker.expect_counts().returning(|_| Err(unavailable()));
        let context = JobContext::new(job, Queue::new("test", broker));

        let result = Backpressure::new(Controller).handle(context).await;

        assert_matches!(result, ExecutionResult::Done(_));
    }
}
