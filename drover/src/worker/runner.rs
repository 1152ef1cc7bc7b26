use std::{sync::Arc, time::Duration};

use serde_json::Value;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::{
    backend,
    dispatch::{DispatchTable, ExecutionError, ExecutionResult, JobContext},
    job::Job,
    queue::{FailureOutcome, Queue},
    DroverError,
};

const ERROR_TYPE_PANIC: &str = "panic";
const MIN_RENEWAL_PERIOD: Duration = Duration::from_millis(1);

pub(crate) struct JobRunner {
    queue: Queue,
    dispatch: Arc<DispatchTable>,
    abandon: CancellationToken,
}

impl JobRunner {
    pub(crate) fn new(
        queue: Queue,
        dispatch: Arc<DispatchTable>,
        abandon: CancellationToken,
    ) -> Self {
        Self {
            queue,
            dispatch,
            abandon,
        }
    }

    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, type_name = %job.type_name, attempt = job.attempts_made)
    )]
    pub(crate) async fn execute_job(&self, job: Job) {
        let job_id = job.id.clone();
        let Some(handler) = self.dispatch.get(&job.type_name) else {
            let error = DroverError::UnknownJobType(job.type_name.clone());
            tracing::warn!(%job_id, "{error}, completing job {job_id} without running it");
            return self.handle_job_complete(&job, Value::Null).await;
        };

        tracing::debug!(%job_id, "Executing job {job_id}");
        let context = JobContext::new(job.clone(), self.queue.clone());
        let mut handle =
            tokio::spawn(async move { handler.handle(context).await }.in_current_span());

        let period = (self.queue.defaults().lock_duration / 2)
            .to_std()
            .unwrap_or_default()
            .max(MIN_RENEWAL_PERIOD);
        let mut renewal = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        let result = loop {
            tokio::select! {
                result = &mut handle => break result,
                _ = renewal.tick() => self.renew_lock(&job).await,
                _ = self.abandon.cancelled() => {
                    handle.abort();
                    tracing::warn!(%job_id, "Abandoning job {job_id}, its lock will expire");
                    return;
                }
            }
        };

        match result {
            Ok(ExecutionResult::Done(value)) => self.handle_job_complete(&job, value).await,
            Ok(ExecutionResult::Skipped { reason }) => {
                tracing::info!(%job_id, %reason, "Job {job_id} skipped: {reason}");
                self.handle_job_complete(&job, Value::Null).await
            }
            Ok(ExecutionResult::Error { error }) => self.handle_job_error(&job, error).await,
            Err(error) => self.handle_job_error(&job, error).await,
        }
    }

    async fn renew_lock(&self, job: &Job) {
        let job_id = &job.id;
        match self.queue.extend_lock(job).await {
            Ok(true) => tracing::trace!(%job_id, "Extended lock of job {job_id}"),
            Ok(false) => tracing::warn!(%job_id, "Job {job_id} is no longer held by this worker"),
            Err(err) => tracing::error!(
                ?err,
                %job_id,
                "Failed to extend lock of job {job_id}, error: {err:?}"
            ),
        }
    }

    async fn handle_job_complete(&self, job: &Job, return_value: Value) {
        let job_id = &job.id;
        tracing::debug!(%job_id, "Job complete {job_id}");
        let _ = self
            .queue
            .report_success(job, return_value)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to mark job {job_id} as complete, error: {err:?}",
                )
            });
    }

    async fn handle_job_error(&self, job: &Job, error: impl Into<backend::ExecutionError>) {
        let job_id = &job.id;
        let error = error.into();
        let error_type = error.error_type.clone();
        let failure = DroverError::HandlerExecutionFailure {
            job_id: job_id.clone(),
            attempt: job.attempts_made,
            error_type: error.error_type.clone(),
            message: error.message.clone(),
        };

        match self.queue.report_failure(job, error).await {
            Ok(FailureOutcome::Retrying { retry_at }) => tracing::warn!(
                %job_id,
                %error_type,
                %retry_at,
                "{failure}, will be retried at {retry_at}",
            ),
            Ok(FailureOutcome::Failed) => tracing::error!(
                %job_id,
                %error_type,
                "{failure}, no attempts remain",
            ),
            Err(err) => tracing::error!(
                ?err,
                %job_id,
                "Failed to record failure of job {job_id}, error: {err:?}",
            ),
        }
    }
}

impl From<JoinError> for backend::ExecutionError {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self::new(ERROR_TYPE_PANIC, message)
    }
}

impl From<Box<dyn ExecutionError>> for backend::ExecutionError {
    fn from(value: Box<dyn ExecutionError>) -> Self {
        Self::new(value.error_type(), value.to_string())
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
        dispatch::{
            test::{MockExecutionResult, MockReturnExecutor},
            Executor,
        },
        job::JobState,
        queue::JobDefaults,
    };
    use chrono::TimeDelta;

    async fn claimed(payload: Value) -> Job {
        let backend = InMemoryBackend::new();
        backend
            .enqueue(EnqueuableJob {
                payload,
                type_name: MockReturnExecutor::NAME.to_owned(),
                ..EnqueuableJob::mock_job()
            })
            .await
            .unwrap();
        backend
            .claim_next(TimeDelta::seconds(30))
            .await
            .unwrap()
            .unwrap()
    }

    fn runner(queue: Queue) -> JobRunner {
        let dispatch = DispatchTable::builder()
            .with_executor(MockReturnExecutor)
            .build()
            .unwrap();
        JobRunner::new(queue, Arc::new(dispatch), CancellationToken::new())
    }

    fn broker() -> MockBroker {
        let mut broker = MockBroker::new();
        broker
            .expect_subscribe()
            .returning(|| tokio::sync::broadcast::channel(1).1);
        broker
    }

    #[tokio::test]
    async fn custom_error_types_are_recorded() {
        let queue = Queue::new("test", InMemoryBackend::new());
        let id = queue
            .job(
                MockReturnExecutor::NAME,
                serde_json::to_value(MockExecutionResult::Error {
                    error: "bad input".to_owned(),
                })
                .unwrap(),
            )
            .enqueue()
            .await
            .unwrap();
        let job = queue.dequeue_next().await.unwrap().unwrap();

        runner(queue.clone()).execute_job(job).await;

        let job = queue.job_by_id(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.errors[0].error_type, "custom");
        assert_eq!(job.errors[0].message, "bad input");
    }

    #[tokio::test]
    async fn skipped_jobs_complete_without_a_value() {
        let queue = Queue::new("test", InMemoryBackend::new());
        let id = queue
            .job(
                MockReturnExecutor::NAME,
                serde_json::to_value(MockExecutionResult::Skip).unwrap(),
            )
            .enqueue()
            .await
            .unwrap();
        let job = queue.dequeue_next().await.unwrap().unwrap();

        runner(queue.clone()).execute_job(job).await;

        let job = queue.job_by_id(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.return_value, Some(Value::Null));
    }

    #[tokio::test]
    async fn unknown_job_types_complete_without_running() {
        let queue = Queue::new("test", InMemoryBackend::new());
        let id = queue
            .job("not-registered", Value::Null)
            .enqueue()
            .await
            .unwrap();
        let job = queue.dequeue_next().await.unwrap().unwrap();

        runner(queue.clone()).execute_job(job).await;

        let job = queue.job_by_id(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.errors.is_empty());
    }

    #[tokio::test]
    async fn broker_errors_while_reporting_are_logged() {
        let job = claimed(serde_json::to_value(MockExecutionResult::Done).unwrap()).await;
        let mut broker = broker();
        broker
            .expect_mark_job_complete()
            .times(1)
            .returning(|_, _, _| Err(unavailable()));

        runner(Queue::new("test", broker)).execute_job(job).await;
    }

    #[tokio::test]
    async fn failures_are_reported_to_the_broker() {
        let job = claimed(
            serde_json::to_value(MockExecutionResult::Error {
                error: "boom".to_owned(),
            })
            .unwrap(),
        )
        .await;
        let expected_id = job.id.clone();
        let mut broker = broker();
        broker
            .expect_mark_job_retryable()
            .withf(move |id, attempt, _, error| {
                id == &expected_id
                    && *attempt == 1
                    && error.error_type == "custom"
                    && error.message == "boom"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        runner(Queue::new("test", broker)).execute_job(job).await;
    }

    #[tokio::test]
    async fn locks_are_renewed_while_the_job_runs() {
        let job = claimed(
            serde_json::to_value(MockExecutionResult::Sleep { millis: 60 }).unwrap(),
        )
        .await;
        let mut broker = broker();
        broker
            .expect_extend_lock()
            .times(2..)
            .returning(|_, _, _| Ok(true));
        broker
            .expect_mark_job_complete()
            .times(1)
            .returning(|_, _, _| Ok(()));
        let queue = Queue::new("test", broker).with_defaults(JobDefaults {
            lock_duration: TimeDelta::milliseconds(40),
            ..Default::default()
        });

        runner(queue).execute_job(job).await;
    }

    #[tokio::test]
    async fn abandoned_jobs_are_not_reported() {
        let job = claimed(
            serde_json::to_value(MockExecutionResult::Sleep { millis: 60_000 }).unwrap(),
        )
        .await;
        let mut broker = broker();
        broker.expect_extend_lock().returning(|_, _, _| Ok(true));
        broker.expect_mark_job_complete().never();
        let runner = runner(Queue::new("test", broker));
        runner.abandon.cancel();

        runner.execute_job(job).await;
    }

    #[tokio::test]
    async fn panic_messages_are_captured() {
        let error = tokio::spawn(async { panic!("{}", "formatted panic") })
            .await
            .unwrap_err();

        let error = backend::ExecutionError::from(error);

        assert_eq!(error.error_type, "panic");
        assert_eq!(error.message, "formatted panic");
    }
}
