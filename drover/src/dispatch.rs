//! Routing claimed jobs to the handler registered for their type.
//!
//! A handler is anything implementing [`Handler`]. Three ways of registering one are provided by
//! the [`DispatchTableBuilder`]:
//!
//! - [`DispatchTableBuilder::with_handler`] for a hand written [`Handler`],
//! - [`DispatchTableBuilder::with_executor`] for an [`Executor`] whose payload is decoded into a
//!   typed value,
//! - [`DispatchTableBuilder::with_fn`] for a plain async closure over the json payload.
use std::{error::Error, future::Future, sync::Arc};

use async_trait::async_trait;
use fxhash::FxHashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::{
    job::{Job, JobId},
    queue::Queue,
    DroverError,
};

pub type BoxError = Box<dyn Error + Send + Sync>;

/// The outcome of running a handler.
#[derive(Debug)]
pub enum ExecutionResult {
    /// The job completed, the value is stored as its return value.
    Done(Value),
    /// The handler decided not to do the work. The job is completed without a return value.
    Skipped { reason: String },
    /// The attempt failed and is retried or failed according to the job's attempts.
    Error { error: Box<dyn ExecutionError> },
}

impl ExecutionResult {
    /// Completed without a return value.
    pub fn done() -> Self {
        Self::Done(Value::Null)
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }
}

impl<T> From<T> for ExecutionResult
where
    T: ExecutionError + 'static,
{
    fn from(value: T) -> Self {
        Self::Error {
            error: Box::new(value),
        }
    }
}

/// An error returned from a handler.
pub trait ExecutionError: Error + Send + Sync {
    /// A short classification recorded with the failed attempt.
    fn error_type(&self) -> &'static str {
        HandlerError::ERROR_TYPE
    }
}

/// Wraps any error returned by a [`DispatchTableBuilder::with_fn`] closure.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub BoxError);

impl HandlerError {
    pub const ERROR_TYPE: &'static str = "handler";
}

impl ExecutionError for HandlerError {}

/// The payload of a job could not be decoded into the [`Executor::Data`] of its handler.
#[derive(Debug, Error)]
#[error("Failed to decode job payload: {0}")]
pub struct DecodeError(#[from] pub serde_json::Error);

impl ExecutionError for DecodeError {
    fn error_type(&self) -> &'static str {
        "decode"
    }
}

/// Everything a handler knows about the job it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    job: Job,
    queue: Queue,
}

impl JobContext {
    pub fn new(job: Job, queue: Queue) -> Self {
        Self { job, queue }
    }

    pub fn id(&self) -> &JobId {
        &self.job.id
    }

    pub fn payload(&self) -> &Value {
        &self.job.payload
    }

    /// The current attempt, starting at `1`.
    pub fn attempt(&self) -> u32 {
        self.job.attempts_made
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// The queue the job was claimed from, for handlers that enqueue follow up work.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }
}

/// Runs jobs of one type.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, context: JobContext) -> ExecutionResult;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn handle(&self, context: JobContext) -> ExecutionResult {
        self.as_ref().handle(context).await
    }
}

/// A handler with a typed payload.
///
/// # Example
///
/// ```
/// # use drover::prelude::*;
/// # use serde::Deserialize;
/// #[derive(Deserialize)]
/// struct RefreshFeed {
///     url: String,
/// }
///
/// struct RefreshFeedExecutor;
///
/// #[async_trait::async_trait]
/// impl Executor for RefreshFeedExecutor {
///     type Data = RefreshFeed;
///     const NAME: &'static str = "refresh-feed";
///
///     async fn execute(&self, data: Self::Data, _context: JobContext) -> ExecutionResult {
///         ExecutionResult::Done(serde_json::json!({ "refreshed": data.url }))
///     }
/// }
///
/// let dispatch = DispatchTable::builder()
///     .with_executor(RefreshFeedExecutor)
///     .build()
///     .unwrap();
/// assert!(dispatch.contains("refresh-feed"));
/// ```
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    type Data: DeserializeOwned + Send;
    /// The job type this executor handles.
    const NAME: &'static str;

    async fn execute(&self, data: Self::Data, context: JobContext) -> ExecutionResult;
}

struct ExecutorHandler<E>(E);

#[async_trait]
impl<E: Executor> Handler for ExecutorHandler<E> {
    async fn handle(&self, context: JobContext) -> ExecutionResult {
        match serde_json::from_value::<E::Data>(context.payload().clone()) {
            Ok(data) => self.0.execute(data, context).await,
            Err(error) => DecodeError(error).into(),
        }
    }
}

struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut, E> Handler for HandlerFn<F>
where
    F: Fn(Value, u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    async fn handle(&self, context: JobContext) -> ExecutionResult {
        let result = (self.0)(context.payload().clone(), context.attempt()).await;
        match result {
            Ok(value) => ExecutionResult::Done(value),
            Err(error) => HandlerError(error.into()).into(),
        }
    }
}

/// A map from job type to handler.
#[derive(Clone, Default)]
pub struct DispatchTable {
    handlers: FxHashMap<String, Arc<dyn Handler>>,
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl DispatchTable {
    pub fn builder() -> DispatchTableBuilder {
        Default::default()
    }

    /// Registers `handler` for `type_name`.
    pub fn register(
        &mut self,
        type_name: impl Into<String>,
        handler: impl Handler,
    ) -> Result<(), DroverError> {
        let type_name = type_name.into();
        if self.handlers.contains_key(&type_name) {
            return Err(DroverError::DuplicateHandler(type_name));
        }
        self.handlers.insert(type_name, Arc::new(handler));
        Ok(())
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(type_name).cloned()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.handlers.contains_key(type_name)
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Builds a [`DispatchTable`]. Registering two handlers for the same type fails the build with
/// [`DroverError::DuplicateHandler`].
#[derive(Debug, Default)]
pub struct DispatchTableBuilder {
    table: DispatchTable,
    error: Option<DroverError>,
}

impl DispatchTableBuilder {
    pub fn with_handler(mut self, type_name: impl Into<String>, handler: impl Handler) -> Self {
        if self.error.is_none() {
            self.error = self.table.register(type_name, handler).err();
        }
        self
    }

    pub fn with_executor<E: Executor>(self, executor: E) -> Self {
        self.with_handler(E::NAME, ExecutorHandler(executor))
    }

    pub fn with_fn<F, Fut, E>(self, type_name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.with_handler(type_name, HandlerFn(handler))
    }

    pub fn build(self) -> Result<DispatchTable, DroverError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.table),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::{
        backend::{memory::InMemoryBackend, Backend, EnqueuableJob},
        job::JobState,
    };
    use assert_matches::assert_matches;
    use chrono::TimeDelta;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub(crate) enum MockExecutionResult {
        Done,
        Skip,
        Panic,
        Sleep { millis: u64 },
        Error { error: String },
    }

    #[derive(Debug, Error)]
    #[error("{0}")]
    pub(crate) struct MockError(pub String);

    impl ExecutionError for MockError {
        fn error_type(&self) -> &'static str {
            "custom"
        }
    }

    pub(crate) struct MockReturnExecutor;

    #[async_trait]
    impl Executor for MockReturnExecutor {
        type Data = MockExecutionResult;
        const NAME: &'static str = "mock_executor";

        async fn execute(&self, data: Self::Data, context: JobContext) -> ExecutionResult {
            match data {
                MockExecutionResult::Done => ExecutionResult::Done(json!(context.attempt())),
                MockExecutionResult::Skip => ExecutionResult::skipped("nothing to do"),
                MockExecutionResult::Panic => panic!("job paniced"),
                MockExecutionResult::Sleep { millis } => {
                    tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
                    ExecutionResult::done()
                }
                MockExecutionResult::Error { error } => MockError(error).into(),
            }
        }
    }

    pub(crate) async fn context_for(payload: Value) -> JobContext {
        let backend = InMemoryBackend::new();
        backend
            .enqueue(EnqueuableJob {
                payload,
                ..EnqueuableJob::mock_job()
            })
            .await
            .unwrap();
        let job = backend
            .claim_next(TimeDelta::seconds(30))
            .await
            .unwrap()
            .unwrap();
        JobContext::new(job, Queue::new("test", backend))
    }

    #[test]
    fn duplicate_registration_fails_the_build() {
        let result = DispatchTable::builder()
            .with_executor(MockReturnExecutor)
            .with_fn(MockReturnExecutor::NAME, |_, _| async {
                Ok::<_, std::io::Error>(Value::Null)
            })
            .build();

        assert_matches!(result, Err(DroverError::DuplicateHandler(name)) if name == "mock_executor");
    }

    #[test]
    fn lookup_by_type() {
        let table = DispatchTable::builder()
            .with_executor(MockReturnExecutor)
            .with_fn("other", |_, _| async { Ok::<_, std::io::Error>(Value::Null) })
            .build()
            .unwrap();

        assert_eq!(table.len(), 2);
        assert!(table.get("mock_executor").is_some());
        assert!(table.get("other").is_some());
        assert!(table.get("missing").is_none());
        let mut types = table.job_types().collect::<Vec<_>>();
        types.sort();
        assert_eq!(types, vec!["mock_executor", "other"]);
    }

    #[tokio::test]
    async fn executor_decodes_payload() {
        let table = DispatchTable::builder()
            .with_executor(MockReturnExecutor)
            .build()
            .unwrap();
        let handler = table.get(MockReturnExecutor::NAME).unwrap();

        let result = handler
            .handle(context_for(serde_json::to_value(MockExecutionResult::Done).unwrap()).await)
            .await;
        assert_matches!(result, ExecutionResult::Done(value) if value == json!(1));

        let result = handler
            .handle(context_for(json!({"not": "a mock result"})).await)
            .await;
        assert_matches!(result, ExecutionResult::Error { error } if error.error_type() == "decode");
    }

    #[tokio::test]
    async fn closures_receive_payload_and_attempt() {
        let table = DispatchTable::builder()
            .with_fn("echo", |payload, attempt| async move {
                Ok::<_, std::io::Error>(json!({ "payload": payload, "attempt": attempt }))
            })
            .with_fn("fail", |_, _| async {
                Err::<Value, _>(std::io::Error::other("boom"))
            })
            .build()
            .unwrap();
        let context = context_for(json!("hello")).await;

        let result = table.get("echo").unwrap().handle(context.clone()).await;
        assert_matches!(
            result,
            ExecutionResult::Done(value) if value == json!({"payload": "hello", "attempt": 1})
        );

        let result = table.get("fail").unwrap().handle(context).await;
        assert_matches!(
            result,
            ExecutionResult::Error { error }
                if error.error_type() == "handler" && error.to_string() == "boom"
        );
    }

    #[tokio::test]
    async fn context_exposes_the_claimed_job() {
        let context = context_for(json!(42)).await;

        assert_eq!(context.payload(), &json!(42));
        assert_eq!(context.attempt(), 1);
        assert_eq!(context.job().state, JobState::Active);
        assert_eq!(context.queue().name(), "test");
    }
}
