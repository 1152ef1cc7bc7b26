//! Ordered process shutdown.
//!
//! A [`Shutdown`] is a list of named steps run one after another. Each step is awaited before the
//! next one starts and every step runs even when an earlier one failed or panicked. Failures are
//! collected into the [`ShutdownReport`].
//!
//! # Example
//!
//! ```
//! # use drover::lifecycle::Shutdown;
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let report = Shutdown::new()
//!     .then("http", || async { Ok::<_, std::io::Error>(()) })
//!     .then("worker", || async { Err(std::io::Error::other("drain failed")) })
//!     .then("broker", || async { Ok::<_, std::io::Error>(()) })
//!     .run()
//!     .await;
//!
//! assert_eq!(report.completed, vec!["http", "broker"]);
//! assert_eq!(report.failures[0].step, "worker");
//! # });
//! ```
use std::{any::Any, future::Future, panic::AssertUnwindSafe};

use futures::{future::BoxFuture, FutureExt};

use crate::dispatch::BoxError;

type StepFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

struct Step {
    name: String,
    run: StepFn,
}

/// The steps of a shutdown sequence, in order.
#[derive(Default)]
pub struct Shutdown {
    steps: Vec<Step>,
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(|step| &step.name))
            .finish()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Default::default()
    }

    /// Appends a step. `step` is only called once every earlier step has finished.
    pub fn then<F, Fut, E>(mut self, name: impl Into<String>, step: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.steps.push(Step {
            name: name.into(),
            run: Box::new(move || async move { step().await.map_err(Into::into) }.boxed()),
        });
        self
    }

    /// Runs every step.
    pub async fn run(self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        for Step { name, run } in self.steps {
            tracing::info!(step = %name, "Shutting down {name}");
            match AssertUnwindSafe(run()).catch_unwind().await {
                Ok(Ok(())) => {
                    tracing::debug!(step = %name, "Shut down {name}");
                    report.completed.push(name);
                }
                Ok(Err(error)) => {
                    tracing::error!(step = %name, ?error, "Failed to shut down {name}: {error}");
                    report.failures.push(StepFailure {
                        step: name,
                        error: error.to_string(),
                    });
                }
                Err(panic) => {
                    let error = panic_message(panic.as_ref());
                    tracing::error!(step = %name, "Panicked while shutting down {name}: {error}");
                    report.failures.push(StepFailure { step: name, error });
                }
            }
        }
        report
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic".to_owned())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Steps that finished, in order.
    pub completed: Vec<String>,
    pub failures: Vec<StepFailure>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: String,
    pub error: String,
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn recording(
        log: &Log,
        name: &'static str,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<(), std::io::Error>> {
        let log = log.clone();
        move || {
            async move {
                tokio::task::yield_now().await;
                log.lock().unwrap().push(name);
                Ok(())
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn steps_run_in_order() {
        let log = Arc::new(Mutex::new(vec![]));

        let report = Shutdown::new()
            .then("http", recording(&log, "http"))
            .then("worker", recording(&log, "worker"))
            .then("broker", recording(&log, "broker"))
            .run()
            .await;

        assert!(report.is_clean());
        assert_eq!(*log.lock().unwrap(), vec!["http", "worker", "broker"]);
        assert_eq!(report.completed, vec!["http", "worker", "broker"]);
    }

    #[tokio::test]
    async fn later_steps_run_after_failures_and_panics() {
        let log = Arc::new(Mutex::new(vec![]));

        let report = Shutdown::new()
            .then("worker", || async {
                Err::<(), _>(std::io::Error::other("drain failed"))
            })
            .then("broker", || async {
                if true {
                    panic!("connection poisoned");
                }
                Ok::<_, std::io::Error>(())
            })
            .then("cache", recording(&log, "cache"))
            .run()
            .await;

        assert!(!report.is_clean());
        assert_eq!(report.completed, vec!["cache"]);
        assert_eq!(
            report.failures,
            vec![
                StepFailure {
                    step: "worker".to_owned(),
                    error: "drain failed".to_owned(),
                },
                StepFailure {
                    step: "broker".to_owned(),
                    error: "connection poisoned".to_owned(),
                },
            ]
        );
        assert_eq!(*log.lock().unwrap(), vec!["cache"]);
    }

    #[tokio::test]
    async fn empty_shutdown_is_clean() {
        assert!(Shutdown::new().run().await.is_clean());
    }
}
