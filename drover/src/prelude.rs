//! The purpose of this module is to alleviate the need to import many of the `[drover]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use drover::prelude::*;
//! ```
pub use crate::admission::Backpressure;
pub use crate::backoff::{Backoff, Curve, Jitter, Strategy};
pub use crate::dispatch::{
    DispatchTable, ExecutionError, ExecutionResult, Executor, Handler, JobContext,
};
pub use crate::events::{spawn_observer, LoggingObserver, QueueEvent, QueueObserver};
pub use crate::job::{Job, JobId, JobState, Keep, Repeat, RetentionPolicy};
pub use crate::lifecycle::Shutdown;
pub use crate::metrics::{MetricsSnapshot, ReadPositionGauge};
pub use crate::pruner::{spawn_pruner, PrunerConfig};
pub use crate::queue::{JobDefaults, JobOptions, Queue};
pub use crate::scheduler::{RecurringJob, Scheduler};
pub use crate::worker::{Worker, WorkerConfig, WorkerHandle};
pub use crate::DroverError;
