//! Periodic removal of finished jobs.
//!
//! Every job carries a [`RetentionPolicy`](crate::job::RetentionPolicy) deciding how long it is
//! kept once completed or failed. The broker only records when each finished job expires; the
//! pruner deletes the expired ones on a [`cron::Schedule`].
//!
//! # Example
//!
//! ```
//! # use drover::prelude::*;
//! # use drover::backend::memory::InMemoryBackend;
//! # use std::str::FromStr;
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let queue = Queue::new("example", InMemoryBackend::new());
//! let cancellation_token = tokio_util::sync::CancellationToken::new();
//!
//! let config = PrunerConfig::new(cron::Schedule::from_str("0 */5 * * * *").unwrap());
//! let handle = spawn_pruner(queue, config, cancellation_token.clone());
//!
//! cancellation_token.cancel();
//! handle.await.unwrap();
//! # });
//! ```
use std::str::FromStr;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{queue::Queue, DroverError};

pub(crate) mod runner;

use runner::PrunerRunner;

/// When the pruner runs.
#[derive(Debug, Clone)]
pub struct PrunerConfig {
    schedule: cron::Schedule,
}

impl PrunerConfig {
    pub const DEFAULT_SCHEDULE: &'static str = "0 */5 * * * *";

    pub fn new(schedule: cron::Schedule) -> Self {
        Self { schedule }
    }

    pub fn schedule(&self) -> &cron::Schedule {
        &self.schedule
    }
}

impl FromStr for PrunerConfig {
    type Err = DroverError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        cron::Schedule::from_str(expression)
            .map(Self::new)
            .map_err(|error| {
                DroverError::InvalidOptions(format!("invalid prune schedule `{expression}`: {error}"))
            })
    }
}

/// Runs the pruner for `queue` until `cancellation_token` is cancelled.
pub fn spawn_pruner(
    queue: Queue,
    config: PrunerConfig,
    cancellation_token: CancellationToken,
) -> JoinHandle<()> {
    PrunerRunner::new(queue, config).spawn(cancellation_token)
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parses_schedules() {
        let config: PrunerConfig = PrunerConfig::DEFAULT_SCHEDULE.parse().unwrap();
        assert!(config.schedule().upcoming(chrono::Utc).next().is_some());

        assert_matches!(
            "every five minutes".parse::<PrunerConfig>(),
            Err(DroverError::InvalidOptions(_))
        );
    }
}
