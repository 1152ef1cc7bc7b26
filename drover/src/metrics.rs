//! Queue gauges in the Prometheus text exposition format.
//!
//! [`MetricsSnapshot::collect`] reads the job counts of the reported states, the age of the oldest
//! prioritized job, and optionally an approximate key count from an auxiliary datastore through a
//! [`ReadPositionGauge`]. [`MetricsSnapshot::render`] formats them.
use std::fmt::Write;

use async_trait::async_trait;
use chrono::TimeDelta;

use crate::{
    backend::{BackendError, StateCounts},
    job::JobState,
    queue::Queue,
    DroverError,
};

/// The states exported as `{prefix}_queue_messages_{state}`.
pub const REPORTED_STATES: [JobState; 4] = [
    JobState::Active,
    JobState::Failed,
    JobState::Completed,
    JobState::Prioritized,
];

/// One bounded pass of a key scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanBatch {
    /// Keys returned by the pass.
    pub keys: u64,
    /// Whether the pass covered the whole keyspace.
    pub complete: bool,
}

/// Counts keys with a single bounded scan.
#[async_trait]
pub trait KeyScan: Send + Sync {
    async fn scan_once(&self) -> Result<ScanBatch, BackendError>;
}

/// Reports the number of cached reading positions, or a sentinel when there are too many to
/// count in one pass.
pub struct ReadPositionGauge {
    scanner: Box<dyn KeyScan>,
    sentinel: u64,
}

impl std::fmt::Debug for ReadPositionGauge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadPositionGauge")
            .field("sentinel", &self.sentinel)
            .finish_non_exhaustive()
    }
}

impl ReadPositionGauge {
    pub const DEFAULT_SENTINEL: u64 = 10_001;

    pub fn new(scanner: impl KeyScan + 'static) -> Self {
        Self {
            scanner: Box::new(scanner),
            sentinel: Self::DEFAULT_SENTINEL,
        }
    }

    pub fn with_sentinel(self, sentinel: u64) -> Self {
        Self { sentinel, ..self }
    }

    pub async fn read(&self) -> Result<u64, BackendError> {
        let batch = self.scanner.scan_once().await?;
        Ok(if batch.complete {
            batch.keys
        } else {
            self.sentinel
        })
    }
}

/// A point in time reading of the queue gauges.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub queue: String,
    pub counts: StateCounts,
    /// `None` when nothing is prioritized.
    pub oldest_prioritized_age: Option<TimeDelta>,
    /// `None` when no gauge is configured or the scan failed.
    pub read_positions: Option<u64>,
}

impl MetricsSnapshot {
    /// Reads the gauges. Fails when the queue cannot be read; a failed read position scan only
    /// drops that gauge.
    pub async fn collect(
        queue: &Queue,
        read_positions: Option<&ReadPositionGauge>,
    ) -> Result<Self, DroverError> {
        let counts = queue.counts(&REPORTED_STATES).await?;
        let oldest_prioritized_age = queue.oldest_age(JobState::Prioritized).await?;
        let read_positions = match read_positions {
            Some(gauge) => gauge
                .read()
                .await
                .inspect_err(|error| {
                    tracing::warn!(?error, "Failed to count read positions: {error}")
                })
                .ok(),
            None => None,
        };

        Ok(Self {
            queue: queue.name().to_owned(),
            counts,
            oldest_prioritized_age,
            read_positions,
        })
    }

    pub fn render(&self, prefix: &str) -> String {
        let mut output = String::new();
        let queue = &self.queue;

        for state in REPORTED_STATES {
            let name = format!("{prefix}_queue_messages_{state}");
            let _ = writeln!(output, "# TYPE {name} gauge");
            let _ = writeln!(output, "{name}{{queue=\"{queue}\"}} {}", self.counts.get(state));
        }

        if let Some(read_positions) = self.read_positions {
            let name = format!("{prefix}_read_position_messages");
            let _ = writeln!(output, "# TYPE {name} gauge");
            let _ = writeln!(output, "{name}{{queue=\"{queue}\"}} {read_positions}");
        }

        let age = self
            .oldest_prioritized_age
            .map(|age| age.num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or_default();
        let name = format!("{prefix}_queue_messages_oldest_job_age_seconds");
        let _ = writeln!(output, "# TYPE {name} gauge");
        let _ = writeln!(output, "{name}{{queue=\"{queue}\"}} {age}");

        output
    }
}
