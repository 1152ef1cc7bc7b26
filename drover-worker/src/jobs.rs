//! The job types owned by the worker process itself.
//!
//! Handlers for the remaining job types are registered by the services producing them. Jobs of a
//! type without a handler are completed with a warning.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::TimeDelta;
use drover::{
    dispatch::{DecodeError, HandlerError},
    prelude::*,
    DroverError,
};
use serde::Deserialize;
use serde_json::json;

pub const REFRESH_ALL_FEEDS: &str = "refresh-all-feeds";
pub const REFRESH_FEED: &str = "refresh-feed";
pub const SYNC_READ_POSITIONS: &str = "sync-read-positions";

pub const SYNC_READ_POSITIONS_EVERY: TimeDelta = TimeDelta::seconds(60);

/// Feed refreshes run after user initiated work.
pub const REFRESH_FEED_PRIORITY: u32 = 100;
pub const SYNC_READ_POSITIONS_PRIORITY: u32 = 50;

#[derive(Debug, Deserialize)]
pub struct FeedBatch {
    pub feeds: Vec<String>,
}

/// Enqueues a `refresh-feed` job for every feed of the batch.
///
/// Child ids are derived from the feed, so a feed whose refresh is still pending is not queued
/// twice.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshAllFeeds;

#[async_trait]
impl Handler for RefreshAllFeeds {
    async fn handle(&self, context: JobContext) -> ExecutionResult {
        let batch = match serde_json::from_value::<FeedBatch>(context.payload().clone()) {
            Ok(batch) => batch,
            Err(error) => return DecodeError(error).into(),
        };

        let mut enqueued = Vec::with_capacity(batch.feeds.len());
        for feed in batch.feeds {
            let id = context
                .queue()
                .job(REFRESH_FEED, json!({ "url": feed }))
                .for_owner(feed)
                .with_priority(REFRESH_FEED_PRIORITY)
                .enqueue()
                .await;
            match id {
                Ok(id) => enqueued.push(id),
                Err(error) => return HandlerError(error.into()).into(),
            }
        }
        enqueued.sort();
        enqueued.dedup();

        tracing::debug!(
            job_id = %context.id(),
            children = enqueued.len(),
            "Enqueued feed refreshes"
        );
        ExecutionResult::Done(json!({ "enqueued": enqueued.len() }))
    }
}

/// Samples the read position cache, skipping when no cache is configured.
#[derive(Debug, Clone, Default)]
pub struct SyncReadPositions {
    gauge: Option<Arc<ReadPositionGauge>>,
}

impl SyncReadPositions {
    pub fn new(gauge: Option<Arc<ReadPositionGauge>>) -> Self {
        Self { gauge }
    }
}

#[async_trait]
impl Handler for SyncReadPositions {
    async fn handle(&self, context: JobContext) -> ExecutionResult {
        let Some(gauge) = &self.gauge else {
            return ExecutionResult::skipped("no read position cache configured");
        };
        match gauge.read().await {
            Ok(positions) => {
                tracing::debug!(job_id = %context.id(), positions, "Read positions sampled");
                ExecutionResult::Done(json!({ "read_positions": positions }))
            }
            Err(error) => HandlerError(error.into()).into(),
        }
    }
}

pub fn dispatch_table(
    fanout_threshold: u64,
    read_positions: Option<Arc<ReadPositionGauge>>,
) -> Result<DispatchTable, DroverError> {
    DispatchTable::builder()
        .with_handler(
            REFRESH_ALL_FEEDS,
            Backpressure::new(RefreshAllFeeds).with_threshold(fanout_threshold),
        )
        .with_handler(SYNC_READ_POSITIONS, SyncReadPositions::new(read_positions))
        .build()
}

pub fn recurring() -> Scheduler {
    Scheduler::new().with_job(
        RecurringJob::new(SYNC_READ_POSITIONS, SYNC_READ_POSITIONS_EVERY)
            .with_priority(SYNC_READ_POSITIONS_PRIORITY),
    )
}
