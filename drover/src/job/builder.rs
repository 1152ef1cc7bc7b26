use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    backoff::Backoff,
    job::{JobId, Repeat, RetentionPolicy},
    queue::{JobOptions, Queue},
    DroverError,
};

/// Fluent construction of a job, created with [`Queue::job`].
///
/// # Example
///
/// ```
/// # use drover::prelude::*;
/// # use drover::backend::memory::InMemoryBackend;
/// # use chrono::TimeDelta;
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let queue = Queue::new("example", InMemoryBackend::new());
///
/// let id = queue
///     .job("refresh-feed", serde_json::json!({ "url": "https://example.com/rss" }))
///     .for_owner("feed-17")
///     .with_priority(10)
///     .schedule_in(TimeDelta::seconds(5))
///     .enqueue()
///     .await
///     .unwrap();
///
/// assert_eq!(id.as_str(), "refresh-feed_feed-17_v001");
/// # });
/// ```
#[derive(Debug)]
pub struct JobBuilder<'a> {
    queue: &'a Queue,
    type_name: String,
    payload: serde_json::Value,
    options: JobOptions,
}

impl<'a> JobBuilder<'a> {
    pub(crate) fn new(queue: &'a Queue, type_name: String, payload: serde_json::Value) -> Self {
        Self {
            queue,
            type_name,
            payload,
            options: Default::default(),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.options.priority = Some(priority);
        self
    }

    pub fn schedule_in(mut self, delay: TimeDelta) -> Self {
        self.options.delay = Some(delay);
        self
    }

    /// Times in the past run immediately.
    pub fn schedule_at(self, scheduled_at: DateTime<Utc>) -> Self {
        let delay = (scheduled_at - Utc::now()).max(TimeDelta::zero());
        self.schedule_in(delay)
    }

    pub fn repeat_every(mut self, interval: TimeDelta) -> Self {
        self.options.repeat = Some(Repeat::every(interval));
        self
    }

    /// Deduplicate against pending jobs of the same type for `owner`.
    pub fn for_owner(mut self, owner: impl Into<String>) -> Self {
        self.options.owner = Some(owner.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.options.id = Some(id.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.options.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.options.backoff = Some(backoff);
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.options.retention = Some(retention);
        self
    }

    pub async fn enqueue(self) -> Result<JobId, DroverError> {
        self.queue
            .enqueue(&self.type_name, self.payload, self.options)
            .await
    }
}
