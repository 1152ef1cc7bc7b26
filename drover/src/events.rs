//! Job lifecycle events.
//!
//! Backends publish a [`QueueEvent`] on a broadcast channel whenever they change a job. The worker
//! uses them to wake up as soon as work arrives, and [`spawn_observer`] forwards them to a
//! [`QueueObserver`] such as the [`LoggingObserver`].
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::job::JobId;

/// Capacity of the broadcast channel used by the backends.
pub const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Added {
        id: JobId,
        type_name: String,
    },
    Completed {
        id: JobId,
    },
    /// A failed attempt was rescheduled.
    Retrying {
        id: JobId,
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    /// The final attempt failed.
    Failed {
        id: JobId,
        attempt: u32,
        reason: String,
    },
    /// The lock of an active job expired before it finished.
    Stalled {
        id: JobId,
    },
    Removed {
        id: JobId,
    },
}

impl QueueEvent {
    pub fn id(&self) -> &JobId {
        match self {
            Self::Added { id, .. }
            | Self::Completed { id }
            | Self::Retrying { id, .. }
            | Self::Failed { id, .. }
            | Self::Stalled { id }
            | Self::Removed { id } => id,
        }
    }

    /// Whether the event may have made a job ready to claim.
    pub(crate) fn wakes_worker(&self) -> bool {
        matches!(self, Self::Added { .. } | Self::Stalled { .. })
    }
}

/// Receives queue events.
#[async_trait]
pub trait QueueObserver: Send + Sync + 'static {
    async fn on_event(&self, event: QueueEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

#[async_trait]
impl QueueObserver for LoggingObserver {
    async fn on_event(&self, event: QueueEvent) {
        match event {
            QueueEvent::Added { id, type_name } => {
                tracing::debug!(job_id = %id, %type_name, "Job added")
            }
            QueueEvent::Completed { id } => tracing::info!(job_id = %id, "Job completed"),
            QueueEvent::Retrying {
                id,
                attempt,
                retry_at,
            } => tracing::warn!(job_id = %id, attempt, %retry_at, "Job attempt failed, retrying"),
            QueueEvent::Failed {
                id,
                attempt,
                reason,
            } => tracing::error!(job_id = %id, attempt, %reason, "Job failed"),
            QueueEvent::Stalled { id } => tracing::warn!(job_id = %id, "Job stalled"),
            QueueEvent::Removed { id } => tracing::debug!(job_id = %id, "Job removed"),
        }
    }
}

/// Forwards events from `receiver` to `observer` until `cancellation_token` is cancelled or the
/// channel closes.
pub fn spawn_observer<O: QueueObserver>(
    mut receiver: broadcast::Receiver<QueueEvent>,
    observer: O,
    cancellation_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                event = receiver.recv() => match event {
                    Ok(event) => observer.on_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Queue observer lagging, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!("Queue observer stopped");
    })
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<QueueEvent>>>);

    #[async_trait]
    impl QueueObserver for Recorder {
        async fn on_event(&self, event: QueueEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn observer_receives_events_until_cancelled() {
        let (sender, receiver) = broadcast::channel(EVENT_CAPACITY);
        let recorder = Recorder::default();
        let token = CancellationToken::new();
        let handle = spawn_observer(receiver, recorder.clone(), token.clone());

        sender
            .send(QueueEvent::Completed { id: "1".into() })
            .unwrap();
        sender.send(QueueEvent::Stalled { id: "2".into() }).unwrap();
        drop(sender);
        handle.await.unwrap();

        let events = recorder.0.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                QueueEvent::Completed { id: "1".into() },
                QueueEvent::Stalled { id: "2".into() }
            ]
        );
    }

    #[tokio::test]
    async fn observer_stops_on_cancellation() {
        let (_sender, receiver) = broadcast::channel(EVENT_CAPACITY);
        let token = CancellationToken::new();
        let handle = spawn_observer(receiver, LoggingObserver, token.clone());

        token.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn only_new_work_wakes_the_worker() {
        assert!(QueueEvent::Added {
            id: "1".into(),
            type_name: "t".into()
        }
        .wakes_worker());
        assert!(QueueEvent::Stalled { id: "1".into() }.wakes_worker());
        assert!(!QueueEvent::Completed { id: "1".into() }.wakes_worker());
    }
}
