use std::{ops::Sub, time::Duration};

use chrono::{TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::queue::Queue;

use super::PrunerConfig;

pub(crate) struct PrunerRunner {
    config: PrunerConfig,
    queue: Queue,
}

impl PrunerRunner {
    pub fn new(queue: Queue, config: PrunerConfig) -> Self {
        Self { queue, config }
    }

    pub fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn({
            async move {
                loop {
                    let Some(next) = self.config.schedule.upcoming(Utc).next() else {
                        tracing::warn!("No future run scheduled for the job pruner, stopping");
                        break;
                    };
                    let delay = next
                        .sub(Utc::now())
                        .sub(TimeDelta::milliseconds(10))
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            self.prune().await;
                            let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                            tokio::time::sleep(delay).await;
                        }
                        _ = cancellation_token.cancelled() => {
                            tracing::debug!("Shutting down the job pruner");
                            break;
                        },
                    }
                }
            }
        })
    }

    async fn prune(&self) {
        match self.queue.prune().await {
            Ok(0) => tracing::trace!("No expired jobs to prune"),
            Ok(removed) => tracing::debug!(removed, "Pruned {removed} expired jobs"),
            Err(err) => tracing::error!(?err, "Failed to clean up jobs with error {err}"),
        }
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;
    use crate::{
        backend::memory::InMemoryBackend,
        job::{Keep, RetentionPolicy},
    };
    use serde_json::json;

    #[tokio::test]
    async fn prunes_on_schedule_until_cancelled() {
        let queue = Queue::new("test", InMemoryBackend::new());
        let id = queue
            .job("type", json!(null))
            .with_retention(RetentionPolicy {
                on_complete: Keep::Nothing,
                on_fail: Keep::Nothing,
            })
            .enqueue()
            .await
            .unwrap();
        let job = queue.dequeue_next().await.unwrap().unwrap();
        queue.report_success(&job, json!(null)).await.unwrap();

        let cancellation_token = CancellationToken::new();
        let handle = PrunerRunner::new(
            queue.clone(),
            PrunerConfig::from_str("* * * * * *").unwrap(),
        )
        .spawn(cancellation_token.clone());

        tokio::time::timeout(Duration::from_secs(3), async {
            while queue.job_by_id(&id).await.unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        cancellation_token.cancel();
        handle.await.unwrap();
    }
}
