//! The worker loop: claim, dispatch, report, repeat.
//!
//! A [`Worker`] claims jobs from its [`Queue`] one at a time, only once a concurrency slot is
//! free, and runs each claimed job in its own task. While idle it sleeps until the next delayed job
//! is due, a new job is added, or the poll interval elapses, whichever comes first. Stalled job
//! recovery runs alongside on its own interval.
//!
//! [`WorkerHandle::close`] stops claiming and waits for in flight jobs up to the drain timeout.
//! Jobs still running after that are abandoned, their locks expire and stalled recovery on any
//! worker picks them up again.
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    sync::{broadcast, Mutex, Semaphore},
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{
    dispatch::DispatchTable,
    events::QueueEvent,
    job::Job,
    queue::Queue,
    DroverError, ErrorPolicy, Phase,
};

mod runner;

use runner::JobRunner;

const MIN_SLEEP: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// The maximum number of jobs in flight.
    pub concurrency: usize,
    /// How long [`WorkerHandle::close`] waits for in flight jobs.
    pub drain_timeout: Duration,
    /// The longest the worker sleeps without checking for ready jobs.
    pub poll_interval: Duration,
    /// How often expired locks are recovered.
    pub stalled_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            drain_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            stalled_interval: Duration::from_secs(30),
        }
    }
}

/// Processes the jobs of a [`Queue`] with the handlers of a [`DispatchTable`].
#[derive(Debug)]
pub struct Worker {
    queue: Queue,
    dispatch: Arc<DispatchTable>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(queue: Queue, dispatch: DispatchTable) -> Self {
        Self {
            queue,
            dispatch: Arc::new(dispatch),
            config: Default::default(),
        }
    }

    pub fn with_config(self, config: WorkerConfig) -> Self {
        Self { config, ..self }
    }

    /// Starts claiming jobs in the background.
    pub fn spawn(self) -> WorkerHandle {
        let cancellation_token = CancellationToken::new();
        let abandon = CancellationToken::new();
        let tracker = TaskTracker::new();
        let drain_timeout = self.config.drain_timeout;
        tracing::info!(
            queue = self.queue.name(),
            concurrency = self.config.concurrency,
            job_types = ?self.dispatch.job_types().collect::<Vec<_>>(),
            "Starting worker"
        );

        let intake = tokio::spawn({
            let cancellation_token = cancellation_token.clone();
            let tracker = tracker.clone();
            let abandon = abandon.clone();
            async move {
                tokio::join!(
                    self.claim_loop(&cancellation_token, &tracker, &abandon),
                    self.stalled_loop(&cancellation_token),
                );
                tracing::debug!("Worker stopped claiming jobs");
            }
        });

        WorkerHandle {
            inner: Arc::new(HandleInner {
                cancellation_token,
                abandon,
                tracker,
                drain_timeout,
                intake: Mutex::new(Some(intake)),
            }),
        }
    }

    async fn claim_loop(
        &self,
        cancellation_token: &CancellationToken,
        tracker: &TaskTracker,
        abandon: &CancellationToken,
    ) {
        let slots = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut events = self.queue.subscribe();
        let runner = Arc::new(JobRunner::new(
            self.queue.clone(),
            self.dispatch.clone(),
            abandon.clone(),
        ));

        loop {
            let permit = tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.claim(cancellation_token).await {
                Ok(Some(job)) => {
                    let runner = runner.clone();
                    tracker.spawn(
                        async move {
                            runner.execute_job(job).await;
                            drop(permit);
                        }
                        .in_current_span(),
                    );
                }
                Ok(None) => {
                    drop(permit);
                    self.wait_for_work(cancellation_token, &mut events).await;
                }
                Err(DroverError::ShutdownInProgress) => break,
                Err(error) => {
                    drop(permit);
                    match error.policy(Phase::Running) {
                        ErrorPolicy::LogAndIgnore => {
                            tracing::warn!(?error, "Failed to claim job: {error}")
                        }
                        _ => tracing::error!(?error, "Failed to claim job, backing off: {error}"),
                    }
                    tokio::select! {
                        _ = cancellation_token.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {},
                    }
                }
            }
        }
    }

    async fn claim(&self, cancellation_token: &CancellationToken) -> Result<Option<Job>, DroverError> {
        if cancellation_token.is_cancelled() {
            return Err(DroverError::ShutdownInProgress);
        }
        self.queue.dequeue_next().await
    }

    async fn wait_for_work(
        &self,
        cancellation_token: &CancellationToken,
        events: &mut broadcast::Receiver<QueueEvent>,
    ) {
        let sleep_for = match self.queue.next_scheduled_at().await {
            Ok(Some(scheduled_at)) => (scheduled_at - Utc::now())
                .to_std()
                .unwrap_or_default()
                .clamp(MIN_SLEEP, self.config.poll_interval.max(MIN_SLEEP)),
            Ok(None) => self.config.poll_interval,
            Err(error) => {
                tracing::warn!(?error, "Failed to read next scheduled job: {error}");
                self.config.poll_interval
            }
        };

        tokio::select! {
            _ = cancellation_token.cancelled() => {},
            _ = tokio::time::sleep(sleep_for) => {},
            _ = next_wake(events) => {},
        }
    }

    async fn stalled_loop(&self, cancellation_token: &CancellationToken) {
        let mut interval = tokio::time::interval(self.config.stalled_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = interval.tick() => {},
            }
            match self.queue.recover_stalled().await {
                Ok(stalled) => {
                    for job in stalled {
                        tracing::warn!(
                            job_id = %job.id,
                            moved_to = %job.moved_to,
                            "Recovered stalled job {}",
                            job.id
                        );
                    }
                }
                Err(error) => tracing::error!(?error, "Failed to recover stalled jobs: {error}"),
            }
        }
    }
}

async fn next_wake(events: &mut broadcast::Receiver<QueueEvent>) {
    loop {
        match events.recv().await {
            Ok(event) if event.wakes_worker() => return,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

/// The outcome of [`WorkerHandle::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Jobs still running when the drain timeout elapsed.
    pub abandoned: usize,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned == 0
    }
}

/// Controls a running [`Worker`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    cancellation_token: CancellationToken,
    abandon: CancellationToken,
    tracker: TaskTracker,
    drain_timeout: Duration,
    intake: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Whether [`WorkerHandle::close`] has been called.
    pub fn is_draining(&self) -> bool {
        self.inner.cancellation_token.is_cancelled()
    }

    /// The number of jobs currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Stops claiming jobs and waits for in flight jobs up to the drain timeout.
    ///
    /// No job is claimed once this returns. Calling it again waits for the same drain.
    pub async fn close(&self) -> DrainReport {
        let inner = &self.inner;
        inner.cancellation_token.cancel();

        if let Some(intake) = inner.intake.lock().await.take() {
            let _ = intake
                .await
                .inspect_err(|error| tracing::error!(?error, "Worker intake task failed: {error}"));
        }
        inner.tracker.close();

        let drained = tokio::time::timeout(inner.drain_timeout, inner.tracker.wait()).await;
        let abandoned = match drained {
            Ok(()) => 0,
            Err(_) => {
                let abandoned = inner.tracker.len();
                tracing::warn!(
                    abandoned,
                    "Drain timeout elapsed, abandoning {abandoned} in flight jobs to lock expiry"
                );
                inner.abandon.cancel();
                inner.tracker.wait().await;
                abandoned
            }
        };
        tracing::info!(abandoned, "Worker closed");
        DrainReport { abandoned }
    }
}
