//! Provides an in memory implementation of [`Backend`].
//!
//! It is not optimized instead is designed to be a correct implementation for use in tests and
//! for running a single process without a broker.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::broadcast;

use super::{
    Backend, BackendError, EnqueuableJob, Enqueued, ExecutionError, Page, Stalled, StateCounts,
};
use crate::{
    events::{QueueEvent, EVENT_CAPACITY},
    job::{Job, JobId, JobState, RepeatableEntry},
};

/// An in memory implementation of [`Backend`].
///
/// Clones share the same jobs.
#[derive(Clone)]
pub struct InMemoryBackend {
    store: Arc<RwLock<Store>>,
    events: broadcast::Sender<QueueEvent>,
    closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct Store {
    jobs: HashMap<JobId, StoredJob>,
    repeatables: BTreeMap<String, RepeatableEntry>,
    id_counter: u64,
    seq: u64,
}

#[derive(Clone)]
struct StoredJob {
    job: Job,
    seq: u64,
    lock_until: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
}

impl std::ops::Deref for StoredJob {
    type Target = Job;

    fn deref(&self) -> &Self::Target {
        &self.job
    }
}

impl std::ops::DerefMut for StoredJob {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.job
    }
}

impl StoredJob {
    fn sort_key(&self) -> (i64, u64) {
        let primary = match self.state {
            JobState::Waiting => 0,
            JobState::Prioritized => self.priority.into(),
            JobState::Delayed => self.scheduled_at.timestamp_millis(),
            JobState::Active => self.lock_until.map_or(0, |at| at.timestamp_millis()),
            JobState::Completed | JobState::Failed => {
                self.finished_at.map_or(0, |at| at.timestamp_millis())
            }
        };
        (primary, self.seq)
    }

    fn held_by(&self, attempt: u32) -> bool {
        self.state == JobState::Active && self.attempts_made == attempt
    }

    fn active(&mut self, attempt: u32) -> Result<&mut Self, BackendError> {
        if self.held_by(attempt) {
            Ok(self)
        } else {
            Err(BackendError::NotActive(self.id.clone()))
        }
    }

    fn mark_job_ready(&mut self, seq: u64) {
        self.seq = seq;
        self.lock_until = None;
        self.state = EnqueuableJob::ready_state(self.priority);
    }

    fn mark_job_active(&mut self, now: DateTime<Utc>, lock: TimeDelta) {
        self.state = JobState::Active;
        self.attempts_made += 1;
        self.processed_at = Some(now);
        self.lock_until = Some(now + lock);
    }

    fn mark_job_finished(&mut self, state: JobState, now: DateTime<Utc>) {
        self.state = state;
        self.finished_at = Some(now);
        self.lock_until = None;
        self.expires_at = self.retention.for_state(state).expires_at(now);
    }

    fn record_error(&mut self, error: ExecutionError, now: DateTime<Utc>) {
        let attempt = self.attempts_made;
        self.errors.push(error.into_job_error(attempt, now));
    }
}

impl Store {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        let mut due = self
            .jobs
            .values()
            .filter(|job| job.state == JobState::Delayed && job.scheduled_at <= now)
            .map(|job| (job.scheduled_at, job.seq, job.id.clone()))
            .collect::<Vec<_>>();
        due.sort();
        for (_, _, id) in due {
            let seq = self.next_seq();
            if let Some(job) = self.jobs.get_mut(&id) {
                job.mark_job_ready(seq);
            }
        }
    }

    fn next_ready(&self) -> Option<JobId> {
        let ready = |state: JobState| {
            self.jobs
                .values()
                .filter(move |job| job.state == state)
                .min_by_key(|job| job.sort_key())
                .map(|job| job.id.clone())
        };
        ready(JobState::Waiting).or_else(|| ready(JobState::Prioritized))
    }

    fn job_mut(&mut self, id: &JobId) -> Result<&mut StoredJob, BackendError> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| BackendError::JobNotFound(id.clone()))
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// Creates a new instance of [`InMemoryBackend`].
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store: Default::default(),
            events,
            closed: Default::default(),
        }
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Store>, BackendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::BrokerUnavailable(
                "in memory backend closed".to_owned(),
            ));
        }
        self.store.write().map_err(|_| BackendError::BadState)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Store>, BackendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::BrokerUnavailable(
                "in memory backend closed".to_owned(),
            ));
        }
        self.store.read().map_err(|_| BackendError::BadState)
    }

    fn emit(&self, event: QueueEvent) {
        // No receivers is not an error.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn enqueue(&self, job: EnqueuableJob) -> Result<Enqueued, BackendError> {
        let now = Utc::now();
        let mut store = self.write()?;
        let id = match job.id.clone() {
            Some(id) => id,
            None => {
                store.id_counter += 1;
                JobId::new(store.id_counter.to_string())
            }
        };
        if let Some(existing) = store.jobs.get(&id) {
            if !existing.state.is_finished() {
                return Ok(Enqueued {
                    id,
                    inserted: false,
                });
            }
        }
        let seq = store.next_seq();
        let type_name = job.type_name.clone();
        store.jobs.insert(
            id.clone(),
            StoredJob {
                job: job.into_job(id.clone(), now),
                seq,
                lock_until: None,
                expires_at: None,
            },
        );
        drop(store);

        self.emit(QueueEvent::Added {
            id: id.clone(),
            type_name,
        });
        Ok(Enqueued { id, inserted: true })
    }

    async fn claim_next(&self, lock: TimeDelta) -> Result<Option<Job>, BackendError> {
        let now = Utc::now();
        let mut store = self.write()?;
        store.promote_due(now);
        let Some(id) = store.next_ready() else {
            return Ok(None);
        };
        let job = store.job_mut(&id)?;
        job.mark_job_active(now, lock);
        Ok(Some(job.job.clone()))
    }

    async fn next_scheduled_at(&self) -> Result<Option<DateTime<Utc>>, BackendError> {
        Ok(self
            .read()?
            .jobs
            .values()
            .filter(|job| job.state == JobState::Delayed)
            .map(|job| job.scheduled_at)
            .min())
    }

    async fn extend_lock(
        &self,
        id: &JobId,
        attempt: u32,
        lock: TimeDelta,
    ) -> Result<bool, BackendError> {
        let mut store = self.write()?;
        match store.jobs.get_mut(id) {
            Some(job) if job.held_by(attempt) => {
                job.lock_until = Some(Utc::now() + lock);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_job_complete(
        &self,
        id: &JobId,
        attempt: u32,
        return_value: serde_json::Value,
    ) -> Result<(), BackendError> {
        let mut store = self.write()?;
        let job = store.job_mut(id)?.active(attempt)?;
        job.return_value = Some(return_value);
        job.mark_job_finished(JobState::Completed, Utc::now());
        drop(store);

        self.emit(QueueEvent::Completed { id: id.clone() });
        Ok(())
    }

    async fn mark_job_retryable(
        &self,
        id: &JobId,
        attempt: u32,
        retry_at: DateTime<Utc>,
        error: ExecutionError,
    ) -> Result<(), BackendError> {
        let mut store = self.write()?;
        let job = store.job_mut(id)?.active(attempt)?;
        job.record_error(error, Utc::now());
        job.state = JobState::Delayed;
        job.scheduled_at = retry_at;
        job.lock_until = None;
        drop(store);

        self.emit(QueueEvent::Retrying {
            id: id.clone(),
            attempt,
            retry_at,
        });
        Ok(())
    }

    async fn mark_job_failed(
        &self,
        id: &JobId,
        attempt: u32,
        error: ExecutionError,
    ) -> Result<(), BackendError> {
        let now = Utc::now();
        let reason = error.message.clone();
        let mut store = self.write()?;
        let job = store.job_mut(id)?.active(attempt)?;
        job.record_error(error, now);
        job.mark_job_finished(JobState::Failed, now);
        drop(store);

        self.emit(QueueEvent::Failed {
            id: id.clone(),
            attempt,
            reason,
        });
        Ok(())
    }

    async fn recover_stalled(&self, now: DateTime<Utc>) -> Result<Vec<Stalled>, BackendError> {
        let mut store = self.write()?;
        let mut stalled = store
            .jobs
            .values()
            .filter(|job| job.state == JobState::Active && job.lock_until.is_some_and(|at| at < now))
            .map(|job| (job.sort_key(), job.id.clone()))
            .collect::<Vec<_>>();
        stalled.sort();

        let mut recovered = Vec::with_capacity(stalled.len());
        for (_, id) in stalled {
            let seq = store.next_seq();
            let job = store.job_mut(&id)?;
            if job.is_final_attempt() {
                job.record_error(ExecutionError::stalled(), now);
                job.mark_job_finished(JobState::Failed, now);
            } else {
                job.mark_job_ready(seq);
            }
            recovered.push(Stalled {
                id,
                moved_to: job.state,
            });
        }
        drop(store);

        for job in &recovered {
            self.emit(QueueEvent::Stalled { id: job.id.clone() });
        }
        Ok(recovered)
    }

    async fn counts(&self, states: &[JobState]) -> Result<StateCounts, BackendError> {
        let store = self.read()?;
        Ok(states
            .iter()
            .map(|state| {
                let count = store
                    .jobs
                    .values()
                    .filter(|job| job.state == *state)
                    .count();
                (*state, count as u64)
            })
            .collect())
    }

    async fn jobs(&self, state: JobState, page: Page) -> Result<Vec<Job>, BackendError> {
        let store = self.read()?;
        let mut jobs = store
            .jobs
            .values()
            .filter(|job| job.state == state)
            .collect::<Vec<_>>();
        jobs.sort_by_key(|job| job.sort_key());
        Ok(page
            .apply(jobs)
            .into_iter()
            .map(|job| job.job.clone())
            .collect())
    }

    async fn job(&self, id: &JobId) -> Result<Option<Job>, BackendError> {
        Ok(self.read()?.jobs.get(id).map(|job| job.job.clone()))
    }

    async fn remove(&self, id: &JobId) -> Result<bool, BackendError> {
        let removed = self.write()?.jobs.remove(id).is_some();
        if removed {
            self.emit(QueueEvent::Removed { id: id.clone() });
        }
        Ok(removed)
    }

    async fn prune(&self, now: DateTime<Utc>) -> Result<u64, BackendError> {
        let mut store = self.write()?;
        let before = store.jobs.len();
        store.jobs.retain(|_, job| {
            !(job.state.is_finished() && job.expires_at.is_some_and(|at| at <= now))
        });
        Ok((before - store.jobs.len()) as u64)
    }

    async fn add_repeatable(&self, entry: RepeatableEntry) -> Result<bool, BackendError> {
        let mut store = self.write()?;
        if store.repeatables.contains_key(&entry.key) {
            return Ok(false);
        }
        store.repeatables.insert(entry.key.clone(), entry);
        Ok(true)
    }

    async fn advance_repeatable(
        &self,
        key: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, BackendError> {
        Ok(match self.write()?.repeatables.get_mut(key) {
            Some(entry) => {
                entry.next_run_at = next_run_at;
                true
            }
            None => false,
        })
    }

    async fn repeatable(&self, key: &str) -> Result<Option<RepeatableEntry>, BackendError> {
        Ok(self.read()?.repeatables.get(key).cloned())
    }

    async fn repeatables(&self) -> Result<Vec<RepeatableEntry>, BackendError> {
        Ok(self.read()?.repeatables.values().cloned().collect())
    }

    async fn remove_repeatable(
        &self,
        key: &str,
    ) -> Result<Option<RepeatableEntry>, BackendError> {
        Ok(self.write()?.repeatables.remove(key))
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.read().map(|_| ())
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, Ordering::Release);
        tracing::debug!("In memory backend closed");
        Ok(())
    }
}

#[cfg(test)]
pub(super) mod test {
    use super::*;
    use crate::test_suite;
    use assert_matches::assert_matches;

    test_suite!(for: InMemoryBackend::new());

    #[tokio::test]
    async fn clones_share_jobs() {
        let backend = InMemoryBackend::new();
        let clone = backend.clone();
        let enqueued = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

        assert!(clone.job(&enqueued.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn badstate_errors() {
        let backend = InMemoryBackend::new();
        let enqueued = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

        tokio::task::spawn({
            let backend = backend.clone();
            async move {
                let _guard = backend.store.write();
                panic!()
            }
        })
        .await
        .unwrap_err();

        assert_matches!(
            backend.enqueue(EnqueuableJob::mock_job()).await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend.claim_next(TimeDelta::seconds(30)).await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend
                .mark_job_complete(&enqueued.id, 1, serde_json::Value::Null)
                .await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend.prune(Utc::now()).await,
            Err(BackendError::BadState)
        );
        assert_matches!(backend.ping().await, Err(BackendError::BadState));
    }
}
