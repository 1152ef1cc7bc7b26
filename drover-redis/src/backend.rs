use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use drover::{
    backend::{
        Backend, BackendError, EnqueuableJob, Enqueued, ExecutionError, Page, Stalled,
        StateCounts,
    },
    events::QueueEvent,
    job::{Job, JobId, JobState, RepeatableEntry},
};
use redis::aio::ConnectionManager;
use tokio::sync::broadcast;
use tracing::instrument;

use crate::{
    map_err,
    types::{from_score, to_millis, EnqueueArgs, StoredJob, StoredRepeatable},
    RedisBackend,
};

/// The status codes returned by the scripts that act on active jobs.
const MISSING: i64 = -1;
/// Not active, or held by a later claim.
const NOT_ACTIVE: i64 = 0;

fn handle_status(id: &JobId, status: i64) -> Result<(), BackendError> {
    match status {
        MISSING => Err(BackendError::JobNotFound(id.clone())),
        NOT_ACTIVE => Err(BackendError::NotActive(id.clone())),
        _ => Ok(()),
    }
}

impl RedisBackend {
    async fn load_job(
        &self,
        conn: &mut ConnectionManager,
        id: &JobId,
    ) -> Result<Option<Job>, BackendError> {
        let (fields, errors): (HashMap<String, String>, Vec<String>) = redis::pipe()
            .cmd("HGETALL")
            .arg(self.namespace.job(id))
            .cmd("LRANGE")
            .arg(self.namespace.errors(id))
            .arg(0)
            .arg(-1)
            .query_async(conn)
            .await
            .map_err(map_err)?;
        if fields.is_empty() {
            return Ok(None);
        }
        StoredJob { fields, errors }.into_job(id.clone()).map(Some)
    }

    async fn load_jobs(
        &self,
        conn: &mut ConnectionManager,
        ids: Vec<String>,
    ) -> Result<Vec<Job>, BackendError> {
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids.into_iter().map(JobId::new) {
            // Jobs removed between the listing and the load are skipped.
            if let Some(job) = self.load_job(conn, &id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}

#[async_trait]
impl Backend for RedisBackend {
    #[instrument(skip(self, job), fields(type_name = %job.type_name))]
    async fn enqueue(&self, job: EnqueuableJob) -> Result<Enqueued, BackendError> {
        let mut conn = self.connection()?;
        let requested = job.id.as_ref().map(|id| id.to_string()).unwrap_or_default();
        let args = EnqueueArgs::try_from(job)?;
        let (id, inserted): (String, i64) = self
            .scripts
            .enqueue
            .key(self.namespace())
            .arg(requested)
            .arg(to_millis(Utc::now()))
            .arg(args.scheduled_at)
            .arg(args.priority)
            .arg(&args.type_name)
            .arg(args.payload)
            .arg(args.max_attempts)
            .arg(args.backoff)
            .arg(args.repeat)
            .arg(args.retention)
            .arg(args.keep_completed_ms)
            .arg(args.keep_failed_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        let id = JobId::new(id);
        let inserted = inserted == 1;

        if inserted {
            self.emit(QueueEvent::Added {
                id: id.clone(),
                type_name: args.type_name,
            });
        }
        Ok(Enqueued { id, inserted })
    }

    async fn claim_next(&self, lock: TimeDelta) -> Result<Option<Job>, BackendError> {
        let mut conn = self.connection()?;
        let claimed: Option<String> = self
            .scripts
            .claim
            .key(self.namespace())
            .arg(to_millis(Utc::now()))
            .arg(lock.num_milliseconds())
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        let Some(id) = claimed.map(JobId::new) else {
            return Ok(None);
        };
        match self.load_job(&mut conn, &id).await? {
            Some(job) => Ok(Some(job)),
            None => {
                tracing::error!(%id, "Claimed job {id} has no hash");
                Err(BackendError::BadState)
            }
        }
    }

    async fn next_scheduled_at(&self) -> Result<Option<DateTime<Utc>>, BackendError> {
        let mut conn = self.connection()?;
        let first: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(self.namespace.state(JobState::Delayed))
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        first
            .into_iter()
            .next()
            .map(|(_, score)| from_score(score))
            .transpose()
    }

    async fn extend_lock(
        &self,
        id: &JobId,
        attempt: u32,
        lock: TimeDelta,
    ) -> Result<bool, BackendError> {
        let mut conn = self.connection()?;
        let extended: i64 = self
            .scripts
            .extend_lock
            .key(self.namespace())
            .arg(id.as_str())
            .arg(attempt)
            .arg(to_millis(Utc::now() + lock))
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(extended == 1)
    }

    #[instrument(skip(self, return_value))]
    async fn mark_job_complete(
        &self,
        id: &JobId,
        attempt: u32,
        return_value: serde_json::Value,
    ) -> Result<(), BackendError> {
        let mut conn = self.connection()?;
        let status: i64 = self
            .scripts
            .complete
            .key(self.namespace())
            .arg(id.as_str())
            .arg(attempt)
            .arg(to_millis(Utc::now()))
            .arg(serde_json::to_string(&return_value)?)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        handle_status(id, status)?;

        self.emit(QueueEvent::Completed { id: id.clone() });
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn mark_job_retryable(
        &self,
        id: &JobId,
        attempt: u32,
        retry_at: DateTime<Utc>,
        error: ExecutionError,
    ) -> Result<(), BackendError> {
        let mut conn = self.connection()?;
        let (status, attempt): (i64, u32) = self
            .scripts
            .retry
            .key(self.namespace())
            .arg(id.as_str())
            .arg(attempt)
            .arg(to_millis(Utc::now()))
            .arg(to_millis(retry_at))
            .arg(error.error_type)
            .arg(error.message)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        handle_status(id, status)?;

        self.emit(QueueEvent::Retrying {
            id: id.clone(),
            attempt,
            retry_at,
        });
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn mark_job_failed(
        &self,
        id: &JobId,
        attempt: u32,
        error: ExecutionError,
    ) -> Result<(), BackendError> {
        let mut conn = self.connection()?;
        let (status, attempt): (i64, u32) = self
            .scripts
            .fail
            .key(self.namespace())
            .arg(id.as_str())
            .arg(attempt)
            .arg(to_millis(Utc::now()))
            .arg(&error.error_type)
            .arg(&error.message)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        handle_status(id, status)?;

        self.emit(QueueEvent::Failed {
            id: id.clone(),
            attempt,
            reason: error.message,
        });
        Ok(())
    }

    async fn recover_stalled(&self, now: DateTime<Utc>) -> Result<Vec<Stalled>, BackendError> {
        let mut conn = self.connection()?;
        let error = ExecutionError::stalled();
        let recovered: Vec<(String, String)> = self
            .scripts
            .recover_stalled
            .key(self.namespace())
            .arg(to_millis(now))
            .arg(error.error_type)
            .arg(error.message)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;

        let stalled = recovered
            .into_iter()
            .map(|(id, state)| {
                Ok(Stalled {
                    id: JobId::new(id),
                    moved_to: state.parse().map_err(|_| BackendError::BadState)?,
                })
            })
            .collect::<Result<Vec<_>, BackendError>>()?;
        for job in &stalled {
            self.emit(QueueEvent::Stalled { id: job.id.clone() });
        }
        Ok(stalled)
    }

    async fn counts(&self, states: &[JobState]) -> Result<StateCounts, BackendError> {
        let mut conn = self.connection()?;
        if states.is_empty() {
            return Ok(StateCounts::default());
        }
        let mut pipe = redis::pipe();
        for state in states {
            pipe.cmd("ZCARD").arg(self.namespace.state(*state));
        }
        let counts: Vec<u64> = pipe.query_async(&mut conn).await.map_err(map_err)?;
        Ok(states.iter().copied().zip(counts).collect())
    }

    async fn jobs(&self, state: JobState, page: Page) -> Result<Vec<Job>, BackendError> {
        if page.limit == 0 {
            return Ok(vec![]);
        }
        let mut conn = self.connection()?;
        let command = if page.ascending { "ZRANGE" } else { "ZREVRANGE" };
        let ids: Vec<String> = redis::cmd(command)
            .arg(self.namespace.state(state))
            .arg(page.offset)
            .arg(page.offset + page.limit - 1)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        self.load_jobs(&mut conn, ids).await
    }

    async fn job(&self, id: &JobId) -> Result<Option<Job>, BackendError> {
        let mut conn = self.connection()?;
        self.load_job(&mut conn, id).await
    }

    async fn remove(&self, id: &JobId) -> Result<bool, BackendError> {
        let mut conn = self.connection()?;
        let removed: i64 = self
            .scripts
            .remove
            .key(self.namespace())
            .arg(id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        let removed = removed == 1;
        if removed {
            self.emit(QueueEvent::Removed { id: id.clone() });
        }
        Ok(removed)
    }

    async fn prune(&self, now: DateTime<Utc>) -> Result<u64, BackendError> {
        let mut conn = self.connection()?;
        self.scripts
            .prune
            .key(self.namespace())
            .arg(to_millis(now))
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn add_repeatable(&self, entry: RepeatableEntry) -> Result<bool, BackendError> {
        let mut conn = self.connection()?;
        let inserted: i64 = self
            .scripts
            .add_repeatable
            .key(self.namespace())
            .arg(&entry.key)
            .arg(serde_json::to_string(&StoredRepeatable::from(&entry))?)
            .arg(to_millis(entry.next_run_at))
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(inserted == 1)
    }

    async fn advance_repeatable(
        &self,
        key: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, BackendError> {
        let mut conn = self.connection()?;
        let advanced: i64 = self
            .scripts
            .advance_repeatable
            .key(self.namespace())
            .arg(key)
            .arg(to_millis(next_run_at))
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(advanced == 1)
    }

    async fn repeatable(&self, key: &str) -> Result<Option<RepeatableEntry>, BackendError> {
        let mut conn = self.connection()?;
        let (entry, next_run_at): (Option<String>, Option<f64>) = redis::pipe()
            .cmd("HGET")
            .arg(self.namespace.repeat())
            .arg(key)
            .cmd("ZSCORE")
            .arg(self.namespace.repeat_next())
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        match (entry, next_run_at) {
            (Some(entry), Some(next_run_at)) => serde_json::from_str::<StoredRepeatable>(&entry)?
                .into_entry(next_run_at)
                .map(Some),
            _ => Ok(None),
        }
    }

    async fn repeatables(&self) -> Result<Vec<RepeatableEntry>, BackendError> {
        let mut conn = self.connection()?;
        let (entries, next_runs): (HashMap<String, String>, Vec<(String, f64)>) = redis::pipe()
            .cmd("HGETALL")
            .arg(self.namespace.repeat())
            .cmd("ZRANGE")
            .arg(self.namespace.repeat_next())
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        let next_runs = next_runs.into_iter().collect::<HashMap<_, _>>();

        let mut repeatables = entries
            .into_iter()
            .filter_map(|(key, entry)| next_runs.get(&key).map(|next| (entry, *next)))
            .map(|(entry, next_run_at)| {
                serde_json::from_str::<StoredRepeatable>(&entry)?.into_entry(next_run_at)
            })
            .collect::<Result<Vec<_>, BackendError>>()?;
        repeatables.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(repeatables)
    }

    async fn remove_repeatable(
        &self,
        key: &str,
    ) -> Result<Option<RepeatableEntry>, BackendError> {
        let mut conn = self.connection()?;
        let removed: Option<(String, Option<f64>)> = self
            .scripts
            .remove_repeatable
            .key(self.namespace())
            .arg(key)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        match removed {
            Some((entry, next_run_at)) => serde_json::from_str::<StoredRepeatable>(&entry)?
                .into_entry(next_run_at.unwrap_or_default())
                .map(Some),
            None => Ok(None),
        }
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let mut conn = self.connection()?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), BackendError> {
        if self.release()? {
            tracing::debug!(namespace = self.namespace(), "Redis backend closed");
        }
        Ok(())
    }
}
