//! Test suite for ensuring a correct implementation of a backend.
use chrono::TimeDelta;
use serde_json::json;

use super::*;
use crate::job::Keep;

const LOCK: TimeDelta = TimeDelta::seconds(30);

impl EnqueuableJob {
    pub(crate) const DEFAULT_TYPE: &'static str = "job-type";

    pub(crate) fn mock_job() -> Self {
        Self {
            id: None,
            type_name: Self::DEFAULT_TYPE.to_owned(),
            payload: json!({"data": "data"}),
            priority: 0,
            max_attempts: 3,
            backoff: Backoff::DEFAULT,
            repeat: None,
            retention: RetentionPolicy::DEFAULT,
            scheduled_at: Utc::now(),
        }
    }

    pub(crate) fn with_id(self, id: impl Into<JobId>) -> Self {
        Self {
            id: Some(id.into()),
            ..self
        }
    }

    pub(crate) fn with_type(self, type_name: impl ToString) -> Self {
        Self {
            type_name: type_name.to_string(),
            ..self
        }
    }

    pub(crate) fn with_priority(self, priority: u32) -> Self {
        Self { priority, ..self }
    }

    pub(crate) fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    pub(crate) fn with_retention(self, retention: RetentionPolicy) -> Self {
        Self { retention, ..self }
    }

    pub(crate) fn with_scheduled_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at,
            ..self
        }
    }
}

/// Create test suite for drover backends.
///
/// For backend implementors, it is useful to include this are part of your test suites.
///
/// # Example
///
/// ```
/// use drover::test_suite;
/// use drover::backend::memory::InMemoryBackend;
/// test_suite!(for: InMemoryBackend::new());
/// ```
///
/// Backends that need external services can mark the whole suite as ignored:
///
/// ```ignore
/// test_suite!(for: connect().await, ignore: "requires a running redis");
/// ```
///
/// If you using a different async test attribute you can configure the marco to use that instead:
///
/// ```ignore
/// test_suite!(
///     attr: my_runtime::test,
///     args: (),
///     backend: BackendImplementation::new()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr, ignore: $reason:literal) => {
        $crate::test_suite!(@with_names @tests [#[tokio::test] #[ignore = $reason]] $backend, (););
    };
    (for: $backend:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), backend: $backend);
    };
    (attr: $attr:meta, args: $args:tt, backend: $backend:expr) => {
        $crate::test_suite!(@with_names @tests [#[$attr]] $backend, $args;);
    };
    (@tests [$(#[$attr:meta])*] $backend:expr, $args:tt; $test:ident $(, $rest:ident)* $(,)?) => {
        $(#[$attr])*
        async fn $test $args {
            let backend = $backend;
            $crate::backend::testing::$test(backend).await;
        }
        $crate::test_suite!(@tests [$(#[$attr])*] $backend, $args; $($rest),*);
    };
    (@tests [$(#[$attr:meta])*] $backend:expr, $args:tt;) => {};
    (@with_names $($prefix:tt)*) => {
        $crate::test_suite!($($prefix)*
            enqueue_allocates_distinct_ids,
            enqueue_with_id_deduplicates_pending_jobs,
            enqueue_with_id_replaces_finished_jobs,
            enqueue_emits_added_event,
            claim_next_when_empty,
            claim_next_marks_job_active,
            claim_next_waiting_in_enqueue_order,
            claim_next_waiting_before_prioritized,
            claim_next_prioritized_by_priority_then_enqueue_order,
            claim_next_skips_future_jobs,
            claim_next_promotes_due_jobs,
            claim_next_concurrent_claims_are_exclusive,
            next_scheduled_at,
            extend_lock,
            mark_job_complete,
            mark_job_complete_not_found,
            mark_job_complete_not_active,
            mark_job_retryable,
            mark_job_failed,
            recover_stalled_requeues_job,
            recover_stalled_fails_exhausted_job,
            recover_stalled_ignores_locked_jobs,
            recover_stalled_rejects_the_expired_claim,
            counts,
            jobs_listing,
            remove,
            prune_respects_retention,
            repeatables,
            close_makes_broker_unavailable
        );
    };
}

async fn claim(backend: &impl Backend) -> Job {
    backend
        .claim_next(LOCK)
        .await
        .unwrap()
        .expect("a job should be ready")
}

fn error() -> ExecutionError {
    ExecutionError::new("handler", "Error Message")
}

#[doc(hidden)]
pub async fn enqueue_allocates_distinct_ids(backend: impl Backend) {
    let first = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let second = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    assert!(first.inserted);
    assert!(second.inserted);
    assert_ne!(first.id, second.id);
    assert!(backend.job(&first.id).await.unwrap().is_some());
    assert!(backend.job(&second.id).await.unwrap().is_some());
}

#[doc(hidden)]
pub async fn enqueue_with_id_deduplicates_pending_jobs(backend: impl Backend) {
    let id = JobId::derive("job-type", "owner");
    let first = backend
        .enqueue(EnqueuableJob::mock_job().with_id(id.clone()))
        .await
        .unwrap();
    let second = backend
        .enqueue(
            EnqueuableJob::mock_job()
                .with_id(id.clone())
                .with_priority(9),
        )
        .await
        .unwrap();

    assert_eq!(first, Enqueued { id: id.clone(), inserted: true });
    assert_eq!(second, Enqueued { id: id.clone(), inserted: false });
    let job = backend.job(&id).await.unwrap().unwrap();
    assert_eq!(job.priority, 0);
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(
        backend.counts(&[JobState::Waiting]).await.unwrap().get(JobState::Waiting),
        1
    );

    // Still deduplicated while running.
    claim(&backend).await;
    let third = backend
        .enqueue(EnqueuableJob::mock_job().with_id(id.clone()))
        .await
        .unwrap();
    assert!(!third.inserted);
}

#[doc(hidden)]
pub async fn enqueue_with_id_replaces_finished_jobs(backend: impl Backend) {
    let id = JobId::new("finished");
    backend
        .enqueue(EnqueuableJob::mock_job().with_id(id.clone()))
        .await
        .unwrap();
    claim(&backend).await;
    backend.mark_job_complete(&id, 1, json!(1)).await.unwrap();

    let again = backend
        .enqueue(EnqueuableJob::mock_job().with_id(id.clone()))
        .await
        .unwrap();

    assert!(again.inserted);
    let job = backend.job(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(job.attempts_made, 0);
    assert_eq!(job.return_value, None);
    assert_eq!(
        backend
            .counts(&[JobState::Completed])
            .await
            .unwrap()
            .get(JobState::Completed),
        0
    );
}

#[doc(hidden)]
pub async fn enqueue_emits_added_event(backend: impl Backend) {
    let mut events = backend.subscribe();
    let enqueued = backend
        .enqueue(EnqueuableJob::mock_job().with_type("evented"))
        .await
        .unwrap();

    let event = tokio::time::timeout(std::time::Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        QueueEvent::Added {
            id: enqueued.id,
            type_name: "evented".to_owned()
        }
    );
}

#[doc(hidden)]
pub async fn claim_next_when_empty(backend: impl Backend) {
    assert!(backend.claim_next(LOCK).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn claim_next_marks_job_active(backend: impl Backend) {
    let enqueued = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let job = claim(&backend).await;

    assert_eq!(job.id, enqueued.id);
    assert_eq!(job.state, JobState::Active);
    assert_eq!(job.attempts_made, 1);
    assert!(job.processed_at.is_some());
    assert_eq!(job.payload, json!({"data": "data"}));
    let stored = backend.job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Active);
    assert_eq!(stored.attempts_made, 1);
    assert!(backend.claim_next(LOCK).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn claim_next_waiting_in_enqueue_order(backend: impl Backend) {
    let mut ids = vec![];
    for _ in 0..5 {
        ids.push(backend.enqueue(EnqueuableJob::mock_job()).await.unwrap().id);
    }

    for id in ids {
        assert_eq!(claim(&backend).await.id, id);
    }
}

#[doc(hidden)]
pub async fn claim_next_waiting_before_prioritized(backend: impl Backend) {
    let prioritized = backend
        .enqueue(EnqueuableJob::mock_job().with_priority(1))
        .await
        .unwrap();
    let waiting = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    assert_eq!(claim(&backend).await.id, waiting.id);
    assert_eq!(claim(&backend).await.id, prioritized.id);
}

#[doc(hidden)]
pub async fn claim_next_prioritized_by_priority_then_enqueue_order(backend: impl Backend) {
    let low_first = backend
        .enqueue(EnqueuableJob::mock_job().with_priority(100))
        .await
        .unwrap();
    let high = backend
        .enqueue(EnqueuableJob::mock_job().with_priority(2))
        .await
        .unwrap();
    let low_second = backend
        .enqueue(EnqueuableJob::mock_job().with_priority(100))
        .await
        .unwrap();
    let highest = backend
        .enqueue(EnqueuableJob::mock_job().with_priority(1))
        .await
        .unwrap();

    assert_eq!(claim(&backend).await.id, highest.id);
    assert_eq!(claim(&backend).await.id, high.id);
    assert_eq!(claim(&backend).await.id, low_first.id);
    assert_eq!(claim(&backend).await.id, low_second.id);
}

#[doc(hidden)]
pub async fn claim_next_skips_future_jobs(backend: impl Backend) {
    let delayed = backend
        .enqueue(
            EnqueuableJob::mock_job().with_scheduled_at(Utc::now() + TimeDelta::hours(1)),
        )
        .await
        .unwrap();

    assert_eq!(
        backend.job(&delayed.id).await.unwrap().unwrap().state,
        JobState::Delayed
    );
    assert!(backend.claim_next(LOCK).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn claim_next_promotes_due_jobs(backend: impl Backend) {
    let enqueued = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    claim(&backend).await;
    backend
        .mark_job_retryable(&enqueued.id, 1, Utc::now() - TimeDelta::seconds(1), error())
        .await
        .unwrap();
    assert_eq!(
        backend.job(&enqueued.id).await.unwrap().unwrap().state,
        JobState::Delayed
    );

    let job = claim(&backend).await;

    assert_eq!(job.id, enqueued.id);
    assert_eq!(job.attempts_made, 2);
}

#[doc(hidden)]
pub async fn claim_next_concurrent_claims_are_exclusive(backend: impl Backend) {
    for _ in 0..10 {
        backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    }

    let claims = futures::future::join_all((0..20).map(|_| backend.claim_next(LOCK))).await;
    let mut claimed = claims
        .into_iter()
        .filter_map(|claim| claim.unwrap())
        .map(|job| job.id)
        .collect::<Vec<_>>();
    claimed.sort();
    let total = claimed.len();
    claimed.dedup();

    assert_eq!(total, 10);
    assert_eq!(claimed.len(), 10);
}

#[doc(hidden)]
pub async fn next_scheduled_at(backend: impl Backend) {
    assert_eq!(backend.next_scheduled_at().await.unwrap(), None);
    let soon = Utc::now() + TimeDelta::minutes(5);
    let later = Utc::now() + TimeDelta::hours(1);
    backend
        .enqueue(EnqueuableJob::mock_job().with_scheduled_at(later))
        .await
        .unwrap();
    backend
        .enqueue(EnqueuableJob::mock_job().with_scheduled_at(soon))
        .await
        .unwrap();

    let next = backend.next_scheduled_at().await.unwrap().unwrap();
    assert_eq!(next.timestamp_millis(), soon.timestamp_millis());
}

#[doc(hidden)]
pub async fn extend_lock(backend: impl Backend) {
    let enqueued = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    assert!(!backend.extend_lock(&enqueued.id, 0, LOCK).await.unwrap());

    let job = claim(&backend).await;
    assert!(backend
        .extend_lock(&enqueued.id, job.attempts_made, LOCK)
        .await
        .unwrap());
    assert!(!backend
        .extend_lock(&enqueued.id, job.attempts_made + 1, LOCK)
        .await
        .unwrap());

    backend
        .mark_job_complete(&enqueued.id, job.attempts_made, json!(null))
        .await
        .unwrap();
    assert!(!backend
        .extend_lock(&enqueued.id, job.attempts_made, LOCK)
        .await
        .unwrap());
    assert!(!backend
        .extend_lock(&JobId::new("missing"), 1, LOCK)
        .await
        .unwrap());
}

#[doc(hidden)]
pub async fn mark_job_complete(backend: impl Backend) {
    let enqueued = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    claim(&backend).await;

    backend
        .mark_job_complete(&enqueued.id, 1, json!({"refreshed": 3}))
        .await
        .unwrap();

    let job = backend.job(&enqueued.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.return_value, Some(json!({"refreshed": 3})));
    assert!(job.finished_at.is_some());
    assert!(job.errors.is_empty());
}

#[doc(hidden)]
pub async fn mark_job_complete_not_found(backend: impl Backend) {
    let result = backend
        .mark_job_complete(&JobId::new("missing"), 1, json!(null))
        .await;

    assert!(matches!(result, Err(BackendError::JobNotFound(_))));
}

#[doc(hidden)]
pub async fn mark_job_complete_not_active(backend: impl Backend) {
    let enqueued = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let result = backend.mark_job_complete(&enqueued.id, 0, json!(null)).await;

    assert!(matches!(result, Err(BackendError::NotActive(_))));
    assert_eq!(
        backend.job(&enqueued.id).await.unwrap().unwrap().state,
        JobState::Waiting
    );
}

#[doc(hidden)]
pub async fn mark_job_retryable(backend: impl Backend) {
    let enqueued = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    claim(&backend).await;
    let retry_at = Utc::now() + TimeDelta::seconds(2);

    backend
        .mark_job_retryable(&enqueued.id, 1, retry_at, error())
        .await
        .unwrap();

    let job = backend.job(&enqueued.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Delayed);
    assert_eq!(job.scheduled_at.timestamp_millis(), retry_at.timestamp_millis());
    assert_eq!(job.errors.len(), 1);
    assert_eq!(job.errors[0].attempt, 1);
    assert_eq!(job.errors[0].error_type, "handler");
    assert_eq!(job.errors[0].message, "Error Message");
    assert!(backend.claim_next(LOCK).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn mark_job_failed(backend: impl Backend) {
    let enqueued = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    claim(&backend).await;

    backend
        .mark_job_failed(&enqueued.id, 1, error())
        .await
        .unwrap();

    let job = backend.job(&enqueued.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.finished_at.is_some());
    assert_eq!(job.errors.len(), 1);
    assert!(matches!(
        backend.mark_job_failed(&enqueued.id, 1, error()).await,
        Err(BackendError::NotActive(_))
    ));
}

#[doc(hidden)]
pub async fn recover_stalled_requeues_job(backend: impl Backend) {
    let enqueued = backend
        .enqueue(EnqueuableJob::mock_job().with_priority(3))
        .await
        .unwrap();
    backend.claim_next(TimeDelta::zero()).await.unwrap().unwrap();

    let stalled = backend
        .recover_stalled(Utc::now() + TimeDelta::seconds(1))
        .await
        .unwrap();

    assert_eq!(
        stalled,
        vec![Stalled {
            id: enqueued.id.clone(),
            moved_to: JobState::Prioritized
        }]
    );
    let job = claim(&backend).await;
    assert_eq!(job.id, enqueued.id);
    assert_eq!(job.attempts_made, 2);
}

#[doc(hidden)]
pub async fn recover_stalled_fails_exhausted_job(backend: impl Backend) {
    let enqueued = backend
        .enqueue(EnqueuableJob::mock_job().with_max_attempts(1))
        .await
        .unwrap();
    backend.claim_next(TimeDelta::zero()).await.unwrap().unwrap();

    let stalled = backend
        .recover_stalled(Utc::now() + TimeDelta::seconds(1))
        .await
        .unwrap();

    assert_eq!(
        stalled,
        vec![Stalled {
            id: enqueued.id.clone(),
            moved_to: JobState::Failed
        }]
    );
    let job = backend.job(&enqueued.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.errors.len(), 1);
    assert_eq!(job.errors[0].error_type, "stalled");
}

#[doc(hidden)]
pub async fn recover_stalled_ignores_locked_jobs(backend: impl Backend) {
    backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    claim(&backend).await;

    assert!(backend.recover_stalled(Utc::now()).await.unwrap().is_empty());
    assert_eq!(
        backend
            .counts(&[JobState::Active])
            .await
            .unwrap()
            .get(JobState::Active),
        1
    );
}

#[doc(hidden)]
pub async fn recover_stalled_rejects_the_expired_claim(backend: impl Backend) {
    let enqueued = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let expired = backend.claim_next(TimeDelta::zero()).await.unwrap().unwrap();
    backend
        .recover_stalled(Utc::now() + TimeDelta::seconds(1))
        .await
        .unwrap();
    let current = claim(&backend).await;
    assert_eq!(current.id, expired.id);

    assert!(!backend
        .extend_lock(&enqueued.id, expired.attempts_made, LOCK)
        .await
        .unwrap());
    assert!(matches!(
        backend
            .mark_job_complete(&enqueued.id, expired.attempts_made, json!("stale"))
            .await,
        Err(BackendError::NotActive(_))
    ));
    assert!(matches!(
        backend
            .mark_job_failed(&enqueued.id, expired.attempts_made, error())
            .await,
        Err(BackendError::NotActive(_))
    ));
    let job = backend.job(&enqueued.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Active);
    assert!(job.errors.is_empty());

    backend
        .mark_job_complete(&enqueued.id, current.attempts_made, json!("current"))
        .await
        .unwrap();
    let job = backend.job(&enqueued.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.return_value, Some(json!("current")));
}

#[doc(hidden)]
pub async fn counts(backend: impl Backend) {
    backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend
        .enqueue(EnqueuableJob::mock_job().with_priority(5))
        .await
        .unwrap();
    backend
        .enqueue(EnqueuableJob::mock_job().with_scheduled_at(Utc::now() + TimeDelta::hours(1)))
        .await
        .unwrap();
    let active = claim(&backend).await;
    let completed = claim(&backend).await;
    backend
        .mark_job_complete(&completed.id, 1, json!(null))
        .await
        .unwrap();

    let counts = backend.counts(&JobState::ALL).await.unwrap();

    assert_eq!(counts.get(JobState::Waiting), 0);
    assert_eq!(counts.get(JobState::Prioritized), 1);
    assert_eq!(counts.get(JobState::Delayed), 1);
    assert_eq!(counts.get(JobState::Active), 1);
    assert_eq!(counts.get(JobState::Completed), 1);
    assert_eq!(counts.get(JobState::Failed), 0);
    assert_ne!(active.id, completed.id);

    let only_delayed = backend.counts(&[JobState::Delayed]).await.unwrap();
    assert_eq!(only_delayed.get(JobState::Delayed), 1);
    assert_eq!(only_delayed.get(JobState::Active), 0);
}

#[doc(hidden)]
pub async fn jobs_listing(backend: impl Backend) {
    let second = backend
        .enqueue(EnqueuableJob::mock_job().with_priority(2))
        .await
        .unwrap();
    let first = backend
        .enqueue(EnqueuableJob::mock_job().with_priority(1))
        .await
        .unwrap();
    let third = backend
        .enqueue(EnqueuableJob::mock_job().with_priority(3))
        .await
        .unwrap();

    let ids = |jobs: Vec<Job>| jobs.into_iter().map(|job| job.id).collect::<Vec<_>>();

    assert_eq!(
        ids(backend.jobs(JobState::Prioritized, Page::first(10)).await.unwrap()),
        vec![first.id.clone(), second.id.clone(), third.id.clone()]
    );
    assert_eq!(
        ids(backend.jobs(JobState::Prioritized, Page::first(1)).await.unwrap()),
        vec![first.id.clone()]
    );
    assert_eq!(
        ids(backend
            .jobs(JobState::Prioritized, Page::first(1).skip(1))
            .await
            .unwrap()),
        vec![second.id.clone()]
    );
    assert_eq!(
        ids(backend
            .jobs(JobState::Prioritized, Page::first(2).descending())
            .await
            .unwrap()),
        vec![third.id, second.id]
    );
    assert!(backend
        .jobs(JobState::Failed, Page::first(10))
        .await
        .unwrap()
        .is_empty());
}

#[doc(hidden)]
pub async fn remove(backend: impl Backend) {
    let waiting = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let delayed = backend
        .enqueue(EnqueuableJob::mock_job().with_scheduled_at(Utc::now() + TimeDelta::hours(1)))
        .await
        .unwrap();

    assert!(backend.remove(&waiting.id).await.unwrap());
    assert!(backend.remove(&delayed.id).await.unwrap());
    assert!(!backend.remove(&waiting.id).await.unwrap());

    assert!(backend.job(&waiting.id).await.unwrap().is_none());
    assert!(backend.claim_next(LOCK).await.unwrap().is_none());
    assert_eq!(backend.next_scheduled_at().await.unwrap(), None);
}

#[doc(hidden)]
pub async fn prune_respects_retention(backend: impl Backend) {
    let keep_nothing = RetentionPolicy {
        on_complete: Keep::Nothing,
        on_fail: Keep::Nothing,
    };
    let keep_forever = RetentionPolicy {
        on_complete: Keep::Forever,
        on_fail: Keep::Forever,
    };
    let pruned = backend
        .enqueue(EnqueuableJob::mock_job().with_retention(keep_nothing))
        .await
        .unwrap();
    let kept = backend
        .enqueue(EnqueuableJob::mock_job().with_retention(keep_forever))
        .await
        .unwrap();
    let recent = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let pending = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    for id in [&pruned.id, &kept.id] {
        claim(&backend).await;
        backend.mark_job_complete(id, 1, json!(null)).await.unwrap();
    }
    claim(&backend).await;
    backend
        .mark_job_failed(&recent.id, 1, error())
        .await
        .unwrap();

    let removed = backend
        .prune(Utc::now() + TimeDelta::seconds(1))
        .await
        .unwrap();

    assert_eq!(removed, 1);
    assert!(backend.job(&pruned.id).await.unwrap().is_none());
    assert!(backend.job(&kept.id).await.unwrap().is_some());
    assert!(backend.job(&recent.id).await.unwrap().is_some());
    assert!(backend.job(&pending.id).await.unwrap().is_some());

    let removed = backend
        .prune(Utc::now() + TimeDelta::days(8))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(backend.job(&recent.id).await.unwrap().is_none());
    assert!(backend.job(&kept.id).await.unwrap().is_some());
}

#[doc(hidden)]
pub async fn repeatables(backend: impl Backend) {
    let repeat = Repeat::every(TimeDelta::minutes(1));
    let first_run = repeat.next_after(Utc::now());
    let entry = RepeatableEntry::new("sync", repeat, first_run);

    assert!(backend.add_repeatable(entry.clone()).await.unwrap());
    assert!(!backend
        .add_repeatable(RepeatableEntry::new("sync", repeat, first_run + TimeDelta::hours(1)))
        .await
        .unwrap());

    let stored = backend.repeatable(&entry.key).await.unwrap().unwrap();
    assert_eq!(stored.type_name, "sync");
    assert_eq!(stored.repeat, repeat);
    assert_eq!(
        stored.next_run_at.timestamp_millis(),
        first_run.timestamp_millis()
    );

    let next_run = first_run + TimeDelta::minutes(1);
    assert!(backend
        .advance_repeatable(&entry.key, next_run)
        .await
        .unwrap());
    let stored = backend.repeatable(&entry.key).await.unwrap().unwrap();
    assert_eq!(
        stored.next_run_at.timestamp_millis(),
        next_run.timestamp_millis()
    );
    assert_eq!(backend.repeatables().await.unwrap().len(), 1);

    let removed = backend.remove_repeatable(&entry.key).await.unwrap();
    assert_eq!(removed.map(|entry| entry.key), Some(entry.key.clone()));
    assert!(!backend
        .advance_repeatable(&entry.key, next_run)
        .await
        .unwrap());
    assert!(backend.repeatables().await.unwrap().is_empty());
    assert!(backend.remove_repeatable(&entry.key).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn close_makes_broker_unavailable(backend: impl Backend) {
    backend.ping().await.unwrap();
    backend.close().await.unwrap();

    assert!(matches!(
        backend.ping().await,
        Err(BackendError::BrokerUnavailable(_))
    ));
    assert!(matches!(
        backend.enqueue(EnqueuableJob::mock_job()).await,
        Err(BackendError::BrokerUnavailable(_))
    ));
}
