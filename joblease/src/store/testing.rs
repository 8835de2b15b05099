//! Test suite for ensuring a correct implementation of a [`JobStore`].
use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use serde_json::json;

use super::{ItemOutput, JobStore, ProgressUpdate, SlotOutcome, StoreError};
use crate::{
    job::{ErrorKind, Job, JobError, JobId, JobStatus, Outcome},
    lock::{Intent, SlotRequest, StalenessPolicy},
};

const RESOURCE: &str = "resource";
const JOB_TYPE: &str = "job_type";
const POLICY: StalenessPolicy = StalenessPolicy::DEFAULT;
const SECOND: TimeDelta = TimeDelta::seconds(1);

/// Generates the conformance tests every [`JobStore`] implementation should pass.
///
/// # Example
///
/// ```
/// use joblease::test_suite;
/// use joblease::store::memory::InMemoryStore;
/// test_suite!(for: InMemoryStore::new());
/// ```
///
/// Stores that need their own test attribute and arguments, such as `sqlx::test` with a pool,
/// pass them explicitly:
///
/// ```ignore
/// use joblease::test_suite;
/// test_suite!(
///     attr: sqlx::test,
///     args: (pool: PgPool),
///     store: StoreImplementation::from(pool)
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $store:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), store: $store);
    };
    (attr: $attr:meta, args: $args:tt, store: $store:expr) => {
        #[$attr]
        async fn acquire_slot_creates_pending_job $args {
            let store = $store;
            $crate::store::testing::acquire_slot_creates_pending_job(store).await;
        }
        #[$attr]
        async fn acquire_slot_conflicts_with_live_job $args {
            let store = $store;
            $crate::store::testing::acquire_slot_conflicts_with_live_job(store).await;
        }
        #[$attr]
        async fn acquire_slot_reclaims_stale_running_job $args {
            let store = $store;
            $crate::store::testing::acquire_slot_reclaims_stale_running_job(store).await;
        }
        #[$attr]
        async fn acquire_slot_reclaims_stale_pending_job $args {
            let store = $store;
            $crate::store::testing::acquire_slot_reclaims_stale_pending_job(store).await;
        }
        #[$attr]
        async fn acquire_slot_resume_seeds_from_failed_attempt $args {
            let store = $store;
            $crate::store::testing::acquire_slot_resume_seeds_from_failed_attempt(store).await;
        }
        #[$attr]
        async fn acquire_slot_resume_without_failed_attempt $args {
            let store = $store;
            $crate::store::testing::acquire_slot_resume_without_failed_attempt(store).await;
        }
        #[$attr]
        async fn acquire_slot_concurrently_creates_one_job $args {
            let store = $store;
            $crate::store::testing::acquire_slot_concurrently_creates_one_job(store).await;
        }
        #[$attr]
        async fn mark_running_only_from_pending $args {
            let store = $store;
            $crate::store::testing::mark_running_only_from_pending(store).await;
        }
        #[$attr]
        async fn touch_never_moves_heartbeat_backwards $args {
            let store = $store;
            $crate::store::testing::touch_never_moves_heartbeat_backwards(store).await;
        }
        #[$attr]
        async fn flush_progress_writes_cursor_and_outputs $args {
            let store = $store;
            $crate::store::testing::flush_progress_writes_cursor_and_outputs(store).await;
        }
        #[$attr]
        async fn flush_progress_requires_running $args {
            let store = $store;
            $crate::store::testing::flush_progress_requires_running(store).await;
        }
        #[$attr]
        async fn finish_completed_requires_running $args {
            let store = $store;
            $crate::store::testing::finish_completed_requires_running(store).await;
        }
        #[$attr]
        async fn finish_applies_once $args {
            let store = $store;
            $crate::store::testing::finish_applies_once(store).await;
        }
        #[$attr]
        async fn request_cancel_ignores_terminal_job $args {
            let store = $store;
            $crate::store::testing::request_cancel_ignores_terminal_job(store).await;
        }
        #[$attr]
        async fn unknown_job_not_found $args {
            let store = $store;
            $crate::store::testing::unknown_job_not_found(store).await;
        }
        #[$attr]
        async fn attempts_are_ordered_oldest_first $args {
            let store = $store;
            $crate::store::testing::attempts_are_ordered_oldest_first(store).await;
        }
    };
}

pub use test_suite;

/// Now, truncated to whole milliseconds so it survives every storage round trip.
fn base_time() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

fn request(resource_id: &str, intent: Intent, now: DateTime<Utc>) -> SlotRequest {
    SlotRequest {
        resource_id: resource_id.to_owned(),
        job_type: JOB_TYPE.to_owned(),
        intent,
        now,
        policy: POLICY,
    }
}

async fn create(store: &impl JobStore, intent: Intent, now: DateTime<Utc>) -> Job {
    match store
        .acquire_slot(&request(RESOURCE, intent, now))
        .await
        .unwrap()
    {
        SlotOutcome::Created { job, .. } => job,
        other => panic!("expected a new job, got {other:?}"),
    }
}

async fn create_running(store: &impl JobStore, now: DateTime<Utc>) -> Job {
    let job = create(store, Intent::Fresh, now).await;
    assert!(store.mark_running(job.id, now).await.unwrap());
    store.get(job.id).await.unwrap()
}

fn progress(cursor: u64, total_items: Option<u64>) -> ProgressUpdate {
    ProgressUpdate {
        completed_items: cursor,
        last_completed_item: cursor,
        total_items,
        outputs: vec![],
    }
}

fn failure(message: &str) -> Outcome {
    Outcome::Failed(JobError::new(ErrorKind::UnitFatal, message))
}

#[doc(hidden)]
pub async fn acquire_slot_creates_pending_job(store: impl JobStore) {
    let now = base_time();

    let job = create(&store, Intent::Fresh, now).await;

    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.resource_id, RESOURCE);
    assert_eq!(job.job_type, JOB_TYPE);
    assert_eq!(job.attempt, 1);
    assert_eq!(job.resumed_from, None);
    assert_eq!(job.created_at, now);
    assert_eq!(job.started_at, None);
    assert_eq!(job.heartbeat_at, None);
    assert_eq!(job.last_completed_item, 0);
    assert!(!job.cancel_requested);
    assert_eq!(store.get(job.id).await.unwrap(), job);
}

#[doc(hidden)]
pub async fn acquire_slot_conflicts_with_live_job(store: impl JobStore) {
    let now = base_time();
    let job = create(&store, Intent::Fresh, now).await;

    let outcome = store
        .acquire_slot(&request(RESOURCE, Intent::Fresh, now + SECOND))
        .await
        .unwrap();
    assert!(matches!(outcome, SlotOutcome::Conflict(existing) if existing.id == job.id));

    // A different resource has its own slot.
    let other = store
        .acquire_slot(&request("other", Intent::Fresh, now + SECOND))
        .await
        .unwrap();
    assert!(matches!(other, SlotOutcome::Created { reclaimed: None, .. }));
}

#[doc(hidden)]
pub async fn acquire_slot_reclaims_stale_running_job(store: impl JobStore) {
    let now = base_time();
    let stale = create_running(&store, now).await;
    let later = now + POLICY.run_stale() + SECOND;

    let outcome = store
        .acquire_slot(&request(RESOURCE, Intent::Fresh, later))
        .await
        .unwrap();

    let (job, reclaimed) = match outcome {
        SlotOutcome::Created { job, reclaimed } => (job, reclaimed),
        other => panic!("expected the stale job to be reclaimed, got {other:?}"),
    };
    let reclaimed = reclaimed.unwrap();
    assert_eq!(reclaimed.id, stale.id);
    assert_eq!(reclaimed.status, JobStatus::Failed);
    assert_eq!(reclaimed.finished_at, Some(later));
    assert_eq!(
        reclaimed.error.map(|error| error.kind),
        Some(ErrorKind::ReclaimedStale)
    );
    assert_eq!(store.get(stale.id).await.unwrap().status, JobStatus::Failed);
    assert_ne!(job.id, stale.id);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt, 1);
}

#[doc(hidden)]
pub async fn acquire_slot_reclaims_stale_pending_job(store: impl JobStore) {
    let now = base_time();
    let stuck = create(&store, Intent::Fresh, now).await;

    let fresh = store
        .acquire_slot(&request(RESOURCE, Intent::Fresh, now + POLICY.pending_stale()))
        .await
        .unwrap();
    assert!(matches!(fresh, SlotOutcome::Conflict(_)));

    let later = now + POLICY.pending_stale() + SECOND;
    let outcome = store
        .acquire_slot(&request(RESOURCE, Intent::Fresh, later))
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        SlotOutcome::Created { reclaimed: Some(ref reclaimed), .. } if reclaimed.id == stuck.id
    ));
    let stuck = store.get(stuck.id).await.unwrap();
    assert_eq!(stuck.status, JobStatus::Failed);
    assert_eq!(stuck.started_at, None);
}

#[doc(hidden)]
pub async fn acquire_slot_resume_seeds_from_failed_attempt(store: impl JobStore) {
    let now = base_time();
    let first = create_running(&store, now).await;
    assert!(store
        .flush_progress(first.id, &progress(5, Some(10)), now + SECOND)
        .await
        .unwrap());
    assert!(store
        .finish(first.id, &failure("bad page"), now + SECOND)
        .await
        .unwrap());

    let resumed = create(&store, Intent::Resume, now + SECOND * 2).await;

    assert_eq!(resumed.status, JobStatus::Pending);
    assert_eq!(resumed.attempt, 2);
    assert_eq!(resumed.resumed_from, Some(first.id));
    assert_eq!(resumed.last_completed_item, 5);
    assert_eq!(resumed.completed_items, 5);
    assert_eq!(resumed.total_items, Some(10));
}

#[doc(hidden)]
pub async fn acquire_slot_resume_without_failed_attempt(store: impl JobStore) {
    let now = base_time();
    let resume = request(RESOURCE, Intent::Resume, now);

    assert_eq!(
        store.acquire_slot(&resume).await.unwrap(),
        SlotOutcome::NoFailedAttempt
    );

    let job = create_running(&store, now).await;
    assert!(store
        .finish(job.id, &Outcome::Completed, now)
        .await
        .unwrap());

    assert_eq!(
        store.acquire_slot(&resume).await.unwrap(),
        SlotOutcome::NoFailedAttempt
    );
    assert_eq!(
        store.attempts(RESOURCE, JOB_TYPE).await.unwrap().len(),
        1,
        "a refused resume must not insert anything"
    );
}

#[doc(hidden)]
pub async fn acquire_slot_concurrently_creates_one_job(store: impl JobStore) {
    let now = base_time();
    let request = request(RESOURCE, Intent::Fresh, now);

    let outcomes = join_all((0..8).map(|_| store.acquire_slot(&request))).await;

    let created = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Ok(SlotOutcome::Created { .. })))
        .count();
    let conflicts = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Ok(SlotOutcome::Conflict(_))))
        .count();
    assert_eq!(created, 1);
    assert_eq!(conflicts, 7);

    let active = store
        .attempts(RESOURCE, JOB_TYPE)
        .await
        .unwrap()
        .into_iter()
        .filter(Job::is_active)
        .count();
    assert_eq!(active, 1);
}

#[doc(hidden)]
pub async fn mark_running_only_from_pending(store: impl JobStore) {
    let now = base_time();
    let job = create(&store, Intent::Fresh, now).await;

    assert!(store.mark_running(job.id, now + SECOND).await.unwrap());
    assert!(!store.mark_running(job.id, now + SECOND * 2).await.unwrap());

    let job = store.get(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.started_at, Some(now + SECOND));
    assert_eq!(job.heartbeat_at, Some(now + SECOND));
}

#[doc(hidden)]
pub async fn touch_never_moves_heartbeat_backwards(store: impl JobStore) {
    let now = base_time();
    let pending = create(&store, Intent::Fresh, now).await;
    assert!(!store.touch(pending.id, now).await.unwrap());

    assert!(store.mark_running(pending.id, now).await.unwrap());
    assert!(store.touch(pending.id, now + SECOND * 10).await.unwrap());
    assert!(store.touch(pending.id, now + SECOND * 5).await.unwrap());

    let job = store.get(pending.id).await.unwrap();
    assert_eq!(job.heartbeat_at, Some(now + SECOND * 10));
}

#[doc(hidden)]
pub async fn flush_progress_writes_cursor_and_outputs(store: impl JobStore) {
    let now = base_time();
    let job = create_running(&store, now).await;
    let update = ProgressUpdate {
        completed_items: 3,
        last_completed_item: 3,
        total_items: Some(10),
        outputs: (1..=3)
            .map(|item| ItemOutput {
                item,
                output: json!({ "page": item }),
            })
            .collect(),
    };

    assert!(store
        .flush_progress(job.id, &update, now + SECOND)
        .await
        .unwrap());

    let flushed = store.get(job.id).await.unwrap();
    assert_eq!(flushed.completed_items, 3);
    assert_eq!(flushed.last_completed_item, 3);
    assert_eq!(flushed.total_items, Some(10));
    assert_eq!(flushed.heartbeat_at, Some(now + SECOND));
    assert_eq!(store.item_outputs(job.id).await.unwrap(), update.outputs);

    // The cursor never moves back, and an unknown total keeps the stored one.
    assert!(store
        .flush_progress(job.id, &progress(2, None), now + SECOND * 2)
        .await
        .unwrap());
    let flushed = store.get(job.id).await.unwrap();
    assert_eq!(flushed.last_completed_item, 3);
    assert_eq!(flushed.total_items, Some(10));
    assert_eq!(flushed.heartbeat_at, Some(now + SECOND * 2));
}

#[doc(hidden)]
pub async fn flush_progress_requires_running(store: impl JobStore) {
    let now = base_time();
    let pending = create(&store, Intent::Fresh, now).await;
    assert!(!store
        .flush_progress(pending.id, &progress(1, None), now)
        .await
        .unwrap());

    assert!(store.mark_running(pending.id, now).await.unwrap());
    assert!(store
        .finish(pending.id, &Outcome::Completed, now)
        .await
        .unwrap());
    let finished = store.get(pending.id).await.unwrap();

    assert!(!store
        .flush_progress(pending.id, &progress(4, Some(4)), now + SECOND)
        .await
        .unwrap());
    assert_eq!(store.get(pending.id).await.unwrap(), finished);
}

#[doc(hidden)]
pub async fn finish_completed_requires_running(store: impl JobStore) {
    let now = base_time();
    let job = create(&store, Intent::Fresh, now).await;

    assert!(!store
        .finish(job.id, &Outcome::Completed, now)
        .await
        .unwrap());
    assert_eq!(store.get(job.id).await.unwrap().status, JobStatus::Pending);

    assert!(store.finish(job.id, &failure("never ran"), now).await.unwrap());
    assert_eq!(store.get(job.id).await.unwrap().status, JobStatus::Failed);
}

#[doc(hidden)]
pub async fn finish_applies_once(store: impl JobStore) {
    let now = base_time();
    let job = create_running(&store, now).await;

    assert!(store
        .finish(job.id, &Outcome::Completed, now + SECOND)
        .await
        .unwrap());
    assert!(!store
        .finish(job.id, &failure("late"), now + SECOND * 2)
        .await
        .unwrap());

    let job = store.get(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.finished_at, Some(now + SECOND));
    assert_eq!(job.error, None);
}

#[doc(hidden)]
pub async fn request_cancel_ignores_terminal_job(store: impl JobStore) {
    let now = base_time();
    let job = create_running(&store, now).await;

    assert!(store.request_cancel(job.id).await.unwrap());
    assert!(store.get(job.id).await.unwrap().cancel_requested);

    let other = match store
        .acquire_slot(&request("other", Intent::Fresh, now))
        .await
        .unwrap()
    {
        SlotOutcome::Created { job, .. } => job,
        outcome => panic!("expected a new job, got {outcome:?}"),
    };
    assert!(store.finish(other.id, &failure("gone"), now).await.unwrap());
    assert!(!store.request_cancel(other.id).await.unwrap());
    assert!(!store.get(other.id).await.unwrap().cancel_requested);
}

#[doc(hidden)]
pub async fn unknown_job_not_found(store: impl JobStore) {
    let now = base_time();
    let id = JobId::from(4242);

    assert!(matches!(store.get(id).await, Err(StoreError::JobNotFound(_))));
    assert!(matches!(
        store.mark_running(id, now).await,
        Err(StoreError::JobNotFound(_))
    ));
    assert!(matches!(
        store.touch(id, now).await,
        Err(StoreError::JobNotFound(_))
    ));
    assert!(matches!(
        store.flush_progress(id, &progress(1, None), now).await,
        Err(StoreError::JobNotFound(_))
    ));
    assert!(matches!(
        store.finish(id, &Outcome::Completed, now).await,
        Err(StoreError::JobNotFound(_))
    ));
    assert!(matches!(
        store.request_cancel(id).await,
        Err(StoreError::JobNotFound(_))
    ));
    assert!(matches!(
        store.item_outputs(id).await,
        Err(StoreError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn attempts_are_ordered_oldest_first(store: impl JobStore) {
    let mut now = base_time();
    let mut ids = vec![];
    for cursor in [2, 6, 9] {
        let intent = if ids.is_empty() {
            Intent::Fresh
        } else {
            Intent::Resume
        };
        let job = create(&store, intent, now).await;
        assert!(store.mark_running(job.id, now).await.unwrap());
        assert!(store
            .flush_progress(job.id, &progress(cursor, Some(10)), now)
            .await
            .unwrap());
        assert!(store.finish(job.id, &failure("flaky"), now).await.unwrap());
        ids.push(job.id);
        now += SECOND;
    }

    let attempts = store.attempts(RESOURCE, JOB_TYPE).await.unwrap();

    assert_eq!(
        attempts.iter().map(|job| job.id).collect::<Vec<_>>(),
        ids
    );
    assert_eq!(
        attempts.iter().map(|job| job.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(attempts[1].resumed_from, Some(ids[0]));
    assert_eq!(attempts[2].resumed_from, Some(ids[1]));
    assert_eq!(
        store.latest(RESOURCE, JOB_TYPE).await.unwrap().map(|job| job.id),
        ids.last().copied()
    );
    assert!(store.attempts("other", JOB_TYPE).await.unwrap().is_empty());
}
