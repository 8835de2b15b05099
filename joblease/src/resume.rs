//! Where the next attempt of a failed lineage starts.
//!
//! Only flushed progress counts: a resumed attempt skips items up to and including the previous
//! attempt's durable `last_completed_item` and reprocesses everything after it, including any
//! item whose success was recorded but never flushed.
use serde::Serialize;

use crate::{
    job::{Job, JobId, JobStatus, NewJob},
    lock::JobLockService,
    store::StoreError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumePlan {
    pub resource_id: String,
    pub job_type: String,
    /// The attempt being continued.
    pub previous: JobId,
    /// The attempt number the new job will carry.
    pub attempt: u32,
    /// Items at or before this cursor are skipped.
    pub resume_from: u64,
    pub total_items: Option<u64>,
}

impl ResumePlan {
    pub fn from_attempt(previous: &Job) -> Self {
        Self {
            resource_id: previous.resource_id.clone(),
            job_type: previous.job_type.clone(),
            previous: previous.id,
            attempt: previous.attempt.saturating_add(1),
            resume_from: previous.last_completed_item,
            total_items: previous.total_items,
        }
    }

    pub fn should_skip(&self, item: u64) -> bool {
        item <= self.resume_from
    }

    pub fn into_new_job(self) -> NewJob {
        NewJob {
            resource_id: self.resource_id,
            job_type: self.job_type,
            attempt: self.attempt,
            resumed_from: Some(self.previous),
            total_items: self.total_items,
            last_completed_item: self.resume_from,
        }
    }
}

/// Answers "where would a resume start?" without acquiring anything.
#[derive(Clone)]
pub struct ResumeCoordinator {
    lock: JobLockService,
}

impl ResumeCoordinator {
    pub fn new(lock: JobLockService) -> Self {
        Self { lock }
    }

    /// The plan a resume would follow right now, or `None` if there is nothing to resume.
    ///
    /// The latest attempt is resumable when it failed, or when it is still active but stale, since
    /// the acquire performed by the resume would reclaim it first.
    pub async fn plan_resume(
        &self,
        resource_id: &str,
        job_type: &str,
    ) -> Result<Option<ResumePlan>, StoreError> {
        let now = self.lock.now();
        let policy = self.lock.policy();
        Ok(self
            .lock
            .store()
            .latest(resource_id, job_type)
            .await?
            .filter(|job| job.status == JobStatus::Failed || policy.is_stale(job, now))
            .map(|job| ResumePlan::from_attempt(&job)))
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use chrono::{TimeDelta, Utc};

    use super::*;
    use crate::{
        clock::ManualClock,
        job::{ErrorKind, JobError, Outcome},
        lock::{Acquisition, StalenessPolicy},
        store::{memory::InMemoryStore, JobStore, ProgressUpdate},
    };

    fn setup() -> (ManualClock, JobLockService) {
        let clock = ManualClock::default();
        let lock = JobLockService::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(clock.clone()),
            StalenessPolicy::DEFAULT,
        );
        (clock, lock)
    }

    async fn running_job(lock: &JobLockService, cursor: u64) -> Job {
        let job = assert_matches!(
            lock.acquire("book-1", "extract").await,
            Ok(Acquisition::Acquired(job)) => job
        );
        lock.start(job.id).await.unwrap();
        let update = ProgressUpdate {
            completed_items: cursor,
            last_completed_item: cursor,
            total_items: Some(10),
            outputs: vec![],
        };
        assert!(lock
            .store()
            .flush_progress(job.id, &update, lock.now())
            .await
            .unwrap());
        lock.job(job.id).await.unwrap()
    }

    #[test]
    fn plan_skips_up_to_the_cursor() {
        let mut job = Job::raw_job(JobStatus::Failed, Utc::now());
        job.last_completed_item = 2;

        let plan = ResumePlan::from_attempt(&job);

        assert!(plan.should_skip(1));
        assert!(plan.should_skip(2));
        assert!(!plan.should_skip(3));
        assert_eq!(plan.attempt, 2);
    }

    #[tokio::test]
    async fn nothing_to_resume_on_an_empty_slot() {
        let (_, lock) = setup();
        let coordinator = ResumeCoordinator::new(lock);

        assert_eq!(coordinator.plan_resume("book-1", "extract").await.unwrap(), None);
    }

    #[tokio::test]
    async fn live_and_completed_jobs_are_not_resumable() {
        let (_, lock) = setup();
        let coordinator = ResumeCoordinator::new(lock.clone());
        let job = running_job(&lock, 3).await;

        assert_eq!(coordinator.plan_resume("book-1", "extract").await.unwrap(), None);

        lock.release(job.id, Outcome::Completed).await.unwrap();

        assert_eq!(coordinator.plan_resume("book-1", "extract").await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_attempt_resumes_from_its_cursor() {
        let (_, lock) = setup();
        let coordinator = ResumeCoordinator::new(lock.clone());
        let job = running_job(&lock, 4).await;
        let error = JobError::new(ErrorKind::UnitFatal, "bad page");
        lock.release(job.id, Outcome::Failed(error)).await.unwrap();

        let plan = coordinator
            .plan_resume("book-1", "extract")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(plan.previous, job.id);
        assert_eq!(plan.resume_from, 4);
        assert_eq!(plan.total_items, Some(10));
    }

    #[tokio::test]
    async fn stale_running_attempt_is_resumable() {
        let (clock, lock) = setup();
        let coordinator = ResumeCoordinator::new(lock.clone());
        let job = running_job(&lock, 5).await;

        clock.advance(StalenessPolicy::DEFAULT.run_stale() + TimeDelta::seconds(1));

        let plan = coordinator
            .plan_resume("book-1", "extract")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(plan.previous, job.id);
        assert_eq!(plan.resume_from, 5);
    }
}
