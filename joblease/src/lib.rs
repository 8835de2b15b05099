//! Background jobs with one live job per `(resource_id, job_type)`.
//!
//! Jobs are leased through a [`JobStore`](store::JobStore): a job that stops heartbeating is
//! reclaimed by the next caller asking for its slot, and a failed or reclaimed job can be resumed
//! from the last item it durably completed.
//!
//! ```
//! # use joblease::prelude::*;
//! # use joblease::store::memory::InMemoryStore;
//! struct Ocr;
//!
//! #[async_trait::async_trait]
//! impl Worker for Ocr {
//!     const JOB_TYPE: &'static str = "ocr";
//!
//!     async fn run(&self, ctx: &JobContext) -> Result<(), WorkError> {
//!         ctx.set_total_items(3).await?;
//!         for page in ctx.remaining_items(3) {
//!             let text = ctx
//!                 .process(page, |_attempt| async move { Ok(format!("page {page}")) })
//!                 .await?;
//!             ctx.record_output(page, text).await?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), JobleaseError> {
//! let joblease = Joblease::builder(InMemoryStore::new()).with_worker(Ocr).build();
//!
//! let job = match joblease.create_or_acquire("book-1", Ocr::JOB_TYPE).await? {
//!     Submission::Started { handle, .. } => handle.finished().await?,
//!     Submission::Conflict { existing_job_id } => joblease.job(existing_job_id).await?,
//! };
//! assert_eq!(job.status, JobStatus::Completed);
//! # Ok(())
//! # }
//! ```
use std::{collections::HashMap, sync::Arc};

use thiserror::Error;
use tokio::task::JoinError;

pub mod backoff;
pub mod classify;
pub mod clock;
pub mod config;
pub mod job;
pub mod lock;
pub mod prelude;
pub mod progress;
pub mod resume;
pub mod retry;
pub mod runner;
pub mod store;
pub mod worker;

use classify::{DefaultClassifier, ErrorClassifier};
use clock::{Clock, SystemClock};
use config::Config;
use job::{Job, JobId, StatusReport};
use lock::{JobLockService, LockError};
use progress::ProgressTracker;
use resume::{ResumeCoordinator, ResumePlan};
use runner::{Submission, TaskRunner};
use store::{ItemOutput, JobStore, StoreError};
use worker::{DynWorker, Worker};

/// Entry point: registers workers and exposes the job operations.
pub struct Joblease<S: JobStore> {
    store: Arc<S>,
    lock: JobLockService,
    runner: TaskRunner,
    resume: ResumeCoordinator,
}

/// Configures a [`Joblease`] before any job runs.
pub struct JobleaseBuilder<S: JobStore> {
    store: S,
    config: Config,
    clock: Arc<dyn Clock>,
    classifier: Arc<dyn ErrorClassifier>,
    workers: HashMap<&'static str, Arc<dyn DynWorker>>,
}

impl<S: JobStore> JobleaseBuilder<S> {
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_classifier(mut self, classifier: impl ErrorClassifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Registers `worker` for [`Worker::JOB_TYPE`], replacing any worker already registered for it.
    pub fn with_worker<W: Worker>(mut self, worker: W) -> Self {
        if self
            .workers
            .insert(W::JOB_TYPE, Arc::new(worker))
            .is_some()
        {
            tracing::warn!(job_type = W::JOB_TYPE, "Replacing worker for job type");
        }
        self
    }

    pub fn build(self) -> Joblease<S> {
        let store = Arc::new(self.store);
        let lock = JobLockService::new(store.clone(), self.clock, self.config.staleness());
        let progress = ProgressTracker::new(lock.clone(), self.config.flush_batch_size());
        let runner = TaskRunner::new(
            lock.clone(),
            progress,
            self.classifier,
            self.config.unit_retry(),
            self.workers,
        );
        Joblease {
            store,
            resume: ResumeCoordinator::new(lock.clone()),
            lock,
            runner,
        }
    }
}

impl<S: JobStore> Joblease<S> {
    pub fn builder(store: S) -> JobleaseBuilder<S> {
        JobleaseBuilder {
            store,
            config: Config::default(),
            clock: Arc::new(SystemClock),
            classifier: Arc::new(DefaultClassifier),
            workers: HashMap::new(),
        }
    }

    /// Starts a job for the pair unless a live one already exists.
    ///
    /// A stale holder of the slot is reclaimed and the new job is returned from the same call.
    pub async fn create_or_acquire(
        &self,
        resource_id: &str,
        job_type: &str,
    ) -> Result<Submission, JobleaseError> {
        self.runner.submit(resource_id, job_type).await
    }

    /// Starts a new attempt continuing the latest failed (or stale) attempt for the pair.
    pub async fn resume(&self, resource_id: &str, job_type: &str) -> Result<Submission, JobleaseError> {
        self.runner.resume(resource_id, job_type).await
    }

    pub async fn job(&self, job_id: JobId) -> Result<Job, JobleaseError> {
        Ok(self.lock.job(job_id).await?)
    }

    pub async fn status(&self, job_id: JobId) -> Result<StatusReport, JobleaseError> {
        let job = self.lock.job(job_id).await?;
        Ok(StatusReport::new(job, self.lock.now()))
    }

    /// Asks a job to stop at its next unit boundary. Cancelling a finished job is accepted and
    /// changes nothing.
    pub async fn cancel(&self, job_id: JobId) -> Result<(), JobleaseError> {
        self.lock.request_cancel(job_id).await?;
        Ok(())
    }

    /// Every attempt for the pair, oldest first.
    pub async fn attempts(&self, resource_id: &str, job_type: &str) -> Result<Vec<Job>, JobleaseError> {
        Ok(self.store.attempts(resource_id, job_type).await?)
    }

    /// Where a resume of the pair would start, without starting it.
    pub async fn resume_plan(
        &self,
        resource_id: &str,
        job_type: &str,
    ) -> Result<Option<ResumePlan>, JobleaseError> {
        Ok(self.resume.plan_resume(resource_id, job_type).await?)
    }

    pub async fn item_outputs(&self, job_id: JobId) -> Result<Vec<ItemOutput>, JobleaseError> {
        Ok(self.store.item_outputs(job_id).await?)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn lock_service(&self) -> &JobLockService {
        &self.lock
    }

    /// Stops accepting jobs and waits for the running ones to stop at their next unit boundary.
    /// They are released as failed with [`ErrorKind::Interrupted`](job::ErrorKind::Interrupted)
    /// and can be resumed later.
    pub async fn graceful_shutdown(&self) {
        self.runner.graceful_shutdown().await
    }
}

#[derive(Debug, Error)]
pub enum JobleaseError {
    #[error("No worker registered for job type {0}")]
    UnknownJobType(String),
    #[error("No failed attempt to resume for {resource_id}/{job_type}")]
    NoFailedAttempt {
        resource_id: String,
        job_type: String,
    },
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Shutting down, not accepting jobs")]
    ShuttingDown,
    #[error("Job task failed to complete")]
    TaskFailed(#[from] JoinError),
    #[error(transparent)]
    Lock(LockError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for JobleaseError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::JobNotFound(job_id) => Self::JobNotFound(job_id),
            error => Self::Store(error),
        }
    }
}

impl From<LockError> for JobleaseError {
    fn from(value: LockError) -> Self {
        match value {
            LockError::NoFailedAttempt {
                resource_id,
                job_type,
            } => Self::NoFailedAttempt {
                resource_id,
                job_type,
            },
            LockError::Store(error) => error.into(),
            error => Self::Lock(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        classify::UnitError,
        clock::ManualClock,
        job::{ErrorKind, JobStatus},
        runner::JobContext,
        store::memory::InMemoryStore,
        worker::WorkError,
    };

    struct Chapters;

    #[async_trait]
    impl Worker for Chapters {
        const JOB_TYPE: &'static str = "chapters";

        async fn run(&self, ctx: &JobContext) -> Result<(), WorkError> {
            ctx.set_total_items(4).await?;
            for item in ctx.remaining_items(4) {
                let fail = item == 3 && ctx.attempt() == 1;
                ctx.process(item, |_attempt| async move {
                    if fail {
                        Err(UnitError::validation("chapter has no title"))
                    } else {
                        Ok(())
                    }
                })
                .await?;
            }
            Ok(())
        }
    }

    /// Records sections itself and stops when asked to, pausing after the second one.
    #[derive(Default)]
    struct Sections {
        reached: Arc<Notify>,
        open: Arc<Notify>,
    }

    #[async_trait]
    impl Worker for Sections {
        const JOB_TYPE: &'static str = "sections";

        async fn run(&self, ctx: &JobContext) -> Result<(), WorkError> {
            for item in ctx.remaining_items(5) {
                if ctx.cancelled().await? {
                    return Err(WorkError::Cancelled);
                }
                ctx.record(item, true).await?;
                if item == 2 {
                    self.reached.notify_one();
                    self.open.notified().await;
                }
            }
            Ok(())
        }
    }

    fn joblease(clock: &ManualClock) -> Joblease<InMemoryStore> {
        Joblease::builder(InMemoryStore::new())
            .with_clock(clock.clone())
            .with_worker(Chapters)
            .build()
    }

    async fn run(submission: Submission) -> Job {
        match submission {
            Submission::Started { handle, .. } => handle.finished().await.unwrap(),
            Submission::Conflict { existing_job_id } => {
                panic!("unexpected conflict with {existing_job_id}")
            }
        }
    }

    #[tokio::test]
    async fn failed_job_is_reported_and_resumed() {
        let clock = ManualClock::default();
        let joblease = joblease(&clock);

        let failed = run(joblease
            .create_or_acquire("book-1", Chapters::JOB_TYPE)
            .await
            .unwrap())
        .await;

        clock.advance(TimeDelta::seconds(10));
        let status = joblease.status(failed.id).await.unwrap();
        assert_eq!(status.status, JobStatus::Failed);
        assert_eq!(status.last_completed_item, 2);
        assert_eq!(status.total_items, Some(4));
        assert_eq!(status.heartbeat_age, Some(Duration::from_secs(10)));
        assert_matches!(status.error, Some(job::JobError { kind: ErrorKind::UnitFatal, .. }));

        let plan = joblease
            .resume_plan("book-1", Chapters::JOB_TYPE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(plan.previous, failed.id);
        assert_eq!(plan.resume_from, 2);
        assert!(plan.should_skip(2));

        let resumed = run(joblease.resume("book-1", Chapters::JOB_TYPE).await.unwrap()).await;
        assert_eq!(resumed.status, JobStatus::Completed);
        assert_eq!(resumed.attempt, 2);

        let attempts = joblease
            .attempts("book-1", Chapters::JOB_TYPE)
            .await
            .unwrap();
        assert_eq!(
            attempts.iter().map(|job| job.id).collect::<Vec<_>>(),
            vec![failed.id, resumed.id]
        );
        assert!(joblease
            .resume_plan("book-1", Chapters::JOB_TYPE)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn errors_are_mapped_for_callers() {
        let joblease = joblease(&ManualClock::default());

        assert_matches!(
            joblease.resume("book-1", Chapters::JOB_TYPE).await,
            Err(JobleaseError::NoFailedAttempt { .. })
        );
        assert_matches!(
            joblease.status(42.into()).await,
            Err(JobleaseError::JobNotFound(job_id)) if job_id == JobId::from(42)
        );
        assert_matches!(
            joblease.cancel(42.into()).await,
            Err(JobleaseError::JobNotFound(_))
        );
        assert_matches!(
            joblease.create_or_acquire("book-1", "unknown").await,
            Err(JobleaseError::UnknownJobType(_))
        );
    }

    #[tokio::test]
    async fn cancelling_finished_job_is_accepted() {
        let joblease = joblease(&ManualClock::default());
        let job = run(joblease
            .create_or_acquire("book-2", Chapters::JOB_TYPE)
            .await
            .unwrap())
        .await;

        assert!(joblease.cancel(job.id).await.is_ok());
        assert!(!joblease.job(job.id).await.unwrap().cancel_requested);
    }

    #[tokio::test]
    async fn cancel_stops_a_running_job() {
        let worker = Sections::default();
        let (reached, open) = (worker.reached.clone(), worker.open.clone());
        let joblease = Joblease::builder(InMemoryStore::new())
            .with_clock(ManualClock::default())
            .with_worker(worker)
            .build();

        let submission = joblease
            .create_or_acquire("book-3", Sections::JOB_TYPE)
            .await
            .unwrap();
        let job_id = submission.job_id();
        reached.notified().await;

        joblease.cancel(job_id).await.unwrap();
        assert!(joblease.job(job_id).await.unwrap().cancel_requested);
        open.notify_one();

        let job = run(submission).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_completed_item, 2);
        assert_eq!(job.completed_items, 2);
        assert_matches!(job.error, Some(job::JobError { kind: ErrorKind::CancelledByUser, .. }));
    }
}
