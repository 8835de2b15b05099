//! Background execution of jobs.
//!
//! Each acquired job runs on its own tokio task, owned by the [`TaskRunner`] rather than by the
//! request that submitted it. The runner starts the job, hands the [`Worker`](crate::worker::Worker)
//! a [`JobContext`], performs the final progress flush and then writes the one terminal state.
use std::{collections::HashMap, future::Future, ops::RangeInclusive, sync::Arc};

use serde::Serialize;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{instrument, Instrument};

use crate::{
    classify::{ErrorClassifier, UnitError},
    job::{ErrorKind, Job, JobError, JobId, JobStatus, Outcome},
    lock::{Acquisition, JobLockService},
    progress::ProgressTracker,
    retry::RetryPolicy,
    worker::{DynWorker, WorkError},
    JobleaseError,
};

/// The result of submitting a job.
#[derive(Debug)]
pub enum Submission {
    /// The job was created and is running in the background.
    Started { job: Job, handle: JobHandle },
    /// A live job already holds the slot; nothing was started.
    Conflict { existing_job_id: JobId },
}

impl Submission {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Started { job, .. } => job.id,
            Self::Conflict { existing_job_id } => *existing_job_id,
        }
    }
}

/// A handle to a job running in the background.
///
/// Dropping the handle detaches from the job; it keeps running.
#[derive(Debug)]
pub struct JobHandle {
    job_id: JobId,
    handle: JoinHandle<Result<Job, JobleaseError>>,
}

impl JobHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Waits for the job to reach a terminal state and returns its final record.
    pub async fn finished(self) -> Result<Job, JobleaseError> {
        self.handle.await?
    }
}

/// What a [`Worker`](crate::worker::Worker) can see and do while it runs.
pub struct JobContext {
    job: Job,
    lock: JobLockService,
    progress: ProgressTracker,
    classifier: Arc<dyn ErrorClassifier>,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

impl JobContext {
    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn resource_id(&self) -> &str {
        &self.job.resource_id
    }

    pub fn job_type(&self) -> &str {
        &self.job.job_type
    }

    pub fn attempt(&self) -> u32 {
        self.job.attempt
    }

    /// The total carried over from a previous attempt, if it was known.
    pub fn total_items(&self) -> Option<u64> {
        self.job.total_items
    }

    /// For a resumed attempt, the last item the previous attempt durably completed.
    pub fn resume_from(&self) -> Option<u64> {
        self.job.resume_from()
    }

    /// Whether `item` was already completed by a previous attempt.
    pub fn should_skip(&self, item: u64) -> bool {
        item <= self.job.last_completed_item
    }

    /// The items of a `total` item job that still need processing, in order.
    pub fn remaining_items(&self, total: u64) -> RangeInclusive<u64> {
        self.job.last_completed_item + 1..=total
    }

    /// Refreshes the job's heartbeat. Long units should call this often enough to stay well
    /// inside the run staleness limit.
    pub async fn heartbeat(&self) -> Result<(), WorkError> {
        if self.progress.heartbeat(self.job.id).await? {
            Ok(())
        } else {
            Err(WorkError::LeaseLost)
        }
    }

    pub async fn record(&self, item: u64, success: bool) -> Result<(), WorkError> {
        Ok(self.progress.record(self.job.id, item, success).await?)
    }

    /// Stores `output` for `item`, persisted with the next flush.
    pub async fn record_output(&self, item: u64, output: impl Serialize) -> Result<(), WorkError> {
        let output = serde_json::to_value(output)?;
        Ok(self
            .progress
            .record_output(self.job.id, item, output)
            .await?)
    }

    pub async fn set_total_items(&self, total: u64) -> Result<(), WorkError> {
        Ok(self.progress.set_total_items(self.job.id, total).await?)
    }

    /// Whether someone asked for this job to be cancelled.
    ///
    /// Fails with [`WorkError::Interrupted`] once the runner is shutting down, like
    /// [`JobContext::checkpoint`].
    pub async fn cancelled(&self) -> Result<bool, WorkError> {
        if self.shutdown.is_cancelled() {
            return Err(WorkError::Interrupted);
        }
        Ok(self.lock.job(self.job.id).await?.cancel_requested)
    }

    /// Unit boundary check. Fails when the runner is shutting down, the job was cancelled, or the
    /// job is no longer running.
    pub async fn checkpoint(&self) -> Result<(), WorkError> {
        if self.shutdown.is_cancelled() {
            return Err(WorkError::Interrupted);
        }
        let job = self.lock.job(self.job.id).await?;
        if job.status != JobStatus::Running {
            return Err(WorkError::LeaseLost);
        }
        if job.cancel_requested {
            return Err(WorkError::Cancelled);
        }
        Ok(())
    }

    /// Processes one item: checks the unit boundary, refreshes the heartbeat, runs `unit` with
    /// in-unit retries of transient failures, and records the result.
    ///
    /// The heartbeat is also refreshed before every retry. A single attempt that can outlast the
    /// run staleness limit still needs to call [`JobContext::heartbeat`] itself.
    ///
    /// `unit` receives the attempt number, starting at 1. A failure that outlives its retries is
    /// recorded and returned as [`WorkError::Unit`].
    pub async fn process<T, F, Fut>(&self, item: u64, mut unit: F) -> Result<T, WorkError>
    where
        F: FnMut(u16) -> Fut + Send,
        Fut: Future<Output = Result<T, UnitError>> + Send,
        T: Send,
    {
        self.checkpoint().await?;
        self.heartbeat().await?;

        let progress = &self.progress;
        let job_id = self.job.id;
        let attempts = |attempt: u16| {
            let retrying = attempt > 1;
            let run = unit(attempt);
            async move {
                if retrying {
                    // A lost lease surfaces when the result is recorded.
                    let _ = progress.heartbeat(job_id).await.inspect_err(
                        |err| tracing::warn!(?err, %job_id, item, "Heartbeat before retry failed"),
                    );
                }
                run.await
            }
        };
        match self.retry.run(self.classifier.as_ref(), attempts).await {
            Ok(value) => {
                self.record(item, true).await?;
                Ok(value)
            }
            Err(error) => {
                tracing::warn!(
                    job_id = %self.job.id,
                    item,
                    class = ?error.class,
                    attempts = error.attempts,
                    error = %error.error,
                    "Unit failed"
                );
                self.record(item, false).await?;
                Err(WorkError::Unit { item, error })
            }
        }
    }
}

/// Launches jobs and is the only writer of their terminal state.
#[derive(Clone)]
pub struct TaskRunner {
    lock: JobLockService,
    progress: ProgressTracker,
    classifier: Arc<dyn ErrorClassifier>,
    retry: RetryPolicy,
    workers: Arc<HashMap<&'static str, Arc<dyn DynWorker>>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl TaskRunner {
    pub(crate) fn new(
        lock: JobLockService,
        progress: ProgressTracker,
        classifier: Arc<dyn ErrorClassifier>,
        retry: RetryPolicy,
        workers: HashMap<&'static str, Arc<dyn DynWorker>>,
    ) -> Self {
        Self {
            lock,
            progress,
            classifier,
            retry,
            workers: Arc::new(workers),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    fn worker(&self, job_type: &str) -> Result<Arc<dyn DynWorker>, JobleaseError> {
        if self.shutdown.is_cancelled() {
            return Err(JobleaseError::ShuttingDown);
        }
        self.workers
            .get(job_type)
            .cloned()
            .ok_or_else(|| JobleaseError::UnknownJobType(job_type.to_owned()))
    }

    /// Acquires a fresh job for the pair and runs it in the background.
    #[instrument(skip(self))]
    pub async fn submit(&self, resource_id: &str, job_type: &str) -> Result<Submission, JobleaseError> {
        let worker = self.worker(job_type)?;
        let acquisition = self.lock.acquire(resource_id, job_type).await?;
        Ok(self.launch(acquisition, worker))
    }

    /// Acquires a job continuing the latest failed attempt and runs it in the background.
    #[instrument(skip(self))]
    pub async fn resume(&self, resource_id: &str, job_type: &str) -> Result<Submission, JobleaseError> {
        let worker = self.worker(job_type)?;
        let acquisition = self.lock.acquire_resume(resource_id, job_type).await?;
        Ok(self.launch(acquisition, worker))
    }

    fn launch(&self, acquisition: Acquisition, worker: Arc<dyn DynWorker>) -> Submission {
        let job = match acquisition {
            Acquisition::Acquired(job) => job,
            Acquisition::Conflict { existing_job_id } => {
                return Submission::Conflict { existing_job_id }
            }
        };
        let job_id = job.id;
        let runner = self.clone();
        let span = tracing::info_span!("job", %job_id, job_type = %job.job_type, attempt = job.attempt);
        let handle = self
            .tasks
            .spawn(async move { runner.execute(job_id, worker).await }.instrument(span));
        Submission::Started {
            job,
            handle: JobHandle { job_id, handle },
        }
    }

    async fn execute(self, job_id: JobId, worker: Arc<dyn DynWorker>) -> Result<Job, JobleaseError> {
        let job = match self.lock.start(job_id).await {
            Ok(job) => job,
            Err(err) => {
                tracing::error!(?err, %job_id, "Failed to start job");
                let error = JobError::new(ErrorKind::Internal, format!("failed to start: {err}"));
                self.release(job_id, Outcome::Failed(error)).await;
                return Ok(self.lock.job(job_id).await?);
            }
        };

        let outcome = match self.progress.begin(&job) {
            Ok(()) => {
                let outcome = self.run_worker(job, worker).await;
                self.final_flush(job_id, outcome).await
            }
            Err(err) => {
                tracing::error!(?err, %job_id, "Failed to track progress");
                Outcome::Failed(JobError::new(ErrorKind::Internal, err.to_string()))
            }
        };

        self.release(job_id, outcome).await;
        Ok(self.lock.job(job_id).await?)
    }

    async fn run_worker(&self, job: Job, worker: Arc<dyn DynWorker>) -> Outcome {
        let job_id = job.id;
        let ctx = JobContext {
            job,
            lock: self.lock.clone(),
            progress: self.progress.clone(),
            classifier: self.classifier.clone(),
            retry: self.retry,
            shutdown: self.shutdown.clone(),
        };

        tracing::debug!(%job_id, "Running job {job_id}");
        let result = tokio::spawn(async move { worker.run_job(&ctx).await }.in_current_span()).await;

        match result {
            Ok(Ok(())) => Outcome::Completed,
            Ok(Err(error)) => {
                let error = error.to_job_error(self.classifier.as_ref());
                tracing::warn!(%job_id, kind = %error.kind, message = %error.message, "Job failed");
                Outcome::Failed(error)
            }
            Err(join_error) => {
                let error = JobError::from(join_error);
                tracing::error!(%job_id, message = %error.message, "Job panicked");
                Outcome::Failed(error)
            }
        }
    }

    /// Flushes whatever the worker recorded since the last batch. A completion whose final flush
    /// fails is downgraded to a failure, since its progress is not durable.
    async fn final_flush(&self, job_id: JobId, outcome: Outcome) -> Outcome {
        match self.progress.finish(job_id).await {
            Ok(()) => outcome,
            Err(err) => {
                tracing::error!(?err, %job_id, "Final progress flush failed");
                match outcome {
                    Outcome::Completed => Outcome::Failed(JobError::new(
                        ErrorKind::Internal,
                        format!("final progress flush failed: {err}"),
                    )),
                    failed => failed,
                }
            }
        }
    }

    async fn release(&self, job_id: JobId, outcome: Outcome) {
        let _ = self
            .lock
            .release(job_id, outcome)
            .await
            .inspect_err(|err| tracing::error!(?err, %job_id, "Failed to release job {job_id}"));
    }

    /// Stops accepting jobs, interrupts running workers at their next unit boundary and waits for
    /// every job to be released.
    pub async fn graceful_shutdown(&self) {
        tracing::debug!("Shutting down job runner");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Number of jobs currently running.
    pub fn running(&self) -> usize {
        self.tasks.len()
    }
}

impl From<JoinError> for JobError {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self::new(ErrorKind::Panic, message)
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    };

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        backoff::BackoffStrategy,
        classify::DefaultClassifier,
        clock::ManualClock,
        lock::StalenessPolicy,
        store::{memory::InMemoryStore, ItemOutput},
        worker::Worker,
    };

    const BOOK: &str = "book-1";

    /// Processes `total` pages, failing fatally once on `fatal_at` when it is set.
    #[derive(Default)]
    struct Extract {
        total: u64,
        fatal_at: AtomicU64,
        seen: Mutex<Vec<u64>>,
    }

    impl Extract {
        fn new(total: u64) -> Self {
            Self {
                total,
                ..Default::default()
            }
        }

        fn failing_once_at(total: u64, item: u64) -> Self {
            Self {
                total,
                fatal_at: AtomicU64::new(item),
                ..Default::default()
            }
        }

        fn seen(&self) -> Vec<u64> {
            std::mem::take(&mut *self.seen.lock().unwrap())
        }
    }

    #[async_trait]
    impl Worker for Extract {
        const JOB_TYPE: &'static str = "extract";

        async fn run(&self, ctx: &JobContext) -> Result<(), WorkError> {
            ctx.set_total_items(self.total).await?;
            for item in ctx.remaining_items(self.total) {
                let fatal = self
                    .fatal_at
                    .compare_exchange(item, 0, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok();
                self.seen.lock().unwrap().push(item);
                ctx.process(item, |_attempt| async move {
                    if fatal {
                        Err(UnitError::malformed_input("unreadable page"))
                    } else {
                        Ok(())
                    }
                })
                .await?;
                ctx.record_output(item, json!({ "page": item })).await?;
            }
            Ok(())
        }
    }

    /// Processes items until it reaches `stop_after`, then waits to be let through.
    #[derive(Default)]
    struct Gated {
        stop_after: u64,
        reached: Notify,
        open: Notify,
    }

    #[async_trait]
    impl Worker for Gated {
        const JOB_TYPE: &'static str = "gated";

        async fn run(&self, ctx: &JobContext) -> Result<(), WorkError> {
            for item in ctx.remaining_items(10) {
                ctx.process(item, |_attempt| async { Ok(()) }).await?;
                if item == self.stop_after {
                    self.reached.notify_one();
                    self.open.notified().await;
                }
            }
            Ok(())
        }
    }

    struct Flaky {
        calls: AtomicU64,
    }

    #[async_trait]
    impl Worker for Flaky {
        const JOB_TYPE: &'static str = "flaky";

        async fn run(&self, ctx: &JobContext) -> Result<(), WorkError> {
            let calls = &self.calls;
            ctx.process(1, |_attempt| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(UnitError::timeout("upstream timed out"))
                } else {
                    Ok(())
                }
            })
            .await
        }
    }

    /// Every unit attempt takes two minutes of clock time. Each unit fails transiently on its
    /// first `transient_failures` attempts, and the unit for `pause_at` waits to be let through
    /// on its successful attempt.
    struct Slow {
        clock: ManualClock,
        items: u64,
        transient_failures: u16,
        pause_at: u64,
        reached: Notify,
        open: Notify,
    }

    impl Slow {
        fn new(clock: &ManualClock, items: u64, transient_failures: u16, pause_at: u64) -> Self {
            Self {
                clock: clock.clone(),
                items,
                transient_failures,
                pause_at,
                reached: Notify::new(),
                open: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl Worker for Slow {
        const JOB_TYPE: &'static str = "slow";

        async fn run(&self, ctx: &JobContext) -> Result<(), WorkError> {
            for item in ctx.remaining_items(self.items) {
                ctx.process(item, |attempt| async move {
                    self.clock.advance(TimeDelta::minutes(2));
                    if attempt <= self.transient_failures {
                        return Err(UnitError::timeout("slow upstream"));
                    }
                    if item == self.pause_at {
                        self.reached.notify_one();
                        self.open.notified().await;
                    }
                    Ok(())
                })
                .await?;
            }
            Ok(())
        }
    }

    /// Records items itself and polls for cancellation between them, pausing after `stop_after`.
    #[derive(Default)]
    struct Polling {
        stop_after: u64,
        reached: Notify,
        open: Notify,
    }

    #[async_trait]
    impl Worker for Polling {
        const JOB_TYPE: &'static str = "polling";

        async fn run(&self, ctx: &JobContext) -> Result<(), WorkError> {
            for item in ctx.remaining_items(10) {
                if ctx.cancelled().await? {
                    return Err(WorkError::Cancelled);
                }
                ctx.record(item, true).await?;
                if item == self.stop_after {
                    self.reached.notify_one();
                    self.open.notified().await;
                }
            }
            Ok(())
        }
    }

    struct Panics;

    #[async_trait]
    impl Worker for Panics {
        const JOB_TYPE: &'static str = "panics";

        async fn run(&self, _ctx: &JobContext) -> Result<(), WorkError> {
            panic!("Oh dear!");
        }
    }

    struct Harness {
        clock: ManualClock,
        lock: JobLockService,
        progress: ProgressTracker,
        runner: TaskRunner,
    }

    impl Harness {
        fn new(workers: Vec<(&'static str, Arc<dyn DynWorker>)>) -> Self {
            Self::with_clock(ManualClock::default(), workers)
        }

        fn with_clock(clock: ManualClock, workers: Vec<(&'static str, Arc<dyn DynWorker>)>) -> Self {
            let lock = JobLockService::new(
                Arc::new(InMemoryStore::new()),
                Arc::new(clock.clone()),
                StalenessPolicy::DEFAULT,
            );
            let progress = ProgressTracker::new(lock.clone(), 5);
            let retry = RetryPolicy::new(3, BackoffStrategy::constant(TimeDelta::zero()));
            let runner = TaskRunner::new(
                lock.clone(),
                progress.clone(),
                Arc::new(DefaultClassifier),
                retry,
                workers.into_iter().collect(),
            );
            Self {
                clock,
                lock,
                progress,
                runner,
            }
        }

        fn with<W: Worker>(worker: &Arc<W>) -> Self {
            Self::new(vec![(W::JOB_TYPE, worker.clone() as Arc<dyn DynWorker>)])
        }
    }

    fn started(submission: Submission) -> (Job, JobHandle) {
        assert_matches!(submission, Submission::Started { job, handle } => (job, handle))
    }

    #[tokio::test]
    async fn completes_job_and_persists_outputs() {
        let worker = Arc::new(Extract::new(7));
        let harness = Harness::with(&worker);

        let (job, handle) = started(harness.runner.submit(BOOK, Extract::JOB_TYPE).await.unwrap());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(handle.job_id(), job.id);

        let job = handle.finished().await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.last_completed_item, 7);
        assert_eq!(job.completed_items, 7);
        assert_eq!(job.total_items, Some(7));
        assert!(job.error.is_none());
        assert_eq!(worker.seen(), (1..=7).collect::<Vec<_>>());

        let outputs = harness.lock.store().item_outputs(job.id).await.unwrap();
        assert_eq!(outputs.len(), 7);
        assert_eq!(
            outputs[6],
            ItemOutput {
                item: 7,
                output: json!({ "page": 7 })
            }
        );
    }

    #[tokio::test]
    async fn live_job_conflicts() {
        let worker = Arc::new(Gated {
            stop_after: 1,
            ..Default::default()
        });
        let harness = Harness::with(&worker);

        let (job, handle) = started(harness.runner.submit(BOOK, Gated::JOB_TYPE).await.unwrap());
        worker.reached.notified().await;

        let submission = harness.runner.submit(BOOK, Gated::JOB_TYPE).await.unwrap();
        assert_matches!(submission, Submission::Conflict { existing_job_id } if existing_job_id == job.id);

        worker.open.notify_one();
        assert_eq!(handle.finished().await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn resume_reprocesses_unflushed_items_after_crash() {
        let worker = Arc::new(Extract::new(7));
        let harness = Harness::with(&worker);

        // A previous process got through six items but only flushed the first batch.
        let crashed = assert_matches!(
            harness.lock.acquire(BOOK, Extract::JOB_TYPE).await,
            Ok(Acquisition::Acquired(job)) => job
        );
        let crashed = harness.lock.start(crashed.id).await.unwrap();
        harness.progress.begin(&crashed).unwrap();
        harness.progress.set_total_items(crashed.id, 7).await.unwrap();
        for item in 1..=6 {
            harness.progress.record(crashed.id, item, true).await.unwrap();
        }

        harness
            .clock
            .advance(StalenessPolicy::DEFAULT.run_stale() + TimeDelta::seconds(1));

        let (job, handle) = started(harness.runner.resume(BOOK, Extract::JOB_TYPE).await.unwrap());
        assert_eq!(job.resumed_from, Some(crashed.id));
        assert_eq!(job.resume_from(), Some(5));
        assert_eq!(job.attempt, 2);

        let job = handle.finished().await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.last_completed_item, 7);
        assert_eq!(worker.seen(), vec![6, 7]);

        let crashed = harness.lock.job(crashed.id).await.unwrap();
        assert_eq!(crashed.status, JobStatus::Failed);
        assert_matches!(crashed.error, Some(JobError { kind: ErrorKind::ReclaimedStale, .. }));
    }

    #[tokio::test]
    async fn fatal_unit_fails_job_and_resume_skips_done_items() {
        let worker = Arc::new(Extract::failing_once_at(5, 3));
        let harness = Harness::with(&worker);

        let (_, handle) = started(harness.runner.submit(BOOK, Extract::JOB_TYPE).await.unwrap());
        let failed = handle.finished().await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.last_completed_item, 2);
        assert_matches!(failed.error, Some(JobError { kind: ErrorKind::UnitFatal, .. }));
        assert_eq!(worker.seen(), vec![1, 2, 3]);

        let (job, handle) = started(harness.runner.resume(BOOK, Extract::JOB_TYPE).await.unwrap());
        assert_eq!(job.resumed_from, Some(failed.id));
        let job = handle.finished().await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.last_completed_item, 5);
        assert_eq!(worker.seen(), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn cancellation_is_observed_at_the_next_unit() {
        let worker = Arc::new(Gated {
            stop_after: 2,
            ..Default::default()
        });
        let harness = Harness::with(&worker);

        let (job, handle) = started(harness.runner.submit(BOOK, Gated::JOB_TYPE).await.unwrap());
        worker.reached.notified().await;
        assert!(harness.lock.request_cancel(job.id).await.unwrap());
        worker.open.notify_one();

        let job = handle.finished().await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_completed_item, 2);
        assert_matches!(job.error, Some(JobError { kind: ErrorKind::CancelledByUser, .. }));
    }

    #[tokio::test]
    async fn transient_units_are_retried() {
        let worker = Arc::new(Flaky {
            calls: AtomicU64::new(0),
        });
        let harness = Harness::with(&worker);

        let (_, handle) = started(harness.runner.submit(BOOK, Flaky::JOB_TYPE).await.unwrap());

        let job = handle.finished().await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn slow_units_keep_the_job_alive() {
        let clock = ManualClock::default();
        let worker = Arc::new(Slow::new(&clock, 4, 0, 3));
        let harness = Harness::with_clock(
            clock,
            vec![(Slow::JOB_TYPE, worker.clone() as Arc<dyn DynWorker>)],
        );

        let (job, handle) = started(harness.runner.submit(BOOK, Slow::JOB_TYPE).await.unwrap());
        worker.reached.notified().await;

        // Six minutes in, with nothing flushed yet.
        assert_matches!(
            harness.lock.acquire(BOOK, Slow::JOB_TYPE).await,
            Ok(Acquisition::Conflict { existing_job_id }) if existing_job_id == job.id
        );

        worker.open.notify_one();
        let job = handle.finished().await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.last_completed_item, 4);
    }

    #[tokio::test]
    async fn retried_units_keep_the_job_alive() {
        let clock = ManualClock::default();
        let worker = Arc::new(Slow::new(&clock, 1, 2, 1));
        let harness = Harness::with_clock(
            clock,
            vec![(Slow::JOB_TYPE, worker.clone() as Arc<dyn DynWorker>)],
        );

        let (job, handle) = started(harness.runner.submit(BOOK, Slow::JOB_TYPE).await.unwrap());
        worker.reached.notified().await;

        // The third attempt of the only unit, six minutes after the unit started.
        assert_matches!(
            harness.lock.acquire(BOOK, Slow::JOB_TYPE).await,
            Ok(Acquisition::Conflict { existing_job_id }) if existing_job_id == job.id
        );

        worker.open.notify_one();
        assert_eq!(handle.finished().await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn panicking_worker_fails_job() {
        let harness = Harness::with(&Arc::new(Panics));

        let (_, handle) = started(harness.runner.submit(BOOK, Panics::JOB_TYPE).await.unwrap());

        let job = handle.finished().await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error,
            Some(JobError::new(ErrorKind::Panic, "Oh dear!"))
        );
    }

    #[tokio::test]
    async fn unknown_job_type_creates_nothing() {
        let harness = Harness::new(vec![]);

        assert_matches!(
            harness.runner.submit(BOOK, "extract").await,
            Err(JobleaseError::UnknownJobType(job_type)) if job_type == "extract"
        );
        assert!(harness
            .lock
            .store()
            .latest(BOOK, "extract")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn graceful_shutdown_interrupts_running_jobs() {
        let worker = Arc::new(Gated {
            stop_after: 1,
            ..Default::default()
        });
        let harness = Harness::with(&worker);

        let (_, handle) = started(harness.runner.submit(BOOK, Gated::JOB_TYPE).await.unwrap());
        worker.reached.notified().await;
        assert_eq!(harness.runner.running(), 1);

        harness.runner.shutdown.cancel();
        worker.open.notify_one();
        harness.runner.graceful_shutdown().await;

        let job = handle.finished().await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_completed_item, 1);
        assert_matches!(job.error, Some(JobError { kind: ErrorKind::Interrupted, .. }));

        assert_matches!(
            harness.runner.submit("book-2", Gated::JOB_TYPE).await,
            Err(JobleaseError::ShuttingDown)
        );
    }

    #[tokio::test]
    async fn polling_worker_sees_graceful_shutdown() {
        let worker = Arc::new(Polling {
            stop_after: 1,
            ..Default::default()
        });
        let harness = Harness::with(&worker);

        let (_, handle) = started(harness.runner.submit(BOOK, Polling::JOB_TYPE).await.unwrap());
        worker.reached.notified().await;

        harness.runner.shutdown.cancel();
        worker.open.notify_one();
        harness.runner.graceful_shutdown().await;

        let job = handle.finished().await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_completed_item, 1);
        assert_matches!(job.error, Some(JobError { kind: ErrorKind::Interrupted, .. }));
    }
}
