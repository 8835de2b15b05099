//! The job state machine.
//!
//! ```text
//! pending --start--> running --release(completed)--> completed
//!                    running --release(failed)-----> failed
//! pending --acquire reclaims stale----------------> failed
//! running --acquire reclaims stale----------------> failed
//! ```
//!
//! [`JobLockService`] is the only component that moves a job between states. Apart from
//! [`JobLockService::start`], every operation on a terminal job is a no-op rather than an error.
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tracing::instrument;

use crate::{
    clock::Clock,
    job::{ErrorKind, Job, JobError, JobId, JobStatus, NewJob, Outcome},
    resume::ResumePlan,
    store::{JobStore, SlotOutcome, StoreError},
};

/// How long an active job may go without a sign of life before it is considered dead.
///
/// One predicate covers both active states: a running job is measured from its last heartbeat
/// against `run_stale`, a pending job from its creation against `pending_stale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    run_stale: TimeDelta,
    pending_stale: TimeDelta,
}

impl StalenessPolicy {
    pub const DEFAULT: Self = Self::new(TimeDelta::minutes(5), TimeDelta::minutes(2));

    pub const fn new(run_stale: TimeDelta, pending_stale: TimeDelta) -> Self {
        Self {
            run_stale,
            pending_stale,
        }
    }

    pub const fn with_run_stale(mut self, run_stale: TimeDelta) -> Self {
        self.run_stale = run_stale;
        self
    }

    pub const fn with_pending_stale(mut self, pending_stale: TimeDelta) -> Self {
        self.pending_stale = pending_stale;
        self
    }

    pub const fn run_stale(&self) -> TimeDelta {
        self.run_stale
    }

    pub const fn pending_stale(&self) -> TimeDelta {
        self.pending_stale
    }

    /// The staleness limit for a job in `status`. Terminal jobs have none.
    pub fn threshold(&self, status: JobStatus) -> Option<TimeDelta> {
        match status {
            JobStatus::Pending => Some(self.pending_stale),
            JobStatus::Running => Some(self.run_stale),
            JobStatus::Completed | JobStatus::Failed => None,
        }
    }

    /// The timestamp staleness is measured from.
    fn last_sign_of_life(job: &Job) -> DateTime<Utc> {
        match job.status {
            JobStatus::Running => job.heartbeat_at.or(job.started_at).unwrap_or(job.created_at),
            _ => job.created_at,
        }
    }

    pub fn is_stale(&self, job: &Job, now: DateTime<Utc>) -> bool {
        self.threshold(job.status)
            .is_some_and(|limit| now - Self::last_sign_of_life(job) > limit)
    }
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Whether an acquire starts a new lineage or continues the latest failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Fresh,
    Resume,
}

/// A request for the `(resource_id, job_type)` slot, handed to [`JobStore::acquire_slot`].
#[derive(Debug, Clone, PartialEq)]
pub struct SlotRequest {
    pub resource_id: String,
    pub job_type: String,
    pub intent: Intent,
    pub now: DateTime<Utc>,
    pub policy: StalenessPolicy,
}

/// What a store must do with a locked slot.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotAction {
    /// Leave the slot alone; the latest job is alive.
    Conflict,
    /// Fail the latest job with `reclaim` when set, then insert `job`.
    Create {
        reclaim: Option<JobError>,
        job: NewJob,
    },
    NoFailedAttempt,
}

impl SlotRequest {
    /// Decides the slot's fate from its latest attempt. Stores call this while holding the slot
    /// lock and apply the result in the same transaction.
    pub fn decide(&self, latest: Option<&Job>) -> SlotAction {
        let reclaim = match latest {
            Some(job) if job.is_active() => {
                if !self.policy.is_stale(job, self.now) {
                    return SlotAction::Conflict;
                }
                Some(JobError::new(
                    ErrorKind::ReclaimedStale,
                    format!("{} job {} stopped reporting and was reclaimed", job.status, job.id),
                ))
            }
            _ => None,
        };

        let job = match (self.intent, latest) {
            (Intent::Fresh, _) => NewJob::fresh(&self.resource_id, &self.job_type),
            (Intent::Resume, Some(previous))
                if previous.status == JobStatus::Failed || reclaim.is_some() =>
            {
                ResumePlan::from_attempt(previous).into_new_job()
            }
            (Intent::Resume, _) => return SlotAction::NoFailedAttempt,
        };

        SlotAction::Create { reclaim, job }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Acquisition {
    Acquired(Job),
    /// A live job already holds the slot. Not an error: the caller can poll or wait for it.
    Conflict { existing_job_id: JobId },
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Invalid transition for {job_id} from {from}")]
    InvalidTransition { job_id: JobId, from: JobStatus },
    #[error("No failed attempt to resume for {resource_id}/{job_type}")]
    NoFailedAttempt {
        resource_id: String,
        job_type: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Owns the job state machine on top of a [`JobStore`].
#[derive(Clone)]
pub struct JobLockService {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    policy: StalenessPolicy,
}

impl JobLockService {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, policy: StalenessPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn policy(&self) -> StalenessPolicy {
        self.policy
    }

    pub(crate) fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Creates a pending job for the pair, reclaiming a stale holder first.
    #[instrument(skip(self))]
    pub async fn acquire(&self, resource_id: &str, job_type: &str) -> Result<Acquisition, LockError> {
        self.acquire_slot(resource_id, job_type, Intent::Fresh).await
    }

    /// Like [`JobLockService::acquire`], but the new job continues the latest attempt, which must
    /// have failed (or be reclaimed as stale in this call).
    #[instrument(skip(self))]
    pub async fn acquire_resume(
        &self,
        resource_id: &str,
        job_type: &str,
    ) -> Result<Acquisition, LockError> {
        self.acquire_slot(resource_id, job_type, Intent::Resume).await
    }

    async fn acquire_slot(
        &self,
        resource_id: &str,
        job_type: &str,
        intent: Intent,
    ) -> Result<Acquisition, LockError> {
        let request = SlotRequest {
            resource_id: resource_id.to_owned(),
            job_type: job_type.to_owned(),
            intent,
            now: self.clock.now(),
            policy: self.policy,
        };
        match self.store.acquire_slot(&request).await? {
            SlotOutcome::Created { job, reclaimed } => {
                if let Some(reclaimed) = reclaimed {
                    tracing::warn!(
                        reclaimed_job_id = %reclaimed.id,
                        status = %reclaimed.status,
                        job_id = %job.id,
                        "Reclaimed stale job"
                    );
                }
                tracing::debug!(job_id = %job.id, attempt = job.attempt, "Created job");
                Ok(Acquisition::Acquired(job))
            }
            SlotOutcome::Conflict(existing) => {
                tracing::debug!(existing_job_id = %existing.id, "Slot held by live job");
                Ok(Acquisition::Conflict {
                    existing_job_id: existing.id,
                })
            }
            SlotOutcome::NoFailedAttempt => Err(LockError::NoFailedAttempt {
                resource_id: request.resource_id,
                job_type: request.job_type,
            }),
        }
    }

    /// `pending -> running`. Returns the job as it is after the transition.
    #[instrument(skip(self))]
    pub async fn start(&self, job_id: JobId) -> Result<Job, LockError> {
        if self.store.mark_running(job_id, self.clock.now()).await? {
            tracing::debug!("Job started");
            return Ok(self.store.get(job_id).await?);
        }
        let job = self.store.get(job_id).await?;
        Err(LockError::InvalidTransition {
            job_id,
            from: job.status,
        })
    }

    /// Refreshes the heartbeat of a running job. Returns `false`, without writing, when the job is
    /// not running.
    pub async fn heartbeat(&self, job_id: JobId) -> Result<bool, LockError> {
        let applied = self
            .store
            .touch(job_id, self.clock.now())
            .await
            .inspect_err(|err| tracing::error!(?err, %job_id, "Failed to write heartbeat"))?;
        if !applied {
            tracing::debug!(%job_id, "Ignoring heartbeat for job that is not running");
        }
        Ok(applied)
    }

    /// The only way a job reaches a terminal state outside of stale reclamation.
    ///
    /// Releasing a job that is already terminal leaves it untouched and succeeds.
    #[instrument(skip(self, outcome), fields(status = %outcome.status()))]
    pub async fn release(&self, job_id: JobId, outcome: Outcome) -> Result<(), LockError> {
        if self
            .store
            .finish(job_id, &outcome, self.clock.now())
            .await
            .inspect_err(|err| tracing::error!(?err, "Failed to write terminal state"))?
        {
            tracing::debug!("Job released");
            return Ok(());
        }

        let job = self.store.get(job_id).await?;
        if job.is_terminal() {
            tracing::warn!(current = %job.status, "Ignoring release of job that is already terminal");
            Ok(())
        } else {
            Err(LockError::InvalidTransition {
                job_id,
                from: job.status,
            })
        }
    }

    /// Raises the cooperative cancellation flag. Returns `false` when the job is already terminal.
    #[instrument(skip(self))]
    pub async fn request_cancel(&self, job_id: JobId) -> Result<bool, LockError> {
        let applied = self.store.request_cancel(job_id).await?;
        if applied {
            tracing::debug!("Cancellation requested");
        } else {
            tracing::debug!("Ignoring cancellation of terminal job");
        }
        Ok(applied)
    }

    pub async fn job(&self, job_id: JobId) -> Result<Job, LockError> {
        Ok(self.store.get(job_id).await?)
    }
}
