//! The domain side of a job.
//!
//! A [`Worker`] does the per-item work for one job type. It reports progress through the
//! [`crate::runner::JobContext`] it is handed and returns; it never writes a terminal state itself.
use std::error::Error;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    classify::{ErrorClass, ErrorClassifier, UnitError},
    job::{ErrorKind, JobError},
    lock::LockError,
    progress::ProgressError,
    retry::ClassifiedError,
    runner::JobContext,
};

/// Processes every job of one job type.
///
/// # Example
///
/// ```
/// # use joblease::prelude::*;
/// struct PageExtractor;
///
/// #[async_trait::async_trait]
/// impl Worker for PageExtractor {
///     const JOB_TYPE: &'static str = "extract_pages";
///
///     async fn run(&self, ctx: &JobContext) -> Result<(), WorkError> {
///         let pages = 12;
///         ctx.set_total_items(pages).await?;
///         for page in ctx.remaining_items(pages) {
///             ctx.process(page, |_attempt| async move { Ok(page * 2) }).await?;
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// The job type this worker handles.
    ///
    /// This is stored with every job, so renaming the rust type does not orphan existing jobs.
    const JOB_TYPE: &'static str;

    async fn run(&self, ctx: &JobContext) -> Result<(), WorkError>;
}

/// Object safe view of a [`Worker`], so workers of different types can share a registry.
#[async_trait]
pub(crate) trait DynWorker: Send + Sync + 'static {
    async fn run_job(&self, ctx: &JobContext) -> Result<(), WorkError>;
}

#[async_trait]
impl<W: Worker> DynWorker for W {
    async fn run_job(&self, ctx: &JobContext) -> Result<(), WorkError> {
        Worker::run(self, ctx).await
    }
}

/// Why a worker stopped early.
#[derive(Debug, Error)]
pub enum WorkError {
    /// A unit failed after in-unit retries, as reported by [`JobContext::process`].
    #[error("Item {item} failed: {error}")]
    Unit {
        item: u64,
        #[source]
        error: ClassifiedError,
    },
    /// A unit error the worker returned without going through [`JobContext::process`].
    #[error(transparent)]
    Unclassified(#[from] UnitError),
    #[error("Cancelled by user")]
    Cancelled,
    /// The job is no longer running, typically because it was reclaimed as stale.
    #[error("Job lease lost")]
    LeaseLost,
    #[error("Interrupted by shutdown")]
    Interrupted,
    #[error(transparent)]
    Progress(ProgressError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Other(Box<dyn Error + Send + Sync>),
}

impl WorkError {
    pub fn other(error: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self::Other(error.into())
    }

    /// The failure recorded on the job when a worker returns this error.
    pub fn to_job_error(&self, classifier: &dyn ErrorClassifier) -> JobError {
        let unit_kind = |class: ErrorClass| match class {
            ErrorClass::Transient => ErrorKind::UnitTransient,
            ErrorClass::Fatal => ErrorKind::UnitFatal,
        };
        match self {
            Self::Unit { error, .. } => JobError::new(unit_kind(error.class), self.to_string()),
            Self::Unclassified(error) => {
                JobError::new(unit_kind(classifier.classify(error)), error.to_string())
            }
            Self::Other(error) => {
                let error = UnitError::other(error.to_string());
                JobError::new(unit_kind(classifier.classify(&error)), error.message)
            }
            Self::Cancelled => JobError::new(ErrorKind::CancelledByUser, self.to_string()),
            Self::LeaseLost => JobError::new(ErrorKind::ReclaimedStale, self.to_string()),
            Self::Interrupted => JobError::new(ErrorKind::Interrupted, self.to_string()),
            Self::Progress(_) | Self::Lock(_) => JobError::new(ErrorKind::Internal, self.to_string()),
        }
    }
}

impl From<ProgressError> for WorkError {
    fn from(error: ProgressError) -> Self {
        match error {
            ProgressError::NotRunning(_) => Self::LeaseLost,
            error => Self::Progress(error),
        }
    }
}

impl From<serde_json::Error> for WorkError {
    fn from(error: serde_json::Error) -> Self {
        Self::Other(error.into())
    }
}
