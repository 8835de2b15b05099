//! The job record shared by every component.
//!
//! A [`Job`] is one attempt at processing one resource with one job type. Attempts that continue
//! a failed run are new rows linked through [`Job::resumed_from`], so the rows for a
//! `(resource_id, job_type)` pair form an audit trail of every attempt.
use std::{fmt::Display, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i32);

impl From<i32> for JobId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<JobId> for i32 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// Where a job is in its lifecycle.
///
/// Jobs only move forward: `Pending -> Running -> {Completed | Failed}`, with `Pending -> Failed`
/// reserved for reclaiming a job whose runner never started.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The structured reason a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The job stopped showing signs of life and was failed by the next acquire.
    ReclaimedStale,
    /// A unit kept failing with a retryable error after its retries ran out.
    UnitTransient,
    /// A unit failed with an error that retrying cannot fix.
    UnitFatal,
    CancelledByUser,
    /// The runner was shut down before the job finished.
    Interrupted,
    Panic,
    Internal,
    #[serde(untagged)]
    Other(String),
}

impl ErrorKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ReclaimedStale => "reclaimed_stale",
            Self::UnitTransient => "unit_transient",
            Self::UnitFatal => "unit_fatal",
            Self::CancelledByUser => "cancelled_by_user",
            Self::Interrupted => "interrupted",
            Self::Panic => "panic",
            Self::Internal => "internal",
            Self::Other(other) => other,
        }
    }
}

impl From<&str> for ErrorKind {
    fn from(value: &str) -> Self {
        match value {
            "reclaimed_stale" => Self::ReclaimedStale,
            "unit_transient" => Self::UnitTransient,
            "unit_fatal" => Self::UnitFatal,
            "cancelled_by_user" => Self::CancelledByUser,
            "interrupted" => Self::Interrupted,
            "panic" => Self::Panic,
            "internal" => Self::Internal,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// The terminal result handed to [`crate::lock::JobLockService::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed(JobError),
}

impl Outcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Completed => JobStatus::Completed,
            Self::Failed(_) => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub resource_id: String,
    pub job_type: String,
    pub status: JobStatus,
    /// Position in the lineage of attempts, starting at 1.
    pub attempt: u32,
    pub resumed_from: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub total_items: Option<u64>,
    pub completed_items: u64,
    /// Highest item such that every item from 1 up to it is durably complete. Items are 1-based,
    /// so 0 means nothing has been completed yet.
    pub last_completed_item: u64,
    pub cancel_requested: bool,
    pub error: Option<JobError>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// The cursor a resumed attempt starts from, or `None` for a fresh attempt.
    pub fn resume_from(&self) -> Option<u64> {
        self.resumed_from.map(|_| self.last_completed_item)
    }
}

#[cfg(test)]
impl Job {
    pub(crate) fn raw_job(status: JobStatus, created_at: DateTime<Utc>) -> Self {
        let started_at = (status != JobStatus::Pending).then_some(created_at);
        Self {
            id: 1.into(),
            resource_id: "resource".to_owned(),
            job_type: "job_type".to_owned(),
            status,
            attempt: 1,
            resumed_from: None,
            created_at,
            started_at,
            finished_at: status.is_terminal().then_some(created_at),
            heartbeat_at: started_at,
            total_items: None,
            completed_items: 0,
            last_completed_item: 0,
            cancel_requested: false,
            error: None,
        }
    }
}

/// A job about to be inserted by [`crate::store::JobStore::acquire_slot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub resource_id: String,
    pub job_type: String,
    pub attempt: u32,
    pub resumed_from: Option<JobId>,
    pub total_items: Option<u64>,
    /// Items `1..=last_completed_item` are already done, so this also seeds `completed_items`.
    pub last_completed_item: u64,
}

impl NewJob {
    pub fn fresh(resource_id: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            job_type: job_type.into(),
            attempt: 1,
            resumed_from: None,
            total_items: None,
            last_completed_item: 0,
        }
    }
}

/// The externally visible state of a job, as returned by a status poll.
///
/// This always reflects the last durable flush, never progress still held in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub attempt: u32,
    pub completed_items: u64,
    pub total_items: Option<u64>,
    pub last_completed_item: u64,
    pub heartbeat_age: Option<Duration>,
    pub cancel_requested: bool,
    pub error: Option<JobError>,
}

impl StatusReport {
    pub fn new(job: Job, now: DateTime<Utc>) -> Self {
        let heartbeat_age = job
            .heartbeat_at
            .map(|heartbeat_at| (now - heartbeat_at).to_std().unwrap_or(Duration::ZERO));
        Self {
            job_id: job.id,
            status: job.status,
            attempt: job.attempt,
            completed_items: job.completed_items,
            total_items: job.total_items,
            last_completed_item: job.last_completed_item,
            heartbeat_age,
            cancel_requested: job.cancel_requested,
            error: job.error,
        }
    }
}
