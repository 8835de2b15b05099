//! Durable job state.
//!
//! A [`JobStore`] only persists; every decision about what to write is made by the caller.
//! [`JobStore::acquire_slot`] is the one place where the store calls back into that logic, via
//! [`SlotRequest::decide`], so the decision runs while the slot is locked.
//!
//! Conditional writes return `Ok(false)` when the job exists but is not in a state the write
//! applies to, and [`StoreError::JobNotFound`] when it does not exist at all.
//!
//! Use [`crate::test_suite!`] to check a new implementation against the expected behaviour.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    job::{Job, JobId, Outcome},
    lock::SlotRequest,
};

pub mod memory;
#[doc(hidden)]
pub mod testing;

/// A per-item result persisted alongside the progress cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutput {
    pub item: u64,
    pub output: serde_json::Value,
}

/// Everything one progress flush writes, applied atomically together with the heartbeat.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgressUpdate {
    pub completed_items: u64,
    /// The store keeps the larger of this and the stored cursor.
    pub last_completed_item: u64,
    /// `None` leaves the stored total untouched.
    pub total_items: Option<u64>,
    pub outputs: Vec<ItemOutput>,
}

/// What [`JobStore::acquire_slot`] did with the slot.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotOutcome {
    /// A new pending job was inserted, after failing `reclaimed` if the previous holder was stale.
    Created { job: Job, reclaimed: Option<Job> },
    /// A live job already holds the slot.
    Conflict(Job),
    /// A resume was requested but the latest attempt is not a failure.
    NoFailedAttempt,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    #[error("System in bad state")]
    BadState,
    #[error("Invalid job record: {0}")]
    InvalidRecord(String),
    #[error("Database error: {0}")]
    Database(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Locks the `(resource_id, job_type)` slot, loads its latest attempt, applies
    /// [`SlotRequest::decide`] and releases the lock, all atomically.
    async fn acquire_slot(&self, request: &SlotRequest) -> Result<SlotOutcome, StoreError>;

    async fn get(&self, id: JobId) -> Result<Job, StoreError>;

    /// The most recently created attempt for the pair.
    async fn latest(&self, resource_id: &str, job_type: &str) -> Result<Option<Job>, StoreError>;

    /// Every attempt for the pair, oldest first.
    async fn attempts(&self, resource_id: &str, job_type: &str) -> Result<Vec<Job>, StoreError>;

    /// `pending -> running`, stamping `started_at` and `heartbeat_at`.
    async fn mark_running(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Moves `heartbeat_at` forward to `now` on a running job. Never moves it backwards.
    async fn touch(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Applies a [`ProgressUpdate`] to a running job and refreshes its heartbeat.
    async fn flush_progress(
        &self,
        id: JobId,
        update: &ProgressUpdate,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Writes the terminal state. `Completed` applies only to a running job, `Failed` to a
    /// pending or running one.
    async fn finish(
        &self,
        id: JobId,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Raises the cooperative cancellation flag on a job that is not terminal.
    async fn request_cancel(&self, id: JobId) -> Result<bool, StoreError>;

    /// Outputs recorded for a job, ordered by item.
    async fn item_outputs(&self, id: JobId) -> Result<Vec<ItemOutput>, StoreError>;
}
