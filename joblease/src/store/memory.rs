//! A [`JobStore`] that keeps everything in process memory.
//!
//! Jobs do not survive a restart, so this suits tests and single process demos. Lookups are
//! linear scans; correctness is the only goal.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ItemOutput, JobStore, ProgressUpdate, SlotOutcome, StoreError};
use crate::{
    job::{Job, JobError, JobId, JobStatus, NewJob, Outcome},
    lock::{SlotAction, SlotRequest},
};

/// An in memory implementation of [`JobStore`].
///
/// Every operation takes a single lock over all jobs, which makes the slot lock of
/// [`JobStore::acquire_slot`] trivially correct.
///
/// **Jobs are lost when the process exits.**
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

#[derive(Default)]
struct State {
    jobs: Vec<Job>,
    outputs: HashMap<JobId, BTreeMap<u64, serde_json::Value>>,
    last_id: i32,
}

impl State {
    fn job(&self, id: JobId) -> Result<&Job, StoreError> {
        self.jobs
            .iter()
            .find(|job| job.id == id)
            .ok_or(StoreError::JobNotFound(id))
    }

    fn job_mut(&mut self, id: JobId) -> Result<&mut Job, StoreError> {
        self.jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or(StoreError::JobNotFound(id))
    }

    fn attempts<'a>(
        &'a self,
        resource_id: &'a str,
        job_type: &'a str,
    ) -> impl DoubleEndedIterator<Item = &'a Job> {
        self.jobs
            .iter()
            .filter(move |job| job.resource_id == resource_id && job.job_type == job_type)
    }

    fn insert(&mut self, new: NewJob, now: DateTime<Utc>) -> Job {
        self.last_id += 1;
        let job = Job {
            id: self.last_id.into(),
            resource_id: new.resource_id,
            job_type: new.job_type,
            status: JobStatus::Pending,
            attempt: new.attempt,
            resumed_from: new.resumed_from,
            created_at: now,
            started_at: None,
            finished_at: None,
            heartbeat_at: None,
            total_items: new.total_items,
            completed_items: new.last_completed_item,
            last_completed_item: new.last_completed_item,
            cancel_requested: false,
            error: None,
        };
        self.jobs.push(job.clone());
        job
    }
}

fn mark_failed(job: &mut Job, error: JobError, now: DateTime<Utc>) {
    job.status = JobStatus::Failed;
    job.finished_at = Some(now);
    job.error = Some(error);
}

impl InMemoryStore {
    /// Creates a new instance of [`InMemoryStore`].
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state.read().map_err(|_| StoreError::BadState)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state.write().map_err(|_| StoreError::BadState)
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn acquire_slot(&self, request: &SlotRequest) -> Result<SlotOutcome, StoreError> {
        let mut state = self.write()?;
        let latest = state
            .attempts(&request.resource_id, &request.job_type)
            .next_back()
            .cloned();

        match request.decide(latest.as_ref()) {
            SlotAction::Conflict => latest
                .map(SlotOutcome::Conflict)
                .ok_or(StoreError::BadState),
            SlotAction::NoFailedAttempt => Ok(SlotOutcome::NoFailedAttempt),
            SlotAction::Create { reclaim, job } => {
                let reclaimed = match (reclaim, latest) {
                    (Some(error), Some(latest)) => {
                        let stale = state.job_mut(latest.id)?;
                        mark_failed(stale, error, request.now);
                        Some(stale.clone())
                    }
                    _ => None,
                };
                let job = state.insert(job, request.now);
                Ok(SlotOutcome::Created { job, reclaimed })
            }
        }
    }

    async fn get(&self, id: JobId) -> Result<Job, StoreError> {
        self.read()?.job(id).cloned()
    }

    async fn latest(&self, resource_id: &str, job_type: &str) -> Result<Option<Job>, StoreError> {
        Ok(self
            .read()?
            .attempts(resource_id, job_type)
            .next_back()
            .cloned())
    }

    async fn attempts(&self, resource_id: &str, job_type: &str) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .read()?
            .attempts(resource_id, job_type)
            .cloned()
            .collect())
    }

    async fn mark_running(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let job = state.job_mut(id)?;
        if job.status != JobStatus::Pending {
            return Ok(false);
        }
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.heartbeat_at = Some(now);
        Ok(true)
    }

    async fn touch(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let job = state.job_mut(id)?;
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.heartbeat_at = job.heartbeat_at.max(Some(now));
        Ok(true)
    }

    async fn flush_progress(
        &self,
        id: JobId,
        update: &ProgressUpdate,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let job = state.job_mut(id)?;
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.completed_items = job.completed_items.max(update.completed_items);
        job.last_completed_item = job.last_completed_item.max(update.last_completed_item);
        job.total_items = update.total_items.or(job.total_items);
        job.heartbeat_at = job.heartbeat_at.max(Some(now));

        let outputs = state.outputs.entry(id).or_default();
        for output in &update.outputs {
            outputs.insert(output.item, output.output.clone());
        }
        Ok(true)
    }

    async fn finish(
        &self,
        id: JobId,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let job = state.job_mut(id)?;
        match (job.status, outcome) {
            (JobStatus::Running, Outcome::Completed) => {
                job.status = JobStatus::Completed;
                job.finished_at = Some(now);
                Ok(true)
            }
            (JobStatus::Pending | JobStatus::Running, Outcome::Failed(error)) => {
                mark_failed(job, error.clone(), now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn request_cancel(&self, id: JobId) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let job = state.job_mut(id)?;
        if job.is_terminal() {
            return Ok(false);
        }
        job.cancel_requested = true;
        Ok(true)
    }

    async fn item_outputs(&self, id: JobId) -> Result<Vec<ItemOutput>, StoreError> {
        let state = self.read()?;
        state.job(id)?;
        Ok(state
            .outputs
            .get(&id)
            .into_iter()
            .flatten()
            .map(|(item, output)| ItemOutput {
                item: *item,
                output: output.clone(),
            })
            .collect())
    }
}
