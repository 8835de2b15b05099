//! Batched, durable progress.
//!
//! Results are accumulated in memory and written to the store in one atomic flush together with
//! the heartbeat, every `batch_size` recorded items and once more when the job ends. Only
//! flushed progress survives a crash, so each item is processed at least once: anything recorded
//! after the last flush is reprocessed by the next attempt.
//!
//! All writes for one job, heartbeats included, go through a per-job async mutex and are
//! therefore totally ordered.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex},
};

use thiserror::Error;

use crate::{
    job::{Job, JobId},
    lock::{JobLockService, LockError},
    store::{ItemOutput, ProgressUpdate, StoreError},
};

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("Job {0} is not being tracked")]
    UnknownJob(JobId),
    #[error("Item {item} is out of range for a job with {total} items")]
    ItemOutOfRange { item: u64, total: u64 },
    #[error("Items are numbered from 1")]
    InvalidItem,
    /// The job left the running state underneath the tracker, for example because it was
    /// reclaimed as stale.
    #[error("Job {0} is no longer running")]
    NotRunning(JobId),
    #[error("Progress tracker in bad state")]
    BadState,
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Default)]
struct Pending {
    /// The durable cursor, as of the last successful flush.
    cursor: u64,
    completed_items: u64,
    total_items: Option<u64>,
    /// Successful items above the cursor.
    succeeded: BTreeSet<u64>,
    outputs: BTreeMap<u64, serde_json::Value>,
    recorded_since_flush: usize,
}

impl Pending {
    fn check_item(&self, item: u64) -> Result<(), ProgressError> {
        if item == 0 {
            return Err(ProgressError::InvalidItem);
        }
        match self.total_items {
            Some(total) if item > total => Err(ProgressError::ItemOutOfRange { item, total }),
            _ => Ok(()),
        }
    }

    /// The cursor after advancing over every contiguous success.
    fn next_cursor(&self) -> u64 {
        let mut cursor = self.cursor;
        while self.succeeded.contains(&(cursor + 1)) {
            cursor += 1;
        }
        cursor
    }
}

#[derive(Clone)]
pub struct ProgressTracker {
    lock: JobLockService,
    batch_size: usize,
    jobs: Arc<Mutex<HashMap<JobId, Arc<tokio::sync::Mutex<Pending>>>>>,
}

impl ProgressTracker {
    pub fn new(lock: JobLockService, batch_size: usize) -> Self {
        Self {
            lock,
            batch_size: batch_size.max(1),
            jobs: Default::default(),
        }
    }

    /// Starts tracking a running job from its durable state.
    pub fn begin(&self, job: &Job) -> Result<(), ProgressError> {
        let pending = Pending {
            cursor: job.last_completed_item,
            completed_items: job.completed_items,
            total_items: job.total_items,
            ..Default::default()
        };
        self.jobs
            .lock()
            .map_err(|_| ProgressError::BadState)?
            .insert(job.id, Arc::new(tokio::sync::Mutex::new(pending)));
        Ok(())
    }

    fn pending(&self, job_id: JobId) -> Result<Arc<tokio::sync::Mutex<Pending>>, ProgressError> {
        self.jobs
            .lock()
            .map_err(|_| ProgressError::BadState)?
            .get(&job_id)
            .cloned()
            .ok_or(ProgressError::UnknownJob(job_id))
    }

    /// Records the result of one item, flushing when the batch is full.
    ///
    /// Items at or below the durable cursor are already done and are ignored.
    pub async fn record(&self, job_id: JobId, item: u64, success: bool) -> Result<(), ProgressError> {
        let pending = self.pending(job_id)?;
        let mut pending = pending.lock().await;
        pending.check_item(item)?;
        if item <= pending.cursor {
            tracing::debug!(%job_id, item, "Ignoring item at or below the resume cursor");
            return Ok(());
        }
        if success && pending.succeeded.insert(item) {
            pending.completed_items += 1;
        }
        pending.recorded_since_flush += 1;
        if pending.recorded_since_flush >= self.batch_size {
            self.write(job_id, &mut pending).await?;
        }
        Ok(())
    }

    /// Attaches an output to an item. It is persisted by the next flush.
    pub async fn record_output(
        &self,
        job_id: JobId,
        item: u64,
        output: serde_json::Value,
    ) -> Result<(), ProgressError> {
        let pending = self.pending(job_id)?;
        let mut pending = pending.lock().await;
        pending.check_item(item)?;
        pending.outputs.insert(item, output);
        Ok(())
    }

    /// Sets the number of items and flushes straight away so status polls can show it.
    pub async fn set_total_items(&self, job_id: JobId, total: u64) -> Result<(), ProgressError> {
        let pending = self.pending(job_id)?;
        let mut pending = pending.lock().await;
        if let Some(item) = pending.succeeded.last().copied().filter(|item| *item > total) {
            return Err(ProgressError::ItemOutOfRange { item, total });
        }
        if pending.completed_items > total {
            return Err(ProgressError::ItemOutOfRange {
                item: pending.completed_items,
                total,
            });
        }
        pending.total_items = Some(total);
        self.write(job_id, &mut pending).await
    }

    /// Refreshes the heartbeat, ordered with respect to every flush of the same job.
    pub async fn heartbeat(&self, job_id: JobId) -> Result<bool, ProgressError> {
        match self.pending(job_id) {
            Ok(pending) => {
                let _guard = pending.lock().await;
                Ok(self.lock.heartbeat(job_id).await?)
            }
            Err(ProgressError::UnknownJob(_)) => Ok(self.lock.heartbeat(job_id).await?),
            Err(error) => Err(error),
        }
    }

    pub async fn flush(&self, job_id: JobId) -> Result<(), ProgressError> {
        let pending = self.pending(job_id)?;
        let mut pending = pending.lock().await;
        self.write(job_id, &mut pending).await
    }

    /// Final flush. The job is no longer tracked afterwards, whether or not the flush succeeds.
    pub async fn finish(&self, job_id: JobId) -> Result<(), ProgressError> {
        let pending = self
            .jobs
            .lock()
            .map_err(|_| ProgressError::BadState)?
            .remove(&job_id)
            .ok_or(ProgressError::UnknownJob(job_id))?;
        let mut pending = pending.lock().await;
        self.write(job_id, &mut pending).await
    }

    async fn write(&self, job_id: JobId, pending: &mut Pending) -> Result<(), ProgressError> {
        let cursor = pending.next_cursor();
        let update = ProgressUpdate {
            completed_items: pending.completed_items,
            last_completed_item: cursor,
            total_items: pending.total_items,
            outputs: pending
                .outputs
                .iter()
                .map(|(item, output)| ItemOutput {
                    item: *item,
                    output: output.clone(),
                })
                .collect(),
        };

        let applied = self
            .lock
            .store()
            .flush_progress(job_id, &update, self.lock.now())
            .await
            .inspect_err(|err| tracing::error!(?err, %job_id, "Failed to flush progress"))?;
        if !applied {
            return Err(ProgressError::NotRunning(job_id));
        }

        pending.cursor = cursor;
        pending.succeeded = pending.succeeded.split_off(&(cursor + 1));
        pending.outputs.clear();
        pending.recorded_since_flush = 0;
        tracing::debug!(
            %job_id,
            last_completed_item = cursor,
            completed_items = pending.completed_items,
            "Flushed progress"
        );
        Ok(())
    }
}
