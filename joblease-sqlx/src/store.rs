use async_trait::async_trait;
use chrono::{DateTime, Utc};
use joblease::{
    job::{Job, JobError, JobId, NewJob, Outcome},
    lock::{SlotAction, SlotRequest},
    store::{ItemOutput, JobStore, ProgressUpdate, SlotOutcome, StoreError},
};
use sqlx::{postgres::PgQueryResult, Postgres, Transaction};
use tracing::instrument;

use crate::{
    map_err, query,
    types::{to_column, to_count, JobRow, OutputRow},
    PgJobStore,
};

impl PgJobStore {
    /// `true` when an update touched the job. Otherwise tells a guarded no-op apart from a
    /// missing job.
    async fn handle_update(&self, result: PgQueryResult, job_id: JobId) -> Result<bool, StoreError> {
        match result.rows_affected() {
            0 => self.ensure_exists(job_id).await.map(|_| false),
            1 => Ok(true),
            _ => Err(StoreError::BadState),
        }
    }

    async fn ensure_exists(&self, job_id: JobId) -> Result<(), StoreError> {
        let (exists,): (bool,) = sqlx::query_as(query::JOB_EXISTS)
            .bind(i32::from(job_id))
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
        if exists {
            Ok(())
        } else {
            Err(StoreError::JobNotFound(job_id))
        }
    }

    async fn fail_active(
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
        error: &JobError,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        sqlx::query_as::<_, JobRow>(query::FAIL_ACTIVE_JOB)
            .bind(i32::from(job_id))
            .bind(now)
            .bind(error.kind.as_str())
            .bind(&error.message)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_err)?
            .map(Job::try_from)
            .transpose()
    }

    async fn insert_job(
        tx: &mut Transaction<'_, Postgres>,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let attempt = i32::try_from(job.attempt)
            .map_err(|_| StoreError::InvalidRecord(format!("attempt out of range: {}", job.attempt)))?;
        sqlx::query_as::<_, JobRow>(query::INSERT_JOB)
            .bind(&job.resource_id)
            .bind(&job.job_type)
            .bind(attempt)
            .bind(job.resumed_from.map(i32::from))
            .bind(now)
            .bind(
                job.total_items
                    .map(|total| to_column(total, "total_items"))
                    .transpose()?,
            )
            .bind(to_column(job.last_completed_item, "last_completed_item")?)
            .fetch_one(&mut **tx)
            .await
            .map_err(map_err)?
            .try_into()
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip(self, request), fields(resource_id = %request.resource_id, job_type = %request.job_type))]
    async fn acquire_slot(&self, request: &SlotRequest) -> Result<SlotOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        sqlx::query(query::INSERT_SLOT)
            .bind(&request.resource_id)
            .bind(&request.job_type)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        sqlx::query(query::LOCK_SLOT)
            .bind(&request.resource_id)
            .bind(&request.job_type)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;

        let latest = sqlx::query_as::<_, JobRow>(query::SELECT_LATEST)
            .bind(&request.resource_id)
            .bind(&request.job_type)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_err)?
            .map(Job::try_from)
            .transpose()?;

        // Dropping the transaction without committing releases the slot lock.
        let outcome = match request.decide(latest.as_ref()) {
            SlotAction::Conflict => return latest.map(SlotOutcome::Conflict).ok_or(StoreError::BadState),
            SlotAction::NoFailedAttempt => return Ok(SlotOutcome::NoFailedAttempt),
            SlotAction::Create { reclaim, job } => {
                let reclaimed = match (reclaim, &latest) {
                    (Some(error), Some(latest)) => {
                        let reclaimed = Self::fail_active(&mut tx, latest.id, &error, request.now)
                            .await?
                            .ok_or(StoreError::BadState)?;
                        Some(reclaimed)
                    }
                    _ => None,
                };
                let job = Self::insert_job(&mut tx, job, request.now).await?;
                SlotOutcome::Created { job, reclaimed }
            }
        };

        tx.commit().await.map_err(map_err)?;
        Ok(outcome)
    }

    async fn get(&self, id: JobId) -> Result<Job, StoreError> {
        sqlx::query_as::<_, JobRow>(query::SELECT_JOB)
            .bind(i32::from(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .ok_or(StoreError::JobNotFound(id))?
            .try_into()
    }

    async fn latest(&self, resource_id: &str, job_type: &str) -> Result<Option<Job>, StoreError> {
        sqlx::query_as::<_, JobRow>(query::SELECT_LATEST)
            .bind(resource_id)
            .bind(job_type)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .map(Job::try_from)
            .transpose()
    }

    async fn attempts(&self, resource_id: &str, job_type: &str) -> Result<Vec<Job>, StoreError> {
        sqlx::query_as::<_, JobRow>(query::SELECT_ATTEMPTS)
            .bind(resource_id)
            .bind(job_type)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    async fn mark_running(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(query::MARK_RUNNING)
            .bind(i32::from(id))
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        self.handle_update(result, id).await
    }

    async fn touch(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(query::TOUCH)
            .bind(i32::from(id))
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        self.handle_update(result, id).await
    }

    async fn flush_progress(
        &self,
        id: JobId,
        update: &ProgressUpdate,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        let result = sqlx::query(query::FLUSH_PROGRESS)
            .bind(i32::from(id))
            .bind(to_column(update.completed_items, "completed_items")?)
            .bind(to_column(update.last_completed_item, "last_completed_item")?)
            .bind(
                update
                    .total_items
                    .map(|total| to_column(total, "total_items"))
                    .transpose()?,
            )
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        if result.rows_affected() == 0 {
            drop(tx);
            return self.ensure_exists(id).await.map(|_| false);
        }

        for output in &update.outputs {
            sqlx::query(query::UPSERT_OUTPUT)
                .bind(i32::from(id))
                .bind(to_column(output.item, "item")?)
                .bind(&output.output)
                .execute(&mut *tx)
                .await
                .map_err(map_err)?;
        }

        tx.commit().await.map_err(map_err)?;
        Ok(true)
    }

    async fn finish(
        &self,
        id: JobId,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        match outcome {
            Outcome::Completed => {
                let result = sqlx::query(query::COMPLETE_JOB)
                    .bind(i32::from(id))
                    .bind(now)
                    .execute(&self.pool)
                    .await
                    .map_err(map_err)?;
                self.handle_update(result, id).await
            }
            Outcome::Failed(error) => {
                let mut tx = self.pool.begin().await.map_err(map_err)?;
                let failed = Self::fail_active(&mut tx, id, error, now).await?;
                tx.commit().await.map_err(map_err)?;
                match failed {
                    Some(_) => Ok(true),
                    None => self.ensure_exists(id).await.map(|_| false),
                }
            }
        }
    }

    async fn request_cancel(&self, id: JobId) -> Result<bool, StoreError> {
        let result = sqlx::query(query::REQUEST_CANCEL)
            .bind(i32::from(id))
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        self.handle_update(result, id).await
    }

    async fn item_outputs(&self, id: JobId) -> Result<Vec<ItemOutput>, StoreError> {
        self.ensure_exists(id).await?;
        sqlx::query_as::<_, OutputRow>(query::SELECT_OUTPUTS)
            .bind(i32::from(id))
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(|row| {
                Ok(ItemOutput {
                    item: to_count(row.item, "item")?,
                    output: row.output,
                })
            })
            .collect()
    }
}

#[cfg(all(test, feature = "postgres-tests"))]
mod test {
    use sqlx::PgPool;

    use super::*;

    joblease::test_suite!(
        attr: sqlx::test,
        args: (pool: PgPool),
        store: PgJobStore::from_pool(pool).await.unwrap()
    );

    #[sqlx::test]
    async fn acquire_slot_creates_slot_row_once(pool: PgPool) {
        let store = PgJobStore::from_pool(pool).await.unwrap();
        let request = SlotRequest {
            resource_id: "book-1".to_owned(),
            job_type: "extract".to_owned(),
            intent: joblease::lock::Intent::Fresh,
            now: Utc::now(),
            policy: joblease::lock::StalenessPolicy::DEFAULT,
        };

        store.acquire_slot(&request).await.unwrap();
        store.acquire_slot(&request).await.unwrap();

        let (slots,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM joblease_slots")
            .fetch_one(&*store)
            .await
            .unwrap();
        assert_eq!(slots, 1);
    }
}
