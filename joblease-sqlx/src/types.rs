use chrono::{DateTime, Utc};
use joblease::{
    job::{ErrorKind, Job, JobError, JobStatus},
    store::StoreError,
};
use sqlx::prelude::FromRow;

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "joblease_job_status", rename_all = "lowercase")]
pub(crate) enum PgJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl From<PgJobStatus> for JobStatus {
    fn from(value: PgJobStatus) -> Self {
        match value {
            PgJobStatus::Pending => Self::Pending,
            PgJobStatus::Running => Self::Running,
            PgJobStatus::Completed => Self::Completed,
            PgJobStatus::Failed => Self::Failed,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct JobRow {
    pub id: i32,
    pub resource_id: String,
    pub job_type: String,
    pub status: PgJobStatus,
    pub attempt: i32,
    pub resumed_from: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub total_items: Option<i64>,
    pub completed_items: i64,
    pub last_completed_item: i64,
    pub cancel_requested: bool,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, FromRow)]
pub(crate) struct OutputRow {
    pub item: i64,
    pub output: serde_json::Value,
}

pub(crate) fn to_count(value: i64, column: &str) -> Result<u64, StoreError> {
    u64::try_from(value)
        .map_err(|_| StoreError::InvalidRecord(format!("negative {column}: {value}")))
}

pub(crate) fn to_column(value: u64, column: &str) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::InvalidRecord(format!("{column} out of range: {value}")))
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(value: JobRow) -> Result<Self, Self::Error> {
        let error = match (value.error_kind, value.error_message) {
            (Some(kind), message) => Some(JobError::new(
                ErrorKind::from(kind.as_str()),
                message.unwrap_or_default(),
            )),
            (None, _) => None,
        };
        Ok(Self {
            id: value.id.into(),
            resource_id: value.resource_id,
            job_type: value.job_type,
            status: value.status.into(),
            attempt: u32::try_from(value.attempt).map_err(|_| {
                StoreError::InvalidRecord(format!("negative attempt: {}", value.attempt))
            })?,
            resumed_from: value.resumed_from.map(Into::into),
            created_at: value.created_at,
            started_at: value.started_at,
            finished_at: value.finished_at,
            heartbeat_at: value.heartbeat_at,
            total_items: value
                .total_items
                .map(|total| to_count(total, "total_items"))
                .transpose()?,
            completed_items: to_count(value.completed_items, "completed_items")?,
            last_completed_item: to_count(value.last_completed_item, "last_completed_item")?,
            cancel_requested: value.cancel_requested,
            error,
        })
    }
}
