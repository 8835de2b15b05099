//! SQL used by [`crate::PgJobStore`].
//!
//! Every job query selects or returns the same column list so rows decode into
//! [`crate::types::JobRow`].
macro_rules! job_columns {
    () => {
        "id, resource_id, job_type, status, attempt, resumed_from, created_at, started_at, \
         finished_at, heartbeat_at, total_items, completed_items, last_completed_item, \
         cancel_requested, error_kind, error_message"
    };
}

pub(crate) const INSERT_SLOT: &str = r#"INSERT INTO joblease_slots (resource_id, job_type)
    VALUES ($1, $2)
    ON CONFLICT DO NOTHING"#;

pub(crate) const LOCK_SLOT: &str = r#"SELECT resource_id FROM joblease_slots
    WHERE resource_id = $1 AND job_type = $2
    FOR UPDATE"#;

pub(crate) const SELECT_JOB: &str =
    concat!("SELECT ", job_columns!(), " FROM joblease_jobs WHERE id = $1");

pub(crate) const SELECT_LATEST: &str = concat!(
    "SELECT ",
    job_columns!(),
    " FROM joblease_jobs WHERE resource_id = $1 AND job_type = $2 ORDER BY id DESC LIMIT 1"
);

pub(crate) const SELECT_ATTEMPTS: &str = concat!(
    "SELECT ",
    job_columns!(),
    " FROM joblease_jobs WHERE resource_id = $1 AND job_type = $2 ORDER BY id"
);

pub(crate) const INSERT_JOB: &str = concat!(
    r#"INSERT INTO joblease_jobs (
        resource_id,
        job_type,
        attempt,
        resumed_from,
        created_at,
        total_items,
        completed_items,
        last_completed_item
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
    RETURNING "#,
    job_columns!()
);

pub(crate) const FAIL_ACTIVE_JOB: &str = concat!(
    r#"UPDATE joblease_jobs
    SET
        status = 'failed',
        finished_at = $2,
        error_kind = $3,
        error_message = $4
    WHERE id = $1 AND status IN ('pending', 'running')
    RETURNING "#,
    job_columns!()
);

pub(crate) const MARK_RUNNING: &str = r#"UPDATE joblease_jobs
    SET
        status = 'running',
        started_at = $2,
        heartbeat_at = $2
    WHERE id = $1 AND status = 'pending'"#;

pub(crate) const TOUCH: &str = r#"UPDATE joblease_jobs
    SET heartbeat_at = GREATEST(heartbeat_at, $2)
    WHERE id = $1 AND status = 'running'"#;

pub(crate) const FLUSH_PROGRESS: &str = r#"UPDATE joblease_jobs
    SET
        completed_items = GREATEST(completed_items, $2),
        last_completed_item = GREATEST(last_completed_item, $3),
        total_items = COALESCE($4, total_items),
        heartbeat_at = GREATEST(heartbeat_at, $5)
    WHERE id = $1 AND status = 'running'"#;

pub(crate) const UPSERT_OUTPUT: &str = r#"INSERT INTO joblease_item_outputs (job_id, item, output)
    VALUES ($1, $2, $3)
    ON CONFLICT (job_id, item) DO UPDATE SET output = EXCLUDED.output"#;

pub(crate) const COMPLETE_JOB: &str = r#"UPDATE joblease_jobs
    SET
        status = 'completed',
        finished_at = $2
    WHERE id = $1 AND status = 'running'"#;

pub(crate) const REQUEST_CANCEL: &str = r#"UPDATE joblease_jobs
    SET cancel_requested = TRUE
    WHERE id = $1 AND status IN ('pending', 'running')"#;

pub(crate) const JOB_EXISTS: &str = "SELECT EXISTS (SELECT 1 FROM joblease_jobs WHERE id = $1)";

pub(crate) const SELECT_OUTPUTS: &str = r#"SELECT item, output
    FROM joblease_item_outputs
    WHERE job_id = $1
    ORDER BY item"#;
