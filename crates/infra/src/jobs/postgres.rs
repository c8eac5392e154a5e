//! Postgres-backed job store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation on insert) | `23505` | `AlreadyExists` |
//! | Database (auth / unknown database) | `28xxx`, `3D000` | `Unavailable` |
//! | Database (other) | Any other | `Storage` |
//! | PoolTimedOut, PoolClosed, Io, Tls, Configuration | N/A | `Unavailable` |
//! | Other | N/A | `Storage` |
//!
//! ## Conditional updates
//!
//! `update_where` is a single `UPDATE ... WHERE id = $1 AND status = $expected`
//! statement (plus the optional version, lease owner and lease expiry
//! predicates), so the row lock Postgres takes for the update is the
//! compare-and-swap. When no row matches, a follow-up read runs the same
//! precondition in memory to classify the miss.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use storyforge_core::JobId;
use storyforge_jobs::{JobKind, JobPatch, JobRecord, JobStatus, ProgressPatch};

use super::store::{Expected, JobStats, JobStore, StoreError};

const SCHEMA: &str = include_str!("../../migrations/0001_generation_jobs.sql");

const COLUMNS: &str = "id, kind, parameters, status, progress, current_step, retry_count, \
    max_retries, created_at, updated_at, started_at, completed_at, error_message, result_ref, \
    worker_id, lease_expires_at";

/// Job store over a `generation_jobs` table.
///
/// `Send + Sync`; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    ///
    /// Unreachable or misconfigured databases surface as `StoreError::Unavailable`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the jobs table and its index if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self), fields(job_id = %id))]
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM generation_jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode(&r)).transpose()
    }

    #[instrument(skip(self, record), fields(job_id = %record.id, kind = %record.kind))]
    async fn insert(&self, record: JobRecord) -> Result<JobRecord, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO generation_jobs ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(record.id.as_uuid())
        .bind(record.kind.as_str())
        .bind(&record.parameters)
        .bind(record.status.as_str())
        .bind(i16::from(record.progress))
        .bind(&record.current_step)
        .bind(to_db_count(record.retry_count)?)
        .bind(to_db_count(record.max_retries)?)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(&record.error_message)
        .bind(&record.result_ref)
        .bind(&record.worker_id)
        .bind(record.lease_expires_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(record.id)
            } else {
                map_sqlx_error("insert", e)
            }
        })?;

        decode(&row)
    }

    #[instrument(skip(self, patch), fields(job_id = %id, expected = %expected.status))]
    async fn update_where(
        &self,
        id: JobId,
        expected: Expected,
        patch: JobPatch,
    ) -> Result<JobRecord, StoreError> {
        let (progress_mode, progress_value) = match patch.progress {
            Some(ProgressPatch::Advance(p)) => (Some("advance"), Some(i16::from(p.min(100)))),
            Some(ProgressPatch::Set(p)) => (Some("set"), Some(i16::from(p.min(100)))),
            None => (None, None),
        };
        let retry_count = patch.retry_count.map(to_db_count).transpose()?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE generation_jobs SET
                status           = COALESCE($2::text, status),
                progress         = CASE $3::text
                                       WHEN 'advance' THEN GREATEST(progress, $4::smallint)
                                       WHEN 'set' THEN $4::smallint
                                       ELSE progress
                                   END,
                current_step     = CASE WHEN $5::bool THEN $6::text ELSE current_step END,
                retry_count      = COALESCE($7::integer, retry_count),
                started_at       = COALESCE(started_at, $8::timestamptz),
                completed_at     = CASE WHEN $9::bool THEN $10::timestamptz ELSE completed_at END,
                error_message    = CASE WHEN $11::bool THEN $12::text ELSE error_message END,
                result_ref       = CASE WHEN $13::bool THEN $14::text ELSE result_ref END,
                worker_id        = CASE WHEN $15::bool THEN $16::text ELSE worker_id END,
                lease_expires_at = CASE WHEN $17::bool THEN $18::timestamptz ELSE lease_expires_at END,
                updated_at       = GREATEST(updated_at + interval '1 microsecond', $19::timestamptz)
            WHERE id = $1
              AND status = $20::text
              AND ($21::timestamptz IS NULL OR updated_at = $21::timestamptz)
              AND ($22::text IS NULL OR worker_id = $22::text)
              AND ($23::timestamptz IS NULL OR lease_expires_at <= $23::timestamptz)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(patch.status.map(|s| s.as_str()))
        .bind(progress_mode)
        .bind(progress_value)
        .bind(patch.current_step.is_some())
        .bind(patch.current_step.clone().flatten())
        .bind(retry_count)
        .bind(patch.started_at)
        .bind(patch.completed_at.is_some())
        .bind(patch.completed_at.flatten())
        .bind(patch.error_message.is_some())
        .bind(patch.error_message.clone().flatten())
        .bind(patch.result_ref.is_some())
        .bind(patch.result_ref.clone().flatten())
        .bind(patch.worker_id.is_some())
        .bind(patch.worker_id.clone().flatten())
        .bind(patch.lease_expires_at.is_some())
        .bind(patch.lease_expires_at.flatten())
        .bind(patch.updated_at)
        .bind(expected.status.as_str())
        .bind(expected.updated_at)
        .bind(expected.worker_id.as_deref())
        .bind(expected.lease_expired_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_where", e))?;

        if let Some(row) = row {
            return decode(&row);
        }

        // The row changed between the UPDATE and this read if the
        // precondition now passes; report that as a stale version.
        match self.get(id).await? {
            None => Err(StoreError::NotFound(id)),
            Some(current) => {
                expected.check(&current)?;
                Err(StoreError::StaleVersion(id))
            }
        }
    }

    #[instrument(skip(self))]
    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM generation_jobs
            WHERE status = $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_status", e))?;

        rows.iter().map(decode).collect()
    }

    #[instrument(skip(self))]
    async fn list_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM generation_jobs
            WHERE status = 'processing'
              AND lease_expires_at <= $1
            ORDER BY lease_expires_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_expired_leases", e))?;

        rows.iter().map(decode).collect()
    }

    #[instrument(skip(self))]
    async fn list_live_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM generation_jobs
            WHERE status = 'processing'
              AND (lease_expires_at IS NULL OR lease_expires_at > $1)
            ORDER BY COALESCE(started_at, updated_at) ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_live_leases", e))?;

        rows.iter().map(decode).collect()
    }

    #[instrument(skip(self))]
    async fn stats(&self) -> Result<JobStats, StoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM generation_jobs GROUP BY status",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| StoreError::Storage(format!("failed to read status: {e}")))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| StoreError::Storage(format!("failed to read count: {e}")))?;
            let status = status
                .parse()
                .map_err(|e| StoreError::Storage(format!("corrupt status column: {e}")))?;
            stats.record(status, count.max(0) as u64);
        }
        Ok(stats)
    }
}

fn to_db_count(value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Storage(format!("count {value} out of range")))
}

fn decode(row: &PgRow) -> Result<JobRecord, StoreError> {
    JobRow::from_row(row)
        .map_err(|e| StoreError::Storage(format!("failed to deserialize job row: {e}")))?
        .try_into()
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some(code) if code.starts_with("28") || code == "3D000" => {
                    StoreError::Unavailable(msg)
                }
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Configuration(_) => {
            StoreError::Unavailable(format!("{} in {}", err, operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    kind: String,
    parameters: serde_json::Value,
    status: String,
    progress: i16,
    current_step: Option<String>,
    retry_count: i32,
    max_retries: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    result_ref: Option<String>,
    worker_id: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            parameters: row.try_get("parameters")?,
            status: row.try_get("status")?,
            progress: row.try_get("progress")?,
            current_step: row.try_get("current_step")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
            result_ref: row.try_get("result_ref")?,
            worker_id: row.try_get("worker_id")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
        })
    }
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |column: &str, detail: String| {
            StoreError::Storage(format!("corrupt {column} column for job {}: {detail}", row.id))
        };

        let kind: JobKind = row.kind.parse().map_err(|e| corrupt("kind", format!("{e}")))?;
        let status: JobStatus = row
            .status
            .parse()
            .map_err(|e| corrupt("status", format!("{e}")))?;
        let progress = u8::try_from(row.progress)
            .map_err(|_| corrupt("progress", row.progress.to_string()))?;
        let retry_count = u32::try_from(row.retry_count)
            .map_err(|_| corrupt("retry_count", row.retry_count.to_string()))?;
        let max_retries = u32::try_from(row.max_retries)
            .map_err(|_| corrupt("max_retries", row.max_retries.to_string()))?;

        Ok(JobRecord {
            id: JobId::from_uuid(row.id),
            kind,
            parameters: row.parameters,
            status,
            progress,
            current_step: row.current_step,
            retry_count,
            max_retries,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
            result_ref: row.result_ref,
            worker_id: row.worker_id,
            lease_expires_at: row.lease_expires_at,
        })
    }
}
