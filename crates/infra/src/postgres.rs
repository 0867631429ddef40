//! Postgres-backed job store implementation.
//!
//! This module provides a persistent job store using PostgreSQL as the
//! backing storage. Counter increments and status transitions are single
//! guarded UPDATE statements, so correctness under concurrent multi-process
//! writers is enforced at the database level, with no application-side
//! read-then-write anywhere on the hot path.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `JobStoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError | Scenario |
//! |------------|----------------------|---------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Duplicate job id on insert |
//! | Database (check constraint violation) | `23514` | `IntegrityFailure` | Counter invariant broken (should not occur) |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed | N/A | `Storage` | Connection pool was closed |
//! | RowNotFound | N/A | `Storage` | Unexpected (we use fetch_optional/fetch_all) |
//! | Other | N/A | `Storage` | Network errors, connection failures, etc. |
//!
//! ## Concurrency
//!
//! `report_outcome` is one `UPDATE ... SET successful = successful + 1 ...
//! RETURNING ...` whose predicate only matches active, non-exhausted rows;
//! a report that matches nothing is a late report, not an error.
//! `apply_transition` compares-and-sets against the legal source statuses of
//! the requested edge, so of several racing writers exactly one observes the
//! first entry into a terminal status.
//!
//! ## Tenant Isolation
//!
//! Every query includes `tenant_id` in the WHERE clause.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, instrument};

use async_trait::async_trait;

use crosswalk_core::{JobGroupId, JobId, RequestId, SubjectId, TenantId};
use crosswalk_jobs::{
    Job, JobStats, JobStatus, JobStore, JobStoreError, Outcome, ProgressSnapshot,
    TransitionOutcome, TransitionRequest,
};

const JOB_COLUMNS: &str = "id, tenant_id, subject_id, job_type, job_group, request_id, \
     status, status_reason, scheduled_at, started_at, finished_at, cancelled_at, failed_at, \
     total, successful, failed, params_cx, params_ops, data, runtime_data, run_url, \
     created_at, updated_at";

/// Postgres-backed, tenant-scoped job store (surrogate-keyed rows).
///
/// The composite workflow-key columns (subject, type, group, request) are
/// persisted on every row, so group and latest-in-group lookups address jobs
/// by business identity without a second table.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    /// Create a new store on the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `jobs` table and its lookup indexes if absent.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id            UUID PRIMARY KEY,
                tenant_id     UUID NOT NULL,
                subject_id    UUID NOT NULL,
                job_type      TEXT NOT NULL,
                job_group     UUID NOT NULL,
                request_id    UUID NOT NULL,
                status        TEXT NOT NULL,
                status_reason TEXT,
                scheduled_at  TIMESTAMPTZ,
                started_at    TIMESTAMPTZ,
                finished_at   TIMESTAMPTZ,
                cancelled_at  TIMESTAMPTZ,
                failed_at     TIMESTAMPTZ,
                total         BIGINT NOT NULL DEFAULT 0,
                successful    BIGINT NOT NULL DEFAULT 0,
                failed        BIGINT NOT NULL DEFAULT 0,
                params_cx     JSONB NOT NULL DEFAULT 'null'::jsonb,
                params_ops    JSONB NOT NULL DEFAULT 'null'::jsonb,
                data          JSONB NOT NULL DEFAULT 'null'::jsonb,
                runtime_data  JSONB NOT NULL DEFAULT 'null'::jsonb,
                run_url       TEXT,
                created_at    TIMESTAMPTZ NOT NULL,
                updated_at    TIMESTAMPTZ NOT NULL,
                CONSTRAINT jobs_counters_non_negative
                    CHECK (total >= 0 AND successful >= 0 AND failed >= 0)
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS jobs_group_lookup
             ON jobs (tenant_id, subject_id, job_type, job_group, status)",
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        Ok(())
    }

    async fn fetch(
        &self,
        tenant_id: TenantId,
        key: &JobId,
    ) -> Result<Option<Job<JobId>>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE tenant_id = $1 AND id = $2");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(tenant_id.as_uuid())
            .bind(key.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch", e))?;
        row.map(Job::try_from).transpose()
    }
}

#[async_trait]
impl JobStore<JobId> for PostgresJobStore {
    #[instrument(skip(self, job), fields(tenant_id = %job.tenant_id, job_id = %job.key), err)]
    async fn insert(&self, job: Job<JobId>) -> Result<Job<JobId>, JobStoreError> {
        let sql = format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
              $17, $18, $19, $20, $21, $22, $23) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job.key.as_uuid())
            .bind(job.tenant_id.as_uuid())
            .bind(job.subject_id.as_uuid())
            .bind(&job.job_type)
            .bind(job.job_group.as_uuid())
            .bind(job.request_id.as_uuid())
            .bind(job.status.as_str())
            .bind(&job.status_reason)
            .bind(job.scheduled_at)
            .bind(job.started_at)
            .bind(job.finished_at)
            .bind(job.cancelled_at)
            .bind(job.failed_at)
            .bind(job.total as i64)
            .bind(job.successful as i64)
            .bind(job.failed as i64)
            .bind(&job.params_cx)
            .bind(&job.params_ops)
            .bind(&job.data)
            .bind(&job.runtime_data)
            .bind(&job.run_url)
            .bind(job.created_at)
            .bind(job.updated_at)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert", e))?;
        Job::try_from(row)
    }

    async fn get(&self, tenant_id: TenantId, key: &JobId) -> Result<Job<JobId>, JobStoreError> {
        self.fetch(tenant_id, key)
            .await?
            .ok_or_else(|| JobStoreError::not_found(tenant_id, key))
    }

    #[instrument(
        skip(self, request),
        fields(tenant_id = %tenant_id, job_id = %key, to = %request.to),
        err
    )]
    async fn apply_transition(
        &self,
        tenant_id: TenantId,
        key: &JobId,
        request: TransitionRequest,
    ) -> Result<TransitionOutcome<JobId>, JobStoreError> {
        // Legal source statuses of the requested edge; a forced request may
        // start anywhere except the target itself (same-status stays a no-op).
        let sources: Vec<String> = if request.force {
            JobStatus::ALL
                .iter()
                .filter(|s| **s != request.to)
                .map(|s| s.as_str().to_string())
                .collect()
        } else {
            request
                .to
                .legal_sources()
                .iter()
                .map(|s| s.as_str().to_string())
                .collect()
        };

        let sql = format!(
            "UPDATE jobs SET \
               status = $3, \
               status_reason = COALESCE($4, status_reason), \
               started_at   = CASE WHEN $3 = 'processing' THEN COALESCE(started_at, $5)   ELSE started_at   END, \
               finished_at  = CASE WHEN $3 = 'completed'  THEN COALESCE(finished_at, $5)  ELSE finished_at  END, \
               failed_at    = CASE WHEN $3 = 'failed'     THEN COALESCE(failed_at, $5)    ELSE failed_at    END, \
               cancelled_at = CASE WHEN $3 = 'cancelled'  THEN COALESCE(cancelled_at, $5) ELSE cancelled_at END, \
               updated_at = $5 \
             WHERE tenant_id = $1 AND id = $2 AND status = ANY($6) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(tenant_id.as_uuid())
            .bind(key.as_uuid())
            .bind(request.to.as_str())
            .bind(&request.reason)
            .bind(request.at)
            .bind(&sources)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("apply_transition", e))?;

        if let Some(row) = row {
            return Ok(TransitionOutcome {
                job: Job::try_from(row)?,
                entered: true,
            });
        }

        // The guarded update matched nothing: absent row, no-op
        // re-application, or an illegal edge. Re-read to tell them apart.
        let current = self
            .fetch(tenant_id, key)
            .await?
            .ok_or_else(|| JobStoreError::not_found(tenant_id, key))?;
        if current.status == request.to && (request.force || request.to.is_terminal()) {
            return Ok(TransitionOutcome {
                job: current,
                entered: false,
            });
        }
        Err(crosswalk_jobs::InvalidTransition {
            from: current.status,
            to: request.to,
        }
        .into())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %key), err)]
    async fn report_outcome(
        &self,
        tenant_id: TenantId,
        key: &JobId,
        outcome: Outcome,
        at: DateTime<Utc>,
    ) -> Result<ProgressSnapshot, JobStoreError> {
        let (successful_delta, failed_delta): (i64, i64) = match outcome {
            Outcome::Successful => (1, 0),
            Outcome::Failed => (0, 1),
        };

        let row = sqlx::query(
            "UPDATE jobs SET \
               successful = successful + $3, \
               failed = failed + $4, \
               updated_at = $5 \
             WHERE tenant_id = $1 AND id = $2 \
               AND status IN ('waiting', 'processing') \
               AND (total = 0 OR successful + failed < total) \
             RETURNING status, successful, failed, total",
        )
        .bind(tenant_id.as_uuid())
        .bind(key.as_uuid())
        .bind(successful_delta)
        .bind(failed_delta)
        .bind(at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("report_outcome", e))?;

        match row {
            Some(row) => snapshot_from_row(&row, true),
            None => {
                // Late report: the job is terminal or already exhausted.
                // Return the unchanged row instead of an error.
                let job = self
                    .fetch(tenant_id, key)
                    .await?
                    .ok_or_else(|| JobStoreError::not_found(tenant_id, key))?;
                Ok(job.snapshot(false))
            }
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %key, total), err)]
    async fn set_total(
        &self,
        tenant_id: TenantId,
        key: &JobId,
        total: u32,
        force: bool,
        at: DateTime<Utc>,
    ) -> Result<Job<JobId>, JobStoreError> {
        let sql = format!(
            "UPDATE jobs SET total = $3, successful = 0, failed = 0, updated_at = $4 \
             WHERE tenant_id = $1 AND id = $2 \
               AND ($5 OR total = 0 OR status NOT IN ('waiting', 'processing')) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(tenant_id.as_uuid())
            .bind(key.as_uuid())
            .bind(total as i64)
            .bind(at)
            .bind(force)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_total", e))?;

        match row {
            Some(row) => Job::try_from(row),
            None => {
                let current = self
                    .fetch(tenant_id, key)
                    .await?
                    .ok_or_else(|| JobStoreError::not_found(tenant_id, key))?;
                Err(JobStoreError::Conflict(format!(
                    "job {} is active with total {} already set; refusing to invalidate in-flight counts",
                    current.key, current.total
                )))
            }
        }
    }

    async fn replace_runtime_data(
        &self,
        tenant_id: TenantId,
        key: &JobId,
        data: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<Job<JobId>, JobStoreError> {
        let sql = format!(
            "UPDATE jobs SET runtime_data = $3, updated_at = $4 \
             WHERE tenant_id = $1 AND id = $2 \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(tenant_id.as_uuid())
            .bind(key.as_uuid())
            .bind(&data)
            .bind(at)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("replace_runtime_data", e))?;
        row.map(Job::try_from)
            .transpose()?
            .ok_or_else(|| JobStoreError::not_found(tenant_id, key))
    }

    async fn find_group(
        &self,
        tenant_id: TenantId,
        subject_id: SubjectId,
        job_type: &str,
        job_group: JobGroupId,
        statuses: &[JobStatus],
    ) -> Result<Vec<Job<JobId>>, JobStoreError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE tenant_id = $1 AND subject_id = $2 AND job_type = $3 AND job_group = $4 \
               AND status = ANY($5) \
             ORDER BY created_at ASC"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(tenant_id.as_uuid())
            .bind(subject_id.as_uuid())
            .bind(job_type)
            .bind(job_group.as_uuid())
            .bind(&statuses)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_group", e))?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn find_latest(
        &self,
        tenant_id: TenantId,
        subject_id: SubjectId,
        job_type: &str,
        job_group: JobGroupId,
        statuses: Option<&[JobStatus]>,
    ) -> Result<Option<Job<JobId>>, JobStoreError> {
        let statuses: Vec<String> = statuses
            .unwrap_or(&JobStatus::ALL)
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE tenant_id = $1 AND subject_id = $2 AND job_type = $3 AND job_group = $4 \
               AND status = ANY($5) \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(tenant_id.as_uuid())
            .bind(subject_id.as_uuid())
            .bind(job_type)
            .bind(job_group.as_uuid())
            .bind(&statuses)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_latest", e))?;
        row.map(Job::try_from).transpose()
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM jobs WHERE tenant_id = $1 GROUP BY status",
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| JobStoreError::Storage(format!("stats: {e}")))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| JobStoreError::Storage(format!("stats: {e}")))?;
            let status = parse_status(&status)?;
            stats.add(status, usize::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }
}

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    subject_id: uuid::Uuid,
    job_type: String,
    job_group: uuid::Uuid,
    request_id: uuid::Uuid,
    status: String,
    status_reason: Option<String>,
    scheduled_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    total: i64,
    successful: i64,
    failed: i64,
    params_cx: serde_json::Value,
    params_ops: serde_json::Value,
    data: serde_json::Value,
    runtime_data: serde_json::Value,
    run_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            subject_id: row.try_get("subject_id")?,
            job_type: row.try_get("job_type")?,
            job_group: row.try_get("job_group")?,
            request_id: row.try_get("request_id")?,
            status: row.try_get("status")?,
            status_reason: row.try_get("status_reason")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            cancelled_at: row.try_get("cancelled_at")?,
            failed_at: row.try_get("failed_at")?,
            total: row.try_get("total")?,
            successful: row.try_get("successful")?,
            failed: row.try_get("failed")?,
            params_cx: row.try_get("params_cx")?,
            params_ops: row.try_get("params_ops")?,
            data: row.try_get("data")?,
            runtime_data: row.try_get("runtime_data")?,
            run_url: row.try_get("run_url")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job<JobId> {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, JobStoreError> {
        Ok(Job {
            key: JobId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            subject_id: SubjectId::from_uuid(row.subject_id),
            job_type: row.job_type,
            job_group: JobGroupId::from_uuid(row.job_group),
            request_id: RequestId::from_uuid(row.request_id),
            status: parse_status(&row.status)?,
            status_reason: row.status_reason,
            scheduled_at: row.scheduled_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            cancelled_at: row.cancelled_at,
            failed_at: row.failed_at,
            total: counter_from_row(row.total, "total")?,
            successful: counter_from_row(row.successful, "successful")?,
            failed: counter_from_row(row.failed, "failed")?,
            params_cx: row.params_cx,
            params_ops: row.params_ops,
            data: row.data,
            runtime_data: row.runtime_data,
            run_url: row.run_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn snapshot_from_row(row: &PgRow, counted: bool) -> Result<ProgressSnapshot, JobStoreError> {
    let status: String = row
        .try_get("status")
        .map_err(|e| JobStoreError::Storage(format!("report_outcome: {e}")))?;
    let successful: i64 = row
        .try_get("successful")
        .map_err(|e| JobStoreError::Storage(format!("report_outcome: {e}")))?;
    let failed: i64 = row
        .try_get("failed")
        .map_err(|e| JobStoreError::Storage(format!("report_outcome: {e}")))?;
    let total: i64 = row
        .try_get("total")
        .map_err(|e| JobStoreError::Storage(format!("report_outcome: {e}")))?;
    Ok(ProgressSnapshot {
        status: parse_status(&status)?,
        successful: counter_from_row(successful, "successful")?,
        failed: counter_from_row(failed, "failed")?,
        total: counter_from_row(total, "total")?,
        counted,
    })
}

fn parse_status(raw: &str) -> Result<JobStatus, JobStoreError> {
    JobStatus::from_str(raw).map_err(|e| {
        error!(status = %raw, "job row carries an unknown status");
        JobStoreError::IntegrityFailure(e)
    })
}

fn counter_from_row(value: i64, column: &str) -> Result<u32, JobStoreError> {
    u32::try_from(value).map_err(|_| {
        error!(column, value, "job counter out of range");
        JobStoreError::IntegrityFailure(format!("counter {column} out of range: {value}"))
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique violation: a job with this id already exists.
                Some("23505") => JobStoreError::Conflict(msg),
                // Check constraint violation: a counter invariant broke.
                Some("23514") => JobStoreError::IntegrityFailure(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            // Should not happen for our queries (we use fetch_optional/fetch_all).
            JobStoreError::Storage(format!("unexpected row not found in {operation}"))
        }
        other => JobStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_status_is_an_integrity_failure() {
        assert!(matches!(
            parse_status("paused"),
            Err(JobStoreError::IntegrityFailure(_))
        ));
        assert_eq!(parse_status("waiting").unwrap(), JobStatus::Waiting);
    }

    #[test]
    fn negative_counter_is_an_integrity_failure() {
        assert!(matches!(
            counter_from_row(-1, "successful"),
            Err(JobStoreError::IntegrityFailure(_))
        ));
        assert_eq!(counter_from_row(7, "total").unwrap(), 7);
    }
}
