use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{JobKey, JobPayload, ScheduledJob, TaskQueue};
use crate::error::{LedgerError, Result};

#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const JOB_COLUMNS: &str = "id, run_at, payload, state, attempts, locked_until, last_error";

fn job_from_row(row: &PgRow) -> Result<ScheduledJob> {
    let Json(payload): Json<JobPayload> = row.try_get("payload")?;
    Ok(ScheduledJob {
        id: row.try_get("id")?,
        run_at: row.try_get("run_at")?,
        payload,
        state: row.try_get::<String, _>("state")?.parse()?,
        attempts: row.try_get("attempts")?,
        locked_until: row.try_get("locked_until")?,
        last_error: row.try_get("last_error")?,
    })
}

fn queue_error(err: sqlx::Error) -> LedgerError {
    LedgerError::Queue(err.to_string())
}

#[async_trait]
impl TaskQueue for PgQueue {
    async fn schedule(&self, run_at: DateTime<Utc>, payload: JobPayload) -> Result<ScheduledJob> {
        let job = ScheduledJob::new(run_at, payload);
        let mut tx = self.pool.begin().await.map_err(queue_error)?;
        sqlx::query("DELETE FROM skill_ledger.scheduled_jobs WHERE job_key = $1")
            .bind(job.key().to_string())
            .execute(&mut *tx)
            .await
            .map_err(queue_error)?;
        sqlx::query(
            r#"
            INSERT INTO skill_ledger.scheduled_jobs
            (job_key, id, program_id, kind, run_at, payload, state, attempts)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0)
            "#,
        )
        .bind(job.key().to_string())
        .bind(job.id)
        .bind(job.payload.program_id)
        .bind(job.payload.kind.as_str())
        .bind(job.run_at)
        .bind(Json(&job.payload))
        .bind(job.state.as_str())
        .execute(&mut *tx)
        .await
        .map_err(queue_error)?;
        tx.commit().await.map_err(queue_error)?;
        Ok(job)
    }

    async fn cancel(&self, key: JobKey) -> Result<bool> {
        let result = sqlx::query("DELETE FROM skill_ledger.scheduled_jobs WHERE job_key = $1")
            .bind(key.to_string())
            .execute(&self.pool)
            .await
            .map_err(queue_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, key: JobKey) -> Result<Option<ScheduledJob>> {
        sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM skill_ledger.scheduled_jobs WHERE job_key = $1"
        ))
        .bind(key.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(queue_error)?
        .as_ref()
        .map(job_from_row)
        .transpose()
    }

    async fn list(&self, program_id: Option<Uuid>) -> Result<Vec<ScheduledJob>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM skill_ledger.scheduled_jobs
            WHERE ($1::uuid IS NULL OR program_id = $1)
            ORDER BY run_at, job_key
            "#
        ))
        .bind(program_id)
        .fetch_all(&self.pool)
        .await
        .map_err(queue_error)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE skill_ledger.scheduled_jobs
            SET state = 'running', attempts = attempts + 1, locked_until = $2
            WHERE job_key IN (
                SELECT job_key FROM skill_ledger.scheduled_jobs
                WHERE (state = 'pending' AND run_at <= $1)
                   OR (state = 'running' AND locked_until <= $1)
                ORDER BY run_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(now + lease)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(queue_error)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn complete(&self, job: &ScheduledJob) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM skill_ledger.scheduled_jobs WHERE job_key = $1 AND id = $2")
                .bind(job.key().to_string())
                .bind(job.id)
                .execute(&self.pool)
                .await
                .map_err(queue_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn retry(&self, job: &ScheduledJob, run_at: DateTime<Utc>, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE skill_ledger.scheduled_jobs
            SET state = 'pending', run_at = $3, locked_until = NULL, last_error = $4
            WHERE job_key = $1 AND id = $2
            "#,
        )
        .bind(job.key().to_string())
        .bind(job.id)
        .bind(run_at)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn bury(&self, job: &ScheduledJob, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE skill_ledger.scheduled_jobs
            SET state = 'dead', locked_until = NULL, last_error = $3
            WHERE job_key = $1 AND id = $2
            "#,
        )
        .bind(job.key().to_string())
        .bind(job.id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;
        Ok(result.rows_affected() > 0)
    }
}
