//! Job repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use rollcall_core::{new_v7, Error, Job, JobRepository, QueueStats, Result};

const JOB_COLUMNS: &str =
    "id, upload_id, status, attempt, run_after, error_message, created_at, started_at, completed_at";

/// PostgreSQL implementation of JobRepository.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: Pool<Postgres>,
}

impl PgJobRepository {
    /// Create a new PgJobRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_job_row(row: &sqlx::postgres::PgRow) -> Result<Job> {
        let status: String = row.get("status");
        Ok(Job {
            id: row.get("id"),
            upload_id: row.get("upload_id"),
            status: status.parse()?,
            attempt: row.get("attempt"),
            run_after: row.get("run_after"),
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        })
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn queue(&self, upload_id: Uuid, attempt: i32, run_after: DateTime<Utc>) -> Result<Uuid> {
        let job_id = new_v7();
        sqlx::query(
            "INSERT INTO processing_jobs (id, upload_id, status, attempt, run_after, created_at)
             VALUES ($1, $2, 'pending', $3, $4, $5)",
        )
        .bind(job_id)
        .bind(upload_id)
        .bind(attempt)
        .bind(run_after)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(job_id)
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        // FOR UPDATE SKIP LOCKED lets several workers poll the same queue.
        let row = sqlx::query(&format!(
            "UPDATE processing_jobs
             SET status = 'running', started_at = $1
             WHERE id = (
                 SELECT id FROM processing_jobs
                 WHERE status = 'pending' AND run_after <= $1
                 ORDER BY run_after ASC, created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE processing_jobs SET status = 'completed', completed_at = $2 WHERE id = $1",
        )
        .bind(job_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE processing_jobs
             SET status = 'failed', error_message = $2, completed_at = $3
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn cleanup(&self, keep: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM processing_jobs
             WHERE status IN ('completed', 'failed')
               AND id NOT IN (
                   SELECT id FROM processing_jobs
                   WHERE status IN ('completed', 'failed')
                   ORDER BY completed_at DESC NULLS LAST
                   LIMIT $1
               )",
        )
        .bind(keep)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            "SELECT
                 COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                 COUNT(*) FILTER (WHERE status = 'running') AS running,
                 COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                 COUNT(*) FILTER (WHERE status = 'failed') AS failed
             FROM processing_jobs",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueStats {
            pending: row.get("pending"),
            running: row.get("running"),
            completed: row.get("completed"),
            failed: row.get("failed"),
        })
    }
}
