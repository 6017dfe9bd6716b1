//! Append-only feedback log.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use rollcall_core::{new_v7, Error, Feedback, FeedbackDraft, FeedbackRepository, Result};

/// PostgreSQL implementation of FeedbackRepository.
#[derive(Clone)]
pub struct PgFeedbackRepository {
    pool: Pool<Postgres>,
}

impl PgFeedbackRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_feedback_row(row: &sqlx::postgres::PgRow) -> Result<Feedback> {
        let ai_status: String = row.get("ai_status");
        let human_status: String = row.get("human_status");
        let match_method: Option<String> = row.get("match_method");
        Ok(Feedback {
            id: row.get("id"),
            upload_id: row.get("upload_id"),
            student_id: row.get("student_id"),
            ai_status: ai_status.parse()?,
            human_status: human_status.parse()?,
            match_method: match_method.map(|m| m.parse()).transpose()?,
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl FeedbackRepository for PgFeedbackRepository {
    async fn append(&self, upload_id: Uuid, entries: Vec<FeedbackDraft>) -> Result<Vec<Feedback>> {
        if entries.is_empty() {
            return Ok(vec![]);
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let mut written = Vec::with_capacity(entries.len());

        for entry in entries {
            let row = sqlx::query(
                "INSERT INTO attendance_feedback
                     (id, upload_id, student_id, ai_status, human_status, match_method, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 RETURNING id, upload_id, student_id, ai_status, human_status, match_method, created_at",
            )
            .bind(new_v7())
            .bind(upload_id)
            .bind(entry.student_id)
            .bind(entry.ai_status.as_str())
            .bind(entry.human_status.as_str())
            .bind(entry.match_method.map(|m| m.as_str()))
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(Error::Database)?;
            written.push(Self::parse_feedback_row(&row)?);
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(written)
    }

    async fn list_for_upload(&self, upload_id: Uuid) -> Result<Vec<Feedback>> {
        let rows = sqlx::query(
            "SELECT id, upload_id, student_id, ai_status, human_status, match_method, created_at
             FROM attendance_feedback
             WHERE upload_id = $1
             ORDER BY id",
        )
        .bind(upload_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(Self::parse_feedback_row).collect()
    }
}
