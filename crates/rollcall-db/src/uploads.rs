//! Upload repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, info};
use uuid::Uuid;

use rollcall_core::{
    new_v7, CreateUploadRequest, CreatedUpload, Error, FailureUpdate, RecognitionResult, Result,
    ReviewDraft, Upload, UploadKey, UploadRepository, UploadStatus,
};

pub(crate) const UPLOAD_COLUMNS: &str = "id, school_id, class_id, register_date, image_ref, status, raw_text, \
     grid, ai_output, review, error_reason, attempt_count, version, claimed_by, claimed_at, \
     supersedes, created_by, confirmed_by, confirmed_at, created_at, updated_at";

/// PostgreSQL implementation of UploadRepository.
#[derive(Clone)]
pub struct PgUploadRepository {
    pool: Pool<Postgres>,
}

impl PgUploadRepository {
    /// Create a new PgUploadRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn json_column<T: DeserializeOwned>(row: &sqlx::postgres::PgRow, column: &str) -> Result<Option<T>> {
        let value: Option<JsonValue> = row.get(column);
        value
            .map(|v| {
                serde_json::from_value(v)
                    .map_err(|e| Error::Serialization(format!("uploads.{}: {}", column, e)))
            })
            .transpose()
    }

    pub(crate) fn parse_upload_row(row: &sqlx::postgres::PgRow) -> Result<Upload> {
        let status: String = row.get("status");
        Ok(Upload {
            id: row.get("id"),
            school_id: row.get("school_id"),
            class_id: row.get("class_id"),
            date: row.get("register_date"),
            image_ref: row.get("image_ref"),
            status: status.parse()?,
            raw_text: row.get("raw_text"),
            grid: Self::json_column(row, "grid")?,
            ai_output: Self::json_column(row, "ai_output")?,
            review: Self::json_column(row, "review")?,
            error_reason: row.get("error_reason"),
            attempt_count: row.get("attempt_count"),
            version: row.get("version"),
            claimed_by: row.get("claimed_by"),
            claimed_at: row.get("claimed_at"),
            supersedes: row.get("supersedes"),
            created_by: row.get("created_by"),
            confirmed_by: row.get("confirmed_by"),
            confirmed_at: row.get("confirmed_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn is_unique_violation(err: &sqlx::Error) -> bool {
        matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
    }
}

#[async_trait]
impl UploadRepository for PgUploadRepository {
    async fn create_superseding(&self, req: CreateUploadRequest) -> Result<CreatedUpload> {
        let id = new_v7();
        let now = Utc::now();
        let key = req.key;

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let superseded: Option<Uuid> = sqlx::query_scalar(
            "UPDATE uploads
             SET status = 'superseded', claimed_by = NULL, claimed_at = NULL,
                 version = version + 1, updated_at = $4
             WHERE id = (
                 SELECT id FROM uploads
                 WHERE school_id = $1 AND class_id = $2 AND register_date = $3
                   AND status IN ('processing', 'review_required')
                 FOR UPDATE
             )
             RETURNING id",
        )
        .bind(key.school_id)
        .bind(key.class_id)
        .bind(key.date)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let row = sqlx::query(&format!(
            "INSERT INTO uploads (id, school_id, class_id, register_date, image_ref, status,
                                  attempt_count, version, supersedes, created_by, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, 'processing', 0, 1, $6, $7, $8, $8)
             RETURNING {}",
            UPLOAD_COLUMNS
        ))
        .bind(id)
        .bind(key.school_id)
        .bind(key.class_id)
        .bind(key.date)
        .bind(&req.image_ref)
        .bind(superseded)
        .bind(req.created_by)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if Self::is_unique_violation(&e) {
                Error::Conflict("another upload for this register was just submitted".into())
            } else {
                Error::Database(e)
            }
        })?;
        let upload = Self::parse_upload_row(&row)?;

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "uploads",
            op = "create",
            upload_id = %upload.id,
            school_id = key.school_id,
            class_id = key.class_id,
            superseded = ?superseded,
            "Upload created"
        );
        Ok(CreatedUpload { upload, superseded })
    }

    async fn get(&self, id: Uuid) -> Result<Option<Upload>> {
        let row = sqlx::query(&format!("SELECT {} FROM uploads WHERE id = $1", UPLOAD_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(Self::parse_upload_row).transpose()
    }

    async fn list_for_key(&self, key: UploadKey) -> Result<Vec<Upload>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM uploads
             WHERE school_id = $1 AND class_id = $2 AND register_date = $3
             ORDER BY created_at ASC, id ASC",
            UPLOAD_COLUMNS
        ))
        .bind(key.school_id)
        .bind(key.class_id)
        .bind(key.date)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(Self::parse_upload_row).collect()
    }

    async fn try_claim(&self, id: Uuid, claim: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE uploads
             SET claimed_by = $2, claimed_at = $3, version = version + 1, updated_at = $3
             WHERE id = $1 AND status = 'processing' AND claimed_by IS NULL",
        )
        .bind(id)
        .bind(claim)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        let claimed = result.rows_affected() == 1;
        debug!(upload_id = %id, claimed, "Upload claim attempted");
        Ok(claimed)
    }

    async fn complete_recognition(
        &self,
        id: Uuid,
        claim: Uuid,
        result: RecognitionResult,
    ) -> Result<bool> {
        let review = ReviewDraft::from_ai(&result.ai_output);
        let outcome = sqlx::query(
            "UPDATE uploads
             SET status = 'review_required', raw_text = $3, grid = $4, ai_output = $5, review = $6,
                 error_reason = NULL, claimed_by = NULL, claimed_at = NULL,
                 version = version + 1, updated_at = $7
             WHERE id = $1 AND status = 'processing' AND claimed_by = $2",
        )
        .bind(id)
        .bind(claim)
        .bind(&result.raw_text)
        .bind(serde_json::to_value(&result.grid)?)
        .bind(serde_json::to_value(&result.ai_output)?)
        .bind(serde_json::to_value(&review)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(outcome.rows_affected() == 1)
    }

    async fn apply_failure(&self, id: Uuid, claim: Uuid, update: FailureUpdate) -> Result<bool> {
        let outcome = sqlx::query(
            "UPDATE uploads
             SET status = $3, error_reason = $4, attempt_count = $5,
                 claimed_by = NULL, claimed_at = NULL,
                 version = version + 1, updated_at = $6
             WHERE id = $1 AND status = 'processing' AND claimed_by = $2",
        )
        .bind(id)
        .bind(claim)
        .bind(update.status.as_str())
        .bind(&update.error_reason)
        .bind(update.attempt_count)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(outcome.rows_affected() == 1)
    }

    async fn save_review(
        &self,
        id: Uuid,
        expected_version: i64,
        draft: ReviewDraft,
    ) -> Result<Upload> {
        let row = sqlx::query(&format!(
            "UPDATE uploads
             SET review = $3, version = version + 1, updated_at = $4
             WHERE id = $1 AND status = 'review_required' AND version = $2
             RETURNING {}",
            UPLOAD_COLUMNS
        ))
        .bind(id)
        .bind(expected_version)
        .bind(serde_json::to_value(&draft)?)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        match row {
            Some(row) => Self::parse_upload_row(&row),
            None => match self.get(id).await? {
                None => Err(Error::UploadNotFound(id)),
                Some(current) if current.status != UploadStatus::ReviewRequired => Err(
                    Error::Conflict(format!("upload {} is {}, not open for review", id, current.status)),
                ),
                Some(current) => Err(Error::Conflict(format!(
                    "upload {} changed (version {} != {})",
                    id, current.version, expected_version
                ))),
            },
        }
    }

    async fn release_stale_claims(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "UPDATE uploads
             SET claimed_by = NULL, claimed_at = NULL, version = version + 1, updated_at = now()
             WHERE status = 'processing' AND claimed_by IS NOT NULL AND claimed_at < $1
             RETURNING id",
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        if !ids.is_empty() {
            info!(
                subsystem = "db",
                component = "uploads",
                op = "release_stale_claims",
                count = ids.len(),
                "Released stale upload claims"
            );
        }
        Ok(ids)
    }

    async fn find_unqueued(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>> {
        sqlx::query_scalar(
            "SELECT u.id FROM uploads u
             WHERE u.status = 'processing' AND u.claimed_by IS NULL AND u.updated_at < $1
               AND NOT EXISTS (
                   SELECT 1 FROM processing_jobs j
                   WHERE j.upload_id = u.id AND j.status IN ('pending', 'running')
               )",
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)
    }
}
