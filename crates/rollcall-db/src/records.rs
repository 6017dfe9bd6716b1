//! Attendance record repository and the confirm transaction.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Pool, Postgres, Row};
use tracing::info;
use uuid::Uuid;

use rollcall_core::{
    new_v7, AttendanceStatus, ConfirmCommit, ConfirmOutcome, Error, Record, RecordChange,
    RecordRepository, RecordSource, Result, ReviewDraft, UploadStatus,
};

use crate::uploads::{PgUploadRepository, UPLOAD_COLUMNS};

const RECORD_COLUMNS: &str = "id, school_id, class_id, student_id, record_date, status, source, \
     upload_id, notification_sent, notified_at, created_at, updated_at";

/// PostgreSQL implementation of RecordRepository.
#[derive(Clone)]
pub struct PgRecordRepository {
    pool: Pool<Postgres>,
}

impl PgRecordRepository {
    /// Create a new PgRecordRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_record_row(row: &sqlx::postgres::PgRow) -> Result<Record> {
        let status: String = row.get("status");
        let source: String = row.get("source");
        Ok(Record {
            id: row.get("id"),
            school_id: row.get("school_id"),
            class_id: row.get("class_id"),
            student_id: row.get("student_id"),
            date: row.get("record_date"),
            status: status.parse()?,
            source: source.parse()?,
            upload_id: row.get("upload_id"),
            notification_sent: row.get("notification_sent"),
            notified_at: row.get("notified_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl RecordRepository for PgRecordRepository {
    async fn commit_confirmation(&self, commit: ConfirmCommit) -> Result<ConfirmOutcome> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Row lock on the upload serializes concurrent confirms.
        let row = sqlx::query(&format!(
            "SELECT {} FROM uploads WHERE id = $1 FOR UPDATE",
            UPLOAD_COLUMNS
        ))
        .bind(commit.upload_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .ok_or(Error::UploadNotFound(commit.upload_id))?;
        let upload = PgUploadRepository::parse_upload_row(&row)?;

        match upload.status {
            UploadStatus::ReviewRequired => {}
            UploadStatus::Confirmed => {
                return Err(Error::Conflict(format!(
                    "upload {} is already confirmed",
                    upload.id
                )))
            }
            other => {
                return Err(Error::Conflict(format!(
                    "upload {} is {} and cannot be confirmed",
                    upload.id, other
                )))
            }
        }
        if upload.version != commit.expected_version {
            return Err(Error::Conflict(format!(
                "upload {} changed (version {} != {})",
                upload.id, upload.version, commit.expected_version
            )));
        }

        let mut seen = HashSet::with_capacity(commit.records.len());
        let mut changes = Vec::with_capacity(commit.records.len());
        for draft in &commit.records {
            if !seen.insert(draft.student_id) {
                return Err(Error::ConsistencyViolation(format!(
                    "student {} materialized twice for {}",
                    draft.student_id, upload.date
                )));
            }

            let existing = sqlx::query(
                "SELECT school_id, status FROM attendance_records
                 WHERE student_id = $1 AND record_date = $2
                 FOR UPDATE",
            )
            .bind(draft.student_id)
            .bind(upload.date)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::Database)?;

            let previous_status = match existing {
                Some(r) => {
                    let school_id: i64 = r.get("school_id");
                    if school_id != upload.school_id {
                        return Err(Error::ConsistencyViolation(format!(
                            "student {} already has a record for {} under school {}",
                            draft.student_id, upload.date, school_id
                        )));
                    }
                    let status: String = r.get("status");
                    Some(status.parse::<AttendanceStatus>()?)
                }
                None => None,
            };

            let row = sqlx::query(&format!(
                "INSERT INTO attendance_records
                     (id, school_id, class_id, student_id, record_date, status, source, upload_id,
                      notification_sent, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, false, $9, $9)
                 ON CONFLICT (student_id, record_date) DO UPDATE
                 SET status = EXCLUDED.status,
                     source = EXCLUDED.source,
                     upload_id = EXCLUDED.upload_id,
                     class_id = EXCLUDED.class_id,
                     notification_sent = CASE WHEN attendance_records.status = EXCLUDED.status
                                              THEN attendance_records.notification_sent ELSE false END,
                     notified_at = CASE WHEN attendance_records.status = EXCLUDED.status
                                        THEN attendance_records.notified_at ELSE NULL END,
                     updated_at = EXCLUDED.updated_at
                 RETURNING {}",
                RECORD_COLUMNS
            ))
            .bind(new_v7())
            .bind(upload.school_id)
            .bind(upload.class_id)
            .bind(draft.student_id)
            .bind(upload.date)
            .bind(draft.status.as_str())
            .bind(RecordSource::Recognized.as_str())
            .bind(upload.id)
            .bind(commit.confirmed_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(Error::Database)?;

            changes.push(RecordChange {
                record: Self::parse_record_row(&row)?,
                previous_status,
            });
        }

        let final_review = ReviewDraft {
            absentees: commit.absentees.clone(),
        };
        let row = sqlx::query(&format!(
            "UPDATE uploads
             SET status = 'confirmed', review = $2, confirmed_by = $3, confirmed_at = $4,
                 version = version + 1, updated_at = $4
             WHERE id = $1
             RETURNING {}",
            UPLOAD_COLUMNS
        ))
        .bind(upload.id)
        .bind(serde_json::to_value(&final_review)?)
        .bind(commit.actor_id)
        .bind(commit.confirmed_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;
        let upload = PgUploadRepository::parse_upload_row(&row)?;

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "records",
            op = "confirm",
            upload_id = %upload.id,
            record_count = changes.len(),
            absent_count = commit.absentees.len(),
            "Upload confirmed and records materialized"
        );
        Ok(ConfirmOutcome { upload, changes })
    }

    async fn list_for_class_date(
        &self,
        school_id: i64,
        class_id: i64,
        date: NaiveDate,
    ) -> Result<Vec<Record>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM attendance_records
             WHERE school_id = $1 AND class_id = $2 AND record_date = $3
             ORDER BY student_id",
            RECORD_COLUMNS
        ))
        .bind(school_id)
        .bind(class_id)
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(Self::parse_record_row).collect()
    }

    async fn mark_notified(&self, record_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE attendance_records
             SET notification_sent = true, notified_at = $2
             WHERE id = $1",
        )
        .bind(record_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("record {}", record_id)));
        }
        Ok(())
    }
}
