//! Read-only adapters for the class roster and school register configuration.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row};

use rollcall_core::{
    Error, Result, RosterEntry, RosterLookup, SchoolConfigSource, SchoolRegisterConfig,
};

/// Roster lookup over the replicated `enrollments` table.
///
/// Never cached: each call reflects enrollment windows as of `date`.
#[derive(Clone)]
pub struct PgRosterLookup {
    pool: Pool<Postgres>,
}

impl PgRosterLookup {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RosterLookup for PgRosterLookup {
    async fn get_active_roster(
        &self,
        school_id: i64,
        class_id: i64,
        date: NaiveDate,
    ) -> Result<Vec<RosterEntry>> {
        let rows = sqlx::query(
            "SELECT DISTINCT ON (student_id) student_id, roll_number, display_name
             FROM enrollments
             WHERE school_id = $1 AND class_id = $2
               AND active_from <= $3
               AND (active_to IS NULL OR active_to >= $3)
             ORDER BY student_id, active_from DESC",
        )
        .bind(school_id)
        .bind(class_id)
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| RosterEntry {
                student_id: row.get("student_id"),
                roll_number: row.get("roll_number"),
                display_name: row.get("display_name"),
            })
            .collect())
    }
}

/// Register configuration stored as JSON per school.
#[derive(Clone)]
pub struct PgSchoolConfigSource {
    pool: Pool<Postgres>,
}

impl PgSchoolConfigSource {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchoolConfigSource for PgSchoolConfigSource {
    async fn register_config(&self, school_id: i64) -> Result<SchoolRegisterConfig> {
        let config: Option<JsonValue> =
            sqlx::query_scalar("SELECT config FROM school_register_configs WHERE school_id = $1")
                .bind(school_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;

        match config {
            Some(value) => serde_json::from_value(value).map_err(|e| {
                Error::Config(format!("register config for school {}: {}", school_id, e))
            }),
            None => Ok(SchoolRegisterConfig::default()),
        }
    }
}
