//! # rollcall-db
//!
//! Storage layer for the attendance recognition pipeline.
//!
//! This crate provides:
//! - Connection pool management
//! - PostgreSQL repositories for uploads, records, feedback and the job queue
//! - Read adapters for the class roster and per-school register configuration
//! - Content-addressed image storage
//! - An in-memory store implementing every trait, for tests and local runs
//!
//! ## Example
//!
//! ```rust,ignore
//! use rollcall_db::Database;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/rollcall", "/var/rollcall").await?;
//!     let stats = db.jobs.queue_stats().await?;
//!     println!("pending jobs: {}", stats.pending);
//!     Ok(())
//! }
//! ```
pub mod blob_storage;
pub mod feedback;
pub mod jobs;
pub mod memory;
pub mod pool;
pub mod records;
pub mod roster;
pub mod test_fixtures;
pub mod uploads;

use std::path::PathBuf;
use std::sync::Arc;

pub use rollcall_core::*;

pub use blob_storage::{compute_content_hash, FilesystemBlobStore, MemoryBlobStore};
pub use feedback::PgFeedbackRepository;
pub use jobs::PgJobRepository;
pub use memory::MemoryStore;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use records::PgRecordRepository;
pub use roster::{PgRosterLookup, PgSchoolConfigSource};
pub use uploads::PgUploadRepository;

/// Combined storage context.
///
/// Fields are trait objects so the same pipeline and API code runs against
/// PostgreSQL or [`MemoryStore`].
#[derive(Clone)]
pub struct Database {
    /// Connection pool, absent for the in-memory backend.
    pub pool: Option<sqlx::Pool<sqlx::Postgres>>,
    pub uploads: Arc<dyn UploadRepository>,
    pub records: Arc<dyn RecordRepository>,
    pub feedback: Arc<dyn FeedbackRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub roster: Arc<dyn RosterLookup>,
    pub school_config: Arc<dyn SchoolConfigSource>,
    pub blobs: Arc<dyn BlobStore>,
}

impl Database {
    /// Build a PostgreSQL-backed context with images stored under `blob_root`.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>, blob_root: impl Into<PathBuf>) -> Self {
        Self {
            uploads: Arc::new(PgUploadRepository::new(pool.clone())),
            records: Arc::new(PgRecordRepository::new(pool.clone())),
            feedback: Arc::new(PgFeedbackRepository::new(pool.clone())),
            jobs: Arc::new(PgJobRepository::new(pool.clone())),
            roster: Arc::new(PgRosterLookup::new(pool.clone())),
            school_config: Arc::new(PgSchoolConfigSource::new(pool.clone())),
            blobs: Arc::new(FilesystemBlobStore::new(blob_root)),
            pool: Some(pool),
        }
    }

    /// Connect with the default pool configuration.
    pub async fn connect(url: &str, blob_root: impl Into<PathBuf>) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool, blob_root))
    }

    /// Connect with a custom pool configuration.
    pub async fn connect_with_config(
        url: &str,
        config: PoolConfig,
        blob_root: impl Into<PathBuf>,
    ) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool, blob_root))
    }

    /// Context backed entirely by process memory. The returned store is the
    /// same instance behind every trait field, for seeding rosters and configs.
    pub fn in_memory() -> (Self, MemoryStore) {
        let store = MemoryStore::new();
        let db = Self {
            pool: None,
            uploads: Arc::new(store.clone()),
            records: Arc::new(store.clone()),
            feedback: Arc::new(store.clone()),
            jobs: Arc::new(store.clone()),
            roster: Arc::new(store.clone()),
            school_config: Arc::new(store.clone()),
            blobs: Arc::new(MemoryBlobStore::new()),
        };
        (db, store)
    }

    /// Run pending migrations. A no-op for the in-memory backend.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        if let Some(pool) = &self.pool {
            sqlx::migrate!("../../migrations")
                .run(pool)
                .await
                .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        }
        Ok(())
    }

    /// Get the underlying connection pool, if any.
    pub fn pool(&self) -> Option<&sqlx::Pool<sqlx::Postgres>> {
        self.pool.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn test_in_memory_fields_share_state() {
        let (db, store) = Database::in_memory();
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        store
            .enroll(1, 2, RosterEntry::new(5, "5", "Esi"), date, None)
            .await;

        let roster = db.roster.get_active_roster(1, 2, date).await.unwrap();
        assert_eq!(roster.len(), 1);
        assert!(db.pool().is_none());
    }
}
