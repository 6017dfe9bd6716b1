//! Core traits for rollcall abstractions.
//!
//! Persistence and every external collaborator sit behind these traits so the
//! pipeline can run against PostgreSQL in production and an in-process store
//! in tests.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// UPLOAD REPOSITORY
// =============================================================================

/// Result of creating an Upload attempt.
#[derive(Debug, Clone)]
pub struct CreatedUpload {
    pub upload: Upload,
    /// Previous non-terminal Upload for the same key, now SUPERSEDED.
    pub superseded: Option<Uuid>,
}

/// Failure outcome written back by the worker that holds the claim.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureUpdate {
    /// Either `Processing` (will be retried) or `Failed`.
    pub status: UploadStatus,
    pub error_reason: String,
    pub attempt_count: i32,
}

/// Repository for Upload lifecycle persistence.
///
/// Every mutating call is guarded by the expected state so that a
/// superseded, claimed-elsewhere or already-reviewed Upload is never
/// overwritten. Guards that fail return `false` rather than an error.
#[async_trait]
pub trait UploadRepository: Send + Sync {
    /// Insert a new PROCESSING Upload and, in the same transaction, mark any
    /// non-terminal Upload for the same key as SUPERSEDED.
    async fn create_superseding(&self, req: CreateUploadRequest) -> Result<CreatedUpload>;

    /// Fetch an Upload by id.
    async fn get(&self, id: Uuid) -> Result<Option<Upload>>;

    /// All attempts for a key, oldest first.
    async fn list_for_key(&self, key: UploadKey) -> Result<Vec<Upload>>;

    /// Compare-and-set claim: succeeds only when the Upload is PROCESSING and
    /// unclaimed.
    async fn try_claim(&self, id: Uuid, claim: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Write recognition output and move to REVIEW_REQUIRED. Returns `false`
    /// when the claim was lost or the Upload was abandoned.
    async fn complete_recognition(
        &self,
        id: Uuid,
        claim: Uuid,
        result: RecognitionResult,
    ) -> Result<bool>;

    /// Record a processing failure and release the claim.
    async fn apply_failure(&self, id: Uuid, claim: Uuid, update: FailureUpdate) -> Result<bool>;

    /// Store a reviewer edit. Fails with `Conflict` when `expected_version`
    /// is stale or the Upload is not in REVIEW_REQUIRED.
    async fn save_review(
        &self,
        id: Uuid,
        expected_version: i64,
        draft: ReviewDraft,
    ) -> Result<Upload>;

    /// Clear claims taken before `older_than` on PROCESSING Uploads.
    /// Returns the released Upload ids.
    async fn release_stale_claims(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>>;

    /// PROCESSING Uploads with no claim, untouched since `older_than`, and
    /// no pending or running job. These lost their job between the status
    /// write and the enqueue.
    async fn find_unqueued(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>>;
}

// =============================================================================
// RECORD / CONFIRMATION
// =============================================================================

/// Everything a confirm transaction writes.
#[derive(Debug, Clone)]
pub struct ConfirmCommit {
    pub upload_id: Uuid,
    pub expected_version: i64,
    pub actor_id: i64,
    pub absentees: BTreeSet<i64>,
    pub records: Vec<RecordDraft>,
    pub confirmed_at: DateTime<Utc>,
}

/// Outcome of a committed confirm.
#[derive(Debug, Clone)]
pub struct ConfirmOutcome {
    pub upload: Upload,
    pub changes: Vec<RecordChange>,
}

/// Repository for attendance Records.
#[async_trait]
pub trait RecordRepository: Send + Sync {
    /// Atomically lock the Upload, verify it is REVIEW_REQUIRED at
    /// `expected_version`, upsert every Record and mark the Upload CONFIRMED.
    ///
    /// The loser of a concurrent confirm gets `Conflict`. Nothing is visible
    /// unless everything is.
    async fn commit_confirmation(&self, commit: ConfirmCommit) -> Result<ConfirmOutcome>;

    /// Records for a class on a date.
    async fn list_for_class_date(
        &self,
        school_id: i64,
        class_id: i64,
        date: NaiveDate,
    ) -> Result<Vec<Record>>;

    /// Set the notification-sent flag.
    async fn mark_notified(&self, record_id: Uuid, at: DateTime<Utc>) -> Result<()>;
}

// =============================================================================
// FEEDBACK
// =============================================================================

/// Append-only store of human corrections.
#[async_trait]
pub trait FeedbackRepository: Send + Sync {
    async fn append(&self, upload_id: Uuid, entries: Vec<FeedbackDraft>) -> Result<Vec<Feedback>>;

    async fn list_for_upload(&self, upload_id: Uuid) -> Result<Vec<Feedback>>;
}

// =============================================================================
// JOB QUEUE
// =============================================================================

/// Repository for the Upload-processing job queue.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Queue a processing job that becomes claimable at `run_after`.
    async fn queue(&self, upload_id: Uuid, attempt: i32, run_after: DateTime<Utc>) -> Result<Uuid>;

    /// Claim the oldest due pending job, if any.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>>;

    async fn complete(&self, job_id: Uuid) -> Result<()>;

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<()>;

    /// Delete finished jobs beyond the newest `keep`. Returns rows removed.
    async fn cleanup(&self, keep: i64) -> Result<u64>;

    async fn queue_stats(&self) -> Result<QueueStats>;
}

// =============================================================================
// EXTERNAL COLLABORATORS
// =============================================================================

/// Read-only roster source.
#[async_trait]
pub trait RosterLookup: Send + Sync {
    /// Active students as of `date`, not as of today.
    async fn get_active_roster(
        &self,
        school_id: i64,
        class_id: i64,
        date: NaiveDate,
    ) -> Result<Vec<RosterEntry>>;
}

/// Per-school mark legend and register layout.
#[async_trait]
pub trait SchoolConfigSource: Send + Sync {
    /// Configuration for a school, or the defaults when none is stored.
    async fn register_config(&self, school_id: i64) -> Result<SchoolRegisterConfig>;
}

/// Opaque image store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes and return a retrievable reference.
    async fn put(&self, data: &[u8], content_type: &str) -> Result<String>;

    async fn get(&self, reference: &str) -> Result<Vec<u8>>;
}

/// Outbound absence notification. Retries are the implementor's concern.
#[async_trait]
pub trait AbsenceNotifier: Send + Sync {
    async fn notify_absence(&self, record: &Record) -> Result<()>;
}

/// Source of the current time. Injected so schedulers can be driven by a
/// fake clock in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
