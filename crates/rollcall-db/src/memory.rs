//! In-process implementation of every storage trait.
//!
//! One mutex guards all tables, so each trait call behaves like a serializable
//! transaction. The guards match the PostgreSQL repositories: the partial
//! unique index on open uploads, claim compare-and-set, version checks, the
//! (student, date) record uniqueness and append-only feedback.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use rollcall_core::{
    new_v7, AttendanceStatus, ConfirmCommit, ConfirmOutcome, CreateUploadRequest, CreatedUpload,
    Error, FailureUpdate, Feedback, FeedbackDraft, FeedbackRepository, Job, JobRepository,
    JobStatus, QueueStats, RecognitionResult, Record, RecordChange, RecordRepository,
    RecordSource, Result, ReviewDraft, RosterEntry, RosterLookup, SchoolConfigSource,
    SchoolRegisterConfig, Upload, UploadKey, UploadRepository, UploadStatus,
};

#[derive(Debug, Clone)]
struct Enrollment {
    school_id: i64,
    class_id: i64,
    entry: RosterEntry,
    active_from: NaiveDate,
    active_to: Option<NaiveDate>,
}

#[derive(Default)]
struct Tables {
    uploads: BTreeMap<Uuid, Upload>,
    records: HashMap<(i64, NaiveDate), Record>,
    feedback: Vec<Feedback>,
    jobs: BTreeMap<Uuid, Job>,
    enrollments: Vec<Enrollment>,
    configs: HashMap<i64, SchoolRegisterConfig>,
}

impl Tables {
    fn open_for_key(&self, key: UploadKey) -> Option<Uuid> {
        self.uploads
            .values()
            .find(|u| u.key() == key && !u.status.is_terminal())
            .map(|u| u.id)
    }

    fn upload_mut(&mut self, id: Uuid) -> Result<&mut Upload> {
        self.uploads.get_mut(&id).ok_or(Error::UploadNotFound(id))
    }
}

/// In-memory database for tests and local runs without PostgreSQL.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a student to a class roster for `[active_from, active_to]`.
    pub async fn enroll(
        &self,
        school_id: i64,
        class_id: i64,
        entry: RosterEntry,
        active_from: NaiveDate,
        active_to: Option<NaiveDate>,
    ) {
        self.tables.lock().await.enrollments.push(Enrollment {
            school_id,
            class_id,
            entry,
            active_from,
            active_to,
        });
    }

    pub async fn set_register_config(&self, school_id: i64, config: SchoolRegisterConfig) {
        self.tables.lock().await.configs.insert(school_id, config);
    }

    /// Every job ever queued for an upload, oldest first.
    pub async fn jobs_for_upload(&self, upload_id: Uuid) -> Vec<Job> {
        let tables = self.tables.lock().await;
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| j.upload_id == upload_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs
    }
}

#[async_trait]
impl UploadRepository for MemoryStore {
    async fn create_superseding(&self, req: CreateUploadRequest) -> Result<CreatedUpload> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();

        let superseded = tables.open_for_key(req.key);
        if let Some(previous) = superseded {
            let upload = tables.upload_mut(previous)?;
            upload.status = UploadStatus::Superseded;
            upload.claimed_by = None;
            upload.claimed_at = None;
            upload.version += 1;
            upload.updated_at = now;
        }

        let upload = Upload {
            id: new_v7(),
            school_id: req.key.school_id,
            class_id: req.key.class_id,
            date: req.key.date,
            image_ref: req.image_ref,
            status: UploadStatus::Processing,
            raw_text: None,
            grid: None,
            ai_output: None,
            review: None,
            error_reason: None,
            attempt_count: 0,
            version: 1,
            claimed_by: None,
            claimed_at: None,
            supersedes: superseded,
            created_by: req.created_by,
            confirmed_by: None,
            confirmed_at: None,
            created_at: now,
            updated_at: now,
        };
        tables.uploads.insert(upload.id, upload.clone());
        Ok(CreatedUpload { upload, superseded })
    }

    async fn get(&self, id: Uuid) -> Result<Option<Upload>> {
        Ok(self.tables.lock().await.uploads.get(&id).cloned())
    }

    async fn list_for_key(&self, key: UploadKey) -> Result<Vec<Upload>> {
        let tables = self.tables.lock().await;
        let mut uploads: Vec<Upload> = tables
            .uploads
            .values()
            .filter(|u| u.key() == key)
            .cloned()
            .collect();
        uploads.sort_by_key(|u| (u.created_at, u.id));
        Ok(uploads)
    }

    async fn try_claim(&self, id: Uuid, claim: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let Some(upload) = tables.uploads.get_mut(&id) else {
            return Ok(false);
        };
        if upload.status != UploadStatus::Processing || upload.claimed_by.is_some() {
            return Ok(false);
        }
        upload.claimed_by = Some(claim);
        upload.claimed_at = Some(now);
        upload.version += 1;
        upload.updated_at = now;
        Ok(true)
    }

    async fn complete_recognition(
        &self,
        id: Uuid,
        claim: Uuid,
        result: RecognitionResult,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let Some(upload) = tables.uploads.get_mut(&id) else {
            return Ok(false);
        };
        if upload.status != UploadStatus::Processing || upload.claimed_by != Some(claim) {
            return Ok(false);
        }
        upload.review = Some(ReviewDraft::from_ai(&result.ai_output));
        upload.raw_text = Some(result.raw_text);
        upload.grid = Some(result.grid);
        upload.ai_output = Some(result.ai_output);
        upload.status = UploadStatus::ReviewRequired;
        upload.error_reason = None;
        upload.claimed_by = None;
        upload.claimed_at = None;
        upload.version += 1;
        upload.updated_at = Utc::now();
        Ok(true)
    }

    async fn apply_failure(&self, id: Uuid, claim: Uuid, update: FailureUpdate) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let Some(upload) = tables.uploads.get_mut(&id) else {
            return Ok(false);
        };
        if upload.status != UploadStatus::Processing || upload.claimed_by != Some(claim) {
            return Ok(false);
        }
        upload.status = update.status;
        upload.error_reason = Some(update.error_reason);
        upload.attempt_count = update.attempt_count;
        upload.claimed_by = None;
        upload.claimed_at = None;
        upload.version += 1;
        upload.updated_at = Utc::now();
        Ok(true)
    }

    async fn save_review(
        &self,
        id: Uuid,
        expected_version: i64,
        draft: ReviewDraft,
    ) -> Result<Upload> {
        let mut tables = self.tables.lock().await;
        let upload = tables.upload_mut(id)?;
        if upload.status != UploadStatus::ReviewRequired {
            return Err(Error::Conflict(format!(
                "upload {} is {}, not open for review",
                id, upload.status
            )));
        }
        if upload.version != expected_version {
            return Err(Error::Conflict(format!(
                "upload {} changed (version {} != {})",
                id, upload.version, expected_version
            )));
        }
        upload.review = Some(draft);
        upload.version += 1;
        upload.updated_at = Utc::now();
        Ok(upload.clone())
    }

    async fn release_stale_claims(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let mut released = Vec::new();
        for upload in tables.uploads.values_mut() {
            let stale = upload.status == UploadStatus::Processing
                && upload.claimed_by.is_some()
                && upload.claimed_at.is_some_and(|at| at < older_than);
            if stale {
                upload.claimed_by = None;
                upload.claimed_at = None;
                upload.version += 1;
                upload.updated_at = now;
                released.push(upload.id);
            }
        }
        Ok(released)
    }

    async fn find_unqueued(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let tables = self.tables.lock().await;
        let queued: HashSet<Uuid> = tables
            .jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Running))
            .map(|j| j.upload_id)
            .collect();
        Ok(tables
            .uploads
            .values()
            .filter(|u| {
                u.status == UploadStatus::Processing
                    && u.claimed_by.is_none()
                    && u.updated_at < older_than
                    && !queued.contains(&u.id)
            })
            .map(|u| u.id)
            .collect())
    }
}

#[async_trait]
impl RecordRepository for MemoryStore {
    async fn commit_confirmation(&self, commit: ConfirmCommit) -> Result<ConfirmOutcome> {
        let mut tables = self.tables.lock().await;

        let upload = tables
            .uploads
            .get(&commit.upload_id)
            .cloned()
            .ok_or(Error::UploadNotFound(commit.upload_id))?;
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

        // Validate everything before touching any row so a failure leaves no
        // partial writes behind.
        let mut seen = HashSet::with_capacity(commit.records.len());
        for draft in &commit.records {
            if !seen.insert(draft.student_id) {
                return Err(Error::ConsistencyViolation(format!(
                    "student {} materialized twice for {}",
                    draft.student_id, upload.date
                )));
            }
            if let Some(existing) = tables.records.get(&(draft.student_id, upload.date)) {
                if existing.school_id != upload.school_id {
                    return Err(Error::ConsistencyViolation(format!(
                        "student {} already has a record for {} under school {}",
                        draft.student_id, upload.date, existing.school_id
                    )));
                }
            }
        }

        let mut changes = Vec::with_capacity(commit.records.len());
        for draft in &commit.records {
            let key = (draft.student_id, upload.date);
            let previous = tables.records.get(&key).cloned();
            let previous_status: Option<AttendanceStatus> = previous.as_ref().map(|r| r.status);
            let record = match previous {
                Some(mut existing) => {
                    if existing.status != draft.status {
                        existing.notification_sent = false;
                        existing.notified_at = None;
                    }
                    existing.status = draft.status;
                    existing.source = RecordSource::Recognized;
                    existing.upload_id = Some(upload.id);
                    existing.class_id = upload.class_id;
                    existing.updated_at = commit.confirmed_at;
                    existing
                }
                None => Record {
                    id: new_v7(),
                    school_id: upload.school_id,
                    class_id: upload.class_id,
                    student_id: draft.student_id,
                    date: upload.date,
                    status: draft.status,
                    source: RecordSource::Recognized,
                    upload_id: Some(upload.id),
                    notification_sent: false,
                    notified_at: None,
                    created_at: commit.confirmed_at,
                    updated_at: commit.confirmed_at,
                },
            };
            tables.records.insert(key, record.clone());
            changes.push(RecordChange {
                record,
                previous_status,
            });
        }

        let stored = tables.upload_mut(upload.id)?;
        stored.status = UploadStatus::Confirmed;
        stored.review = Some(ReviewDraft {
            absentees: commit.absentees.clone(),
        });
        stored.confirmed_by = Some(commit.actor_id);
        stored.confirmed_at = Some(commit.confirmed_at);
        stored.version += 1;
        stored.updated_at = commit.confirmed_at;

        Ok(ConfirmOutcome {
            upload: stored.clone(),
            changes,
        })
    }

    async fn list_for_class_date(
        &self,
        school_id: i64,
        class_id: i64,
        date: NaiveDate,
    ) -> Result<Vec<Record>> {
        let tables = self.tables.lock().await;
        let mut records: Vec<Record> = tables
            .records
            .values()
            .filter(|r| r.school_id == school_id && r.class_id == class_id && r.date == date)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.student_id);
        Ok(records)
    }

    async fn mark_notified(&self, record_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let record = tables
            .records
            .values_mut()
            .find(|r| r.id == record_id)
            .ok_or_else(|| Error::NotFound(format!("record {}", record_id)))?;
        record.notification_sent = true;
        record.notified_at = Some(at);
        Ok(())
    }
}

#[async_trait]
impl FeedbackRepository for MemoryStore {
    async fn append(&self, upload_id: Uuid, entries: Vec<FeedbackDraft>) -> Result<Vec<Feedback>> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let written: Vec<Feedback> = entries
            .into_iter()
            .map(|entry| Feedback {
                id: new_v7(),
                upload_id,
                student_id: entry.student_id,
                ai_status: entry.ai_status,
                human_status: entry.human_status,
                match_method: entry.match_method,
                created_at: now,
            })
            .collect();
        tables.feedback.extend(written.iter().cloned());
        Ok(written)
    }

    async fn list_for_upload(&self, upload_id: Uuid) -> Result<Vec<Feedback>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .feedback
            .iter()
            .filter(|f| f.upload_id == upload_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn queue(&self, upload_id: Uuid, attempt: i32, run_after: DateTime<Utc>) -> Result<Uuid> {
        let mut tables = self.tables.lock().await;
        let job = Job {
            id: new_v7(),
            upload_id,
            status: JobStatus::Pending,
            attempt,
            run_after,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let id = job.id;
        tables.jobs.insert(id, job);
        Ok(id)
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut tables = self.tables.lock().await;
        let next = tables
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.run_after <= now)
            .min_by_key(|j| (j.run_after, j.created_at, j.id))
            .map(|j| j.id);
        let Some(id) = next else {
            return Ok(None);
        };
        let job = tables
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::Internal(format!("job {} vanished", id)))?;
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(job) = tables.jobs.get_mut(&job_id) {
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(job) = tables.jobs.get_mut(&job_id) {
            job.status = JobStatus::Failed;
            job.error_message = Some(error.to_string());
            job.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn cleanup(&self, keep: i64) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let mut finished: Vec<(Option<DateTime<Utc>>, Uuid)> = tables
            .jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Completed | JobStatus::Failed))
            .map(|j| (j.completed_at, j.id))
            .collect();
        finished.sort_by(|a, b| b.cmp(a));
        let keep = usize::try_from(keep.max(0)).unwrap_or(usize::MAX);
        let doomed: Vec<Uuid> = finished.into_iter().skip(keep).map(|(_, id)| id).collect();
        for id in &doomed {
            tables.jobs.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let tables = self.tables.lock().await;
        let mut stats = QueueStats::default();
        for job in tables.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl RosterLookup for MemoryStore {
    async fn get_active_roster(
        &self,
        school_id: i64,
        class_id: i64,
        date: NaiveDate,
    ) -> Result<Vec<RosterEntry>> {
        let tables = self.tables.lock().await;
        let mut roster: BTreeMap<i64, RosterEntry> = BTreeMap::new();
        for e in &tables.enrollments {
            let active = e.school_id == school_id
                && e.class_id == class_id
                && e.active_from <= date
                && e.active_to.map_or(true, |to| to >= date);
            if active {
                roster.insert(e.entry.student_id, e.entry.clone());
            }
        }
        Ok(roster.into_values().collect())
    }
}

#[async_trait]
impl SchoolConfigSource for MemoryStore {
    async fn register_config(&self, school_id: i64) -> Result<SchoolRegisterConfig> {
        let tables = self.tables.lock().await;
        Ok(tables.configs.get(&school_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use rollcall_core::{AiOutput, ColumnSource, GridSnapshot, RecordDraft};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn key() -> UploadKey {
        UploadKey {
            school_id: 1,
            class_id: 10,
            date: date(),
        }
    }

    fn request() -> CreateUploadRequest {
        CreateUploadRequest {
            key: key(),
            image_ref: "blake3:00".into(),
            created_by: 7,
        }
    }

    fn recognition(absent: &[i64]) -> RecognitionResult {
        RecognitionResult {
            raw_text: "text".into(),
            grid: GridSnapshot {
                rows: vec![],
                column_source: ColumnSource::Clustered,
                extraction_quality: 0.5,
            },
            ai_output: AiOutput {
                matched: absent
                    .iter()
                    .enumerate()
                    .map(|(i, id)| rollcall_core::MatchedCandidate {
                        student_id: *id,
                        row_index: i,
                        method: rollcall_core::MatchMethod::ExactRoll,
                        mark: AttendanceStatus::Absent,
                        confidence: 1.0,
                    })
                    .collect(),
                unmatched: vec![],
                confidence: 0.9,
                likely_correct: true,
                candidates_considered: absent.len(),
                notes: vec![],
            },
        }
    }

    async fn reviewable(store: &MemoryStore, absent: &[i64]) -> Upload {
        let created = store.create_superseding(request()).await.unwrap();
        let claim = Uuid::new_v4();
        assert!(store.try_claim(created.upload.id, claim, Utc::now()).await.unwrap());
        assert!(store
            .complete_recognition(created.upload.id, claim, recognition(absent))
            .await
            .unwrap());
        store.get(created.upload.id).await.unwrap().unwrap()
    }

    fn commit(upload: &Upload, absent: &[i64], roster: &[i64]) -> ConfirmCommit {
        let absentees: BTreeSet<i64> = absent.iter().copied().collect();
        ConfirmCommit {
            upload_id: upload.id,
            expected_version: upload.version,
            actor_id: 9,
            records: roster
                .iter()
                .map(|id| RecordDraft {
                    student_id: *id,
                    status: if absentees.contains(id) {
                        AttendanceStatus::Absent
                    } else {
                        AttendanceStatus::Present
                    },
                })
                .collect(),
            absentees,
            confirmed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_supersedes_open_upload() {
        let store = MemoryStore::new();
        let first = store.create_superseding(request()).await.unwrap();
        assert!(first.superseded.is_none());

        let second = store.create_superseding(request()).await.unwrap();
        assert_eq!(second.superseded, Some(first.upload.id));
        assert_eq!(second.upload.supersedes, Some(first.upload.id));

        let old = store.get(first.upload.id).await.unwrap().unwrap();
        assert_eq!(old.status, UploadStatus::Superseded);
        assert_eq!(store.list_for_key(key()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_claim_is_single_flight() {
        let store = MemoryStore::new();
        let created = store.create_superseding(request()).await.unwrap();
        let id = created.upload.id;
        assert!(store.try_claim(id, Uuid::new_v4(), Utc::now()).await.unwrap());
        assert!(!store.try_claim(id, Uuid::new_v4(), Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_superseded_upload_rejects_recognition() {
        let store = MemoryStore::new();
        let created = store.create_superseding(request()).await.unwrap();
        let claim = Uuid::new_v4();
        store.try_claim(created.upload.id, claim, Utc::now()).await.unwrap();
        store.create_superseding(request()).await.unwrap();

        let written = store
            .complete_recognition(created.upload.id, claim, recognition(&[1]))
            .await
            .unwrap();
        assert!(!written);
        let upload = store.get(created.upload.id).await.unwrap().unwrap();
        assert_eq!(upload.status, UploadStatus::Superseded);
        assert!(upload.ai_output.is_none());
    }

    #[tokio::test]
    async fn test_release_stale_claims() {
        let store = MemoryStore::new();
        let created = store.create_superseding(request()).await.unwrap();
        let long_ago = Utc::now() - chrono::Duration::minutes(30);
        store.try_claim(created.upload.id, Uuid::new_v4(), long_ago).await.unwrap();

        let released = store
            .release_stale_claims(Utc::now() - chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(released, vec![created.upload.id]);
        assert!(store
            .try_claim(created.upload.id, Uuid::new_v4(), Utc::now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_save_review_checks_version() {
        let store = MemoryStore::new();
        let upload = reviewable(&store, &[1]).await;
        let mut draft = upload.review.clone().unwrap();
        draft.mark_absent(2);

        let saved = store.save_review(upload.id, upload.version, draft.clone()).await.unwrap();
        assert_eq!(saved.version, upload.version + 1);

        let stale = store.save_review(upload.id, upload.version, draft).await;
        assert!(matches!(stale, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_confirm_materializes_and_second_confirm_conflicts() {
        let store = MemoryStore::new();
        let upload = reviewable(&store, &[2]).await;

        let outcome = store
            .commit_confirmation(commit(&upload, &[2], &[1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(outcome.upload.status, UploadStatus::Confirmed);
        assert_eq!(outcome.changes.len(), 3);
        assert_eq!(
            outcome.changes.iter().filter(|c| c.became_absent()).count(),
            1
        );

        let again = store.commit_confirmation(commit(&upload, &[2], &[1, 2, 3])).await;
        assert!(matches!(again, Err(Error::Conflict(_))));

        let records = store.list_for_class_date(1, 10, date()).await.unwrap();
        assert_eq!(records.len(), 3);
    }

    #[tokio::test]
    async fn test_reconfirm_resets_notification_only_on_status_change() {
        let store = MemoryStore::new();
        let first = reviewable(&store, &[2]).await;
        let outcome = store.commit_confirmation(commit(&first, &[2], &[1, 2])).await.unwrap();
        for change in &outcome.changes {
            store.mark_notified(change.record.id, Utc::now()).await.unwrap();
        }

        let second = reviewable(&store, &[1, 2]).await;
        let outcome = store
            .commit_confirmation(commit(&second, &[1, 2], &[1, 2]))
            .await
            .unwrap();

        let by_student: HashMap<i64, &RecordChange> =
            outcome.changes.iter().map(|c| (c.record.student_id, c)).collect();
        assert!(by_student[&1].became_absent());
        assert!(!by_student[&1].record.notification_sent);
        assert!(!by_student[&2].became_absent());
        assert!(by_student[&2].record.notification_sent);
        assert_eq!(store.list_for_class_date(1, 10, date()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_confirm_rejects_duplicate_student_without_partial_write() {
        let store = MemoryStore::new();
        let upload = reviewable(&store, &[]).await;
        let mut bad = commit(&upload, &[], &[1, 2]);
        bad.records.push(RecordDraft {
            student_id: 1,
            status: AttendanceStatus::Absent,
        });

        let result = store.commit_confirmation(bad).await;
        assert!(matches!(result, Err(Error::ConsistencyViolation(_))));
        assert!(store.list_for_class_date(1, 10, date()).await.unwrap().is_empty());
        let upload = store.get(upload.id).await.unwrap().unwrap();
        assert_eq!(upload.status, UploadStatus::ReviewRequired);
    }

    #[tokio::test]
    async fn test_roster_respects_enrollment_window() {
        let store = MemoryStore::new();
        let d = |day| NaiveDate::from_ymd_opt(2026, 3, day).unwrap();
        store.enroll(1, 10, RosterEntry::new(1, "1", "Asha"), d(1), None).await;
        store.enroll(1, 10, RosterEntry::new(2, "2", "Bilal"), d(1), Some(d(1))).await;
        store.enroll(1, 10, RosterEntry::new(3, "3", "Chen"), d(5), None).await;
        store.enroll(1, 11, RosterEntry::new(4, "1", "Dara"), d(1), None).await;

        let roster = store.get_active_roster(1, 10, d(2)).await.unwrap();
        let ids: Vec<i64> = roster.iter().map(|r| r.student_id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test]
    async fn test_job_queue_orders_by_due_time() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let later = store.queue(Uuid::new_v4(), 2, now + chrono::Duration::seconds(60)).await.unwrap();
        let due = store.queue(Uuid::new_v4(), 1, now).await.unwrap();

        let claimed = store.claim_next(now).await.unwrap().unwrap();
        assert_eq!(claimed.id, due);
        assert!(store.claim_next(now).await.unwrap().is_none());

        let claimed = store
            .claim_next(now + chrono::Duration::seconds(61))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, later);

        store.complete(due).await.unwrap();
        store.fail(later, "boom").await.unwrap();
        let stats = store.queue_stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(store.cleanup(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_feedback_is_append_only_log() {
        let store = MemoryStore::new();
        let upload_id = Uuid::new_v4();
        let draft = FeedbackDraft {
            student_id: Some(4),
            ai_status: AttendanceStatus::Absent,
            human_status: AttendanceStatus::Present,
            match_method: Some(rollcall_core::MatchMethod::FuzzyName),
        };
        store.append(upload_id, vec![draft.clone()]).await.unwrap();
        store.append(upload_id, vec![draft]).await.unwrap();
        assert_eq!(store.list_for_upload(upload_id).await.unwrap().len(), 2);
    }
}
