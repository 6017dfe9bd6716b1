//! Attendance service: intake, review, confirm and reprocess.
//!
//! Handlers call into this service; it owns the order of operations around
//! each Upload transition. State is persisted first, then the transition's
//! effects run. Enqueue effects must succeed. Notices and feedback are
//! best-effort and only logged when they fail.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use tracing::{error, info, warn};
use uuid::Uuid;

use rollcall_core::lifecycle::{self, Effect};
use rollcall_core::materialize;
use rollcall_core::{
    defaults, AbsenceNotifier, CreateUploadRequest, Error, Record, Result, ReviewDraft,
    TenantContext, Upload, UploadKey,
};
use rollcall_db::Database;
use rollcall_jobs::RetryScheduler;

/// Outcome of a confirm call.
#[derive(Debug, Clone)]
pub struct Confirmation {
    pub upload: Upload,
    pub records: Vec<Record>,
    /// Records that transitioned into ABSENT with this confirm.
    pub newly_absent: usize,
    /// Of those, how many notices were delivered.
    pub notified: usize,
    /// Proposed absentees dropped because they left the roster after
    /// recognition. Only the AI-proposal fallback drops students.
    pub departed: Vec<i64>,
}

pub struct AttendanceService {
    db: Database,
    scheduler: RetryScheduler,
    notifier: Arc<dyn AbsenceNotifier>,
    max_image_bytes: usize,
}

impl AttendanceService {
    pub fn new(db: Database, scheduler: RetryScheduler, notifier: Arc<dyn AbsenceNotifier>) -> Self {
        Self {
            db,
            scheduler,
            notifier,
            max_image_bytes: defaults::MAX_IMAGE_BYTES,
        }
    }

    pub fn with_max_image_bytes(mut self, max: usize) -> Self {
        self.max_image_bytes = max;
        self
    }

    pub fn max_image_bytes(&self) -> usize {
        self.max_image_bytes
    }

    /// Store a register photo and start recognition for it.
    ///
    /// Any non-terminal Upload for the same (school, class, date) is
    /// superseded in the same step.
    pub async fn submit(
        &self,
        tenant: &TenantContext,
        class_id: i64,
        date: NaiveDate,
        image: &[u8],
    ) -> Result<Upload> {
        if image.is_empty() {
            return Err(Error::InvalidInput("image is empty".into()));
        }
        if image.len() > self.max_image_bytes {
            return Err(Error::InvalidInput(format!(
                "image is {} bytes; the limit is {}",
                image.len(),
                self.max_image_bytes
            )));
        }
        let mime = match infer::get(image) {
            Some(kind) if kind.mime_type().starts_with("image/") => kind.mime_type(),
            Some(kind) => {
                return Err(Error::InvalidInput(format!(
                    "unsupported file type: {}",
                    kind.mime_type()
                )))
            }
            None => return Err(Error::InvalidInput("unrecognized file type".into())),
        };

        let image_ref = self.db.blobs.put(image, mime).await?;
        let created = self
            .db
            .uploads
            .create_superseding(CreateUploadRequest {
                key: UploadKey {
                    school_id: tenant.school_id,
                    class_id,
                    date,
                },
                image_ref,
                created_by: tenant.actor_id,
            })
            .await?;

        info!(
            subsystem = "api",
            component = "attendance",
            op = "submit",
            upload_id = %created.upload.id,
            school_id = tenant.school_id,
            class_id,
            actor_id = tenant.actor_id,
            %date,
            mime_type = mime,
            size_bytes = image.len(),
            superseded = ?created.superseded,
            "Upload created"
        );

        self.run_effects(lifecycle::on_created(&created.upload)).await?;
        Ok(created.upload)
    }

    /// Fetch an Upload within the tenant's school.
    pub async fn get(&self, tenant: &TenantContext, id: Uuid) -> Result<Upload> {
        let upload = self
            .db
            .uploads
            .get(id)
            .await?
            .ok_or(Error::UploadNotFound(id))?;
        lifecycle::ensure_tenant(&upload, tenant)?;
        Ok(upload)
    }

    /// Every attempt for a class and date, oldest first.
    pub async fn attempts(
        &self,
        tenant: &TenantContext,
        class_id: i64,
        date: NaiveDate,
    ) -> Result<Vec<Upload>> {
        self.db
            .uploads
            .list_for_key(UploadKey {
                school_id: tenant.school_id,
                class_id,
                date,
            })
            .await
    }

    /// Store the reviewer's working absentee list.
    pub async fn save_review(
        &self,
        tenant: &TenantContext,
        id: Uuid,
        expected_version: i64,
        absentees: BTreeSet<i64>,
    ) -> Result<Upload> {
        let upload = self.get(tenant, id).await?;
        lifecycle::ensure_reviewable(&upload)?;

        let roster = self
            .db
            .roster
            .get_active_roster(upload.school_id, upload.class_id, upload.date)
            .await?;
        if let Some(unknown) = absentees
            .iter()
            .find(|id| !roster.iter().any(|r| r.student_id == **id))
        {
            return Err(Error::InvalidInput(format!(
                "student {} is not on the roster for this date",
                unknown
            )));
        }

        let saved = self
            .db
            .uploads
            .save_review(id, expected_version, ReviewDraft { absentees })
            .await?;
        info!(
            subsystem = "api",
            component = "attendance",
            op = "save_review",
            upload_id = %id,
            actor_id = tenant.actor_id,
            version = saved.version,
            "Review saved"
        );
        Ok(saved)
    }

    /// Confirm an Upload and materialize one Record per active roster student.
    ///
    /// `absentees` overrides the saved review. A list from either source
    /// must name only students on the roster as of the register date, else
    /// `InvalidInput`. Without either, the AI proposal is confirmed, minus
    /// any student who has since left the roster.
    pub async fn confirm(
        &self,
        tenant: &TenantContext,
        id: Uuid,
        expected_version: i64,
        absentees: Option<BTreeSet<i64>>,
    ) -> Result<Confirmation> {
        let start = Instant::now();
        let upload = self.get(tenant, id).await?;

        // Roster as of the register's date, fetched fresh for this confirm.
        let roster = self
            .db
            .roster
            .get_active_roster(upload.school_id, upload.class_id, upload.date)
            .await?;

        let mut departed = Vec::new();
        let absentees = match absentees.or_else(|| upload.review.as_ref().map(|r| r.absentees.clone())) {
            Some(list) => list,
            None => {
                let proposed = upload
                    .ai_output
                    .as_ref()
                    .map(|ai| ai.proposed_absentees())
                    .unwrap_or_default();
                let (kept, gone) = materialize::split_by_roster(proposed, &roster);
                if !gone.is_empty() {
                    warn!(
                        subsystem = "api",
                        component = "attendance",
                        upload_id = %id,
                        departed = ?gone,
                        "Dropped proposed absentees no longer on the roster"
                    );
                }
                departed = gone;
                kept
            }
        };
        let plan = lifecycle::plan_confirm(
            &upload,
            expected_version,
            absentees,
            &roster,
            tenant.actor_id,
            self.scheduler.now(),
        )?;

        let outcome = self.db.records.commit_confirmation(plan.commit).await?;
        let records: Vec<Record> = outcome.changes.iter().map(|c| c.record.clone()).collect();

        info!(
            subsystem = "api",
            component = "attendance",
            op = "confirm",
            upload_id = %id,
            actor_id = tenant.actor_id,
            roster_size = roster.len(),
            record_count = records.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Upload confirmed"
        );

        let effects = lifecycle::on_confirmed(&outcome, plan.feedback);
        let newly_absent = effects
            .iter()
            .filter(|e| matches!(e, Effect::NotifyAbsence { .. }))
            .count();
        let notified = self.run_effects(effects).await?;

        let records = if notified > 0 {
            self.db
                .records
                .list_for_class_date(upload.school_id, upload.class_id, upload.date)
                .await?
        } else {
            records
        };

        Ok(Confirmation {
            upload: outcome.upload,
            records,
            newly_absent,
            notified,
            departed,
        })
    }

    /// Start a fresh attempt from the same image. The old Upload is kept.
    ///
    /// Only the newest attempt for the register can be reprocessed; an older
    /// one gets `Conflict` so a later attempt under review is not replaced.
    pub async fn reprocess(&self, tenant: &TenantContext, id: Uuid) -> Result<Upload> {
        let upload = self.get(tenant, id).await?;
        lifecycle::ensure_reprocessable(&upload)?;
        let attempts = self.db.uploads.list_for_key(upload.key()).await?;
        lifecycle::ensure_latest_attempt(&upload, &attempts)?;

        let created = self
            .db
            .uploads
            .create_superseding(CreateUploadRequest {
                key: upload.key(),
                image_ref: upload.image_ref.clone(),
                created_by: tenant.actor_id,
            })
            .await?;

        info!(
            subsystem = "api",
            component = "attendance",
            op = "reprocess",
            upload_id = %created.upload.id,
            previous_upload_id = %upload.id,
            actor_id = tenant.actor_id,
            "Reprocessing upload"
        );

        self.run_effects(lifecycle::on_created(&created.upload)).await?;
        Ok(created.upload)
    }

    /// Committed Records for a class on a date.
    pub async fn records(
        &self,
        tenant: &TenantContext,
        class_id: i64,
        date: NaiveDate,
    ) -> Result<Vec<Record>> {
        self.db
            .records
            .list_for_class_date(tenant.school_id, class_id, date)
            .await
    }

    /// Execute transition effects. Returns how many absence notices were
    /// delivered.
    async fn run_effects(&self, effects: Vec<Effect>) -> Result<usize> {
        let mut notified = 0;
        for effect in effects {
            match effect {
                Effect::Enqueue {
                    upload_id,
                    attempt,
                    delay,
                } => {
                    if let Err(e) = self.scheduler.schedule(upload_id, attempt, delay).await {
                        error!(upload_id = %upload_id, error = %e, "Failed to queue processing job");
                        return Err(e);
                    }
                }
                Effect::NotifyAbsence { record } => {
                    if self.notify(&record).await {
                        notified += 1;
                    }
                }
                Effect::WriteFeedback { upload_id, entries } => {
                    let count = entries.len();
                    match self.db.feedback.append(upload_id, entries).await {
                        Ok(_) => info!(
                            subsystem = "api",
                            component = "feedback",
                            upload_id = %upload_id,
                            count,
                            "Feedback captured"
                        ),
                        Err(e) => warn!(
                            subsystem = "api",
                            component = "feedback",
                            upload_id = %upload_id,
                            count,
                            error = %e,
                            "Feedback write failed"
                        ),
                    }
                }
            }
        }
        Ok(notified)
    }

    async fn notify(&self, record: &Record) -> bool {
        if let Err(e) = self.notifier.notify_absence(record).await {
            warn!(
                subsystem = "api",
                component = "notify",
                record_id = %record.id,
                student_id = record.student_id,
                error = %e,
                "Absence notice failed"
            );
            return false;
        }
        if let Err(e) = self.db.records.mark_notified(record.id, self.scheduler.now()).await {
            warn!(
                subsystem = "api",
                component = "notify",
                record_id = %record.id,
                error = %e,
                "Failed to mark record notified"
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingNotifier;
    use rollcall_core::{
        AiOutput, AttendanceStatus, ColumnSource, GridSnapshot, MatchMethod, MatchedCandidate,
        RecognitionResult, RosterEntry, UploadStatus,
    };
    use rollcall_jobs::ManualClock;

    /// Drive an Upload to REVIEW_REQUIRED with `absent` proposed.
    async fn recognized(db: &Database, upload: &Upload, absent: &[i64]) -> Upload {
        let claim = Uuid::new_v4();
        assert!(db.uploads.try_claim(upload.id, claim, chrono::Utc::now()).await.unwrap());
        let result = RecognitionResult {
            raw_text: String::new(),
            grid: GridSnapshot {
                rows: vec![],
                column_source: ColumnSource::Clustered,
                extraction_quality: 0.9,
            },
            ai_output: AiOutput {
                matched: absent
                    .iter()
                    .enumerate()
                    .map(|(i, id)| MatchedCandidate {
                        student_id: *id,
                        row_index: i,
                        method: MatchMethod::ExactRoll,
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
        };
        assert!(db.uploads.complete_recognition(upload.id, claim, result).await.unwrap());
        db.uploads.get(upload.id).await.unwrap().unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn png() -> Vec<u8> {
        vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0]
    }

    async fn service() -> (AttendanceService, Database, RecordingNotifier) {
        let (db, store) = Database::in_memory();
        store
            .enroll(7, 3, RosterEntry::new(1, "101", "Ali Khan"), date(), None)
            .await;
        store
            .enroll(7, 3, RosterEntry::new(2, "102", "Sara Malik"), date(), None)
            .await;
        let notifier = RecordingNotifier::new();
        let scheduler = RetryScheduler::new(db.jobs.clone(), Arc::new(ManualClock::default()));
        let service = AttendanceService::new(db.clone(), scheduler, Arc::new(notifier.clone()));
        (service, db, notifier)
    }

    #[tokio::test]
    async fn test_submit_rejects_non_images() {
        let (service, _db, _) = service().await;
        let tenant = TenantContext::new(7, 40);
        let err = service
            .submit(&tenant, 3, date(), b"%PDF-1.7 not a photo")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_submit_rejects_oversized_images() {
        let (service, _db, _) = service().await;
        let service = service.with_max_image_bytes(4);
        let err = service
            .submit(&TenantContext::new(7, 40), 3, date(), &png())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("limit"));
    }

    #[tokio::test]
    async fn test_submit_queues_first_attempt() {
        let (service, db, _) = service().await;
        let upload = service
            .submit(&TenantContext::new(7, 40), 3, date(), &png())
            .await
            .unwrap();
        assert_eq!(upload.status, UploadStatus::Processing);
        assert_eq!(upload.created_by, 40);

        let job = db.jobs.claim_next(chrono::Utc::now()).await.unwrap().unwrap();
        assert_eq!(job.upload_id, upload.id);
        assert_eq!(job.attempt, 1);
    }

    #[tokio::test]
    async fn test_other_school_is_forbidden() {
        let (service, _db, _) = service().await;
        let upload = service
            .submit(&TenantContext::new(7, 40), 3, date(), &png())
            .await
            .unwrap();
        let err = service
            .get(&TenantContext::new(8, 40), upload.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_confirm_requires_review_state() {
        let (service, _db, notifier) = service().await;
        let tenant = TenantContext::new(7, 40);
        let upload = service.submit(&tenant, 3, date(), &png()).await.unwrap();

        let err = service
            .confirm(&tenant, upload.id, upload.version, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(notifier.sent().is_empty());
        assert!(service.records(&tenant, 3, date()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reprocess_rejected_while_processing() {
        let (service, _db, _) = service().await;
        let tenant = TenantContext::new(7, 40);
        let upload = service.submit(&tenant, 3, date(), &png()).await.unwrap();
        let err = service.reprocess(&tenant, upload.id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_confirm_drops_proposed_students_who_left_roster() {
        let (service, db, _) = service().await;
        let tenant = TenantContext::new(7, 40);
        let upload = service.submit(&tenant, 3, date(), &png()).await.unwrap();
        // Student 5 was matched at recognition time but is no longer enrolled.
        let upload = recognized(&db, &upload, &[1, 5]).await;

        let err = service
            .confirm(&tenant, upload.id, upload.version, Some(BTreeSet::from([5])))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let confirmation = service
            .confirm(&tenant, upload.id, upload.version, None)
            .await
            .unwrap();
        assert_eq!(confirmation.departed, vec![5]);
        assert_eq!(confirmation.records.len(), 2);
        let absent: Vec<i64> = confirmation
            .records
            .iter()
            .filter(|r| r.status == AttendanceStatus::Absent)
            .map(|r| r.student_id)
            .collect();
        assert_eq!(absent, vec![1]);
    }
}
