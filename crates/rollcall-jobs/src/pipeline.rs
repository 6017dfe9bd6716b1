//! Recognition pipeline: one processing attempt for one Upload.
//!
//! ```text
//! claim ─► image ─► pre-check ─► OCR ─► grid ─► roster ─► match ─► score ─► REVIEW_REQUIRED
//!                       │          │       │
//!                       └──────────┴───────┴──► failure policy ─► FAILED or retry
//! ```
//!
//! The attempt owns the Upload through a claim (the job id). Every write is
//! guarded by that claim, so an Upload superseded mid-flight is left alone
//! and the attempt's results are discarded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use rollcall_core::lifecycle::{self, Effect};
use rollcall_core::{
    Error, Job, PipelineConfig, RecognitionResult, Result, Upload, UploadStatus,
};
use rollcall_db::Database;
use rollcall_inference::{OcrBackend, ReasoningResponse, ReasoningService};

use crate::grid;
use crate::handler::{JobContext, JobHandler, JobResult};
use crate::matcher::RosterMatcher;
use crate::precheck::{ImagePrecheck, PrecheckConfig};
use crate::scheduler::RetryScheduler;
use crate::scorer;

const FALLBACK_MIME: &str = "application/octet-stream";

/// What a recognition attempt produced.
enum Attempt {
    Recognized(RecognitionResult),
    /// The Upload left PROCESSING or changed hands during an external call.
    Abandoned,
}

/// Handler that runs recognition for queued Uploads.
pub struct RecognitionHandler {
    db: Database,
    ocr: Arc<dyn OcrBackend>,
    reasoning: Arc<dyn ReasoningService>,
    scheduler: RetryScheduler,
    precheck: ImagePrecheck,
    matcher: RosterMatcher,
    config: PipelineConfig,
}

impl RecognitionHandler {
    pub fn new(
        db: Database,
        ocr: Arc<dyn OcrBackend>,
        reasoning: Arc<dyn ReasoningService>,
        scheduler: RetryScheduler,
    ) -> Self {
        let config = PipelineConfig::default();
        Self {
            db,
            ocr,
            reasoning,
            scheduler,
            precheck: ImagePrecheck::default(),
            matcher: RosterMatcher::new(config.matching.clone()),
            config,
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.matcher = RosterMatcher::new(config.matching.clone());
        self.config = config;
        self
    }

    pub fn with_precheck(mut self, config: PrecheckConfig) -> Self {
        self.precheck = ImagePrecheck::new(config);
        self
    }

    /// Whether this attempt still owns the Upload.
    async fn still_owned(&self, upload_id: Uuid, claim: Uuid) -> Result<bool> {
        Ok(self
            .db
            .uploads
            .get(upload_id)
            .await?
            .is_some_and(|u| u.status == UploadStatus::Processing && u.claimed_by == Some(claim)))
    }

    async fn recognize(&self, upload: &Upload, claim: Uuid) -> Result<Attempt> {
        let image = Arc::new(self.db.blobs.get(&upload.image_ref).await?);

        let precheck = self.precheck.clone();
        let bytes = image.clone();
        let metrics = tokio::task::spawn_blocking(move || precheck.check(&bytes))
            .await
            .map_err(|e| Error::Internal(format!("precheck task failed: {}", e)))?
            .into_result()?;
        debug!(
            upload_id = %upload.id,
            width = metrics.width,
            height = metrics.height,
            sharpness = ?metrics.sharpness,
            skew = ?metrics.skew_degrees,
            "Image pre-check passed"
        );

        let school = self.db.school_config.register_config(upload.school_id).await?;
        let mime = infer::get(image.as_slice())
            .map(|kind| kind.mime_type())
            .unwrap_or(FALLBACK_MIME);

        let ocr = match tokio::time::timeout(
            self.config.ocr_timeout,
            self.ocr.extract_text(image.as_slice(), mime),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::TransientService(format!(
                    "{} timed out after {}s",
                    self.ocr.name(),
                    self.config.ocr_timeout.as_secs()
                )))
            }
        };
        if !self.still_owned(upload.id, claim).await? {
            return Ok(Attempt::Abandoned);
        }

        let grid = grid::reconstruct(&ocr, school.layout.as_ref(), &school.legend)?;
        let roster = self
            .db
            .roster
            .get_active_roster(upload.school_id, upload.class_id, upload.date)
            .await?;

        let mut session = self.matcher.start(&grid, &roster, &school.legend);
        if roster.is_empty() {
            session.note("no active roster for this class and date");
        }

        if session.has_pending() {
            let pending = session.pending_count();
            let reply = tokio::time::timeout(
                self.config.reasoning_timeout,
                self.reasoning.reason_match(&grid, &roster, &school.legend),
            )
            .await;
            match reply {
                Ok(Ok(ReasoningResponse::Valid(entries))) => {
                    debug!(upload_id = %upload.id, pending, proposals = entries.len(), "Reasoning answered");
                    session.apply_reasoning(&entries);
                }
                Ok(Ok(ReasoningResponse::SchemaError(reason))) => {
                    warn!(upload_id = %upload.id, %reason, "Reasoning response rejected, using fuzzy fallback");
                    session.note(format!("reasoning response rejected: {}", reason));
                }
                Ok(Err(e)) => {
                    warn!(upload_id = %upload.id, error = %e, "Reasoning unavailable, using fuzzy fallback");
                    session.note("reasoning unavailable; fuzzy fallback used");
                }
                Err(_) => {
                    warn!(
                        upload_id = %upload.id,
                        timeout_secs = self.config.reasoning_timeout.as_secs(),
                        "Reasoning timed out, using fuzzy fallback"
                    );
                    session.note("reasoning timed out; fuzzy fallback used");
                }
            }
            if !self.still_owned(upload.id, claim).await? {
                return Ok(Attempt::Abandoned);
            }
        }

        let outcome = session.finish();
        let ai_output =
            scorer::build_ai_output(outcome, &grid, self.config.likely_correct_threshold);

        Ok(Attempt::Recognized(RecognitionResult {
            raw_text: ocr.raw_text,
            grid,
            ai_output,
        }))
    }

    /// Apply the failure policy and queue a retry when it asks for one.
    async fn record_failure(&self, upload: &Upload, claim: Uuid, err: &Error) -> JobResult {
        let transition = lifecycle::on_processing_error(upload, err, &self.config.retry);
        let update = transition.next.clone();

        match self.db.uploads.apply_failure(upload.id, claim, update.clone()).await {
            Ok(true) => {}
            Ok(false) => return JobResult::Discarded("upload abandoned before failure was recorded".into()),
            Err(e) => return JobResult::Failed(e.to_string()),
        }

        for effect in transition.effects {
            if let Effect::Enqueue {
                upload_id,
                attempt,
                delay,
            } = effect
            {
                if let Err(e) = self.scheduler.schedule(upload_id, attempt, delay).await {
                    error!(upload_id = %upload_id, error = %e, "Failed to queue retry");
                    return JobResult::Failed(format!("failed to queue retry: {}", e));
                }
                warn!(
                    subsystem = "jobs",
                    component = "recognition",
                    upload_id = %upload.id,
                    attempt = update.attempt_count,
                    next_attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Recognition attempt failed, retry scheduled"
                );
            }
        }

        if update.status == UploadStatus::Failed {
            warn!(
                subsystem = "jobs",
                component = "recognition",
                upload_id = %upload.id,
                attempt = update.attempt_count,
                reason = %update.error_reason,
                "Upload failed"
            );
        }
        JobResult::Completed
    }
}

#[async_trait]
impl JobHandler for RecognitionHandler {
    async fn execute(&self, ctx: JobContext) -> JobResult {
        let start = Instant::now();
        let upload_id = ctx.upload_id();
        let claim = ctx.job.id;

        let upload = match self.db.uploads.get(upload_id).await {
            Ok(Some(upload)) => upload,
            Ok(None) => return JobResult::Discarded(format!("upload {} not found", upload_id)),
            Err(e) => return JobResult::Failed(e.to_string()),
        };
        if upload.status != UploadStatus::Processing {
            return JobResult::Discarded(format!("upload is {}", upload.status));
        }
        match self.db.uploads.try_claim(upload_id, claim, self.scheduler.now()).await {
            Ok(true) => {}
            Ok(false) => return JobResult::Discarded("upload claimed by another attempt".into()),
            Err(e) => return JobResult::Failed(e.to_string()),
        }

        info!(
            subsystem = "jobs",
            component = "recognition",
            op = "process",
            upload_id = %upload_id,
            job_id = %claim,
            attempt = ctx.attempt(),
            "Processing upload"
        );

        match self.recognize(&upload, claim).await {
            Ok(Attempt::Recognized(result)) => {
                let rows = result.grid.rows.len();
                let matched = result.ai_output.matched.len();
                let unmatched = result.ai_output.unmatched.len();
                let confidence = result.ai_output.confidence;
                match self.db.uploads.complete_recognition(upload_id, claim, result).await {
                    Ok(true) => {
                        info!(
                            subsystem = "jobs",
                            component = "recognition",
                            upload_id = %upload_id,
                            row_count = rows,
                            matched,
                            unmatched,
                            confidence,
                            duration_ms = start.elapsed().as_millis() as u64,
                            "Upload ready for review"
                        );
                        JobResult::Completed
                    }
                    Ok(false) => JobResult::Discarded("upload abandoned during processing".into()),
                    Err(e) => JobResult::Failed(e.to_string()),
                }
            }
            Ok(Attempt::Abandoned) => {
                info!(upload_id = %upload_id, "Upload abandoned mid-attempt, results discarded");
                JobResult::Discarded("upload abandoned during processing".into())
            }
            Err(err) => self.record_failure(&upload, claim, &err).await,
        }
    }

    async fn on_timeout(&self, job: &Job, limit: Duration) -> JobResult {
        let upload = match self.db.uploads.get(job.upload_id).await {
            Ok(Some(upload)) => upload,
            Ok(None) => return JobResult::Discarded(format!("upload {} not found", job.upload_id)),
            Err(e) => return JobResult::Failed(e.to_string()),
        };
        let err = Error::TransientService(format!(
            "processing exceeded {}s",
            limit.as_secs()
        ));
        self.record_failure(&upload, job.id, &err).await
    }
}
