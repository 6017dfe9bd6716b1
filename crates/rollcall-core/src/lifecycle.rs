//! Upload state machine.
//!
//! Transitions are pure: each returns the new state to persist together
//! with the effects the caller must run *after* that state is durably
//! written. Nothing here touches storage or the network.
//!
//! ```text
//! PROCESSING ──► REVIEW_REQUIRED ──► CONFIRMED
//!     │                 │
//!     ▼                 ▼
//!   FAILED          SUPERSEDED (by a newer attempt for the same key)
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::error::{Error, Result};
use crate::materialize::{plan_feedback, plan_records};
use crate::models::*;
use crate::traits::{ConfirmCommit, ConfirmOutcome, FailureUpdate};

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Queue a processing job for the Upload after `delay`.
    Enqueue {
        upload_id: Uuid,
        attempt: i32,
        delay: Duration,
    },
    /// Send an absence notice for a Record that just became ABSENT.
    NotifyAbsence { record: Record },
    /// Append feedback entries for a confirmed Upload.
    WriteFeedback {
        upload_id: Uuid,
        entries: Vec<FeedbackDraft>,
    },
}

/// New state plus the effects to run once it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<T> {
    pub next: T,
    pub effects: Vec<Effect>,
}

/// Reject access to another school's Upload.
pub fn ensure_tenant(upload: &Upload, tenant: &TenantContext) -> Result<()> {
    if upload.school_id != tenant.school_id {
        return Err(Error::Forbidden(format!(
            "upload {} does not belong to school {}",
            upload.id, tenant.school_id
        )));
    }
    Ok(())
}

/// A freshly created Upload gets its first processing job immediately.
pub fn on_created(upload: &Upload) -> Vec<Effect> {
    vec![Effect::Enqueue {
        upload_id: upload.id,
        attempt: upload.attempt_count + 1,
        delay: Duration::ZERO,
    }]
}

/// Decide what a failed processing attempt does to the Upload.
///
/// Transient service errors are charged against the retry budget and
/// re-queued with backoff until it runs out. Every other error is terminal
/// immediately and leaves `attempt_count` untouched.
pub fn on_processing_error(upload: &Upload, err: &Error, policy: &RetryPolicy) -> Transition<FailureUpdate> {
    if !err.is_retryable() {
        return Transition {
            next: FailureUpdate {
                status: UploadStatus::Failed,
                error_reason: err.to_string(),
                attempt_count: upload.attempt_count,
            },
            effects: vec![],
        };
    }

    let failures = upload.attempt_count + 1;
    if policy.is_exhausted(failures) {
        return Transition {
            next: FailureUpdate {
                status: UploadStatus::Failed,
                error_reason: err.to_string(),
                attempt_count: failures,
            },
            effects: vec![],
        };
    }

    Transition {
        next: FailureUpdate {
            status: UploadStatus::Processing,
            error_reason: err.to_string(),
            attempt_count: failures,
        },
        effects: vec![Effect::Enqueue {
            upload_id: upload.id,
            attempt: failures + 1,
            delay: policy.backoff(failures),
        }],
    }
}

/// Reviewer edits are only accepted while REVIEW_REQUIRED.
pub fn ensure_reviewable(upload: &Upload) -> Result<()> {
    match upload.status {
        UploadStatus::ReviewRequired => Ok(()),
        other => Err(Error::Conflict(format!(
            "upload {} is {}, not open for review",
            upload.id, other
        ))),
    }
}

/// Reprocessing creates a new attempt and is allowed from FAILED or
/// REVIEW_REQUIRED only.
pub fn ensure_reprocessable(upload: &Upload) -> Result<()> {
    match upload.status {
        UploadStatus::Failed | UploadStatus::ReviewRequired => Ok(()),
        other => Err(Error::Conflict(format!(
            "upload {} is {}; only failed or in-review uploads can be reprocessed",
            upload.id, other
        ))),
    }
}

/// Only the newest attempt for a key may start another one; retrying an
/// older attempt would supersede whatever came after it.
pub fn ensure_latest_attempt(upload: &Upload, attempts: &[Upload]) -> Result<()> {
    let newer = attempts
        .iter()
        .find(|a| a.id != upload.id && (a.created_at, a.id) > (upload.created_at, upload.id));
    match newer {
        Some(newer) => Err(Error::Conflict(format!(
            "upload {} is not the latest attempt; {} is newer",
            upload.id, newer.id
        ))),
        None => Ok(()),
    }
}

/// Confirm plan: the commit to apply plus the feedback to write afterwards.
#[derive(Debug, Clone)]
pub struct ConfirmPlan {
    pub commit: ConfirmCommit,
    pub feedback: Vec<FeedbackDraft>,
}

/// Validate a confirm request against the Upload as last read and plan
/// the writes.
///
/// The storage layer re-checks status and version under lock; this check
/// rejects obvious conflicts before the roster is consulted.
pub fn plan_confirm(
    upload: &Upload,
    expected_version: i64,
    absentees: BTreeSet<i64>,
    roster: &[RosterEntry],
    actor_id: i64,
    now: DateTime<Utc>,
) -> Result<ConfirmPlan> {
    match upload.status {
        UploadStatus::ReviewRequired => {}
        UploadStatus::Confirmed => {
            return Err(Error::Conflict(format!("upload {} is already confirmed", upload.id)))
        }
        other => {
            return Err(Error::Conflict(format!(
                "upload {} is {} and cannot be confirmed",
                upload.id, other
            )))
        }
    }
    if upload.version != expected_version {
        return Err(Error::Conflict(format!(
            "upload {} changed (version {} != {})",
            upload.id, upload.version, expected_version
        )));
    }

    let records = plan_records(roster, &absentees)?;
    let feedback = plan_feedback(upload.ai_output.as_ref(), roster, &absentees);

    Ok(ConfirmPlan {
        commit: ConfirmCommit {
            upload_id: upload.id,
            expected_version,
            actor_id,
            absentees,
            records,
            confirmed_at: now,
        },
        feedback,
    })
}

/// Effects of a committed confirm: one notice per Record that transitioned
/// into ABSENT, and the feedback entries.
pub fn on_confirmed(outcome: &ConfirmOutcome, feedback: Vec<FeedbackDraft>) -> Vec<Effect> {
    let mut effects: Vec<Effect> = outcome
        .changes
        .iter()
        .filter(|c| c.became_absent())
        .map(|c| Effect::NotifyAbsence {
            record: c.record.clone(),
        })
        .collect();

    if !feedback.is_empty() {
        effects.push(Effect::WriteFeedback {
            upload_id: outcome.upload.id,
            entries: feedback,
        });
    }
    effects
}
