//! Upload HTTP handlers.
//!
//! An Upload is one recognition attempt for a class register on a date.
//! Intake is asynchronous: the photo is stored, the Upload is created in
//! PROCESSING and a worker picks it up. Clients poll `GET /uploads/:id`
//! until it reaches REVIEW_REQUIRED or FAILED.

use std::collections::BTreeSet;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use rollcall_core::{Record, Upload};

use crate::tenant::Tenant;
use crate::{ApiError, AppState};

/// Class and date selecting a register.
#[derive(Debug, Deserialize)]
pub struct ClassDateQuery {
    pub class_id: i64,
    pub date: NaiveDate,
}

/// Reviewer edit of the absentee list.
#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    /// Version the reviewer last read.
    pub expected_version: i64,
    pub absentees: BTreeSet<i64>,
}

/// Confirm request.
#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub expected_version: i64,
    /// Final absentee list. Omit to confirm the saved review (or the AI
    /// proposal when nothing was saved).
    #[serde(default)]
    pub absentees: Option<BTreeSet<i64>>,
}

#[derive(Debug, Serialize)]
pub struct ConfirmResponse {
    pub upload: Upload,
    pub records: Vec<Record>,
    pub newly_absent: usize,
    pub notified: usize,
    pub departed: Vec<i64>,
}

/// Submit a register photo.
///
/// Multipart fields: `file` (image bytes), `class_id`, `date` (YYYY-MM-DD).
///
/// # Returns
/// - 202 Accepted with the new Upload in PROCESSING
/// - 400 Bad Request for missing fields or a non-image file
pub async fn submit_upload(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Upload>), ApiError> {
    let mut image: Option<Vec<u8>> = None;
    let mut class_id: Option<i64> = None;
    let mut date: Option<NaiveDate> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to read multipart: {}", e)))?
    {
        match field.name() {
            Some("file") => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read file: {}", e)))?;
                image = Some(data.to_vec());
            }
            Some("class_id") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read class_id: {}", e)))?;
                class_id = Some(
                    text.trim()
                        .parse()
                        .map_err(|_| ApiError::BadRequest(format!("invalid class_id: {}", text)))?,
                );
            }
            Some("date") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read date: {}", e)))?;
                date = Some(
                    text.trim()
                        .parse()
                        .map_err(|_| ApiError::BadRequest(format!("invalid date: {}", text)))?,
                );
            }
            _ => {}
        }
    }

    let image = image.ok_or_else(|| ApiError::BadRequest("missing file field".into()))?;
    let class_id = class_id.ok_or_else(|| ApiError::BadRequest("missing class_id field".into()))?;
    let date = date.ok_or_else(|| ApiError::BadRequest("missing date field".into()))?;
    if image.len() > state.attendance.max_image_bytes() {
        return Err(ApiError::PayloadTooLarge(format!(
            "image exceeds {} bytes",
            state.attendance.max_image_bytes()
        )));
    }

    let upload = state
        .attendance
        .submit(&tenant, class_id, date, &image)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(upload)))
}

/// Fetch one Upload with its recognition output and review draft.
pub async fn get_upload(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<Uuid>,
) -> Result<Json<Upload>, ApiError> {
    Ok(Json(state.attendance.get(&tenant, id).await?))
}

/// Audit listing: every attempt for a class register, oldest first.
pub async fn list_uploads(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Query(query): Query<ClassDateQuery>,
) -> Result<Json<Vec<Upload>>, ApiError> {
    let uploads = state
        .attendance
        .attempts(&tenant, query.class_id, query.date)
        .await?;
    Ok(Json(uploads))
}

/// Save the reviewer's absentee list.
///
/// # Returns
/// - 200 OK with the Upload at its new version
/// - 409 Conflict when `expected_version` is stale or the Upload is not in review
pub async fn save_review(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<Uuid>,
    Json(req): Json<ReviewRequest>,
) -> Result<Json<Upload>, ApiError> {
    let upload = state
        .attendance
        .save_review(&tenant, id, req.expected_version, req.absentees)
        .await?;
    Ok(Json(upload))
}

/// Confirm an Upload and write attendance Records.
///
/// # Returns
/// - 200 OK with the confirmed Upload and its Records. `departed` lists AI
///   proposed absentees dropped because they left the roster.
/// - 400 Bad Request when a supplied or saved absentee list names a student
///   not on the roster for the register date
/// - 409 Conflict on a repeated, concurrent or stale confirm
pub async fn confirm_upload(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<Uuid>,
    Json(req): Json<ConfirmRequest>,
) -> Result<Json<ConfirmResponse>, ApiError> {
    let confirmation = state
        .attendance
        .confirm(&tenant, id, req.expected_version, req.absentees)
        .await?;
    Ok(Json(ConfirmResponse {
        upload: confirmation.upload,
        records: confirmation.records,
        newly_absent: confirmation.newly_absent,
        notified: confirmation.notified,
        departed: confirmation.departed,
    }))
}

/// Start a new attempt from a FAILED or in-review Upload's image.
pub async fn reprocess_upload(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Upload>), ApiError> {
    let upload = state.attendance.reprocess(&tenant, id).await?;
    Ok((StatusCode::ACCEPTED, Json(upload)))
}
