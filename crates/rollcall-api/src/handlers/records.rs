//! Attendance record handlers.

use axum::{
    extract::{Query, State},
    Json,
};

use rollcall_core::Record;

use crate::handlers::uploads::ClassDateQuery;
use crate::tenant::Tenant;
use crate::{ApiError, AppState};

/// Committed Records for a class on a date.
pub async fn list_records(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Query(query): Query<ClassDateQuery>,
) -> Result<Json<Vec<Record>>, ApiError> {
    let records = state
        .attendance
        .records(&tenant, query.class_id, query.date)
        .await?;
    Ok(Json(records))
}
