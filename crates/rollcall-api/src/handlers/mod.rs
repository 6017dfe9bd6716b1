//! HTTP handler modules for rollcall-api.

pub mod records;
pub mod uploads;

use axum::{extract::State, response::IntoResponse, Json};

use crate::AppState;

/// Liveness plus queue depth.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let queue = state.db.jobs.queue_stats().await.ok();
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "queue": queue,
    }))
}
