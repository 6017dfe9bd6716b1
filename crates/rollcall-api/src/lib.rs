//! # rollcall-api
//!
//! HTTP surface of the attendance pipeline.
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | GET  | `/health` | liveness and queue depth |
//! | POST | `/api/v1/uploads` | submit a register photo (multipart) |
//! | GET  | `/api/v1/uploads?class_id&date` | every attempt for a register |
//! | GET  | `/api/v1/uploads/:id` | one Upload |
//! | PUT  | `/api/v1/uploads/:id/review` | save the reviewer's absentee list |
//! | POST | `/api/v1/uploads/:id/confirm` | confirm and write Records |
//! | POST | `/api/v1/uploads/:id/reprocess` | new attempt from the same photo |
//! | GET  | `/api/v1/records?class_id&date` | committed Records |
//!
//! Every `/api/v1` route requires the `X-School-Id` and `X-Actor-Id`
//! headers set by the identity layer.

pub mod error;
pub mod handlers;
pub mod notify;
pub mod services;
pub mod tenant;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use rollcall_db::Database;

pub use error::ApiError;
pub use services::{AttendanceService, Confirmation};
pub use tenant::Tenant;

/// Multipart framing allowance on top of the image size limit.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub attendance: Arc<AttendanceService>,
}

impl AppState {
    pub fn new(db: Database, attendance: AttendanceService) -> Self {
        Self {
            db,
            attendance: Arc::new(attendance),
        }
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let body_limit = state.attendance.max_image_bytes() + MULTIPART_OVERHEAD;

    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/api/v1/uploads",
            post(handlers::uploads::submit_upload).get(handlers::uploads::list_uploads),
        )
        .route("/api/v1/uploads/:id", get(handlers::uploads::get_upload))
        .route("/api/v1/uploads/:id/review", put(handlers::uploads::save_review))
        .route(
            "/api/v1/uploads/:id/confirm",
            post(handlers::uploads::confirm_upload),
        )
        .route(
            "/api/v1/uploads/:id/reprocess",
            post(handlers::uploads::reprocess_upload),
        )
        .route("/api/v1/records", get(handlers::records::list_records))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}
