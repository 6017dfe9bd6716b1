//! Error types for rollcall.
//!
//! The first group of variants is the pipeline taxonomy: how a failure is
//! classified decides whether the Upload is retried, failed, or the caller
//! is told to back off. The second group covers ambient failures.

use thiserror::Error;

/// Result type alias using rollcall's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for rollcall operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The submitted image is unusable (resolution, blur, skew, undecodable).
    /// Terminal; never charged to the retry budget.
    #[error("InputDefect: {0}")]
    InputDefect(String),

    /// An external recognition service was unavailable, timed out, or hit a quota.
    /// Retried with backoff up to the attempt cap.
    #[error("TransientServiceError: {0}")]
    TransientService(String),

    /// A service answered but nothing usable could be parsed from it. Terminal.
    #[error("ParseFailure: {0}")]
    ParseFailure(String),

    /// Duplicate or stale confirm, stale review edit, or an illegal transition.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A materialization invariant would be broken. The transaction is aborted.
    #[error("ConsistencyViolation: {0}")]
    ConsistencyViolation(String),

    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Upload not found
    #[error("Upload not found: {0}")]
    UploadNotFound(uuid::Uuid),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Authenticated but not allowed to touch this school's data
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the pipeline should retry the attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientService(_))
    }

    /// Whether this error should surface as a terminal FAILED Upload.
    pub fn is_terminal_for_upload(&self) -> bool {
        !self.is_retryable()
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            Error::TransientService(e.to_string())
        } else {
            Error::Request(e.to_string())
        }
    }
}
