//! HTTP status classification for external recognition services.
//!
//! Callers decide retryable vs terminal from the status code alone; the
//! response body is only carried along for the error message.

use rollcall_core::Error;

/// Service failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceErrorCode {
    /// Credentials rejected or endpoint missing. Needs operator action.
    Misconfigured,
    /// Request timed out at the service.
    Timeout,
    /// Quota or rate limit exceeded.
    RateLimited,
    /// The service could not decode the image.
    UnsupportedMedia,
    /// The service answered but found nothing usable.
    Unprocessable,
    /// Server-side failure.
    ServerError,
    /// Anything else.
    Unknown,
}

impl ServiceErrorCode {
    /// Determine the failure class from an HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 | 404 => Self::Misconfigured,
            408 | 504 => Self::Timeout,
            429 => Self::RateLimited,
            415 => Self::UnsupportedMedia,
            422 => Self::Unprocessable,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited | Self::ServerError)
    }
}

/// Convert a service failure into the pipeline error taxonomy.
pub fn to_pipeline_error(service: &str, status: u16, body: &str) -> Error {
    let code = ServiceErrorCode::from_status(status);
    let message = format!("{} returned {}: {}", service, status, truncate(body, 200));
    match code {
        ServiceErrorCode::Timeout | ServiceErrorCode::RateLimited | ServiceErrorCode::ServerError => {
            Error::TransientService(message)
        }
        ServiceErrorCode::UnsupportedMedia => Error::InputDefect("unreadable image".to_string()),
        ServiceErrorCode::Unprocessable => Error::ParseFailure(message),
        ServiceErrorCode::Misconfigured => Error::Config(message),
        ServiceErrorCode::Unknown => Error::Request(message),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
