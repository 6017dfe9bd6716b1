//! Centralized default constants for rollcall.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates read these instead of defining their own magic numbers; every
//! value here can be overridden through the environment variable named in
//! the owning config type.

// =============================================================================
// IMAGE PRE-CHECK
// =============================================================================

/// Minimum register photo width in pixels.
pub const PRECHECK_MIN_WIDTH: u32 = 800;

/// Minimum register photo height in pixels.
pub const PRECHECK_MIN_HEIGHT: u32 = 600;

/// Minimum Laplacian variance; anything below is treated as too blurry to read.
pub const PRECHECK_MIN_SHARPNESS: f32 = 60.0;

/// Maximum tolerated page rotation in degrees.
pub const PRECHECK_MAX_SKEW_DEGREES: f32 = 8.0;

/// Longest edge the pre-check analyses at. Larger photos are downscaled first.
pub const PRECHECK_ANALYSIS_EDGE: u32 = 1200;

/// Maximum accepted image payload.
pub const MAX_IMAGE_BYTES: usize = 25 * 1024 * 1024;

// =============================================================================
// MATCHING
// =============================================================================

/// Minimum normalized similarity for a fuzzy name match.
pub const MATCH_FUZZY_THRESHOLD: f64 = 0.80;

/// Minimum lead of the best fuzzy candidate over the second best.
pub const MATCH_FUZZY_MARGIN: f64 = 0.10;

/// Minimum self-reported confidence for a reasoning-tier match.
pub const MATCH_REASONING_MIN_CONFIDENCE: f64 = 0.50;

/// Score at which the review screen highlights an Upload as likely correct.
pub const REVIEW_LIKELY_CORRECT_THRESHOLD: f64 = 0.85;

// =============================================================================
// EXTERNAL SERVICES
// =============================================================================

/// Default OCR service base URL.
pub const OCR_URL: &str = "http://127.0.0.1:8090";

/// Per-call timeout for the OCR service in seconds.
pub const OCR_TIMEOUT_SECS: u64 = 30;

/// Default Ollama base URL (reasoning service).
pub const OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Default reasoning model name (Ollama).
pub const REASONING_MODEL: &str = "qwen3:8b";

/// Per-call timeout for the reasoning service in seconds.
pub const REASONING_TIMEOUT_SECS: u64 = 60;

/// Timeout for absence notification webhook delivery in seconds.
pub const NOTIFY_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Maximum processing attempts per Upload before it is externalized as FAILED.
pub const PIPELINE_MAX_ATTEMPTS: i32 = 3;

/// Backoff before the second attempt, in milliseconds. Doubles per attempt.
pub const RETRY_BASE_DELAY_MS: u64 = 2_000;

/// Upper bound for a single backoff delay, in milliseconds.
pub const RETRY_MAX_DELAY_MS: u64 = 60_000;

/// Default job worker poll interval in milliseconds when the queue is empty.
pub const JOB_POLL_INTERVAL_MS: u64 = 500;

/// Default maximum concurrent jobs per worker.
pub const JOB_MAX_CONCURRENT: usize = 4;

/// Whole-job execution timeout in seconds (covers all stages of one attempt).
pub const JOB_TIMEOUT_SECS: u64 = 300;

/// Claims older than this are considered orphaned by a crashed worker.
pub const JOB_STALE_CLAIM_SECS: u64 = 600;

/// How often the worker runs its cleanup pass, in seconds.
pub const JOB_CLEANUP_INTERVAL_SECS: u64 = 300;

/// Finished jobs retained by cleanup.
pub const JOB_RETENTION_COUNT: i64 = 10_000;

/// Broadcast capacity for worker events.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// DATABASE
// =============================================================================

/// Pool size when `DATABASE_MAX_CONNECTIONS` is unset.
pub const DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Connections kept free for API requests beyond the worker slots.
pub const DATABASE_API_HEADROOM: u32 = 4;

/// Seconds to wait for a pooled connection.
pub const DATABASE_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Seconds an idle connection is kept.
pub const DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Seconds before a connection is recycled.
pub const DATABASE_MAX_LIFETIME_SECS: u64 = 1800;

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 3000;

/// Default filesystem root for stored register images.
pub const BLOB_STORAGE_PATH: &str = "/var/lib/rollcall/blobs";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fuzzy_thresholds_are_normalized() {
        assert!(MATCH_FUZZY_THRESHOLD > 0.0 && MATCH_FUZZY_THRESHOLD <= 1.0);
        assert!(MATCH_FUZZY_MARGIN > 0.0 && MATCH_FUZZY_MARGIN < MATCH_FUZZY_THRESHOLD);
    }

    #[test]
    fn test_retry_delays_are_ordered() {
        assert!(RETRY_BASE_DELAY_MS <= RETRY_MAX_DELAY_MS);
        assert!(PIPELINE_MAX_ATTEMPTS >= 1);
    }

    #[test]
    fn test_default_pool_covers_default_workers() {
        assert!(DATABASE_MAX_CONNECTIONS as usize >= JOB_MAX_CONCURRENT);
    }

    #[test]
    fn test_service_timeouts_fit_inside_job_timeout() {
        assert!(OCR_TIMEOUT_SECS + REASONING_TIMEOUT_SECS < JOB_TIMEOUT_SECS);
    }
}
