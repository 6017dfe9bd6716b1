//! Structured logging schema and field name constants for rollcall.
//!
//! All crates use these constants for consistent structured logging fields so
//! log aggregation can query by the same names across every subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Consistency violations, failed persistence; operator attention |
//! | WARN  | Recoverable issue, fallback applied (reasoning down, notify failed) |
//! | INFO  | Upload lifecycle transitions, worker start/stop |
//! | DEBUG | Matcher tier outcomes, scores, backoff decisions |
//! | TRACE | Per-row and per-token detail |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "api", "db", "inference", "jobs"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "precheck", "grid", "matcher", "worker", "attendance"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "claim", "extract", "reason_match", "confirm"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Upload UUID being operated on.
pub const UPLOAD_ID: &str = "upload_id";

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// School identifier from the tenant context.
pub const SCHOOL_ID: &str = "school_id";

/// Class identifier.
pub const CLASS_ID: &str = "class_id";

/// Acting user from the tenant context.
pub const ACTOR_ID: &str = "actor_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Processing attempt number for an Upload.
pub const ATTEMPT: &str = "attempt";

/// Number of grid rows reconstructed.
pub const ROW_COUNT: &str = "row_count";

/// Number of roster students considered.
pub const ROSTER_SIZE: &str = "roster_size";

/// Normalized confidence score.
pub const CONFIDENCE: &str = "confidence";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
