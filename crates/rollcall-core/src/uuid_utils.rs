//! UUID v7 utilities for time-ordered identifiers.
//!
//! Uploads, records, feedback entries and jobs all use UUIDv7 so that
//! ordering by id matches creation order, which keeps audit listings cheap.

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
///
/// # Example
///
/// ```
/// use rollcall_core::uuid_utils::new_v7;
///
/// let id = new_v7();
/// assert_eq!(id.get_version_num(), 7);
/// ```
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

/// Check whether a UUID is version 7.
pub fn is_v7(id: &Uuid) -> bool {
    id.get_version_num() == 7
}

/// Extract the embedded creation timestamp from a UUIDv7.
///
/// Returns `None` for any other version.
pub fn extract_timestamp(id: &Uuid) -> Option<DateTime<Utc>> {
    if !is_v7(id) {
        return None;
    }
    let bytes = id.as_bytes();
    let mut millis: u64 = 0;
    for b in &bytes[0..6] {
        millis = (millis << 8) | *b as u64;
    }
    Utc.timestamp_millis_opt(millis as i64).single()
}
