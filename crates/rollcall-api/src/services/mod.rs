//! Service layer for rollcall-api.

pub mod attendance;

pub use attendance::{AttendanceService, Confirmation};
