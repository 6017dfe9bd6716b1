//! # rollcall-core
//!
//! Core types, traits, and abstractions for the rollcall attendance
//! recognition pipeline.
//!
//! This crate provides the data model, the error taxonomy, the repository and
//! collaborator traits, and the pure Upload state machine that the other
//! rollcall crates build on.

pub mod config;
pub mod defaults;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod materialize;
pub mod models;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use config::{MatchConfig, PipelineConfig, RetryPolicy};
pub use error::{Error, Result};
pub use lifecycle::{Effect, Transition};
pub use models::*;
pub use traits::*;
pub use uuid_utils::{extract_timestamp, is_v7, new_v7};
