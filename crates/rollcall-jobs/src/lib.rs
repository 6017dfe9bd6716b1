//! # rollcall-jobs
//!
//! Background recognition for submitted register photos.
//!
//! This crate provides:
//! - Image quality pre-check
//! - Grid reconstruction from positioned OCR tokens
//! - Three-tier roster matching and confidence scoring
//! - The recognition job handler and its failure policy
//! - Retry scheduling on an injectable clock
//! - A concurrent job worker with event broadcasting and graceful shutdown
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use rollcall_db::Database;
//! use rollcall_inference::{HttpOcrBackend, LlmReasoningService, OllamaBackend};
//! use rollcall_jobs::{RecognitionHandler, RetryScheduler, WorkerBuilder, WorkerConfig};
//!
//! let db = Database::connect("postgres://...", "/var/lib/rollcall/blobs").await?;
//! let scheduler = RetryScheduler::system(db.jobs.clone());
//! let handler = RecognitionHandler::new(
//!     db.clone(),
//!     Arc::new(HttpOcrBackend::from_env()),
//!     Arc::new(LlmReasoningService::new(Arc::new(OllamaBackend::from_env()))),
//!     scheduler.clone(),
//! );
//!
//! let handle = WorkerBuilder::new(db)
//!     .with_config(WorkerConfig::from_env())
//!     .with_handler(handler)
//!     .with_scheduler(scheduler)
//!     .build()
//!     .start();
//!
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! handle.shutdown().await?;
//! ```

pub mod grid;
pub mod handler;
pub mod matcher;
pub mod pipeline;
pub mod precheck;
pub mod scheduler;
pub mod scorer;
pub mod worker;

// Re-export core types
pub use rollcall_core::*;

pub use handler::{JobContext, JobHandler, JobResult, NoOpHandler};
pub use matcher::{MatchOutcome, MatchSession, RosterMatcher};
pub use pipeline::RecognitionHandler;
pub use precheck::{ImageMetrics, ImagePrecheck, PrecheckConfig, PrecheckOutcome};
pub use scheduler::{ManualClock, RetryScheduler};
pub use worker::{JobWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};
