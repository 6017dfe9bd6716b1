//! # rollcall-inference
//!
//! External recognition services for rollcall.
//!
//! This crate provides:
//! - OCR backend trait and HTTP implementation
//! - Generation backend trait and Ollama implementation (feature `ollama`)
//! - Reasoning matcher client with strict response validation
//! - HTTP status classification into retryable and terminal failures
//! - Mock backends for tests (feature `mock`)
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rollcall_inference::{HttpOcrBackend, LlmReasoningService, OllamaBackend};
//!
//! let ocr = HttpOcrBackend::from_env();
//! let reasoning = LlmReasoningService::new(Arc::new(OllamaBackend::from_env()));
//! ```

pub mod error;
pub mod generation;
pub mod ocr;
pub mod reasoning;
pub mod schema;

#[cfg(feature = "ollama")]
pub mod ollama;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use error::{to_pipeline_error, ServiceErrorCode};
pub use generation::GenerationBackend;
pub use ocr::{HttpOcrBackend, OcrBackend};
pub use reasoning::{LlmReasoningService, ReasoningService};
pub use schema::{parse_response, ReasoningEntry, ReasoningResponse};

#[cfg(feature = "ollama")]
pub use ollama::OllamaBackend;
