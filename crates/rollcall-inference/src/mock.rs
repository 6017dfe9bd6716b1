//! Mock recognition backends for deterministic testing.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rollcall_inference::mock::{MockOcrBackend, MockReasoningService, MockFailure};
//!
//! let ocr = MockOcrBackend::new().with_output(output);
//! let reasoning = MockReasoningService::new().with_failure(MockFailure::Transient("down".into()));
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rollcall_core::{Error, GridSnapshot, MarkLegend, OcrOutput, Result, RosterEntry};

use crate::ocr::OcrBackend;
use crate::reasoning::ReasoningService;
use crate::schema::{ReasoningEntry, ReasoningResponse};

/// Scripted failure. `Error` is not `Clone`, so mocks store this instead.
#[derive(Debug, Clone, PartialEq)]
pub enum MockFailure {
    Transient(String),
    Parse(String),
    InputDefect(String),
}

impl MockFailure {
    fn to_error(&self) -> Error {
        match self {
            MockFailure::Transient(m) => Error::TransientService(m.clone()),
            MockFailure::Parse(m) => Error::ParseFailure(m.clone()),
            MockFailure::InputDefect(m) => Error::InputDefect(m.clone()),
        }
    }
}

/// Mock OCR backend.
///
/// Scripted outcomes are consumed in order; once exhausted the default
/// output is returned.
#[derive(Clone, Default)]
pub struct MockOcrBackend {
    default_output: OcrOutput,
    script: Arc<Mutex<VecDeque<std::result::Result<OcrOutput, MockFailure>>>>,
    latency: Duration,
    calls: Arc<Mutex<usize>>,
}

impl MockOcrBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output returned once the script is exhausted.
    pub fn with_output(mut self, output: OcrOutput) -> Self {
        self.default_output = output;
        self
    }

    /// Queue a failure for the next call.
    pub fn then_fail(self, failure: MockFailure) -> Self {
        self.script.lock().unwrap().push_back(Err(failure));
        self
    }

    /// Queue a successful output for the next call.
    pub fn then_return(self, output: OcrOutput) -> Self {
        self.script.lock().unwrap().push_back(Ok(output));
        self
    }

    /// Simulated latency for every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl OcrBackend for MockOcrBackend {
    async fn extract_text(&self, _image_data: &[u8], _mime_type: &str) -> Result<OcrOutput> {
        *self.calls.lock().unwrap() += 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(output)) => Ok(output),
            Some(Err(failure)) => Err(failure.to_error()),
            None => Ok(self.default_output.clone()),
        }
    }

    fn name(&self) -> &str {
        "mock-ocr"
    }
}

/// Mock reasoning service.
#[derive(Clone)]
pub struct MockReasoningService {
    outcome: std::result::Result<ReasoningResponse, MockFailure>,
    latency: Duration,
    calls: Arc<Mutex<usize>>,
}

impl Default for MockReasoningService {
    fn default() -> Self {
        Self {
            outcome: Ok(ReasoningResponse::Valid(vec![])),
            latency: Duration::ZERO,
            calls: Arc::new(Mutex::new(0)),
        }
    }
}

impl MockReasoningService {
    /// Service that answers with no entries.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(mut self, entries: Vec<ReasoningEntry>) -> Self {
        self.outcome = Ok(ReasoningResponse::Valid(entries));
        self
    }

    pub fn with_schema_error(mut self, reason: impl Into<String>) -> Self {
        self.outcome = Ok(ReasoningResponse::SchemaError(reason.into()));
        self
    }

    pub fn with_failure(mut self, failure: MockFailure) -> Self {
        self.outcome = Err(failure);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl ReasoningService for MockReasoningService {
    async fn reason_match(
        &self,
        _grid: &GridSnapshot,
        _roster: &[RosterEntry],
        _legend: &MarkLegend,
    ) -> Result<ReasoningResponse> {
        *self.calls.lock().unwrap() += 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match &self.outcome {
            Ok(response) => Ok(response.clone()),
            Err(failure) => Err(failure.to_error()),
        }
    }
}
