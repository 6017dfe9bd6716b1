//! Reasoning-service client for the second matcher tier.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use rollcall_core::{AttendanceStatus, GridSnapshot, MarkLegend, Result, RosterEntry};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::generation::GenerationBackend;
use crate::schema::{parse_response, ReasoningResponse};

/// Resolves grid rows to roster students using an external reasoning model.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    /// Ask the service to match rows to students.
    ///
    /// Transport failures are errors; a malformed answer is
    /// `Ok(ReasoningResponse::SchemaError)`.
    async fn reason_match(
        &self,
        grid: &GridSnapshot,
        roster: &[RosterEntry],
        legend: &MarkLegend,
    ) -> Result<ReasoningResponse>;
}

const SYSTEM_PROMPT: &str = "You match rows of a handwritten class attendance register to students on a roster. \
Each row has a reference like \"r0\", an optional roll number, an optional name and an optional mark symbol. \
Use the legend to interpret marks. Answer with JSON only, in the form \
{\"entries\": [{\"input_ref\": \"r0\", \"student_id\": 12, \"mark\": \"ABSENT\", \"confidence\": 0.9}]}. \
Use null for student_id when no roster student fits. Only use student ids from the roster. \
confidence is your certainty between 0 and 1.";

/// [`ReasoningService`] backed by a generation model.
pub struct LlmReasoningService {
    backend: Arc<dyn GenerationBackend>,
}

impl LlmReasoningService {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self { backend }
    }

    /// User prompt containing the grid, roster and legend as JSON.
    pub fn build_prompt(grid: &GridSnapshot, roster: &[RosterEntry], legend: &MarkLegend) -> String {
        let rows: Vec<_> = grid
            .rows
            .iter()
            .map(|r| {
                json!({
                    "ref": r.input_ref(),
                    "roll": r.roll,
                    "name": r.name,
                    "mark": r.symbol,
                })
            })
            .collect();
        let students: Vec<_> = roster
            .iter()
            .map(|s| {
                json!({
                    "student_id": s.student_id,
                    "roll_number": s.roll_number,
                    "name": s.display_name,
                })
            })
            .collect();
        let mut legend_entries: Vec<_> = legend
            .entries()
            .map(|(symbol, status)| {
                let meaning = match status {
                    AttendanceStatus::Absent => "ABSENT",
                    AttendanceStatus::Present => "PRESENT",
                };
                (symbol.clone(), meaning)
            })
            .collect();
        legend_entries.sort();
        let legend_json: serde_json::Map<_, _> = legend_entries
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::from(v)))
            .collect();

        format!(
            "Legend:\n{}\n\nRoster:\n{}\n\nRegister rows:\n{}",
            serde_json::Value::Object(legend_json),
            serde_json::Value::Array(students),
            serde_json::Value::Array(rows),
        )
    }
}

#[async_trait]
impl ReasoningService for LlmReasoningService {
    #[instrument(skip_all, fields(subsystem = "inference", component = "reasoning", op = "reason_match", model = %self.backend.model_name(), row_count = grid.rows.len(), roster_size = roster.len()))]
    async fn reason_match(
        &self,
        grid: &GridSnapshot,
        roster: &[RosterEntry],
        legend: &MarkLegend,
    ) -> Result<ReasoningResponse> {
        let start = Instant::now();
        let prompt = Self::build_prompt(grid, roster, legend);
        let raw = self
            .backend
            .generate_json_with_system(SYSTEM_PROMPT, &prompt)
            .await?;

        let parsed = parse_response(&raw);
        match &parsed {
            ReasoningResponse::Valid(entries) => debug!(
                entry_count = entries.len(),
                duration_ms = start.elapsed().as_millis() as u64,
                "Reasoning response accepted"
            ),
            ReasoningResponse::SchemaError(reason) => warn!(
                error = %reason,
                duration_ms = start.elapsed().as_millis() as u64,
                "Reasoning response rejected by schema"
            ),
        }
        Ok(parsed)
    }
}
