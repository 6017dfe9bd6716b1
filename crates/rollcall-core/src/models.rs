//! Core data models for rollcall.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// =============================================================================
// TENANT CONTEXT
// =============================================================================

/// Opaque request scope handed over by the identity layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub school_id: i64,
    pub actor_id: i64,
}

impl TenantContext {
    pub fn new(school_id: i64, actor_id: i64) -> Self {
        Self {
            school_id,
            actor_id,
        }
    }
}

/// The (school, class, date) triple an Upload attempt is recognized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadKey {
    pub school_id: i64,
    pub class_id: i64,
    pub date: NaiveDate,
}

// =============================================================================
// ENUMS
// =============================================================================

/// Lifecycle state of an Upload.
///
/// `Confirmed`, `Failed` and `Superseded` are terminal: once reached, the row
/// is never mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Processing,
    ReviewRequired,
    Confirmed,
    Failed,
    Superseded,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadStatus::Confirmed | UploadStatus::Failed | UploadStatus::Superseded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Processing => "processing",
            UploadStatus::ReviewRequired => "review_required",
            UploadStatus::Confirmed => "confirmed",
            UploadStatus::Failed => "failed",
            UploadStatus::Superseded => "superseded",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(UploadStatus::Processing),
            "review_required" => Ok(UploadStatus::ReviewRequired),
            "confirmed" => Ok(UploadStatus::Confirmed),
            "failed" => Ok(UploadStatus::Failed),
            "superseded" => Ok(UploadStatus::Superseded),
            other => Err(Error::Serialization(format!("unknown upload status: {}", other))),
        }
    }
}

/// Committed or proposed attendance for one student.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
        }
    }
}

impl FromStr for AttendanceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Ok(AttendanceStatus::Present),
            "absent" => Ok(AttendanceStatus::Absent),
            other => Err(Error::Serialization(format!(
                "unknown attendance status: {}",
                other
            ))),
        }
    }
}

/// Where a Record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordSource {
    Recognized,
    Manual,
}

impl RecordSource {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordSource::Recognized => "recognized",
            RecordSource::Manual => "manual",
        }
    }
}

impl FromStr for RecordSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recognized" => Ok(RecordSource::Recognized),
            "manual" => Ok(RecordSource::Manual),
            other => Err(Error::Serialization(format!("unknown record source: {}", other))),
        }
    }
}

/// Which matcher tier resolved a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    ExactRoll,
    Reasoning,
    FuzzyName,
}

impl MatchMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchMethod::ExactRoll => "exact_roll",
            MatchMethod::Reasoning => "reasoning",
            MatchMethod::FuzzyName => "fuzzy_name",
        }
    }
}

impl FromStr for MatchMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact_roll" => Ok(MatchMethod::ExactRoll),
            "reasoning" => Ok(MatchMethod::Reasoning),
            "fuzzy_name" => Ok(MatchMethod::FuzzyName),
            other => Err(Error::Serialization(format!("unknown match method: {}", other))),
        }
    }
}

// =============================================================================
// EXTRACTION
// =============================================================================

/// Axis-aligned box in page pixel coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center_x(&self) -> f32 {
        self.x + self.width / 2.0
    }

    pub fn center_y(&self) -> f32 {
        self.y + self.height / 2.0
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    /// Smallest box containing both.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        BoundingBox {
            x,
            y,
            width: self.right().max(other.right()) - x,
            height: self.bottom().max(other.bottom()) - y,
        }
    }
}

/// One recognized token from the OCR service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrToken {
    pub text: String,
    pub bbox: BoundingBox,
    /// Service-reported certainty in [0,1], when the service provides one.
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// Raw OCR service output for one image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrOutput {
    pub raw_text: String,
    pub tokens: Vec<OcrToken>,
    /// Page width in pixels, when known. Needed for configured column layouts.
    #[serde(default)]
    pub page_width: Option<f32>,
}

/// A reconstructed register row: roll number, name and mark cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridRow {
    /// Position in the grid, top to bottom. Used as the row reference everywhere.
    pub index: usize,
    pub roll: Option<String>,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub bbox: BoundingBox,
    /// Mean OCR confidence of the tokens in this row.
    pub ocr_confidence: Option<f32>,
}

impl GridRow {
    /// Stable reference string handed to the reasoning service.
    pub fn input_ref(&self) -> String {
        format!("r{}", self.index)
    }
}

/// How column boundaries were determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnSource {
    Configured,
    Clustered,
}

/// Structured grid snapshot stored on the Upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub rows: Vec<GridRow>,
    pub column_source: ColumnSource,
    /// Extraction quality signal in [0,1].
    pub extraction_quality: f64,
}

// =============================================================================
// ROSTER
// =============================================================================

/// One active student as of the register date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub student_id: i64,
    pub roll_number: String,
    pub display_name: String,
}

impl RosterEntry {
    pub fn new(student_id: i64, roll_number: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            student_id,
            roll_number: roll_number.into(),
            display_name: display_name.into(),
        }
    }
}

// =============================================================================
// MATCHING OUTPUT
// =============================================================================

/// A candidate absentee resolved to a roster student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedCandidate {
    pub student_id: i64,
    pub row_index: usize,
    pub method: MatchMethod,
    pub mark: AttendanceStatus,
    pub confidence: f64,
}

/// Why an absent-marked row could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedReason {
    /// No tier produced a match.
    NoMatch,
    /// Fuzzy tier found near-equal candidates and refused to pick.
    Ambiguous,
    /// Row has neither a roll number nor a name.
    Unreadable,
}

/// An absent-marked row left for human resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmatchedCandidate {
    pub row_index: usize,
    pub roll: Option<String>,
    pub name: Option<String>,
    pub reason: UnmatchedReason,
}

/// Everything the recognition step proposes for review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiOutput {
    pub matched: Vec<MatchedCandidate>,
    pub unmatched: Vec<UnmatchedCandidate>,
    pub confidence: f64,
    /// Drives the "likely correct" highlight in review. Never auto-confirms.
    pub likely_correct: bool,
    pub candidates_considered: usize,
    pub notes: Vec<String>,
}

impl AiOutput {
    /// Students the recognition step proposes as absent.
    pub fn proposed_absentees(&self) -> BTreeSet<i64> {
        self.matched
            .iter()
            .filter(|m| m.mark == AttendanceStatus::Absent)
            .map(|m| m.student_id)
            .collect()
    }

    pub fn method_for(&self, student_id: i64) -> Option<MatchMethod> {
        self.matched
            .iter()
            .find(|m| m.student_id == student_id)
            .map(|m| m.method)
    }
}

/// The reviewer's working absentee list. Plain data, versioned on the Upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewDraft {
    pub absentees: BTreeSet<i64>,
}

impl ReviewDraft {
    pub fn from_ai(ai: &AiOutput) -> Self {
        Self {
            absentees: ai.proposed_absentees(),
        }
    }

    pub fn mark_absent(&mut self, student_id: i64) {
        self.absentees.insert(student_id);
    }

    pub fn mark_present(&mut self, student_id: i64) {
        self.absentees.remove(&student_id);
    }
}

/// What a successful recognition attempt writes back to the Upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub raw_text: String,
    pub grid: GridSnapshot,
    pub ai_output: AiOutput,
}

// =============================================================================
// UPLOAD / RECORD / FEEDBACK
// =============================================================================

/// One register-image recognition attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upload {
    pub id: Uuid,
    pub school_id: i64,
    pub class_id: i64,
    pub date: NaiveDate,
    pub image_ref: String,
    pub status: UploadStatus,
    pub raw_text: Option<String>,
    pub grid: Option<GridSnapshot>,
    pub ai_output: Option<AiOutput>,
    pub review: Option<ReviewDraft>,
    pub error_reason: Option<String>,
    pub attempt_count: i32,
    /// Optimistic version, incremented on every mutation.
    pub version: i64,
    /// Job currently holding the single-flight claim.
    pub claimed_by: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Upload this attempt replaced, if any.
    pub supersedes: Option<Uuid>,
    pub created_by: i64,
    pub confirmed_by: Option<i64>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Upload {
    pub fn key(&self) -> UploadKey {
        UploadKey {
            school_id: self.school_id,
            class_id: self.class_id,
            date: self.date,
        }
    }
}

/// Request to create a new Upload attempt.
#[derive(Debug, Clone)]
pub struct CreateUploadRequest {
    pub key: UploadKey,
    pub image_ref: String,
    pub created_by: i64,
}

/// Committed attendance for one student on one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub school_id: i64,
    pub class_id: i64,
    pub student_id: i64,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub source: RecordSource,
    pub upload_id: Option<Uuid>,
    pub notification_sent: bool,
    pub notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Record as planned by the materializer, before it is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDraft {
    pub student_id: i64,
    pub status: AttendanceStatus,
}

/// What happened to one Record during a confirm transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordChange {
    pub record: Record,
    /// Status before this confirm; `None` when the Record was created.
    pub previous_status: Option<AttendanceStatus>,
}

impl RecordChange {
    /// Whether this change is a transition into ABSENT.
    pub fn became_absent(&self) -> bool {
        self.record.status == AttendanceStatus::Absent
            && self.previous_status != Some(AttendanceStatus::Absent)
    }
}

/// Append-only human correction of an AI proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: Uuid,
    pub upload_id: Uuid,
    pub student_id: Option<i64>,
    pub ai_status: AttendanceStatus,
    pub human_status: AttendanceStatus,
    pub match_method: Option<MatchMethod>,
    pub created_at: DateTime<Utc>,
}

/// Feedback entry before an id and timestamp are assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackDraft {
    pub student_id: Option<i64>,
    pub ai_status: AttendanceStatus,
    pub human_status: AttendanceStatus,
    pub match_method: Option<MatchMethod>,
}

// =============================================================================
// SCHOOL REGISTER CONFIGURATION
// =============================================================================

/// Per-school mapping of raw mark symbols to attendance.
///
/// Symbols are compared trimmed and upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "HashMap<String, AttendanceStatus>", into = "HashMap<String, AttendanceStatus>")]
pub struct MarkLegend {
    symbols: HashMap<String, AttendanceStatus>,
}

impl MarkLegend {
    pub fn normalize_symbol(symbol: &str) -> String {
        symbol.trim().to_uppercase()
    }

    pub fn classify(&self, symbol: &str) -> Option<AttendanceStatus> {
        self.symbols.get(&Self::normalize_symbol(symbol)).copied()
    }

    pub fn is_absent(&self, symbol: Option<&str>) -> bool {
        symbol.and_then(|s| self.classify(s)) == Some(AttendanceStatus::Absent)
    }

    /// Whether a token looks like a mark symbol under this legend.
    pub fn recognizes(&self, symbol: &str) -> bool {
        self.classify(symbol).is_some()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &AttendanceStatus)> {
        self.symbols.iter()
    }
}

impl Default for MarkLegend {
    fn default() -> Self {
        let mut symbols = HashMap::new();
        for s in ["A", "AB", "X", "✗", "✘", "O"] {
            symbols.insert(s.to_string(), AttendanceStatus::Absent);
        }
        for s in ["P", "✓", "✔", "/", "."] {
            symbols.insert(s.to_string(), AttendanceStatus::Present);
        }
        Self { symbols }
    }
}

impl From<HashMap<String, AttendanceStatus>> for MarkLegend {
    fn from(raw: HashMap<String, AttendanceStatus>) -> Self {
        Self {
            symbols: raw
                .into_iter()
                .map(|(k, v)| (Self::normalize_symbol(&k), v))
                .collect(),
        }
    }
}

impl From<MarkLegend> for HashMap<String, AttendanceStatus> {
    fn from(legend: MarkLegend) -> Self {
        legend.symbols
    }
}

/// Horizontal span of a column as a fraction of page width.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColumnRange {
    pub start: f32,
    pub end: f32,
}

impl ColumnRange {
    pub fn contains(&self, fraction: f32) -> bool {
        fraction >= self.start && fraction < self.end
    }
}

/// Expected register column layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterLayout {
    pub roll: Option<ColumnRange>,
    pub name: Option<ColumnRange>,
    pub mark: Option<ColumnRange>,
}

/// Read-only per-school input to extraction and matching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchoolRegisterConfig {
    #[serde(default)]
    pub legend: MarkLegend,
    #[serde(default)]
    pub layout: Option<RegisterLayout>,
}

// =============================================================================
// JOB QUEUE
// =============================================================================

/// Status of a processing job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::Serialization(format!("unknown job status: {}", other))),
        }
    }
}

/// One queued processing attempt for one Upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub upload_id: Uuid,
    pub status: JobStatus,
    /// Upload attempt number this job runs (1-based).
    pub attempt: i32,
    pub run_after: DateTime<Utc>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Queue statistics summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!UploadStatus::Processing.is_terminal());
        assert!(!UploadStatus::ReviewRequired.is_terminal());
        assert!(UploadStatus::Confirmed.is_terminal());
        assert!(UploadStatus::Failed.is_terminal());
        assert!(UploadStatus::Superseded.is_terminal());
    }

    #[test]
    fn test_upload_status_str_round_trip() {
        for status in [
            UploadStatus::Processing,
            UploadStatus::ReviewRequired,
            UploadStatus::Confirmed,
            UploadStatus::Failed,
            UploadStatus::Superseded,
        ] {
            assert_eq!(status.as_str().parse::<UploadStatus>().unwrap(), status);
        }
        assert!("pending".parse::<UploadStatus>().is_err());
    }

    #[test]
    fn test_upload_status_serializes_screaming() {
        let json = serde_json::to_string(&UploadStatus::ReviewRequired).unwrap();
        assert_eq!(json, "\"REVIEW_REQUIRED\"");
    }

    #[test]
    fn test_legend_is_case_and_whitespace_insensitive() {
        let legend = MarkLegend::default();
        assert_eq!(legend.classify(" a "), Some(AttendanceStatus::Absent));
        assert_eq!(legend.classify("ab"), Some(AttendanceStatus::Absent));
        assert_eq!(legend.classify("p"), Some(AttendanceStatus::Present));
        assert_eq!(legend.classify("?"), None);
        assert!(legend.is_absent(Some("A")));
        assert!(!legend.is_absent(None));
    }

    #[test]
    fn test_legend_deserializes_and_normalizes_keys() {
        let legend: MarkLegend = serde_json::from_str(r#"{"a": "ABSENT", " l ": "ABSENT"}"#).unwrap();
        assert_eq!(legend.classify("A"), Some(AttendanceStatus::Absent));
        assert_eq!(legend.classify("L"), Some(AttendanceStatus::Absent));
        assert_eq!(legend.classify("P"), None);
    }

    #[test]
    fn test_bbox_union() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 5.0, 10.0, 10.0);
        let u = a.union(&b);
        assert_eq!(u, BoundingBox::new(0.0, 0.0, 30.0, 15.0));
        assert_eq!(u.center_x(), 15.0);
    }

    #[test]
    fn test_proposed_absentees_ignores_present_marks() {
        let ai = AiOutput {
            matched: vec![
                MatchedCandidate {
                    student_id: 1,
                    row_index: 0,
                    method: MatchMethod::ExactRoll,
                    mark: AttendanceStatus::Absent,
                    confidence: 1.0,
                },
                MatchedCandidate {
                    student_id: 2,
                    row_index: 1,
                    method: MatchMethod::Reasoning,
                    mark: AttendanceStatus::Present,
                    confidence: 0.9,
                },
            ],
            unmatched: vec![],
            confidence: 0.9,
            likely_correct: true,
            candidates_considered: 2,
            notes: vec![],
        };
        assert_eq!(ai.proposed_absentees(), BTreeSet::from([1]));
        assert_eq!(ai.method_for(2), Some(MatchMethod::Reasoning));
        assert_eq!(ai.method_for(3), None);
    }

    #[test]
    fn test_record_change_became_absent() {
        let now = Utc::now();
        let record = Record {
            id: Uuid::new_v4(),
            school_id: 1,
            class_id: 1,
            student_id: 1,
            date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            status: AttendanceStatus::Absent,
            source: RecordSource::Recognized,
            upload_id: None,
            notification_sent: false,
            notified_at: None,
            created_at: now,
            updated_at: now,
        };
        let created = RecordChange {
            record: record.clone(),
            previous_status: None,
        };
        let unchanged = RecordChange {
            record: record.clone(),
            previous_status: Some(AttendanceStatus::Absent),
        };
        let flipped = RecordChange {
            record,
            previous_status: Some(AttendanceStatus::Present),
        };
        assert!(created.became_absent());
        assert!(!unchanged.became_absent());
        assert!(flipped.became_absent());
    }
}
