//! Strict parsing of reasoning-service responses.
//!
//! The reasoning service is untrusted. Its output is parsed into a tagged
//! result: either every entry is well-formed, or the whole response is a
//! schema error. Whether referenced students exist is checked later against
//! the roster, not here.

use std::sync::OnceLock;

use regex::Regex;
use rollcall_core::AttendanceStatus;
use serde::Deserialize;

/// One validated reasoning entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ReasoningEntry {
    /// Row reference as sent in the prompt, e.g. `r3`.
    pub input_ref: String,
    pub student_id: Option<i64>,
    pub mark: AttendanceStatus,
    pub confidence: f64,
}

impl ReasoningEntry {
    /// Grid row index encoded in `input_ref`, if it has the expected shape.
    pub fn row_index(&self) -> Option<usize> {
        self.input_ref.trim().strip_prefix('r')?.parse().ok()
    }
}

/// Parsed reasoning output.
#[derive(Debug, Clone, PartialEq)]
pub enum ReasoningResponse {
    Valid(Vec<ReasoningEntry>),
    SchemaError(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope {
    Wrapped { entries: Vec<serde_json::Value> },
    Bare(Vec<serde_json::Value>),
}

#[derive(Deserialize)]
struct RawEntry {
    input_ref: String,
    student_id: Option<i64>,
    mark: String,
    confidence: f64,
}

fn code_fence() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").unwrap())
}

/// Parse raw model output.
///
/// Markdown code fences around the JSON are tolerated. Anything else that
/// deviates from the schema rejects the whole response.
pub fn parse_response(raw: &str) -> ReasoningResponse {
    let body = match code_fence().captures(raw).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => raw,
    }
    .trim();

    let envelope: Envelope = match serde_json::from_str(body) {
        Ok(e) => e,
        Err(e) => return ReasoningResponse::SchemaError(format!("not a valid envelope: {}", e)),
    };
    let values = match envelope {
        Envelope::Wrapped { entries } => entries,
        Envelope::Bare(entries) => entries,
    };

    let mut entries = Vec::with_capacity(values.len());
    for (i, value) in values.into_iter().enumerate() {
        let raw: RawEntry = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => return ReasoningResponse::SchemaError(format!("entry {}: {}", i, e)),
        };
        let mark = match raw.mark.parse::<AttendanceStatus>() {
            Ok(m) => m,
            Err(_) => {
                return ReasoningResponse::SchemaError(format!(
                    "entry {}: unknown mark {:?}",
                    i, raw.mark
                ))
            }
        };
        if !(0.0..=1.0).contains(&raw.confidence) {
            return ReasoningResponse::SchemaError(format!(
                "entry {}: confidence {} outside [0,1]",
                i, raw.confidence
            ));
        }
        if raw.input_ref.trim().is_empty() {
            return ReasoningResponse::SchemaError(format!("entry {}: empty input_ref", i));
        }
        entries.push(ReasoningEntry {
            input_ref: raw.input_ref,
            student_id: raw.student_id,
            mark,
            confidence: raw.confidence,
        });
    }

    ReasoningResponse::Valid(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wrapped_entries() {
        let raw = r#"{"entries": [{"input_ref": "r0", "student_id": 1, "mark": "ABSENT", "confidence": 0.9}]}"#;
        match parse_response(raw) {
            ReasoningResponse::Valid(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].student_id, Some(1));
                assert_eq!(entries[0].mark, AttendanceStatus::Absent);
                assert_eq!(entries[0].row_index(), Some(0));
            }
            other => panic!("expected valid, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_bare_array_in_code_fence() {
        let raw = "Here you go:\n```json\n[{\"input_ref\": \"r2\", \"student_id\": null, \"mark\": \"present\", \"confidence\": 0.4}]\n```";
        match parse_response(raw) {
            ReasoningResponse::Valid(entries) => {
                assert_eq!(entries[0].student_id, None);
                assert_eq!(entries[0].mark, AttendanceStatus::Present);
                assert_eq!(entries[0].row_index(), Some(2));
            }
            other => panic!("expected valid, got {:?}", other),
        }
    }

    #[test]
    fn test_string_student_id_is_schema_error() {
        let raw = r#"[{"input_ref": "r0", "student_id": "1", "mark": "ABSENT", "confidence": 0.9}]"#;
        assert!(matches!(parse_response(raw), ReasoningResponse::SchemaError(_)));
    }

    #[test]
    fn test_unknown_mark_is_schema_error() {
        let raw = r#"[{"input_ref": "r0", "student_id": 1, "mark": "LATE", "confidence": 0.9}]"#;
        assert!(matches!(parse_response(raw), ReasoningResponse::SchemaError(m) if m.contains("LATE")));
    }

    #[test]
    fn test_confidence_out_of_range_is_schema_error() {
        let raw = r#"[{"input_ref": "r0", "student_id": 1, "mark": "ABSENT", "confidence": 7}]"#;
        assert!(matches!(parse_response(raw), ReasoningResponse::SchemaError(_)));
    }

    #[test]
    fn test_prose_is_schema_error() {
        assert!(matches!(
            parse_response("I could not read the register."),
            ReasoningResponse::SchemaError(_)
        ));
    }

    #[test]
    fn test_malformed_input_ref_has_no_row_index() {
        let entry = ReasoningEntry {
            input_ref: "row-3".into(),
            student_id: Some(1),
            mark: AttendanceStatus::Absent,
            confidence: 0.9,
        };
        assert_eq!(entry.row_index(), None);
    }
}
