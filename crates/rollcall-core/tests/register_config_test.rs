//! Tests for the per-school register configuration wire shape.
//!
//! School configuration is stored as JSON; these tests pin the accepted
//! shape and the defaults applied when parts of it are missing.

use rollcall_core::{AttendanceStatus, ColumnRange, SchoolRegisterConfig};
use serde_json::json;

#[test]
fn test_full_config_parses() {
    let raw = json!({
        "legend": {"a": "ABSENT", "L": "ABSENT", "p": "PRESENT"},
        "layout": {
            "roll": {"start": 0.0, "end": 0.15},
            "name": {"start": 0.15, "end": 0.6},
            "mark": {"start": 0.6, "end": 1.0}
        }
    });

    let config: SchoolRegisterConfig = serde_json::from_value(raw).unwrap();

    assert_eq!(config.legend.classify("A"), Some(AttendanceStatus::Absent));
    assert_eq!(config.legend.classify("l"), Some(AttendanceStatus::Absent));
    assert_eq!(config.legend.classify("P"), Some(AttendanceStatus::Present));
    // A custom legend replaces the defaults entirely.
    assert_eq!(config.legend.classify("X"), None);

    let layout = config.layout.unwrap();
    assert_eq!(
        layout.roll,
        Some(ColumnRange {
            start: 0.0,
            end: 0.15
        })
    );
    assert!(layout.mark.unwrap().contains(0.75));
    assert!(!layout.name.unwrap().contains(0.6));
}

#[test]
fn test_empty_config_uses_defaults() {
    let config: SchoolRegisterConfig = serde_json::from_value(json!({})).unwrap();

    assert_eq!(config, SchoolRegisterConfig::default());
    assert!(config.layout.is_none());
    assert_eq!(config.legend.classify("A"), Some(AttendanceStatus::Absent));
    assert_eq!(config.legend.classify("✓"), Some(AttendanceStatus::Present));
}

#[test]
fn test_legend_rejects_unknown_status() {
    let result: Result<SchoolRegisterConfig, _> =
        serde_json::from_value(json!({"legend": {"A": "LATE"}}));
    assert!(result.is_err());
}

#[test]
fn test_config_serializes_back() {
    let config = SchoolRegisterConfig::default();
    let value = serde_json::to_value(&config).unwrap();
    assert_eq!(value["legend"]["A"], "ABSENT");
    assert_eq!(value["layout"], serde_json::Value::Null);
}
