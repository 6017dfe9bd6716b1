//! Upload confidence scoring.
//!
//! The score weighs how many candidate rows were resolved without the fuzzy
//! fallback against the grid's extraction quality, minus a penalty for each
//! near-tie. It only drives the "likely correct" highlight in review; it
//! never confirms anything by itself.

use rollcall_core::{AiOutput, GridSnapshot};

use crate::matcher::MatchOutcome;

const RESOLUTION_WEIGHT: f64 = 0.5;
const QUALITY_WEIGHT: f64 = 0.5;
const NEAR_TIE_PENALTY: f64 = 0.1;

/// Share of candidate rows resolved by the exact or reasoning tier.
/// A grid with no candidates is fully resolved.
pub fn resolution_ratio(outcome: &MatchOutcome) -> f64 {
    if outcome.candidates_considered == 0 {
        return 1.0;
    }
    outcome.resolved_without_fuzzy as f64 / outcome.candidates_considered as f64
}

/// Upload-level confidence in [0,1].
pub fn upload_confidence(outcome: &MatchOutcome, grid: &GridSnapshot) -> f64 {
    let raw = RESOLUTION_WEIGHT * resolution_ratio(outcome)
        + QUALITY_WEIGHT * grid.extraction_quality.clamp(0.0, 1.0)
        - NEAR_TIE_PENALTY * outcome.near_ties as f64;
    raw.clamp(0.0, 1.0)
}

/// Assemble the review proposal from a match outcome.
pub fn build_ai_output(outcome: MatchOutcome, grid: &GridSnapshot, likely_correct_threshold: f64) -> AiOutput {
    let confidence = upload_confidence(&outcome, grid);
    AiOutput {
        likely_correct: confidence >= likely_correct_threshold,
        confidence,
        candidates_considered: outcome.candidates_considered,
        matched: outcome.matched,
        unmatched: outcome.unmatched,
        notes: outcome.notes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::ColumnSource;

    fn grid(quality: f64) -> GridSnapshot {
        GridSnapshot {
            rows: vec![],
            column_source: ColumnSource::Clustered,
            extraction_quality: quality,
        }
    }

    fn outcome(considered: usize, resolved: usize, near_ties: usize) -> MatchOutcome {
        MatchOutcome {
            candidates_considered: considered,
            resolved_without_fuzzy: resolved,
            near_ties,
            ..Default::default()
        }
    }

    #[test]
    fn test_perfect_register_scores_one() {
        assert_eq!(upload_confidence(&outcome(3, 3, 0), &grid(1.0)), 1.0);
    }

    #[test]
    fn test_no_candidates_counts_as_resolved() {
        assert!((upload_confidence(&outcome(0, 0, 0), &grid(0.8)) - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_fuzzy_only_halves_resolution_term() {
        let score = upload_confidence(&outcome(2, 1, 0), &grid(1.0));
        assert!((score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_near_ties_penalize_and_clamp() {
        let score = upload_confidence(&outcome(1, 0, 1), &grid(0.9));
        assert!((score - 0.35).abs() < 1e-9);
        assert_eq!(upload_confidence(&outcome(1, 0, 20), &grid(0.1)), 0.0);
    }

    #[test]
    fn test_likely_correct_flag() {
        let ai = build_ai_output(outcome(2, 2, 0), &grid(0.9), 0.85);
        assert!(ai.likely_correct);
        let ai = build_ai_output(outcome(2, 0, 0), &grid(0.9), 0.85);
        assert!(!ai.likely_correct);
    }
}
