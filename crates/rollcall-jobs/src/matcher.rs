//! Three-tier roster matching.
//!
//! Only rows whose mark the legend classifies as absent are candidates.
//! Each candidate is resolved by the first tier that succeeds:
//!
//! 1. exact roll number (after normalization)
//! 2. reasoning-service proposals, validated against the roster
//! 3. fuzzy name similarity with a threshold and a margin over the runner-up
//!
//! A row resolved by an earlier tier is never reconsidered by a later one.
//! Matching is pure; the reasoning call itself happens in the pipeline and
//! only when tier 1 leaves rows unresolved.

use std::collections::{BTreeMap, HashMap, HashSet};

use rollcall_core::{
    AttendanceStatus, GridRow, GridSnapshot, MarkLegend, MatchConfig, MatchMethod,
    MatchedCandidate, RosterEntry, UnmatchedCandidate, UnmatchedReason,
};
use rollcall_inference::ReasoningEntry;

use crate::grid::normalize_roll;

/// Final matching result for one grid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchOutcome {
    pub matched: Vec<MatchedCandidate>,
    pub unmatched: Vec<UnmatchedCandidate>,
    pub candidates_considered: usize,
    /// Rows resolved by the exact or reasoning tier.
    pub resolved_without_fuzzy: usize,
    /// Rows where two roster names scored within the margin.
    pub near_ties: usize,
    pub notes: Vec<String>,
}

/// Lower-cased alphanumeric words separated by single spaces.
pub fn normalize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized Levenshtein similarity in [0,1] between two names.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&normalize_name(a), &normalize_name(b))
}

fn row_confidence(row: &GridRow) -> f64 {
    row.ocr_confidence.map(|c| c.clamp(0.0, 1.0) as f64).unwrap_or(1.0)
}

/// Roster matcher with configured thresholds.
#[derive(Debug, Clone, Default)]
pub struct RosterMatcher {
    config: MatchConfig,
}

impl RosterMatcher {
    pub fn new(config: MatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Run tier 1 and return a session holding the unresolved rows.
    pub fn start<'a>(
        &'a self,
        grid: &'a GridSnapshot,
        roster: &'a [RosterEntry],
        legend: &MarkLegend,
    ) -> MatchSession<'a> {
        let candidates: Vec<&GridRow> = grid
            .rows
            .iter()
            .filter(|r| legend.is_absent(r.symbol.as_deref()))
            .collect();

        let mut session = MatchSession {
            config: &self.config,
            roster,
            candidates_considered: candidates.len(),
            pending: Vec::new(),
            matched: BTreeMap::new(),
            claimed: HashMap::new(),
            unmatched: Vec::new(),
            resolved_without_fuzzy: 0,
            near_ties: 0,
            notes: Vec::new(),
        };
        session.exact_tier(candidates);
        session
    }

    /// Run all three tiers with already-obtained reasoning entries.
    pub fn match_rows(
        &self,
        grid: &GridSnapshot,
        roster: &[RosterEntry],
        legend: &MarkLegend,
        reasoning: Option<&[ReasoningEntry]>,
    ) -> MatchOutcome {
        let mut session = self.start(grid, roster, legend);
        if let Some(entries) = reasoning {
            session.apply_reasoning(entries);
        }
        session.finish()
    }
}

/// In-progress match of one grid against one roster.
pub struct MatchSession<'a> {
    config: &'a MatchConfig,
    roster: &'a [RosterEntry],
    candidates_considered: usize,
    pending: Vec<&'a GridRow>,
    /// Keyed by row index so output follows grid order.
    matched: BTreeMap<usize, MatchedCandidate>,
    /// student_id -> row index that claimed the student.
    claimed: HashMap<i64, usize>,
    unmatched: Vec<UnmatchedCandidate>,
    resolved_without_fuzzy: usize,
    near_ties: usize,
    notes: Vec<String>,
}

impl<'a> MatchSession<'a> {
    /// Whether any candidate row is still unresolved.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    fn accept(&mut self, row: &GridRow, student_id: i64, method: MatchMethod, confidence: f64) {
        self.claimed.insert(student_id, row.index);
        self.matched.insert(
            row.index,
            MatchedCandidate {
                student_id,
                row_index: row.index,
                method,
                mark: AttendanceStatus::Absent,
                confidence: confidence.clamp(0.0, 1.0),
            },
        );
        if method != MatchMethod::FuzzyName {
            self.resolved_without_fuzzy += 1;
        }
    }

    /// Same student written twice: the first row keeps the match.
    fn collapse(&mut self, row: &GridRow, student_id: i64) {
        let first = self.claimed.get(&student_id).copied().unwrap_or(row.index);
        self.notes.push(format!(
            "{} duplicates student {} from r{}; collapsed",
            row.input_ref(),
            student_id,
            first
        ));
    }

    fn exact_tier(&mut self, candidates: Vec<&'a GridRow>) {
        let mut by_roll: HashMap<String, Vec<i64>> = HashMap::new();
        for entry in self.roster {
            by_roll
                .entry(normalize_roll(&entry.roll_number))
                .or_default()
                .push(entry.student_id);
        }

        for row in candidates {
            let key = row.roll.as_deref().map(normalize_roll).filter(|k| !k.is_empty());
            let student = match key.as_ref().and_then(|k| by_roll.get(k)) {
                Some(ids) if ids.len() == 1 => ids[0],
                Some(_) => {
                    self.notes.push(format!(
                        "{}: roll {} is shared by several students",
                        row.input_ref(),
                        key.unwrap_or_default()
                    ));
                    self.pending.push(row);
                    continue;
                }
                None => {
                    self.pending.push(row);
                    continue;
                }
            };

            if self.claimed.contains_key(&student) {
                self.collapse(row, student);
                self.resolved_without_fuzzy += 1;
                continue;
            }
            self.accept(row, student, MatchMethod::ExactRoll, row_confidence(row));
        }
    }

    /// Apply reasoning proposals to rows still pending after tier 1.
    ///
    /// An entry counts only when it names a pending row and a roster student,
    /// with confidence at or above the minimum. A student some other row
    /// already claimed collapses the row as a duplicate. Everything else is
    /// ignored.
    pub fn apply_reasoning(&mut self, entries: &[ReasoningEntry]) {
        let roster_ids: HashSet<i64> = self.roster.iter().map(|e| e.student_id).collect();
        let mut ignored = 0usize;

        for entry in entries {
            let Some(student_id) = entry.student_id else {
                continue;
            };
            let Some(row_index) = entry.row_index() else {
                ignored += 1;
                continue;
            };
            let Some(pos) = self.pending.iter().position(|r| r.index == row_index) else {
                ignored += 1;
                continue;
            };
            if !roster_ids.contains(&student_id)
                || entry.confidence < self.config.reasoning_min_confidence
            {
                ignored += 1;
                continue;
            }
            if self.claimed.contains_key(&student_id) {
                let row = self.pending.remove(pos);
                self.collapse(row, student_id);
                self.resolved_without_fuzzy += 1;
                continue;
            }
            if entry.mark != AttendanceStatus::Absent {
                self.notes.push(format!(
                    "{}: reasoning read the mark as {} but the legend says absent",
                    entry.input_ref,
                    entry.mark.as_str()
                ));
            }

            let row = self.pending.remove(pos);
            self.accept(
                row,
                student_id,
                MatchMethod::Reasoning,
                entry.confidence * row_confidence(row),
            );
        }

        if ignored > 0 {
            self.notes
                .push(format!("{} reasoning proposal(s) ignored", ignored));
        }
    }

    /// Run the fuzzy tier over what is left and produce the outcome.
    pub fn finish(mut self) -> MatchOutcome {
        let pending = std::mem::take(&mut self.pending);

        for row in pending {
            let Some(name) = row.name.as_deref().filter(|n| !normalize_name(n).is_empty()) else {
                let reason = if row.roll.is_none() {
                    UnmatchedReason::Unreadable
                } else {
                    UnmatchedReason::NoMatch
                };
                self.leave_unmatched(row, reason);
                continue;
            };

            // Whole roster, claimed students included.
            let mut scored: Vec<(f64, i64)> = self
                .roster
                .iter()
                .map(|e| (name_similarity(name, &e.display_name), e.student_id))
                .collect();
            scored.sort_by(|a, b| b.0.total_cmp(&a.0));

            let best = scored.first().copied();
            let runner_up = scored.get(1).map(|s| s.0).unwrap_or(0.0);

            match best {
                Some((score, student_id)) if score >= self.config.fuzzy_threshold => {
                    if score - runner_up >= self.config.fuzzy_margin {
                        if self.claimed.contains_key(&student_id) {
                            self.collapse(row, student_id);
                            continue;
                        }
                        self.accept(row, student_id, MatchMethod::FuzzyName, score * row_confidence(row));
                    } else {
                        self.near_ties += 1;
                        self.notes.push(format!(
                            "{}: '{}' is too close to call between roster names",
                            row.input_ref(),
                            name
                        ));
                        self.leave_unmatched(row, UnmatchedReason::Ambiguous);
                    }
                }
                _ => self.leave_unmatched(row, UnmatchedReason::NoMatch),
            }
        }

        self.unmatched.sort_by_key(|u| u.row_index);
        MatchOutcome {
            matched: self.matched.into_values().collect(),
            unmatched: self.unmatched,
            candidates_considered: self.candidates_considered,
            resolved_without_fuzzy: self.resolved_without_fuzzy,
            near_ties: self.near_ties,
            notes: self.notes,
        }
    }

    fn leave_unmatched(&mut self, row: &GridRow, reason: UnmatchedReason) {
        self.unmatched.push(UnmatchedCandidate {
            row_index: row.index,
            roll: row.roll.clone(),
            name: row.name.clone(),
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{BoundingBox, ColumnSource};

    fn row(index: usize, roll: Option<&str>, name: Option<&str>, symbol: &str) -> GridRow {
        GridRow {
            index,
            roll: roll.map(Into::into),
            name: name.map(Into::into),
            symbol: Some(symbol.into()),
            bbox: BoundingBox::default(),
            ocr_confidence: Some(1.0),
        }
    }

    fn grid(rows: Vec<GridRow>) -> GridSnapshot {
        GridSnapshot {
            rows,
            column_source: ColumnSource::Clustered,
            extraction_quality: 1.0,
        }
    }

    fn roster() -> Vec<RosterEntry> {
        vec![
            RosterEntry::new(1, "101", "Asha Rao"),
            RosterEntry::new(2, "102", "Ali Khan"),
            RosterEntry::new(3, "103", "Mei Chen"),
        ]
    }

    fn entry(input_ref: &str, student_id: Option<i64>, confidence: f64) -> ReasoningEntry {
        ReasoningEntry {
            input_ref: input_ref.into(),
            student_id,
            mark: AttendanceStatus::Absent,
            confidence,
        }
    }

    #[test]
    fn test_exact_roll_match() {
        let g = grid(vec![row(0, Some("101"), None, "A"), row(1, Some("102"), None, "P")]);
        let out = RosterMatcher::default().match_rows(&g, &roster(), &MarkLegend::default(), None);

        assert_eq!(out.candidates_considered, 1);
        assert_eq!(out.matched.len(), 1);
        assert_eq!(out.matched[0].student_id, 1);
        assert_eq!(out.matched[0].method, MatchMethod::ExactRoll);
        assert!(out.unmatched.is_empty());
    }

    #[test]
    fn test_roll_match_ignores_leading_zeros() {
        let g = grid(vec![row(0, Some("0103"), None, "a")]);
        let out = RosterMatcher::default().match_rows(&g, &roster(), &MarkLegend::default(), None);
        assert_eq!(out.matched[0].student_id, 3);
    }

    #[test]
    fn test_fuzzy_fallback_when_reasoning_unavailable() {
        let g = grid(vec![row(0, None, Some("Ali Khn"), "A")]);
        let out = RosterMatcher::default().match_rows(&g, &roster(), &MarkLegend::default(), None);

        assert_eq!(out.matched.len(), 1);
        assert_eq!(out.matched[0].student_id, 2);
        assert_eq!(out.matched[0].method, MatchMethod::FuzzyName);
        assert_eq!(out.resolved_without_fuzzy, 0);
    }

    #[test]
    fn test_reasoning_tier_accepts_valid_entry() {
        let g = grid(vec![row(0, None, Some("A. K."), "A")]);
        let entries = [entry("r0", Some(2), 0.9)];
        let out = RosterMatcher::default().match_rows(
            &g,
            &roster(),
            &MarkLegend::default(),
            Some(&entries),
        );

        assert_eq!(out.matched[0].student_id, 2);
        assert_eq!(out.matched[0].method, MatchMethod::Reasoning);
        assert_eq!(out.resolved_without_fuzzy, 1);
    }

    #[test]
    fn test_reasoning_cannot_override_exact_match() {
        let g = grid(vec![row(0, Some("101"), Some("Asha"), "A")]);
        let entries = [entry("r0", Some(3), 0.99)];
        let out = RosterMatcher::default().match_rows(
            &g,
            &roster(),
            &MarkLegend::default(),
            Some(&entries),
        );

        assert_eq!(out.matched.len(), 1);
        assert_eq!(out.matched[0].student_id, 1);
        assert_eq!(out.matched[0].method, MatchMethod::ExactRoll);
    }

    #[test]
    fn test_reasoning_rejects_unknown_student_and_low_confidence() {
        let g = grid(vec![
            row(0, None, Some("zzz"), "A"),
            row(1, None, Some("qqq"), "A"),
        ]);
        let entries = [entry("r0", Some(999), 0.9), entry("r1", Some(3), 0.2)];
        let out = RosterMatcher::default().match_rows(
            &g,
            &roster(),
            &MarkLegend::default(),
            Some(&entries),
        );

        assert!(out.matched.is_empty());
        assert_eq!(out.unmatched.len(), 2);
        assert!(out.notes.iter().any(|n| n.contains("ignored")));
    }

    #[test]
    fn test_reasoning_on_claimed_student_collapses_row() {
        let g = grid(vec![row(0, Some("101"), None, "A"), row(1, None, Some("xx"), "A")]);
        let entries = [entry("r1", Some(1), 0.95)];
        let out = RosterMatcher::default().match_rows(
            &g,
            &roster(),
            &MarkLegend::default(),
            Some(&entries),
        );
        assert_eq!(out.matched.len(), 1);
        assert_eq!(out.matched[0].row_index, 0);
        assert!(out.unmatched.is_empty());
        assert!(out.notes.iter().any(|n| n.contains("r1 duplicates student 1")));
        assert!(!out.notes.iter().any(|n| n.contains("ignored")));
    }

    #[test]
    fn test_repeated_name_collapses_onto_roll_match() {
        let g = grid(vec![
            row(0, Some("102"), None, "A"),
            row(1, None, Some("Ali Khn"), "A"),
        ]);
        let out = RosterMatcher::default().match_rows(&g, &roster(), &MarkLegend::default(), None);

        assert_eq!(out.matched.len(), 1);
        assert_eq!(out.matched[0].student_id, 2);
        assert!(out.unmatched.is_empty());
        assert!(out.notes.iter().any(|n| n.contains("r1 duplicates student 2")));
    }

    #[test]
    fn test_repeated_name_never_shifts_to_similar_student() {
        let roster = vec![
            RosterEntry::new(10, "1", "Maria Lopez"),
            RosterEntry::new(11, "2", "Mario Lopez"),
        ];
        let g = grid(vec![
            row(0, Some("1"), None, "A"),
            row(1, None, Some("Maria Lopez"), "A"),
        ]);
        let out = RosterMatcher::default().match_rows(&g, &roster, &MarkLegend::default(), None);

        assert_eq!(out.matched.len(), 1);
        assert_eq!(out.matched[0].student_id, 10);
        assert!(out.matched.iter().all(|m| m.student_id != 11));
        assert_eq!(out.unmatched[0].row_index, 1);
        assert_eq!(out.unmatched[0].reason, UnmatchedReason::Ambiguous);
    }

    #[test]
    fn test_fuzzy_near_tie_is_ambiguous() {
        let roster = vec![
            RosterEntry::new(10, "1", "Maria Lopez"),
            RosterEntry::new(11, "2", "Mario Lopez"),
        ];
        let g = grid(vec![row(0, None, Some("Mari Lopez"), "A")]);
        let out = RosterMatcher::default().match_rows(&g, &roster, &MarkLegend::default(), None);

        assert!(out.matched.is_empty());
        assert_eq!(out.near_ties, 1);
        assert_eq!(out.unmatched[0].reason, UnmatchedReason::Ambiguous);
    }

    #[test]
    fn test_duplicate_rows_collapse() {
        let g = grid(vec![row(0, Some("102"), None, "A"), row(1, Some("102"), None, "A")]);
        let out = RosterMatcher::default().match_rows(&g, &roster(), &MarkLegend::default(), None);

        assert_eq!(out.matched.len(), 1);
        assert!(out.unmatched.is_empty());
        assert!(out.notes.iter().any(|n| n.contains("collapsed")));
    }

    #[test]
    fn test_unreadable_row() {
        let g = grid(vec![row(0, None, None, "A")]);
        let out = RosterMatcher::default().match_rows(&g, &roster(), &MarkLegend::default(), None);
        assert_eq!(out.unmatched[0].reason, UnmatchedReason::Unreadable);
    }

    #[test]
    fn test_session_skips_reasoning_when_exact_resolves_all() {
        let g = grid(vec![row(0, Some("101"), None, "A")]);
        let r = roster();
        let matcher = RosterMatcher::default();
        let session = matcher.start(&g, &r, &MarkLegend::default());
        assert!(!session.has_pending());
    }

    #[test]
    fn test_name_normalization() {
        assert_eq!(normalize_name("  ALI   khan. "), "ali khan");
        assert!(name_similarity("Ali Khn", "Ali Khan") > 0.85);
    }
}
