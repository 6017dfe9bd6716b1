//! Pure planners for confirm-time Record materialization and feedback capture.

use std::collections::{BTreeSet, HashSet};

use crate::error::{Error, Result};
use crate::models::{AiOutput, AttendanceStatus, FeedbackDraft, RecordDraft, RosterEntry};

/// One Record per roster student: ABSENT if listed, PRESENT otherwise.
///
/// Every absentee must be on the roster. A roster that lists the same
/// student twice would produce two Records for one (student, date) and is
/// rejected as a consistency violation.
pub fn plan_records(roster: &[RosterEntry], absentees: &BTreeSet<i64>) -> Result<Vec<RecordDraft>> {
    let mut seen = HashSet::with_capacity(roster.len());
    for entry in roster {
        if !seen.insert(entry.student_id) {
            return Err(Error::ConsistencyViolation(format!(
                "student {} appears twice in the roster",
                entry.student_id
            )));
        }
    }

    if let Some(unknown) = absentees.iter().find(|id| !seen.contains(id)) {
        return Err(Error::InvalidInput(format!(
            "student {} is not on the roster for this date",
            unknown
        )));
    }

    Ok(roster
        .iter()
        .map(|entry| RecordDraft {
            student_id: entry.student_id,
            status: if absentees.contains(&entry.student_id) {
                AttendanceStatus::Absent
            } else {
                AttendanceStatus::Present
            },
        })
        .collect())
}

/// Split proposed absentees into those still on `roster` and those no
/// longer on it (roster changed after recognition ran).
pub fn split_by_roster(proposed: BTreeSet<i64>, roster: &[RosterEntry]) -> (BTreeSet<i64>, Vec<i64>) {
    let on_roster: HashSet<i64> = roster.iter().map(|e| e.student_id).collect();
    let (kept, departed): (BTreeSet<i64>, BTreeSet<i64>) =
        proposed.into_iter().partition(|id| on_roster.contains(id));
    (kept, departed.into_iter().collect())
}

/// Diff the AI proposal against the confirmed list.
///
/// Emits one entry per roster student whose confirmed status differs from
/// what recognition proposed. Without an AI proposal every student counts
/// as proposed PRESENT.
pub fn plan_feedback(
    ai: Option<&AiOutput>,
    roster: &[RosterEntry],
    absentees: &BTreeSet<i64>,
) -> Vec<FeedbackDraft> {
    let proposed = ai.map(AiOutput::proposed_absentees).unwrap_or_default();

    roster
        .iter()
        .filter_map(|entry| {
            let ai_absent = proposed.contains(&entry.student_id);
            let human_absent = absentees.contains(&entry.student_id);
            if ai_absent == human_absent {
                return None;
            }
            Some(FeedbackDraft {
                student_id: Some(entry.student_id),
                ai_status: status_of(ai_absent),
                human_status: status_of(human_absent),
                match_method: ai.and_then(|a| a.method_for(entry.student_id)),
            })
        })
        .collect()
}

fn status_of(absent: bool) -> AttendanceStatus {
    if absent {
        AttendanceStatus::Absent
    } else {
        AttendanceStatus::Present
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MatchMethod, MatchedCandidate};

    fn roster() -> Vec<RosterEntry> {
        vec![
            RosterEntry::new(1, "101", "Ali Khan"),
            RosterEntry::new(2, "102", "Sara Malik"),
            RosterEntry::new(3, "103", "Omar Farooq"),
        ]
    }

    fn ai_proposing(ids: &[(i64, MatchMethod)]) -> AiOutput {
        AiOutput {
            matched: ids
                .iter()
                .enumerate()
                .map(|(i, (id, method))| MatchedCandidate {
                    student_id: *id,
                    row_index: i,
                    method: *method,
                    mark: AttendanceStatus::Absent,
                    confidence: 0.9,
                })
                .collect(),
            unmatched: vec![],
            confidence: 0.9,
            likely_correct: true,
            candidates_considered: ids.len(),
            notes: vec![],
        }
    }

    #[test]
    fn test_plan_records_covers_whole_roster() {
        let drafts = plan_records(&roster(), &BTreeSet::from([1])).unwrap();
        assert_eq!(drafts.len(), 3);
        assert_eq!(drafts[0].status, AttendanceStatus::Absent);
        assert_eq!(drafts[1].status, AttendanceStatus::Present);
        assert_eq!(drafts[2].status, AttendanceStatus::Present);
    }

    #[test]
    fn test_plan_records_rejects_unknown_absentee() {
        let err = plan_records(&roster(), &BTreeSet::from([99])).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_plan_records_rejects_duplicate_roster_entry() {
        let mut r = roster();
        r.push(RosterEntry::new(2, "102", "Sara Malik"));
        let err = plan_records(&r, &BTreeSet::new()).unwrap_err();
        assert!(matches!(err, Error::ConsistencyViolation(_)));
    }

    #[test]
    fn test_plan_records_empty_roster() {
        assert!(plan_records(&[], &BTreeSet::new()).unwrap().is_empty());
    }

    #[test]
    fn test_feedback_only_for_differences() {
        let ai = ai_proposing(&[(1, MatchMethod::ExactRoll), (2, MatchMethod::FuzzyName)]);
        // Reviewer keeps 1, removes false positive 2, adds missed 3.
        let fb = plan_feedback(Some(&ai), &roster(), &BTreeSet::from([1, 3]));
        assert_eq!(fb.len(), 2);

        let removed = fb.iter().find(|f| f.student_id == Some(2)).unwrap();
        assert_eq!(removed.ai_status, AttendanceStatus::Absent);
        assert_eq!(removed.human_status, AttendanceStatus::Present);
        assert_eq!(removed.match_method, Some(MatchMethod::FuzzyName));

        let added = fb.iter().find(|f| f.student_id == Some(3)).unwrap();
        assert_eq!(added.ai_status, AttendanceStatus::Present);
        assert_eq!(added.human_status, AttendanceStatus::Absent);
        assert_eq!(added.match_method, None);
    }

    #[test]
    fn test_feedback_empty_when_reviewer_accepts() {
        let ai = ai_proposing(&[(1, MatchMethod::ExactRoll)]);
        assert!(plan_feedback(Some(&ai), &roster(), &BTreeSet::from([1])).is_empty());
    }

    #[test]
    fn test_feedback_without_ai_output() {
        let fb = plan_feedback(None, &roster(), &BTreeSet::from([2]));
        assert_eq!(fb.len(), 1);
        assert_eq!(fb[0].student_id, Some(2));
    }

    #[test]
    fn test_split_by_roster_separates_departed_students() {
        let proposed: BTreeSet<i64> = [1, 3, 9].into_iter().collect();
        let (kept, departed) = split_by_roster(proposed, &roster());
        assert_eq!(kept, BTreeSet::from([1, 3]));
        assert_eq!(departed, vec![9]);
    }
}
