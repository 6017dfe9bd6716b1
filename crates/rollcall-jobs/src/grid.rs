//! Grid reconstruction from positioned OCR tokens.
//!
//! Tokens are grouped into rows by vertical position. Columns come from the
//! school's configured layout when one exists, otherwise from clustering the
//! horizontal extents of every token on the page and guessing each cluster's
//! role from its contents.

use tracing::debug;

use rollcall_core::{
    BoundingBox, ColumnRange, ColumnSource, Error, GridRow, GridSnapshot, MarkLegend, OcrOutput,
    OcrToken, RegisterLayout, Result,
};

/// Tokens whose centers are within this many median heights share a row.
const ROW_TOLERANCE: f32 = 0.6;

/// Gaps wider than this many median heights separate columns.
const COLUMN_GAP: f32 = 1.5;

/// Share of tokens that must look like roll numbers for a roll column.
const MIN_ROLL_RATIO: f64 = 0.5;

/// Share of tokens the legend must recognize for a mark column.
const MIN_MARK_RATIO: f64 = 0.3;

/// Confidence assumed for tokens the OCR service did not score.
const UNSCORED_CONFIDENCE: f32 = 1.0;

/// Column role assigned during reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Roll,
    Name,
    Mark,
    Ignored,
}

/// A row of tokens in reading order.
struct TokenRow<'a> {
    center_y: f32,
    tokens: Vec<&'a OcrToken>,
}

/// Reconstruct the register grid.
///
/// Fails with `ParseFailure` when the page has no tokens or no row carries
/// a roll number or a name.
pub fn reconstruct(
    ocr: &OcrOutput,
    layout: Option<&RegisterLayout>,
    legend: &MarkLegend,
) -> Result<GridSnapshot> {
    let rows = group_rows(&ocr.tokens);
    if rows.is_empty() {
        return Err(Error::ParseFailure("no text found on register".into()));
    }

    let page_width = ocr
        .page_width
        .filter(|w| *w > 0.0)
        .or_else(|| ocr.tokens.iter().map(|t| t.bbox.right()).reduce(f32::max))
        .unwrap_or(0.0);

    let (grid_rows, column_source) = match layout.filter(|_| page_width > 0.0) {
        Some(layout) => (
            assign_configured(&rows, layout, page_width),
            ColumnSource::Configured,
        ),
        None => (assign_clustered(&rows, legend), ColumnSource::Clustered),
    };

    if !grid_rows.iter().any(|r| r.roll.is_some() || r.name.is_some()) {
        return Err(Error::ParseFailure(
            "no tabular structure found on register".into(),
        ));
    }

    let extraction_quality = extraction_quality(&grid_rows, &ocr.tokens);
    debug!(
        rows = grid_rows.len(),
        ?column_source,
        extraction_quality,
        "grid: reconstructed"
    );

    Ok(GridSnapshot {
        rows: grid_rows,
        column_source,
        extraction_quality,
    })
}

/// Whether a token reads as a roll number: digits, optionally followed by
/// list punctuation.
pub fn looks_like_roll(text: &str) -> bool {
    let t = text.trim().trim_end_matches(['.', ')', ':']);
    !t.is_empty() && t.chars().all(|c| c.is_ascii_digit())
}

/// Canonical roll number for comparison: no whitespace, no list punctuation,
/// no leading zeros.
pub fn normalize_roll(raw: &str) -> String {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let compact = compact.trim_end_matches(['.', ')', ':']);
    let trimmed = compact.trim_start_matches('0');
    if trimmed.is_empty() && !compact.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_uppercase()
    }
}

fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    values[values.len() / 2]
}

fn median_height<'a>(tokens: impl IntoIterator<Item = &'a OcrToken>) -> f32 {
    let mut heights: Vec<f32> = tokens
        .into_iter()
        .map(|t| t.bbox.height)
        .filter(|h| *h > 0.0)
        .collect();
    median(&mut heights).max(1.0)
}

fn group_rows(tokens: &[OcrToken]) -> Vec<TokenRow<'_>> {
    let tolerance = median_height(tokens) * ROW_TOLERANCE;

    let mut sorted: Vec<&OcrToken> = tokens.iter().filter(|t| !t.text.trim().is_empty()).collect();
    sorted.sort_by(|a, b| a.bbox.center_y().total_cmp(&b.bbox.center_y()));

    let mut rows: Vec<TokenRow<'_>> = Vec::new();
    for token in sorted {
        let cy = token.bbox.center_y();
        match rows.last_mut() {
            Some(row) if (cy - row.center_y).abs() <= tolerance => {
                let n = row.tokens.len() as f32;
                row.center_y = (row.center_y * n + cy) / (n + 1.0);
                row.tokens.push(token);
            }
            _ => rows.push(TokenRow {
                center_y: cy,
                tokens: vec![token],
            }),
        }
    }

    for row in &mut rows {
        row.tokens.sort_by(|a, b| a.bbox.x.total_cmp(&b.bbox.x));
    }
    rows
}

fn build_row(index: usize, tokens: &[&OcrToken], role_of: impl Fn(&OcrToken) -> Role) -> GridRow {
    let mut roll: Vec<&str> = Vec::new();
    let mut name: Vec<&str> = Vec::new();
    let mut mark: Vec<&str> = Vec::new();

    for token in tokens {
        let text = token.text.trim();
        match role_of(token) {
            Role::Roll => roll.push(text),
            Role::Name => name.push(text),
            Role::Mark => mark.push(text),
            Role::Ignored => {}
        }
    }

    let join = |parts: Vec<&str>| (!parts.is_empty()).then(|| parts.join(" "));

    let bbox = tokens
        .iter()
        .skip(1)
        .fold(tokens[0].bbox, |acc: BoundingBox, t| acc.union(&t.bbox));

    let scored: Vec<f32> = tokens.iter().filter_map(|t| t.confidence).collect();
    let ocr_confidence =
        (!scored.is_empty()).then(|| scored.iter().sum::<f32>() / scored.len() as f32);

    GridRow {
        index,
        roll: join(roll),
        name: join(name),
        symbol: join(mark),
        bbox,
        ocr_confidence,
    }
}

fn assign_configured(rows: &[TokenRow<'_>], layout: &RegisterLayout, page_width: f32) -> Vec<GridRow> {
    let in_range = |range: &Option<ColumnRange>, fraction: f32| {
        range.as_ref().is_some_and(|r| r.contains(fraction))
    };

    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            build_row(i, &row.tokens, |token| {
                let fraction = token.bbox.center_x() / page_width;
                if in_range(&layout.roll, fraction) {
                    Role::Roll
                } else if in_range(&layout.mark, fraction) {
                    Role::Mark
                } else if in_range(&layout.name, fraction) {
                    Role::Name
                } else {
                    Role::Ignored
                }
            })
        })
        .collect()
}

/// A horizontal span of the page occupied by one column.
#[derive(Debug, Clone, Copy)]
struct Span {
    start: f32,
    end: f32,
}

fn cluster_columns(rows: &[TokenRow<'_>], gap: f32) -> Vec<Span> {
    let mut extents: Vec<Span> = rows
        .iter()
        .flat_map(|r| r.tokens.iter())
        .map(|t| Span {
            start: t.bbox.x,
            end: t.bbox.right(),
        })
        .collect();
    extents.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut spans: Vec<Span> = Vec::new();
    for extent in extents {
        match spans.last_mut() {
            Some(span) if extent.start - span.end <= gap => span.end = span.end.max(extent.end),
            _ => spans.push(extent),
        }
    }
    spans
}

fn column_of(spans: &[Span], token: &OcrToken) -> usize {
    let x = token.bbox.x;
    spans
        .iter()
        .position(|s| x >= s.start && x <= s.end)
        .unwrap_or(0)
}

fn assign_clustered(rows: &[TokenRow<'_>], legend: &MarkLegend) -> Vec<GridRow> {
    let all: Vec<&OcrToken> = rows.iter().flat_map(|r| r.tokens.iter().copied()).collect();
    let gap = median_height(all.iter().copied()) * COLUMN_GAP;
    let spans = cluster_columns(rows, gap);

    // Per-column content statistics.
    let mut totals = vec![0usize; spans.len()];
    let mut rolls = vec![0usize; spans.len()];
    let mut marks = vec![0usize; spans.len()];
    for token in &all {
        let c = column_of(&spans, token);
        totals[c] += 1;
        if looks_like_roll(&token.text) {
            rolls[c] += 1;
        }
        if legend.recognizes(&token.text) {
            marks[c] += 1;
        }
    }
    let ratio = |hits: &[usize], c: usize| {
        if totals[c] == 0 {
            0.0
        } else {
            hits[c] as f64 / totals[c] as f64
        }
    };

    let mut roles = vec![Role::Name; spans.len()];

    let roll_col = (0..spans.len())
        .filter(|&c| ratio(&rolls, c) >= MIN_ROLL_RATIO)
        .max_by(|&a, &b| ratio(&rolls, a).total_cmp(&ratio(&rolls, b)).then(b.cmp(&a)));
    if let Some(c) = roll_col {
        roles[c] = Role::Roll;
    }

    // Rightmost wins ties: marks are written after names.
    let mark_col = (0..spans.len())
        .filter(|&c| Some(c) != roll_col && ratio(&marks, c) >= MIN_MARK_RATIO)
        .max_by(|&a, &b| ratio(&marks, a).total_cmp(&ratio(&marks, b)).then(a.cmp(&b)));
    if let Some(c) = mark_col {
        roles[c] = Role::Mark;
        // Columns right of the mark column are other dates or totals.
        for role in roles.iter_mut().skip(c + 1) {
            *role = Role::Ignored;
        }
    }

    // With no column structure at all, classify token by token.
    let single_column = spans.len() <= 1;

    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            build_row(i, &row.tokens, |token| {
                if single_column {
                    if looks_like_roll(&token.text) {
                        Role::Roll
                    } else if legend.recognizes(&token.text) {
                        Role::Mark
                    } else {
                        Role::Name
                    }
                } else {
                    roles[column_of(&spans, token)]
                }
            })
        })
        .collect()
}

/// Mean token confidence scaled by the share of rows that have a mark and
/// an identifier.
fn extraction_quality(rows: &[GridRow], tokens: &[OcrToken]) -> f64 {
    if rows.is_empty() || tokens.is_empty() {
        return 0.0;
    }
    let mean_confidence = tokens
        .iter()
        .map(|t| t.confidence.unwrap_or(UNSCORED_CONFIDENCE).clamp(0.0, 1.0) as f64)
        .sum::<f64>()
        / tokens.len() as f64;
    let complete = rows
        .iter()
        .filter(|r| r.symbol.is_some() && (r.roll.is_some() || r.name.is_some()))
        .count() as f64
        / rows.len() as f64;
    (mean_confidence * complete).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(text: &str, x: f32, y: f32, conf: f32) -> OcrToken {
        OcrToken {
            text: text.into(),
            bbox: BoundingBox::new(x, y, 10.0 * text.chars().count() as f32, 20.0),
            confidence: Some(conf),
        }
    }

    /// Three-row register: roll at x=50, name at x=200, mark at x=600.
    fn register() -> OcrOutput {
        let rows = [
            ("101", "Asha", Some("Rao"), "P"),
            ("102", "Ali", Some("Khn"), "A"),
            ("103", "Chen", None, "A"),
        ];
        let mut tokens = Vec::new();
        for (i, (roll, first, last, mark)) in rows.iter().enumerate() {
            let y = 100.0 + i as f32 * 50.0;
            tokens.push(token(roll, 50.0, y, 0.9));
            tokens.push(token(first, 200.0, y + 2.0, 0.8));
            if let Some(last) = last {
                tokens.push(token(last, 250.0, y + 1.0, 0.8));
            }
            tokens.push(token(mark, 600.0, y - 1.0, 0.9));
        }
        OcrOutput {
            raw_text: String::new(),
            tokens,
            page_width: Some(800.0),
        }
    }

    #[test]
    fn test_clustered_columns() {
        let grid = reconstruct(&register(), None, &MarkLegend::default()).unwrap();
        assert_eq!(grid.column_source, ColumnSource::Clustered);
        assert_eq!(grid.rows.len(), 3);
        let row = &grid.rows[1];
        assert_eq!(row.roll.as_deref(), Some("102"));
        assert_eq!(row.name.as_deref(), Some("Ali Khn"));
        assert_eq!(row.symbol.as_deref(), Some("A"));
        assert_eq!(row.input_ref(), "r1");
        assert!(grid.extraction_quality > 0.8);
    }

    #[test]
    fn test_configured_layout() {
        let layout = RegisterLayout {
            roll: Some(ColumnRange { start: 0.0, end: 0.2 }),
            name: Some(ColumnRange { start: 0.2, end: 0.7 }),
            mark: Some(ColumnRange { start: 0.7, end: 1.0 }),
        };
        let grid = reconstruct(&register(), Some(&layout), &MarkLegend::default()).unwrap();
        assert_eq!(grid.column_source, ColumnSource::Configured);
        assert_eq!(grid.rows[2].roll.as_deref(), Some("103"));
        assert_eq!(grid.rows[2].name.as_deref(), Some("Chen"));
        assert_eq!(grid.rows[2].symbol.as_deref(), Some("A"));
    }

    #[test]
    fn test_layout_without_page_width_uses_token_extent() {
        let mut ocr = register();
        ocr.page_width = None;
        let layout = RegisterLayout {
            roll: Some(ColumnRange { start: 0.0, end: 0.2 }),
            name: Some(ColumnRange { start: 0.2, end: 0.7 }),
            mark: Some(ColumnRange { start: 0.7, end: 1.0 }),
        };
        let grid = reconstruct(&ocr, Some(&layout), &MarkLegend::default()).unwrap();
        assert_eq!(grid.rows[0].symbol.as_deref(), Some("P"));
    }

    #[test]
    fn test_empty_page_is_parse_failure() {
        let err = reconstruct(&OcrOutput::default(), None, &MarkLegend::default()).unwrap_err();
        assert!(matches!(err, Error::ParseFailure(_)));
    }

    #[test]
    fn test_marks_only_is_parse_failure() {
        let ocr = OcrOutput {
            raw_text: "A P".into(),
            tokens: vec![token("A", 50.0, 100.0, 0.9), token("P", 50.0, 160.0, 0.9)],
            page_width: Some(800.0),
        };
        let err = reconstruct(&ocr, None, &MarkLegend::default()).unwrap_err();
        assert!(matches!(err, Error::ParseFailure(_)));
    }

    #[test]
    fn test_quality_drops_for_incomplete_rows() {
        let mut ocr = register();
        ocr.tokens.retain(|t| t.text != "A");
        let grid = reconstruct(&ocr, None, &MarkLegend::default()).unwrap();
        assert!(grid.extraction_quality < 0.5);
    }

    #[test]
    fn test_roll_normalization() {
        assert_eq!(normalize_roll(" 0101 "), "101");
        assert_eq!(normalize_roll("1 01."), "101");
        assert_eq!(normalize_roll("000"), "0");
        assert_eq!(normalize_roll("12b"), "12B");
        assert!(looks_like_roll("7)"));
        assert!(!looks_like_roll("Ali"));
    }
}
