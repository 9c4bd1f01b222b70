//! Turning patient uploads and form text into a [`Timeline`].
//!
//! CSV lab tables are accepted with loose column naming (`lab` or
//! `test_name`, `result` or `value`, ...). JSON uploads must already look
//! like a timeline: a lab list key is required here, unlike
//! [`Timeline::from_json_str`], which loads saved files.

use thiserror::Error;

use crate::timeline::{LabEntry, Stage, Timeline};

const DATE_ALIASES: &[&str] = &["date", "lab_date", "timestamp", "collected_date"];
const NAME_ALIASES: &[&str] = &["lab", "lab_name", "test", "test_name"];
const VALUE_ALIASES: &[&str] = &["value", "result", "lab_value"];
const UNIT_ALIASES: &[&str] = &["unit", "units"];
const RANGE_ALIASES: &[&str] = &["reference_range", "ref_range", "range", "ref"];

/// Keys that mark a JSON object as a timeline.
const LAB_LIST_KEYS: &[&str] = &["labs", "labs_over_time"];

#[derive(Error, Debug)]
pub enum IntakeError {
    #[error(
        "CSV must contain at least columns for: date, lab_name, value \
         (names can vary like lab/test and result/value). Missing: {}",
        .0.join(", ")
    )]
    MissingColumns(Vec<&'static str>),

    #[error("The CSV file is empty")]
    EmptyCsv,

    #[error("CSV line {line} has an unterminated quoted field")]
    UnterminatedQuote { line: usize },

    #[error("JSON uploaded, but it doesn't look like a NephroBridge timeline")]
    NotATimeline,

    #[error("Could not read timeline JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ═══════════════════════════════════════════════════════════
// Form text
// ═══════════════════════════════════════════════════════════

/// One item per non-blank line, trimmed.
pub fn lines_to_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

// ═══════════════════════════════════════════════════════════
// JSON upload
// ═══════════════════════════════════════════════════════════

/// Parse an uploaded timeline document.
///
/// The stage picked by the patient wins over the stage stored in the file,
/// and a non-blank `reason` replaces the stored hospital stay reason.
pub fn parse_timeline_json(
    json: &str,
    stage: Option<Stage>,
    reason: Option<&str>,
) -> Result<Timeline, IntakeError> {
    let raw: serde_json::Value = serde_json::from_str(json)?;
    let looks_like_timeline = raw
        .as_object()
        .is_some_and(|obj| LAB_LIST_KEYS.iter().any(|key| obj.contains_key(*key)));
    if !looks_like_timeline {
        return Err(IntakeError::NotATimeline);
    }

    let mut raw = raw;
    if let (Some(stage), Some(obj)) = (&stage, raw.as_object_mut()) {
        obj.remove("kidney_journey_stage");
        obj.insert("stage".into(), serde_json::Value::String(stage.to_string()));
    }

    let mut timeline: Timeline = serde_json::from_value(raw)?;
    if let Some(reason) = reason.filter(|r| !r.trim().is_empty()) {
        timeline = timeline.with_hospital_stay_reason(reason);
    }
    Ok(timeline)
}

// ═══════════════════════════════════════════════════════════
// CSV upload
// ═══════════════════════════════════════════════════════════

/// Normalize a CSV lab table into lab entries, in file order.
///
/// Header matching is case-insensitive and ignores surrounding whitespace.
/// Unit and reference range columns are optional.
pub fn parse_labs_csv(text: &str) -> Result<Vec<LabEntry>, IntakeError> {
    let mut rows = split_csv_records(text)?.into_iter();
    let header: Vec<String> = rows
        .next()
        .ok_or(IntakeError::EmptyCsv)?
        .iter()
        .map(|h| h.trim().trim_start_matches('\u{feff}').to_ascii_lowercase())
        .collect();

    let pick = |aliases: &[&str]| aliases.iter().find_map(|a| header.iter().position(|h| h == a));

    let date_col = pick(DATE_ALIASES);
    let name_col = pick(NAME_ALIASES);
    let value_col = pick(VALUE_ALIASES);
    let unit_col = pick(UNIT_ALIASES);
    let range_col = pick(RANGE_ALIASES);

    let (date_col, name_col, value_col) = match (date_col, name_col, value_col) {
        (Some(d), Some(n), Some(v)) => (d, n, v),
        _ => {
            let missing = [("date", date_col), ("lab_name", name_col), ("value", value_col)]
                .into_iter()
                .filter(|(_, col)| col.is_none())
                .map(|(name, _)| name)
                .collect();
            return Err(IntakeError::MissingColumns(missing));
        }
    };

    let cell = |row: &[String], col: Option<usize>| {
        col.and_then(|c| row.get(c))
            .map(|v| v.trim().to_string())
            .unwrap_or_default()
    };

    let labs: Vec<LabEntry> = rows
        .map(|row| LabEntry {
            date: cell(&row, Some(date_col)),
            lab_name: cell(&row, Some(name_col)),
            value: cell(&row, Some(value_col)),
            unit: cell(&row, unit_col),
            reference_range: cell(&row, range_col),
        })
        .collect();

    tracing::debug!(rows = labs.len(), "parsed lab CSV");
    Ok(labs)
}

/// Split CSV text into records. Double-quoted fields may contain commas,
/// line breaks and `""` escapes. Blank records are dropped.
fn split_csv_records(text: &str) -> Result<Vec<Vec<String>>, IntakeError> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut record_line = 1;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' if field.trim().is_empty() => {
                field.clear();
                in_quotes = true;
            }
            ',' if !in_quotes => record.push(std::mem::take(&mut field)),
            '\r' if !in_quotes && chars.peek() == Some(&'\n') => {}
            '\n' if !in_quotes => {
                line += 1;
                finish_record(&mut records, &mut record, &mut field);
                record_line = line;
            }
            _ => {
                if c == '\n' {
                    line += 1;
                }
                field.push(c);
            }
        }
    }

    if in_quotes {
        return Err(IntakeError::UnterminatedQuote { line: record_line });
    }
    finish_record(&mut records, &mut record, &mut field);
    Ok(records)
}

fn finish_record(records: &mut Vec<Vec<String>>, record: &mut Vec<String>, field: &mut String) {
    record.push(std::mem::take(field));
    let done = std::mem::take(record);
    if done.iter().any(|f| !f.trim().is_empty()) {
        records.push(done);
    }
}
