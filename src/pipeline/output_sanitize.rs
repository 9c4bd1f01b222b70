//! Post-generation sanitization of topic answers.
//!
//! Two stages, in order:
//! 1. Leakage truncation: cut at the earliest case-insensitive occurrence of
//!    any forbidden marker (thinking tags, meta-commentary, AI disclaimers).
//! 2. Re-anchoring: drop everything before the topic's first required
//!    header. A missing header is not an error; the truncated text is
//!    returned and the caller flags structural drift.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Marker substrings that must never reach a patient. Matched
/// case-insensitively.
pub const FORBIDDEN_MARKERS: &[&str] = &[
    "<thought>",
    "<unused",
    "analysis",
    "reasoning",
    "The user wants",
    "Model:",
    "Confidence",
    "As an AI",
    "language model",
];

static FORBIDDEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    let alternation = FORBIDDEN_MARKERS
        .iter()
        .map(|m| regex::escape(m))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!("(?i){alternation}")).expect("escaped literals form a valid regex")
});

/// Result of sanitizing one raw model answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SanitizedOutput {
    /// Trimmed, patient-safe text.
    pub text: String,
    /// Text starts with the first required header.
    pub anchored: bool,
    /// Byte offset in the raw text where leakage truncation cut, if any.
    pub truncated_at: Option<usize>,
}

/// Truncate `text` before the earliest forbidden marker.
///
/// Returns the kept prefix and the cut offset.
pub fn truncate_leakage(text: &str) -> (&str, Option<usize>) {
    match FORBIDDEN_RE.find(text) {
        Some(m) => (&text[..m.start()], Some(m.start())),
        None => (text, None),
    }
}

/// Drop everything before the first exact occurrence of `header`.
pub fn reanchor<'a>(text: &'a str, header: &str) -> Option<&'a str> {
    text.find(header).map(|idx| &text[idx..])
}

/// Full sanitizer: leakage truncation, then re-anchoring on `first_header`.
pub fn sanitize_output(raw: &str, first_header: &str) -> SanitizedOutput {
    let (kept, truncated_at) = truncate_leakage(raw);
    if let Some(offset) = truncated_at {
        tracing::debug!(offset, "leakage marker found, output truncated");
    }

    match reanchor(kept, first_header) {
        Some(anchored) => SanitizedOutput {
            text: anchored.trim().to_string(),
            anchored: true,
            truncated_at,
        },
        None => SanitizedOutput {
            text: kept.trim().to_string(),
            anchored: false,
            truncated_at,
        },
    }
}

// ═══════════════════════════════════════════════════════════
// Structure check
// ═══════════════════════════════════════════════════════════

/// How far an answer drifted from the required section structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StructureReport {
    /// Required headers that never appear.
    pub missing: Vec<String>,
    /// Headers that appear more than once.
    pub duplicated: Vec<String>,
    /// Present headers are not in the required order.
    pub out_of_order: bool,
    /// Some header is immediately followed by the next one (or the end of
    /// the text) with nothing in between.
    pub empty_sections: Vec<String>,
}

impl StructureReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
            && self.duplicated.is_empty()
            && !self.out_of_order
            && self.empty_sections.is_empty()
    }
}

/// Compare `text` against the ordered `headers` contract.
pub fn check_structure(text: &str, headers: &[&str]) -> StructureReport {
    let mut report = StructureReport::default();
    let mut found: Vec<(usize, &str)> = Vec::new();

    for &header in headers {
        match text.find(header) {
            Some(pos) => found.push((pos, header)),
            None => report.missing.push(header.to_string()),
        }
        if text.matches(header).count() > 1 {
            report.duplicated.push(header.to_string());
        }
    }

    report.out_of_order = found.windows(2).any(|w| w[0].0 > w[1].0);

    let mut by_position = found.clone();
    by_position.sort_by_key(|(pos, _)| *pos);
    for (i, (pos, header)) in by_position.iter().enumerate() {
        let body_start = pos + header.len();
        let body_end = by_position
            .get(i + 1)
            .map(|(next, _)| *next)
            .unwrap_or(text.len());
        let body = text.get(body_start..body_end).unwrap_or("");
        if body.trim().trim_matches('-').trim().is_empty() {
            report.empty_sections.push(header.to_string());
        }
    }

    report
}
