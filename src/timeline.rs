//! Patient timeline: the single structured input to every topic agent.
//!
//! Clinical values are carried as opaque strings. Nothing in this crate
//! parses, rounds, or "corrects" a lab value, unit, or date.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Where the patient is in their kidney journey.
///
/// Unknown stage strings are kept in `Other` instead of being rejected, so
/// prompt rendering can fall back to a generic phrase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Stage {
    PostTransplant,
    AdvancedCkd,
    Dialysis,
    Other(String),
}

impl Stage {
    /// The three stages offered to patients.
    pub fn known() -> &'static [Stage] {
        &[Stage::PostTransplant, Stage::AdvancedCkd, Stage::Dialysis]
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::PostTransplant => "post_transplant",
            Self::AdvancedCkd => "advanced_ckd",
            Self::Dialysis => "dialysis",
            Self::Other(raw) => raw,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl From<&str> for Stage {
    fn from(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "post_transplant" => Self::PostTransplant,
            "advanced_ckd" => Self::AdvancedCkd,
            "dialysis" => Self::Dialysis,
            _ => Self::Other(raw.trim().to_string()),
        }
    }
}

impl From<String> for Stage {
    fn from(raw: String) -> Self {
        Stage::from(raw.as_str())
    }
}

impl From<Stage> for String {
    fn from(stage: Stage) -> Self {
        stage.as_str().to_string()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One lab result as the patient reported it.
///
/// Hand-written uploads may carry numbers (`"value": 1.6`); they are kept
/// as the text JSON gives them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabEntry {
    #[serde(default, deserialize_with = "deserialize_text")]
    pub date: String,
    #[serde(default, deserialize_with = "deserialize_text")]
    pub lab_name: String,
    #[serde(default, deserialize_with = "deserialize_text")]
    pub value: String,
    #[serde(default, deserialize_with = "deserialize_text")]
    pub unit: String,
    #[serde(default, deserialize_with = "deserialize_text")]
    pub reference_range: String,
}

/// Accept a string, number, bool or null as field text.
fn deserialize_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(D::Error::custom(format!(
            "expected text or a number, found {other}"
        ))),
    }
}

/// Accept either a plain reason string or the older nested
/// `{"reason_for_admission": ...}` object. Blank reasons become `None`.
fn deserialize_hospital_stay_reason<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let reason = match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Object(stay) => match stay.get("reason_for_admission") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                return Err(D::Error::custom(format!(
                    "reason_for_admission must be text, found {other}"
                )))
            }
        },
        other => {
            return Err(D::Error::custom(format!(
                "expected a hospital stay reason, found {other}"
            )))
        }
    };
    Ok(reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty()))
}

impl LabEntry {
    pub fn new(
        date: impl Into<String>,
        lab_name: impl Into<String>,
        value: impl Into<String>,
        unit: impl Into<String>,
        reference_range: impl Into<String>,
    ) -> Self {
        Self {
            date: date.into(),
            lab_name: lab_name.into(),
            value: value.into(),
            unit: unit.into(),
            reference_range: reference_range.into(),
        }
    }

    /// Date, lab name and value are all present.
    pub fn is_valid(&self) -> bool {
        self.missing_fields().is_empty()
    }

    /// Every field is empty (an untouched form row).
    pub fn is_blank(&self) -> bool {
        [
            &self.date,
            &self.lab_name,
            &self.value,
            &self.unit,
            &self.reference_range,
        ]
        .iter()
        .all(|field| field.trim().is_empty())
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.date.trim().is_empty() {
            missing.push("date");
        }
        if self.lab_name.trim().is_empty() {
            missing.push("lab_name");
        }
        if self.value.trim().is_empty() {
            missing.push("value");
        }
        missing
    }
}

/// Structured record of a patient's stage, labs, medications, and follow-ups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeline {
    #[serde(alias = "kidney_journey_stage")]
    pub stage: Stage,
    #[serde(
        default,
        alias = "recent_hospital_stay",
        deserialize_with = "deserialize_hospital_stay_reason",
        skip_serializing_if = "Option::is_none"
    )]
    pub hospital_stay_reason: Option<String>,
    #[serde(default, alias = "labs_over_time")]
    pub labs: Vec<LabEntry>,
    #[serde(default)]
    pub medications_before: Vec<String>,
    #[serde(default)]
    pub medications_after: Vec<String>,
    #[serde(default, alias = "followup_appointments")]
    pub followups: Vec<String>,
    #[serde(default)]
    pub pending_labs: Vec<String>,
}

#[derive(Error, Debug)]
pub enum TimelineError {
    #[error("Lab row {row} is missing {}", .missing.join(", "))]
    InvalidLabEntry {
        row: usize,
        missing: Vec<&'static str>,
    },

    #[error("Timeline JSON is invalid: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ═══════════════════════════════════════════════════════════
// Construction & validation
// ═══════════════════════════════════════════════════════════

impl Timeline {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            hospital_stay_reason: None,
            labs: Vec::new(),
            medications_before: Vec::new(),
            medications_after: Vec::new(),
            followups: Vec::new(),
            pending_labs: Vec::new(),
        }
    }

    /// Blank reasons are stored as `None`.
    pub fn with_hospital_stay_reason(mut self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let trimmed = reason.trim();
        self.hospital_stay_reason = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self
    }

    pub fn with_labs(mut self, labs: Vec<LabEntry>) -> Self {
        self.labs = labs;
        self
    }

    pub fn with_medications(mut self, before: Vec<String>, after: Vec<String>) -> Self {
        self.medications_before = before;
        self.medications_after = after;
        self
    }

    pub fn with_followups(mut self, followups: Vec<String>, pending_labs: Vec<String>) -> Self {
        self.followups = followups;
        self.pending_labs = pending_labs;
        self
    }

    /// Reject lab rows that were started but lack date, name or value.
    ///
    /// Fully blank rows are skipped. An empty lab list is valid: the lab
    /// agent answers it with its fallback text.
    pub fn validate(&self) -> Result<(), TimelineError> {
        for (i, entry) in self.labs.iter().enumerate() {
            if entry.is_blank() {
                continue;
            }
            let missing = entry.missing_fields();
            if !missing.is_empty() {
                return Err(TimelineError::InvalidLabEntry {
                    row: i + 1,
                    missing,
                });
            }
        }
        Ok(())
    }

    /// Lab entries usable in a prompt, in input order.
    pub fn valid_labs(&self) -> impl Iterator<Item = &LabEntry> {
        self.labs.iter().filter(|entry| entry.is_valid())
    }

    pub fn has_labs(&self) -> bool {
        self.valid_labs().next().is_some()
    }

    pub fn has_medication_changes(&self) -> bool {
        !self.medications_before.is_empty() || !self.medications_after.is_empty()
    }

    pub fn has_followups(&self) -> bool {
        !self.followups.is_empty() || !self.pending_labs.is_empty()
    }

    // ── JSON persistence ───────────────────────────────────

    pub fn from_json_str(json: &str) -> Result<Self, TimelineError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_pretty(&self) -> Result<String, TimelineError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self, TimelineError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Write the timeline as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), TimelineError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_json_pretty()?)?;
        tracing::info!(path = %path.display(), "timeline saved");
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
