//! Per-topic prompt configuration.
//!
//! The three topic agents share one renderer; everything that differs
//! between them lives in a static [`TopicTemplate`].

use std::fmt;

use serde::{Deserialize, Serialize};

use super::generation::{DecodingParams, ModelTier};

/// Which explanation a topic agent produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Labs,
    Medications,
    #[serde(rename = "followups")]
    FollowUps,
}

impl Topic {
    pub fn all() -> &'static [Topic] {
        &[Self::Labs, Self::Medications, Self::FollowUps]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Labs => "labs",
            Self::Medications => "medications",
            Self::FollowUps => "followups",
        }
    }

    pub fn template(&self) -> &'static TopicTemplate {
        match self {
            Self::Labs => &LABS,
            Self::Medications => &MEDICATIONS,
            Self::FollowUps => &FOLLOWUPS,
        }
    }

    /// Headers the output must contain, verbatim and in this order.
    pub fn required_headers(&self) -> &'static [&'static str] {
        self.template().required_headers
    }

    /// The header every answer must open with.
    pub fn first_header(&self) -> &'static str {
        self.template().required_headers[0]
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "labs" | "lab" => Ok(Self::Labs),
            "medications" | "meds" => Ok(Self::Medications),
            "followups" | "follow-ups" | "followup" => Ok(Self::FollowUps),
            other => Err(format!(
                "unknown topic '{other}' (expected labs, medications or followups)"
            )),
        }
    }
}

/// Static configuration for one topic agent.
#[derive(Debug)]
pub struct TopicTemplate {
    /// What the assistant is explaining; completed with the stage phrase.
    pub purpose: &'static str,
    /// Title of the verbatim data block.
    pub data_title: &'static str,
    /// Forbidden behaviours, rendered as "Do NOT ..." rules.
    pub forbidden: &'static [&'static str],
    /// Tone constraints.
    pub tone: &'static [&'static str],
    pub required_headers: &'static [&'static str],
    /// Text appended after the first header to open the model's answer.
    pub seed_suffix: &'static str,
    pub system_instruction: &'static str,
    /// Canned sentence under each required header, same order.
    pub fallback_lines: &'static [&'static str],
    pub healthcare_tokens: u32,
    pub lightweight_tokens: u32,
    pub repetition_penalty: f32,
}

impl TopicTemplate {
    pub fn decoding(&self, tier: ModelTier) -> DecodingParams {
        let tokens = match tier {
            ModelTier::Healthcare => self.healthcare_tokens,
            ModelTier::Lightweight => self.lightweight_tokens,
        };
        DecodingParams::new(tokens, self.repetition_penalty)
    }

    /// Forced continuation: the first required header plus its list marker.
    pub fn seed(&self) -> String {
        format!("{}{}", self.required_headers[0], self.seed_suffix)
    }
}

// ═══════════════════════════════════════════════════════════
// Shared rules
// ═══════════════════════════════════════════════════════════

const SYSTEM_INSTRUCTION: &str = "\
You are NephroBridge, a patient-facing explanation assistant for people \
living with kidney disease. You explain medical information clearly \
without giving advice.";

const QUESTIONS_HEADER: &str = "💬 Helpful questions to ask your care team";
const SAFETY_HEADER: &str = "🛟 Safety note";

const TONE: &[&str] = &[
    "Be calm, supportive, and non-alarmist",
    "Use plain, patient-friendly language",
    "Write short sentences and short bullet points",
];

const SAFETY_FALLBACK: &str = "These explanations are for clarity and preparation, \
not diagnosis. If you feel unwell or your symptoms are getting worse, contact \
your care team.";

const QUESTIONS_FALLBACK: &str = "- What should I keep track of before my next visit?";

// ═══════════════════════════════════════════════════════════
// Topic templates
// ═══════════════════════════════════════════════════════════

static LABS: TopicTemplate = TopicTemplate {
    purpose: "You are explaining kidney lab trends to a patient",
    data_title: "LAB RESULTS (use exactly as provided)",
    forbidden: &[
        "diagnose or give medical instructions",
        "predict outcomes",
        "comment on data formatting or correctness",
        "add, infer, or change any lab value",
        "explain your reasoning",
    ],
    tone: TONE,
    required_headers: &[
        "🧠 Key takeaways",
        "🧬 What changed in your labs",
        "🔍 Common reasons this can happen",
        QUESTIONS_HEADER,
        SAFETY_HEADER,
    ],
    seed_suffix: "\n- ",
    system_instruction: SYSTEM_INSTRUCTION,
    fallback_lines: &[
        "- No lab results were provided, so there is nothing to compare yet.",
        "No lab values were shared with NephroBridge this time.",
        "Once lab results are added, common reasons for changes can be explained here.",
        QUESTIONS_FALLBACK,
        SAFETY_FALLBACK,
    ],
    healthcare_tokens: 180,
    lightweight_tokens: 250,
    repetition_penalty: 1.1,
};

static MEDICATIONS: TopicTemplate = TopicTemplate {
    purpose: "You are explaining medication changes to a kidney patient",
    data_title: "MEDICATION CHANGES (use exactly as provided)",
    forbidden: &[
        "give medical advice, dosing, or instructions",
        "diagnose or predict outcomes",
        "list side effects unless common and general",
        "comment on data quality or assumptions",
        "add or infer medications that are not listed",
    ],
    tone: TONE,
    required_headers: &[
        "💊 What changed in your medications",
        "🔍 Why clinicians commonly make changes like this",
        QUESTIONS_HEADER,
        SAFETY_HEADER,
    ],
    seed_suffix: "\n",
    system_instruction: SYSTEM_INSTRUCTION,
    fallback_lines: &[
        "No medication changes were provided, so there is nothing to compare yet.",
        "When before and after medication lists are added, common reasons for changes can be explained here.",
        QUESTIONS_FALLBACK,
        SAFETY_FALLBACK,
    ],
    healthcare_tokens: 400,
    lightweight_tokens: 400,
    repetition_penalty: 1.2,
};

static FOLLOWUPS: TopicTemplate = TopicTemplate {
    purpose: "You are helping a kidney patient understand what comes next in their care",
    data_title: "FOLLOW-UPS AND OPEN LOOPS (use exactly as provided)",
    forbidden: &[
        "give medical advice or instructions",
        "diagnose or predict outcomes or results",
        "invent dates, appointments, or tests that are not listed",
        "comment on data quality or assumptions",
    ],
    tone: TONE,
    required_headers: &[
        "🧾 What comes next",
        "📅 Your upcoming appointments",
        "⏳ Results you are still waiting for",
        QUESTIONS_HEADER,
        SAFETY_HEADER,
    ],
    seed_suffix: "\n",
    system_instruction: SYSTEM_INSTRUCTION,
    fallback_lines: &[
        "No follow-up plans were provided, so there is nothing to organize yet.",
        "No upcoming appointments were listed.",
        "No pending results were listed.",
        QUESTIONS_FALLBACK,
        SAFETY_FALLBACK,
    ],
    healthcare_tokens: 320,
    lightweight_tokens: 320,
    repetition_penalty: 1.15,
};
