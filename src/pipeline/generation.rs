//! Generation contract between the topic agents and a model backend.
//!
//! Decoding is deterministic: no sampling, fixed seed, repetition
//! suppressed by penalty. The forced continuation ("seed") is an explicit
//! request field so backends can steer the model to open with the first
//! required section header instead of a preamble.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Which generation backend a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Healthcare-specialized model (MedGemma).
    Healthcare,
    /// Lightweight general model for local/dev machines.
    Lightweight,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthcare => "healthcare",
            Self::Lightweight => "lightweight",
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ModelTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "healthcare" | "medgemma" => Ok(Self::Healthcare),
            "lightweight" | "gemma" => Ok(Self::Lightweight),
            other => Err(format!(
                "unknown model tier '{other}' (expected healthcare or lightweight)"
            )),
        }
    }
}

/// Deterministic decoding parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecodingParams {
    /// Hard cap on generated tokens.
    pub max_new_tokens: u32,
    /// Penalty applied to recently generated tokens (1.0 = off).
    pub repetition_penalty: f32,
    /// How many recent tokens the penalty looks back over.
    pub repeat_window: u32,
}

/// Recent-token window for repetition suppression.
pub const DEFAULT_REPEAT_WINDOW: u32 = 64;

impl DecodingParams {
    pub fn new(max_new_tokens: u32, repetition_penalty: f32) -> Self {
        Self {
            max_new_tokens,
            repetition_penalty,
            repeat_window: DEFAULT_REPEAT_WINDOW,
        }
    }
}

/// A single-turn chat request with a forced continuation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub model: String,
    /// System role instruction.
    pub system: String,
    /// Rendered user prompt.
    pub user: String,
    /// Text the model's answer is forced to begin with.
    pub seed: String,
    pub decoding: DecodingParams,
    /// Ask the backend to unload the model once generation completes.
    pub release_after: bool,
    /// Overall request budget. `None` = client default.
    pub timeout: Option<Duration>,
}

/// Backend failure. Always surfaced to the caller; never an empty result.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("The model backend is not reachable at {0}")]
    NotReachable(String),

    #[error("The model backend returned an error (HTTP {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Request timed out after {:.1} seconds", .0.as_secs_f32())]
    Timeout(Duration),

    #[error("The explanation deadline passed before generation could start")]
    DeadlineExceeded,

    #[error("Malformed backend response: {0}")]
    ResponseParsing(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Model access lock is poisoned")]
    ModelGate,
}

/// Model backend abstraction (allows mocking).
pub trait LlmClient {
    /// Generate a continuation. The returned text starts with `request.seed`.
    fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;

    fn list_models(&self) -> Result<Vec<String>, GenerationError>;

    fn is_model_available(&self, model: &str) -> Result<bool, GenerationError> {
        let models = self.list_models()?;
        Ok(models.iter().any(|m| m.starts_with(model)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_parses_aliases() {
        assert_eq!("healthcare".parse::<ModelTier>().unwrap(), ModelTier::Healthcare);
        assert_eq!("MedGemma".parse::<ModelTier>().unwrap(), ModelTier::Healthcare);
        assert_eq!("lightweight".parse::<ModelTier>().unwrap(), ModelTier::Lightweight);
        assert_eq!(" gemma ".parse::<ModelTier>().unwrap(), ModelTier::Lightweight);
    }

    #[test]
    fn tier_rejects_unknown() {
        let err = "gpt".parse::<ModelTier>().unwrap_err();
        assert!(err.contains("gpt"));
    }

    #[test]
    fn tier_serializes_snake_case() {
        let json = serde_json::to_value(ModelTier::Lightweight).unwrap();
        assert_eq!(json, "lightweight");
    }

    #[test]
    fn decoding_params_default_window() {
        let params = DecodingParams::new(180, 1.1);
        assert_eq!(params.max_new_tokens, 180);
        assert_eq!(params.repeat_window, DEFAULT_REPEAT_WINDOW);
    }

    #[test]
    fn error_messages_are_sentences() {
        let err = GenerationError::NotReachable("http://localhost:11434".into());
        assert_eq!(
            err.to_string(),
            "The model backend is not reachable at http://localhost:11434"
        );
        assert_eq!(
            GenerationError::Timeout(Duration::from_secs(30)).to_string(),
            "Request timed out after 30.0 seconds"
        );
    }

    #[test]
    fn sub_second_timeout_is_not_reported_as_zero() {
        assert_eq!(
            GenerationError::Timeout(Duration::from_millis(400)).to_string(),
            "Request timed out after 0.4 seconds"
        );
    }
}
