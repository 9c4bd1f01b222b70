use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::pipeline::generation::ModelTier;

/// Application-level constants
pub const APP_NAME: &str = "NephroBridge";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default local Ollama endpoint.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Healthcare-specialized tier: MedGemma 1.5 instruction-tuned.
pub const DEFAULT_HEALTHCARE_MODEL: &str = "dcarrascosa/medgemma-1.5-4b-it";

/// Lightweight general tier for local/dev machines.
pub const DEFAULT_LIGHTWEIGHT_MODEL: &str = "gemma:2b-instruct";

/// Generation is slow on CPU-only machines (MedGemma ~3 tok/s).
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default tracing filter when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "nephrobridge=info,nephrobridge_lib=info,reqwest=warn"
}

/// Get the application data directory
/// ~/NephroBridge/ on all platforms, falling back to the working directory
/// when no home directory can be determined.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Where a user-assembled timeline is saved for reproducibility.
pub fn default_timeline_path() -> PathBuf {
    app_data_dir().join("patient_timeline_user.json")
}

// ═══════════════════════════════════════════════════════════
// Runtime settings
// ═══════════════════════════════════════════════════════════

/// Maps each model tier to a concrete Ollama model name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelRegistry {
    pub healthcare: String,
    pub lightweight: String,
}

impl ModelRegistry {
    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Healthcare => &self.healthcare,
            ModelTier::Lightweight => &self.lightweight,
        }
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self {
            healthcare: DEFAULT_HEALTHCARE_MODEL.to_string(),
            lightweight: DEFAULT_LIGHTWEIGHT_MODEL.to_string(),
        }
    }
}

/// Backend settings, resolved once at startup.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub ollama_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub models: ModelRegistry,
    /// Unload the model after every topic call to bound peak memory.
    pub release_after_call: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            models: ModelRegistry::default(),
            release_after_call: true,
        }
    }
}

impl Settings {
    /// Defaults overridden by `NEPHROBRIDGE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve settings from an arbitrary key lookup. Blank and unparsable
    /// values fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut settings = Self::default();

        if let Some(url) = get("NEPHROBRIDGE_OLLAMA_URL") {
            settings.ollama_url = url.trim_end_matches('/').to_string();
        }
        if let Some(model) = get("NEPHROBRIDGE_HEALTHCARE_MODEL") {
            settings.models.healthcare = model;
        }
        if let Some(model) = get("NEPHROBRIDGE_LIGHTWEIGHT_MODEL") {
            settings.models.lightweight = model;
        }
        match get("NEPHROBRIDGE_TIMEOUT_SECS").map(|v| v.parse::<u64>()) {
            Some(Ok(secs)) if secs > 0 => {
                settings.request_timeout = Duration::from_secs(secs);
            }
            Some(_) => {
                tracing::warn!("ignoring invalid NEPHROBRIDGE_TIMEOUT_SECS");
            }
            None => {}
        }
        if let Some(flag) = get("NEPHROBRIDGE_KEEP_MODEL_LOADED") {
            settings.release_after_call = !matches!(
                flag.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }

        settings
    }
}
