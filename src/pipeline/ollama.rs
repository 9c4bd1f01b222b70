use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::generation::{GenerationError, GenerationRequest, LlmClient};
use crate::config::Settings;

/// Ollama HTTP client for local LLM inference.
///
/// Requests use raw mode: the conversation is rendered into the Gemma turn
/// format here so the forced-continuation seed can be placed after the
/// model-turn marker.
pub struct OllamaClient {
    base_url: String,
    client: reqwest::blocking::Client,
    timeout: Duration,
}

impl OllamaClient {
    pub fn new(settings: &Settings) -> Result<Self, GenerationError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| GenerationError::Network(e.to_string()))?;

        Ok(Self {
            base_url: settings.ollama_url.trim_end_matches('/').to_string(),
            client,
            timeout: settings.request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_send_error(&self, e: reqwest::Error, timeout: Duration) -> GenerationError {
        if e.is_connect() {
            GenerationError::NotReachable(self.base_url.clone())
        } else if e.is_timeout() {
            GenerationError::Timeout(timeout)
        } else {
            GenerationError::Network(e.to_string())
        }
    }
}

/// Render a system + user exchange in Gemma's chat format, opening the
/// model turn with `seed`.
///
/// Gemma has no system role; the system instruction is prepended to the
/// user turn, as the model's own chat template does.
pub fn render_gemma_turns(system: &str, user: &str, seed: &str) -> String {
    format!(
        "<start_of_turn>user\n{system}\n\n{user}<end_of_turn>\n<start_of_turn>model\n{seed}"
    )
}

// ═══════════════════════════════════════════════════════════
// Wire types
// ═══════════════════════════════════════════════════════════

/// Request body for Ollama /api/generate (raw mode).
#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    raw: bool,
    stream: bool,
    options: OllamaOptions,
    /// "0" unloads the model as soon as the response is produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<&'static str>,
}

/// Deterministic decoding options.
#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    top_k: u32,
    seed: u32,
    num_predict: u32,
    repeat_penalty: f32,
    repeat_last_n: u32,
}

/// Response body from Ollama /api/generate
#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

/// Response body from Ollama /api/tags
#[derive(Deserialize)]
struct OllamaTagsResponse {
    models: Vec<OllamaModel>,
}

#[derive(Deserialize)]
struct OllamaModel {
    name: String,
}

fn build_generate_body(request: &GenerationRequest) -> OllamaGenerateRequest<'_> {
    OllamaGenerateRequest {
        model: &request.model,
        prompt: render_gemma_turns(&request.system, &request.user, &request.seed),
        raw: true,
        stream: false,
        options: OllamaOptions {
            temperature: 0.0,
            top_k: 1,
            seed: 0,
            num_predict: request.decoding.max_new_tokens,
            repeat_penalty: request.decoding.repetition_penalty,
            repeat_last_n: request.decoding.repeat_window,
        },
        keep_alive: request.release_after.then_some("0"),
    }
}

impl LlmClient for OllamaClient {
    fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = build_generate_body(request);
        let timeout = request.timeout.unwrap_or(self.timeout);

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .map_err(|e| self.map_send_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(GenerationError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: OllamaGenerateResponse = response
            .json()
            .map_err(|e| GenerationError::ResponseParsing(e.to_string()))?;

        // Raw mode returns only the continuation; the seed is part of the answer.
        Ok(format!("{}{}", request.seed, parsed.response))
    }

    fn list_models(&self) -> Result<Vec<String>, GenerationError> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| self.map_send_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(GenerationError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: OllamaTagsResponse = response
            .json()
            .map_err(|e| GenerationError::ResponseParsing(e.to_string()))?;

        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }
}

/// Mock LLM client for testing. Continues every seed with a fixed text.
pub struct MockLlmClient {
    continuation: String,
    available_models: Vec<String>,
    fail_marker: Option<String>,
    seen: Mutex<Vec<GenerationRequest>>,
}

impl MockLlmClient {
    pub fn new(continuation: &str) -> Self {
        Self {
            continuation: continuation.to_string(),
            available_models: vec!["dcarrascosa/medgemma-1.5-4b-it:latest".to_string()],
            fail_marker: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.available_models = models;
        self
    }

    /// Fail with `NotReachable` whenever the user prompt contains `marker`.
    pub fn failing_when_prompt_contains(mut self, marker: &str) -> Self {
        self.fail_marker = Some(marker.to_string());
        self
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }
}

impl LlmClient for MockLlmClient {
    fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(request.clone());
        }
        if let Some(marker) = &self.fail_marker {
            if request.user.contains(marker.as_str()) {
                return Err(GenerationError::NotReachable("mock://ollama".into()));
            }
        }
        Ok(format!("{}{}", request.seed, self.continuation))
    }

    fn list_models(&self) -> Result<Vec<String>, GenerationError> {
        Ok(self.available_models.clone())
    }
}
