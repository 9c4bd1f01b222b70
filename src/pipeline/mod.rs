pub mod topic;
pub mod prompt_templates;
pub mod generation;
pub mod ollama;
pub mod model_gate; // One resident model per process
pub mod output_sanitize;
pub mod orchestrator;

pub use generation::{DecodingParams, GenerationError, GenerationRequest, LlmClient, ModelTier};
pub use model_gate::ModelGate;
pub use ollama::{MockLlmClient, OllamaClient};
pub use orchestrator::{
    canned_response, AgentError, ExplainOptions, ExplanationOrchestrator, ExplanationSource,
    Explanations, TopicExplanation,
};
pub use output_sanitize::{check_structure, sanitize_output, SanitizedOutput, StructureReport};
pub use prompt_templates::{render_prompt, stage_phrase};
pub use topic::Topic;
