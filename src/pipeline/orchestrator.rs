use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use super::generation::{GenerationError, GenerationRequest, LlmClient, ModelTier};
use super::model_gate::ModelGate;
use super::output_sanitize::{check_structure, sanitize_output, StructureReport};
use super::prompt_templates::{render_prompt, system_prompt};
use super::topic::Topic;
use crate::config::{ModelRegistry, Settings};
use crate::timeline::Timeline;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Per-call configuration. Nothing is read from process state at call time.
#[derive(Debug, Clone, Copy)]
pub struct ExplainOptions {
    pub tier: ModelTier,
    /// Calls starting after this instant fail with `DeadlineExceeded`; the
    /// remaining budget bounds the backend request.
    pub deadline: Option<Instant>,
    /// Unload the model after each topic call.
    pub release_after_call: bool,
}

impl ExplainOptions {
    pub fn new(tier: ModelTier) -> Self {
        Self {
            tier,
            deadline: None,
            release_after_call: true,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline `budget` from now.
    pub fn with_time_budget(self, budget: Duration) -> Self {
        self.with_deadline(Instant::now() + budget)
    }

    pub fn keep_model_loaded(mut self) -> Self {
        self.release_after_call = false;
        self
    }

    /// Time left before the deadline, or `DeadlineExceeded`.
    fn remaining(&self) -> Result<Option<Duration>, GenerationError> {
        match self.deadline {
            None => Ok(None),
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(left) if !left.is_zero() => Ok(Some(left)),
                _ => Err(GenerationError::DeadlineExceeded),
            },
        }
    }
}

/// Whether an answer came from the model or from canned text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplanationSource {
    Generated,
    Fallback,
}

/// One topic's patient-facing answer.
#[derive(Debug, Clone, Serialize)]
pub struct TopicExplanation {
    pub topic: Topic,
    pub text: String,
    pub source: ExplanationSource,
    /// Model that produced the text; `None` for fallback answers.
    pub model: Option<String>,
    /// Set when a generated answer misses the required structure. Non-fatal.
    pub drift: Option<StructureReport>,
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("The {topic} explanation could not be generated: {source}")]
    Generation {
        topic: Topic,
        #[source]
        source: GenerationError,
    },
}

impl AgentError {
    pub fn topic(&self) -> Topic {
        match self {
            Self::Generation { topic, .. } => *topic,
        }
    }
}

/// The three independent topic results for one timeline.
#[derive(Debug)]
pub struct Explanations {
    pub labs: Result<TopicExplanation, AgentError>,
    pub medications: Result<TopicExplanation, AgentError>,
    pub followups: Result<TopicExplanation, AgentError>,
}

impl Explanations {
    pub fn get(&self, topic: Topic) -> &Result<TopicExplanation, AgentError> {
        match topic {
            Topic::Labs => &self.labs,
            Topic::Medications => &self.medications,
            Topic::FollowUps => &self.followups,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        Topic::all().iter().all(|t| self.get(*t).is_ok())
    }
}

// ═══════════════════════════════════════════════════════════
// Canned responses
// ═══════════════════════════════════════════════════════════

/// Fallback answer: every required header, in order, each followed by a
/// neutral placeholder sentence.
pub fn canned_response(topic: Topic) -> String {
    let template = topic.template();
    template
        .required_headers
        .iter()
        .zip(template.fallback_lines)
        .map(|(header, line)| format!("{header}\n{line}"))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// True when the timeline has nothing for this topic to explain.
pub fn topic_is_empty(topic: Topic, timeline: &Timeline) -> bool {
    match topic {
        Topic::Labs => !timeline.has_labs(),
        Topic::Medications => !timeline.has_medication_changes(),
        Topic::FollowUps => !timeline.has_followups(),
    }
}

// ═══════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════

/// Runs the topic agents: emptiness check → prompt → generate → sanitize →
/// structure check.
pub struct ExplanationOrchestrator {
    llm: Arc<dyn LlmClient + Send + Sync>,
    models: ModelRegistry,
    gate: Arc<ModelGate>,
}

impl ExplanationOrchestrator {
    pub fn new(llm: Arc<dyn LlmClient + Send + Sync>, models: ModelRegistry) -> Self {
        Self {
            llm,
            models,
            gate: Arc::new(ModelGate::new()),
        }
    }

    /// Share a gate with other orchestrators so they serialize on one
    /// resident model.
    pub fn with_gate(mut self, gate: Arc<ModelGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn from_settings(llm: Arc<dyn LlmClient + Send + Sync>, settings: &Settings) -> Self {
        Self::new(llm, settings.models.clone())
    }

    pub fn gate(&self) -> &ModelGate {
        &self.gate
    }

    /// Run one topic agent. Never mutates the timeline.
    pub fn run_topic(
        &self,
        topic: Topic,
        timeline: &Timeline,
        options: &ExplainOptions,
    ) -> Result<TopicExplanation, AgentError> {
        if topic_is_empty(topic, timeline) {
            tracing::info!(%topic, "no input for topic, using fallback text");
            return Ok(TopicExplanation {
                topic,
                text: canned_response(topic),
                source: ExplanationSource::Fallback,
                model: None,
                drift: None,
            });
        }

        self.generate_topic(topic, timeline, options)
            .map_err(|source| AgentError::Generation { topic, source })
    }

    fn generate_topic(
        &self,
        topic: Topic,
        timeline: &Timeline,
        options: &ExplainOptions,
    ) -> Result<TopicExplanation, GenerationError> {
        options.remaining()?;
        let template = topic.template();
        let model = self.models.model_for(options.tier).to_string();

        let mut request = GenerationRequest {
            model: model.clone(),
            system: system_prompt(topic).to_string(),
            user: render_prompt(topic, timeline),
            seed: template.seed(),
            decoding: template.decoding(options.tier),
            release_after: options.release_after_call,
            timeout: None,
        };

        let started = Instant::now();
        let raw = {
            let _guard = self.gate.acquire(topic, &model)?;
            // Waiting on the gate spends the budget too.
            request.timeout = options.remaining()?;
            tracing::info!(%topic, tier = %options.tier, model = %model, "generating explanation");
            self.llm.generate(&request)?
        };

        let sanitized = sanitize_output(&raw, topic.first_header());
        let report = check_structure(&sanitized.text, topic.required_headers());
        let drift = if sanitized.anchored && report.is_complete() {
            None
        } else {
            tracing::warn!(
                %topic,
                anchored = sanitized.anchored,
                missing = ?report.missing,
                out_of_order = report.out_of_order,
                "generated explanation drifted from required structure"
            );
            Some(report)
        };

        tracing::info!(
            %topic,
            elapsed_ms = started.elapsed().as_millis() as u64,
            chars = sanitized.text.len(),
            truncated = sanitized.truncated_at.is_some(),
            "explanation ready"
        );

        Ok(TopicExplanation {
            topic,
            text: sanitized.text,
            source: ExplanationSource::Generated,
            model: Some(model),
            drift,
        })
    }

    /// Run all three topic agents. A failure in one never stops the others.
    pub fn explain(&self, timeline: &Timeline, options: &ExplainOptions) -> Explanations {
        Explanations {
            labs: self.run_isolated(Topic::Labs, timeline, options),
            medications: self.run_isolated(Topic::Medications, timeline, options),
            followups: self.run_isolated(Topic::FollowUps, timeline, options),
        }
    }

    /// Run one topic, or all of them when `only` is `None`, in display order.
    pub fn explain_topics(
        &self,
        timeline: &Timeline,
        options: &ExplainOptions,
        only: Option<Topic>,
    ) -> Vec<(Topic, Result<TopicExplanation, AgentError>)> {
        Topic::all()
            .iter()
            .copied()
            .filter(|topic| only.map_or(true, |t| t == *topic))
            .map(|topic| (topic, self.run_isolated(topic, timeline, options)))
            .collect()
    }

    fn run_isolated(
        &self,
        topic: Topic,
        timeline: &Timeline,
        options: &ExplainOptions,
    ) -> Result<TopicExplanation, AgentError> {
        let result = self.run_topic(topic, timeline, options);
        if let Err(e) = &result {
            tracing::error!(%topic, error = %e, "topic agent failed");
        }
        result
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ollama::MockLlmClient;
    use crate::timeline::{LabEntry, Stage};

    fn full_timeline() -> Timeline {
        Timeline::new(Stage::PostTransplant)
            .with_labs(vec![LabEntry::new(
                "2026-01-08",
                "Creatinine",
                "1.6",
                "mg/dL",
                "0.6–1.3",
            )])
            .with_medications(vec!["Tacrolimus 1mg".into()], vec!["Tacrolimus 2mg".into()])
            .with_followups(vec!["Nephrology follow-up in 1 week".into()], vec![])
    }

    fn orchestrator(mock: Arc<MockLlmClient>) -> ExplanationOrchestrator {
        ExplanationOrchestrator::new(mock, ModelRegistry::default())
    }

    // ── Canned responses ───────────────────────────────────

    #[test]
    fn canned_responses_have_every_header_once_in_order() {
        for topic in Topic::all() {
            let text = canned_response(*topic);
            let mut last = 0;
            for header in topic.required_headers() {
                assert_eq!(text.matches(header).count(), 1, "{topic}: {header}");
                let pos = text.find(header).unwrap();
                assert!(pos >= last);
                last = pos;
            }
            assert!(text.starts_with(topic.first_header()));
            assert!(check_structure(&text, topic.required_headers()).is_complete());
        }
    }

    #[test]
    fn empty_labs_use_canned_text() {
        let mock = Arc::new(MockLlmClient::new("unused"));
        let timeline = Timeline::new(Stage::Dialysis);
        let result = orchestrator(mock.clone())
            .run_topic(Topic::Labs, &timeline, &ExplainOptions::new(ModelTier::Healthcare))
            .unwrap();

        assert_eq!(result.source, ExplanationSource::Fallback);
        assert!(result.text.contains("No lab results were provided"));
        assert_eq!(result.text, canned_response(Topic::Labs));
        assert!(result.model.is_none());
        assert!(mock.requests().is_empty());
    }

    #[test]
    fn only_invalid_labs_counts_as_empty() {
        let timeline = Timeline::new(Stage::Dialysis).with_labs(vec![LabEntry::default()]);
        assert!(topic_is_empty(Topic::Labs, &timeline));
    }

    #[test]
    fn medications_need_either_list() {
        let after_only = Timeline::new(Stage::Dialysis).with_medications(vec![], vec!["A".into()]);
        assert!(!topic_is_empty(Topic::Medications, &after_only));
        assert!(topic_is_empty(Topic::Medications, &Timeline::new(Stage::Dialysis)));
    }

    // ── Generation path ────────────────────────────────────

    #[test]
    fn generated_answer_is_seeded_and_sanitized() {
        let continuation = "Your creatinine is a little higher.\n\n\
            🧬 What changed in your labs\nCreatinine went to 1.6 mg/dL.\n\n\
            🔍 Common reasons this can happen\nHydration can matter.\n\n\
            💬 Helpful questions to ask your care team\n- What does this mean for me?\n\n\
            🛟 Safety note\nContact your care team if you feel unwell.\n\n\
            Confidence: high";
        let mock = Arc::new(MockLlmClient::new(continuation));
        let result = orchestrator(mock.clone())
            .run_topic(
                Topic::Labs,
                &full_timeline(),
                &ExplainOptions::new(ModelTier::Healthcare),
            )
            .unwrap();

        assert_eq!(result.source, ExplanationSource::Generated);
        assert!(result.text.starts_with("🧠 Key takeaways\n- Your creatinine"));
        assert!(!result.text.contains("Confidence"));
        assert!(result.drift.is_none());
        assert_eq!(result.model.as_deref(), Some(crate::config::DEFAULT_HEALTHCARE_MODEL));

        let requests = mock.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].seed, "🧠 Key takeaways\n- ");
        assert_eq!(requests[0].decoding.max_new_tokens, 180);
        assert!(requests[0].release_after);
        assert!(requests[0]
            .user
            .contains("2026-01-08: Creatinine = 1.6 mg/dL (ref 0.6–1.3)"));
    }

    #[test]
    fn tier_selects_model_and_budget() {
        let mock = Arc::new(MockLlmClient::new("text"));
        let options = ExplainOptions::new(ModelTier::Lightweight).keep_model_loaded();
        orchestrator(mock.clone())
            .run_topic(Topic::Labs, &full_timeline(), &options)
            .unwrap();

        let request = &mock.requests()[0];
        assert_eq!(request.model, crate::config::DEFAULT_LIGHTWEIGHT_MODEL);
        assert_eq!(request.decoding.max_new_tokens, 250);
        assert!(!request.release_after);
    }

    #[test]
    fn incomplete_answer_reports_drift() {
        let mock = Arc::new(MockLlmClient::new("Only a short note."));
        let result = orchestrator(mock)
            .run_topic(
                Topic::Medications,
                &full_timeline(),
                &ExplainOptions::new(ModelTier::Healthcare),
            )
            .unwrap();

        assert!(result.text.starts_with("💊 What changed in your medications"));
        let drift = result.drift.expect("drift expected");
        assert!(drift.missing.contains(&"🛟 Safety note".to_string()));
    }

    /// Returns its text as-is, without the seed.
    struct UnseededClient(&'static str);

    impl LlmClient for UnseededClient {
        fn generate(&self, _request: &GenerationRequest) -> Result<String, GenerationError> {
            Ok(self.0.to_string())
        }

        fn list_models(&self) -> Result<Vec<String>, GenerationError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn leakage_before_first_header_returns_best_effort_text() {
        let raw = "Your tacrolimus dose changed.\n\
            reasoning: the user wants\n\
            💊 What changed in your medications\n- Dose went up.";
        let orch = ExplanationOrchestrator::new(
            Arc::new(UnseededClient(raw)),
            ModelRegistry::default(),
        );
        let result = orch
            .run_topic(
                Topic::Medications,
                &full_timeline(),
                &ExplainOptions::new(ModelTier::Healthcare),
            )
            .unwrap();

        assert_eq!(result.source, ExplanationSource::Generated);
        assert_eq!(result.text, "Your tacrolimus dose changed.");
        let drift = result.drift.expect("drift expected");
        assert_eq!(drift.missing.len(), Topic::Medications.required_headers().len());
        assert!(!result.text.contains("reasoning"));
    }

    // ── Isolation ──────────────────────────────────────────

    #[test]
    fn one_failing_topic_does_not_abort_others() {
        let mock = Arc::new(
            MockLlmClient::new("answer").failing_when_prompt_contains("MEDICATION CHANGES"),
        );
        let explanations = orchestrator(mock.clone())
            .explain(&full_timeline(), &ExplainOptions::new(ModelTier::Healthcare));

        assert!(explanations.labs.is_ok());
        assert!(explanations.followups.is_ok());
        let err = explanations.medications.as_ref().unwrap_err();
        assert_eq!(err.topic(), Topic::Medications);
        assert!(matches!(
            err,
            AgentError::Generation {
                source: GenerationError::NotReachable(_),
                ..
            }
        ));
        assert!(!explanations.all_succeeded());
        assert_eq!(mock.requests().len(), 3);
    }

    #[test]
    fn explain_mixes_fallback_and_generated() {
        let mock = Arc::new(MockLlmClient::new("answer"));
        let timeline = Timeline::new(Stage::AdvancedCkd)
            .with_medications(vec!["Furosemide 20mg".into()], vec![]);
        let explanations =
            orchestrator(mock.clone()).explain(&timeline, &ExplainOptions::new(ModelTier::Healthcare));

        assert_eq!(
            explanations.labs.as_ref().unwrap().source,
            ExplanationSource::Fallback
        );
        assert_eq!(
            explanations.medications.as_ref().unwrap().source,
            ExplanationSource::Generated
        );
        assert_eq!(
            explanations.followups.as_ref().unwrap().source,
            ExplanationSource::Fallback
        );
        assert_eq!(mock.requests().len(), 1);
    }

    #[test]
    fn explain_topics_filters_and_keeps_order() {
        let mock = Arc::new(MockLlmClient::new("answer"));
        let orch = orchestrator(mock.clone());
        let options = ExplainOptions::new(ModelTier::Healthcare);

        let all = orch.explain_topics(&full_timeline(), &options, None);
        let topics: Vec<Topic> = all.iter().map(|(t, _)| *t).collect();
        assert_eq!(topics, Topic::all());

        let only = orch.explain_topics(&full_timeline(), &options, Some(Topic::FollowUps));
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].0, Topic::FollowUps);
        assert_eq!(mock.requests().len(), 4);
    }

    #[test]
    fn agents_do_not_mutate_timeline() {
        let timeline = full_timeline();
        let before = timeline.clone();
        let mock = Arc::new(MockLlmClient::new("answer"));
        orchestrator(mock).explain(&timeline, &ExplainOptions::new(ModelTier::Healthcare));
        assert_eq!(timeline, before);
    }

    #[test]
    fn gate_is_free_after_explain() {
        let mock = Arc::new(MockLlmClient::new("answer"));
        let orch = orchestrator(mock);
        orch.explain(&full_timeline(), &ExplainOptions::new(ModelTier::Healthcare));
        assert!(!orch.gate().is_busy());
    }

    // ── Deadline ───────────────────────────────────────────

    #[test]
    fn expired_deadline_fails_before_generation() {
        let mock = Arc::new(MockLlmClient::new("answer"));
        let options = ExplainOptions::new(ModelTier::Healthcare).with_deadline(Instant::now());
        let err = orchestrator(mock.clone())
            .run_topic(Topic::Labs, &full_timeline(), &options)
            .unwrap_err();
        assert!(matches!(
            err,
            AgentError::Generation {
                source: GenerationError::DeadlineExceeded,
                ..
            }
        ));
        assert!(mock.requests().is_empty());
    }

    #[test]
    fn expired_deadline_still_allows_fallback() {
        let mock = Arc::new(MockLlmClient::new("answer"));
        let options = ExplainOptions::new(ModelTier::Healthcare).with_deadline(Instant::now());
        let result = orchestrator(mock)
            .run_topic(Topic::FollowUps, &Timeline::new(Stage::Dialysis), &options)
            .unwrap();
        assert_eq!(result.source, ExplanationSource::Fallback);
    }

    /// Holds `gate` on another thread for `hold`; returns once it is held.
    fn hold_gate(gate: &Arc<ModelGate>, hold: Duration) -> std::thread::JoinHandle<()> {
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let gate = Arc::clone(gate);
        let handle = std::thread::spawn(move || {
            let _guard = gate.acquire(Topic::FollowUps, "other-model").unwrap();
            held_tx.send(()).unwrap();
            std::thread::sleep(hold);
        });
        held_rx.recv().unwrap();
        handle
    }

    #[test]
    fn deadline_passing_while_waiting_for_gate_fails() {
        let gate = Arc::new(ModelGate::new());
        let mock = Arc::new(MockLlmClient::new("answer"));
        let orch = orchestrator(mock.clone()).with_gate(Arc::clone(&gate));

        let holder = hold_gate(&gate, Duration::from_millis(400));
        let options =
            ExplainOptions::new(ModelTier::Healthcare).with_time_budget(Duration::from_millis(100));
        let err = orch
            .run_topic(Topic::Labs, &full_timeline(), &options)
            .unwrap_err();
        holder.join().unwrap();

        assert!(matches!(
            err,
            AgentError::Generation {
                source: GenerationError::DeadlineExceeded,
                ..
            }
        ));
        assert!(mock.requests().is_empty());
        assert!(!gate.is_busy());
    }

    #[test]
    fn request_timeout_excludes_time_waited_at_gate() {
        let gate = Arc::new(ModelGate::new());
        let mock = Arc::new(MockLlmClient::new("answer"));
        let orch = orchestrator(mock.clone()).with_gate(Arc::clone(&gate));

        let options =
            ExplainOptions::new(ModelTier::Healthcare).with_time_budget(Duration::from_secs(10));
        let holder = hold_gate(&gate, Duration::from_millis(200));
        orch.run_topic(Topic::Labs, &full_timeline(), &options)
            .unwrap();
        holder.join().unwrap();

        let timeout = mock.requests()[0].timeout.unwrap();
        assert!(timeout <= Duration::from_millis(9_800), "timeout {timeout:?}");
    }

    #[test]
    fn remaining_budget_becomes_request_timeout() {
        let mock = Arc::new(MockLlmClient::new("answer"));
        let options =
            ExplainOptions::new(ModelTier::Healthcare).with_time_budget(Duration::from_secs(60));
        orchestrator(mock.clone())
            .run_topic(Topic::Labs, &full_timeline(), &options)
            .unwrap();
        let timeout = mock.requests()[0].timeout.unwrap();
        assert!(timeout <= Duration::from_secs(60));
        assert!(timeout > Duration::from_secs(50));
    }
}
