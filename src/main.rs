//! NephroBridge command line.
//!
//! ```sh
//! # Explain a saved timeline with MedGemma
//! nephrobridge explain timeline.json
//!
//! # Use the lightweight model, one topic, 2 minute budget
//! nephrobridge explain timeline.json --tier lightweight --topic labs --timeout-secs 120
//!
//! # Show the exact prompt a topic agent would send
//! nephrobridge prompt timeline.json --topic medications
//!
//! # Build a timeline from a CSV lab export
//! nephrobridge import-csv labs.csv --stage dialysis --out timeline.json
//! ```

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use thiserror::Error;

use nephrobridge_lib::config::{self, Settings};
use nephrobridge_lib::intake::{self, IntakeError};
use nephrobridge_lib::pipeline::{
    ExplainOptions, ExplanationOrchestrator, ExplanationSource, GenerationError, LlmClient,
    ModelTier, OllamaClient, Topic,
};
use nephrobridge_lib::pipeline::prompt_templates::{render_prompt, system_prompt};
use nephrobridge_lib::timeline::{Stage, Timeline, TimelineError};

#[derive(Parser)]
#[command(name = "nephrobridge", version, about = "Calm explanations of kidney labs, medication changes, and follow-ups")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate patient-facing explanations for a timeline
    Explain {
        /// Timeline JSON file
        timeline: PathBuf,

        /// Model tier: healthcare (MedGemma) or lightweight (Gemma)
        #[arg(long, default_value = "healthcare", env = "NEPHROBRIDGE_TIER")]
        tier: ModelTier,

        /// Only explain this topic (labs, medications, followups)
        #[arg(long)]
        topic: Option<Topic>,

        /// Overall time budget for all topics
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the system and user prompt for one topic without calling a model
    Prompt {
        timeline: PathBuf,

        #[arg(long, default_value = "labs")]
        topic: Topic,
    },

    /// Check a timeline file for incomplete lab rows
    Validate { timeline: PathBuf },

    /// Convert a CSV lab table into a timeline JSON file
    ImportCsv {
        csv: PathBuf,

        /// post_transplant, advanced_ckd or dialysis
        #[arg(long)]
        stage: String,

        /// Why the patient was recently seen (optional)
        #[arg(long)]
        reason: Option<String>,

        /// Output path (default: ~/NephroBridge/patient_timeline_user.json)
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// List installed models and check both tiers are available
    Models,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Timeline(#[from] TimelineError),

    #[error(transparent)]
    Intake(#[from] IntakeError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("Could not read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not encode output: {0}")]
    Output(#[from] serde_json::Error),
}

fn main() {
    nephrobridge_lib::init_tracing();
    tracing::debug!("{} v{}", config::APP_NAME, config::APP_VERSION);

    let cli = Cli::parse();
    if let Err(e) = run(cli.command) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn run(command: Command) -> Result<(), CliError> {
    match command {
        Command::Explain {
            timeline,
            tier,
            topic,
            timeout_secs,
            json,
        } => explain(&timeline, tier, topic, timeout_secs, json),
        Command::Prompt { timeline, topic } => {
            let timeline = load_valid(&timeline)?;
            println!("=== system ===\n{}\n", system_prompt(topic));
            println!("=== user ===\n{}", render_prompt(topic, &timeline));
            Ok(())
        }
        Command::Validate { timeline } => {
            let timeline = load_valid(&timeline)?;
            println!(
                "Timeline OK: stage {}, {} valid lab result(s), {} medication item(s), {} follow-up item(s)",
                timeline.stage,
                timeline.valid_labs().count(),
                timeline.medications_before.len() + timeline.medications_after.len(),
                timeline.followups.len() + timeline.pending_labs.len(),
            );
            if !timeline.stage.is_known() {
                eprintln!(
                    "warning: unknown stage '{}', explanations will use generic wording",
                    timeline.stage
                );
            }
            Ok(())
        }
        Command::ImportCsv {
            csv,
            stage,
            reason,
            out,
        } => {
            let text = read_file(&csv)?;
            let labs = intake::parse_labs_csv(&text)?;
            let timeline = Timeline::new(Stage::from(stage.as_str()))
                .with_hospital_stay_reason(reason.unwrap_or_default())
                .with_labs(labs);
            timeline.validate()?;
            let out = out.unwrap_or_else(config::default_timeline_path);
            timeline.save(&out)?;
            println!("Saved {} lab result(s) to {}", timeline.labs.len(), out.display());
            Ok(())
        }
        Command::Models => {
            let settings = Settings::from_env();
            let client = OllamaClient::new(&settings)?;
            for model in client.list_models()? {
                println!("{model}");
            }
            for tier in [ModelTier::Healthcare, ModelTier::Lightweight] {
                let name = settings.models.model_for(tier);
                let status = if client.is_model_available(name)? {
                    "installed"
                } else {
                    "missing"
                };
                println!("{tier}: {name} ({status})");
            }
            Ok(())
        }
    }
}

fn explain(
    path: &Path,
    tier: ModelTier,
    only: Option<Topic>,
    timeout_secs: Option<u64>,
    json: bool,
) -> Result<(), CliError> {
    let timeline = load_valid(path)?;
    let settings = Settings::from_env();
    let client = OllamaClient::new(&settings)?;
    let orchestrator = ExplanationOrchestrator::from_settings(Arc::new(client), &settings);

    let mut options = ExplainOptions::new(tier);
    if !settings.release_after_call {
        options = options.keep_model_loaded();
    }
    if let Some(secs) = timeout_secs {
        options = options.with_time_budget(Duration::from_secs(secs));
    }

    let explanations = orchestrator.explain_topics(&timeline, &options, only);

    if json {
        let report: Vec<serde_json::Value> = explanations
            .iter()
            .map(|(topic, result)| match result {
                Ok(explanation) => serde_json::to_value(explanation),
                Err(e) => Ok(serde_json::json!({ "topic": topic, "error": e.to_string() })),
            })
            .collect::<Result<_, _>>()?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for (topic, result) in &explanations {
        println!("{}", "=".repeat(60));
        println!("{}", section_title(*topic));
        println!("{}\n", "=".repeat(60));
        match result {
            Ok(explanation) => {
                println!("{}\n", explanation.text);
                if explanation.source == ExplanationSource::Fallback {
                    println!("(No {topic} information was provided.)\n");
                }
            }
            Err(e) => println!("Sorry, this part could not be prepared right now.\n({e})\n"),
        }
    }
    Ok(())
}

fn section_title(topic: Topic) -> &'static str {
    match topic {
        Topic::Labs => "🧪 What changed in my labs",
        Topic::Medications => "💊 Why my medications changed",
        Topic::FollowUps => "🧾 What I should expect next",
    }
}

fn read_file(path: &Path) -> Result<String, CliError> {
    std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.display().to_string(),
        source,
    })
}

/// Load a saved timeline. Absent lists default to empty, so a file with
/// only medications or follow-ups is accepted.
fn load_valid(path: &Path) -> Result<Timeline, CliError> {
    let timeline = Timeline::from_json_str(&read_file(path)?)?;
    timeline.validate()?;
    Ok(timeline)
}
