pub mod config;
pub mod intake;
pub mod pipeline;
pub mod timeline;

use tracing_subscriber::EnvFilter;

pub use pipeline::{ExplainOptions, ExplanationOrchestrator, ModelTier, Topic};
pub use timeline::{LabEntry, Stage, Timeline};

/// Initialize tracing once per process. `RUST_LOG` overrides the default
/// filter. Logs go to stderr so explanations on stdout stay clean.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter()));
    // A second call (tests, embedding apps) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
