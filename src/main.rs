use std::path::PathBuf;

use clap::Parser;
use kgmerge::config::Config;
use kgmerge::errors::{ConfigError, Error};
use kgmerge::merge::{self, MergeOptions, Only};
use kgmerge::utils::CancelToken;
use tracing::{error, info};
use tracing_subscriber::fmt::format::FmtSpan;

/// Merge knowledge graph node and edge tables into a single deduplicated graph
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The path to the merge configuration
    #[arg(long)]
    config: PathBuf,

    /// Restrict the run: `stats` re-emits statistics from the existing
    /// merged tables, `chain=<name>` re-runs a single chain projection
    #[arg(long, value_parser = parse_only)]
    only: Option<Only>,

    /// Continue from intact partition run files left by a crashed run
    #[arg(long)]
    resume: bool,

    /// Discard stale run files from a crashed run and start over
    #[arg(long, conflicts_with = "resume")]
    force_resume: bool,

    /// Treat dangling edge references as a fatal error after the merge
    #[arg(long)]
    strict: bool,
}

fn parse_only(value: &str) -> Result<Only, ConfigError> {
    match value {
        "stats" => Ok(Only::Stats),
        _ => match value.strip_prefix("chain=") {
            Some(name) if !name.is_empty() => Ok(Only::Chain(name.to_string())),
            _ => Err(ConfigError::InvalidOnly(value.to_string())),
        },
    }
}


fn main() {
    tracing_subscriber::fmt::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_level(false)
        .init();

    let cli = Cli::parse();

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        info!("Cancellation requested, draining workers");
        handler_token.cancel();
    }) {
        error!(?err, "Failed to install the cancellation handler");
    }

    let options = MergeOptions {
        only: cli.only,
        resume: cli.resume,
        force_resume: cli.force_resume,
        strict: cli.strict,
    };

    let result = Config::load(&cli.config).and_then(|config| merge::run(&config, &options, &cancel));

    if let Err(err) = result {
        // the single last line describing the failure cause
        error!(%err, "Merge failed");
        std::process::exit(err.exit_code());
    }
}
