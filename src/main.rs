use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{info, warn, LevelFilter};

use operant_photometry::config::PipelineConfig;
use operant_photometry::models::{AttributionMode, Phase};
use operant_photometry::pipeline::{run, Stages};

/// Parse operant-conditioning controller logs and align them with fiber
/// photometry recordings
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// JSON configuration file; every field is optional
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding one `phase N` folder of raw logs per phase
    #[arg(long, global = true)]
    input_dir: Option<PathBuf>,

    /// Directory holding `phase N/<session>.csv` calcium recordings
    #[arg(long, global = true)]
    calcium_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Restrict to these phases (repeatable)
    #[arg(long = "phase", global = true)]
    phases: Vec<Phase>,

    /// Restrict to these attribution modes: reward, time (repeatable)
    #[arg(long = "mode", global = true)]
    modes: Vec<AttributionMode>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Convert raw logs to event tables
    Parse,
    /// Per-session statistics for every attribution mode
    Stats,
    /// Calcium segmentation, bout and trial metrics
    Calcium,
    /// Everything above
    Run,
}

impl Command {
    fn stages(self) -> Stages {
        match self {
            Command::Parse => Stages::PARSE,
            Command::Stats => Stages::STATS,
            Command::Calcium => Stages::CALCIUM,
            Command::Run => Stages::ALL,
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = &args.input_dir {
        config.input_dir = dir.clone();
    }
    if let Some(dir) = &args.calcium_dir {
        config.calcium_dir = dir.clone();
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if !args.phases.is_empty() {
        config.phases = args.phases.clone();
    }
    if !args.modes.is_empty() {
        config.modes = args.modes.clone();
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let config = load_config(&args)?;
    let summary = run(&config, args.command.stages())
        .with_context(|| format!("Failed to write outputs under {}", config.output_dir.display()))?;

    info!(
        "{} sessions: {} processed, {} skipped, {} failed",
        summary.total(),
        summary.processed,
        summary.skipped,
        summary.failed
    );
    if summary.failed > 0 {
        warn!("some sessions failed, see the errors above");
    }
    Ok(())
}
