//! smtrace - trace-driven state machine analysis
//!
//! Replays a trace through a model, learns adaptive constraints and reports
//! the time segments where constraints were violated.

mod render;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use smtrace_core::Model;
use smtrace_driver::config::StrategyKind;
use smtrace_driver::{source, Config, OutputFormat};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "smtrace")]
#[command(about = "Trace-driven state machine analysis")]
#[command(version)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, env = "SMTRACE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Cluster,
    Percentile,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a trace and report violated segments
    Run {
        /// Model definition (JSON)
        #[arg(short, long)]
        model: Option<PathBuf>,

        /// Trace events (JSON lines)
        #[arg(short, long)]
        events: Option<PathBuf>,

        /// Kernel scheduling and counter records (JSON lines)
        #[arg(short, long)]
        kernel_log: Option<PathBuf>,

        /// Skip events before this timestamp
        #[arg(long)]
        start: Option<u64>,

        /// Skip events after this timestamp
        #[arg(long)]
        end: Option<u64>,

        /// Adaptive decision strategy
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,

        /// Percentile for the percentile strategy
        #[arg(long)]
        percentile: Option<f64>,

        /// Learn adaptive constraints as if every run were valid
        #[arg(long)]
        all_valid: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,

        /// Dump every instance
        #[arg(long)]
        dump: bool,

        /// Write the segments as JSON to this file
        #[arg(long)]
        segments_out: Option<PathBuf>,

        /// Exit with status 2 when any segment is invalid
        #[arg(long)]
        fail_on_invalid: bool,
    },

    /// Validate a model and describe it
    Check {
        /// Model definition (JSON)
        model: PathBuf,
    },

    /// Print a model in canonical form
    Export {
        /// Model definition (JSON)
        model: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            model,
            events,
            kernel_log,
            start,
            end,
            strategy,
            percentile,
            all_valid,
            json,
            dump,
            segments_out,
            fail_on_invalid,
        } => {
            let mut config = match &cli.config {
                Some(path) => {
                    let mut config = Config::from_file(path)?;
                    config.apply_overrides(|key| std::env::var(key).ok());
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                None => Config::load()?,
            };

            // Command line flags win over file and environment
            if model.is_some() {
                config.input.model = model;
            }
            if events.is_some() {
                config.input.events = events;
            }
            if kernel_log.is_some() {
                config.input.kernel_log = kernel_log;
            }
            if start.is_some() {
                config.input.start = start;
            }
            if end.is_some() {
                config.input.end = end;
            }
            match strategy {
                Some(StrategyArg::Cluster) => config.analysis.strategy = StrategyKind::Cluster,
                Some(StrategyArg::Percentile) => {
                    config.analysis.strategy = StrategyKind::Percentile
                }
                None => {}
            }
            if let Some(p) = percentile {
                config.analysis.percentile = p;
            }
            config.analysis.all_instances_valid |= all_valid;
            if json {
                config.output.format = OutputFormat::Json;
            }
            config.output.dump_instances |= dump;
            if segments_out.is_some() {
                config.output.segments_file = segments_out;
            }

            let analysis = match smtrace_driver::run(&config) {
                Ok(analysis) => analysis,
                Err(e) => {
                    eprintln!("{} [{}]: {}", "Error".red(), e.error_code(), e);
                    std::process::exit(1);
                }
            };

            if let Some(path) = &config.output.segments_file {
                analysis.write_segments(path)?;
                tracing::info!("Wrote segments to {}", path.display());
            }

            match config.output.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&analysis)?),
                OutputFormat::Text => print!("{}", render::analysis(&analysis)),
            }

            if fail_on_invalid && analysis.invalid_segments().next().is_some() {
                std::process::exit(2);
            }
        }

        Commands::Check { model } => match source::load_model(&model) {
            Ok(model) => print!("{}", render::model_summary(&model)),
            Err(e) => {
                eprintln!("{} [{}]: {}", "Invalid model".red(), e.error_code(), e);
                std::process::exit(1);
            }
        },

        Commands::Export { model } => {
            let model: Model = source::load_model(&model)?;
            println!("{}", serde_json::to_string_pretty(&model.to_json()?)?);
        }
    }

    Ok(())
}
