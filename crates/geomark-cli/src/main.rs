//! Geomark CLI
//!
//! Drives the annotation engine against in-memory ports:
//! - `demo` runs a built-in walkthrough
//! - `simulate` replays a scripted scenario file
//! - `config` prints the effective engine configuration

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use geomark_sync::{AnnotationStatus, EngineConfig, EngineEvent, NoticeLevel, ViewportState};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod scenario;

use scenario::{Scenario, ScenarioReport};

#[derive(Parser)]
#[command(name = "geomark")]
#[command(
    author,
    version,
    about = "Geomark: optimistic map annotations synchronized with a remote collection"
)]
struct Cli {
    /// Raise log verbosity (`-v` debug, `-vv` trace). `RUST_LOG` takes precedence.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the built-in walkthrough and print the final annotation list.
    Demo {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Replay a scripted scenario against in-memory ports.
    Simulate {
        /// Scenario JSON file
        scenario: PathBuf,
        /// Engine configuration JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration (file + environment overrides).
    Config {
        /// Engine configuration JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Demo { json } => {
            let config = load_config(None)?;
            let report = run_scenario(Scenario::demo(), config)?;
            print_report(&report, json)?;
        }
        Commands::Simulate {
            scenario,
            config,
            json,
        } => {
            let config = load_config(config.as_deref())?;
            let scenario = Scenario::load(&scenario)?;
            let report = run_scenario(scenario, config)?;
            print_report(&report, json)?;
        }
        Commands::Config { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => EngineConfig::from_env().context("invalid environment configuration"),
    }
}

fn run_scenario(scenario: Scenario, config: EngineConfig) -> Result<ScenarioReport> {
    // One event loop drives every engine task
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow!("failed to initialize tokio runtime: {e}"))?;
    rt.block_on(scenario::run(&scenario, config))
}

// ============================================================================
// Output
// ============================================================================

fn print_report(report: &ScenarioReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    if let Some(name) = &report.name {
        println!("{} {}", "scenario".bold(), name);
    }

    println!("{}", "Annotations".bold().underline());
    if report.annotations.is_empty() {
        println!("  (none)");
    }
    for annotation in &report.annotations {
        let status = match &annotation.status {
            AnnotationStatus::Synced => "synced".green().bold(),
            AnnotationStatus::Failed(point) => format!("failed ({point:?})").red().bold(),
            other => format!("{other:?}").to_lowercase().yellow(),
        };
        println!(
            "  {:<22} {:>11.6} {:>12.6}  {:<8} {}",
            status,
            annotation.coordinate.latitude,
            annotation.coordinate.longitude,
            annotation.remote_id.as_deref().unwrap_or("-"),
            annotation.image_ref.as_deref().unwrap_or("-").dimmed(),
        );
        if let Some(error) = &annotation.last_error {
            println!("  {:<22} {}", "", error.red());
        }
    }

    let region = report.region;
    println!(
        "{} center ({:.4}, {:.4}) span {}° × {}°",
        "Region".bold(),
        region.latitude,
        region.longitude,
        region.latitude_span,
        region.longitude_span
    );
    let viewport = match &report.viewport {
        ViewportState::Unavailable { reason } => format!("unavailable: {reason}").yellow(),
        other => format!("{other:?}").to_lowercase().normal(),
    };
    println!("{} {}", "Viewport".bold(), viewport);
    println!(
        "{} {} document(s), {} upload attempt(s), {} write(s)",
        "Remote".bold(),
        report.remote_documents.len(),
        report.uploads,
        report.writes
    );

    for inspection in &report.inspections {
        println!(
            "{} {} | {} | {}",
            "Tapped".bold(),
            inspection.latitude_label,
            inspection.longitude_label,
            inspection.image_ref.as_deref().unwrap_or("no image")
        );
    }

    println!("{}", "Events".bold().underline());
    for event in &report.events {
        println!("  {}", describe_event(event));
    }

    for warning in &report.warnings {
        eprintln!("{} {}", "warning".yellow().bold(), warning);
    }
    Ok(())
}

fn describe_event(event: &EngineEvent) -> String {
    match event {
        EngineEvent::RegionChanged { region } => {
            format!("region → ({:.4}, {:.4})", region.latitude, region.longitude)
        }
        EngineEvent::SnapshotApplied { documents, report } => format!(
            "snapshot of {documents} document(s): {} newly synced, {} adopted, {} removed",
            report.newly_synced.len(),
            report.adopted,
            report.removed.len()
        ),
        EngineEvent::AttachmentFailed {
            correlation_id,
            step,
            message,
            ..
        } => format!("{} {correlation_id} at {step:?}: {message}", "failed".red()),
        EngineEvent::AnnotationDiscarded { correlation_id } => {
            format!("discarded {correlation_id}")
        }
        EngineEvent::Notice { level, message } => {
            let tag = match level {
                NoticeLevel::Info => "info".blue(),
                NoticeLevel::Warning => "warning".yellow(),
                NoticeLevel::Error => "error".red(),
            };
            format!("{tag} {message}")
        }
    }
}
