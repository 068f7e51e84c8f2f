//! CLI entry point for qcl-daq
//!
//! ```bash
//! # Validate a configuration and print the resolved settings
//! qcl-daq check-config --config config/qcl_daq.toml
//!
//! # Full bring-up and acquisition against simulated devices
//! qcl-daq simulate --config config/qcl_daq.toml --cycles 5
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use qcl_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use qcl_daq::logging;
use qcl_daq::procedures::{ShutdownSummary, StageResult, StartupSequencer, TurnOnAttempt};
use qcl_driver_mock::{MockController, MockLockin};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "qcl-daq")]
#[command(about = "QCL bring-up and lock-in acquisition", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a configuration, then print it
    CheckConfig {
        /// Configuration file (TOML)
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Output format of the resolved settings
        #[arg(long, value_enum, default_value_t = Format::Json)]
        format: Format,
    },

    /// Run bring-up and acquisition against simulated devices
    Simulate {
        /// Configuration file (TOML)
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Acquisition cycles (overrides simulation.cycles)
        #[arg(long)]
        cycles: Option<usize>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Toml,
}

#[derive(Serialize)]
struct SimulationSummary {
    device: String,
    family: Option<String>,
    stages: Vec<StageResult>,
    turn_on_attempts: Vec<TurnOnAttempt>,
    cycle_lengths: Vec<usize>,
    shutdown: ShutdownSummary,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { config, format } => check_config(config, format),
        Commands::Simulate { config, cycles } => simulate(config, cycles).await,
    }
}

fn load(path: &Path) -> Result<Settings> {
    let settings = Settings::load_from(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    for warning in settings.validate().context("invalid configuration")? {
        eprintln!("warning: {warning}");
    }
    Ok(settings)
}

fn check_config(path: PathBuf, format: Format) -> Result<()> {
    let settings = load(&path)?;
    let rendered = match format {
        Format::Json => serde_json::to_string_pretty(&settings)?,
        Format::Toml => toml::to_string_pretty(&settings)?,
    };
    println!("{rendered}");
    Ok(())
}

async fn simulate(path: PathBuf, cycles: Option<usize>) -> Result<()> {
    let settings = load(&path)?;
    logging::init_from_settings(&settings).map_err(anyhow::Error::msg)?;

    let cycles = cycles.unwrap_or(settings.simulation.cycles);
    let controller = Arc::new(MockController::with_config(
        settings.simulation.controller.clone(),
    ));
    let lockin = Arc::new(MockLockin::with_config(settings.simulation.lockin.clone()));

    let mut sequencer = StartupSequencer::new(controller, lockin)
        .with_timings(settings.timing.clone())
        .with_limits(settings.limits.clone());
    info!(name = %settings.application.name, cycles, "starting simulated bring-up");
    let mut active = sequencer
        .run(settings.laser.clone(), settings.detector.clone())
        .await
        .context("bring-up failed")?;

    let collected = active.acquisition.collect_cycles(cycles).await;
    let shutdown = active.shutdown().await;
    if !shutdown.is_clean() {
        warn!(errors = shutdown.errors.len(), "shutdown reported errors");
    }
    let buffer = collected.context("acquisition failed")?;

    let summary = SimulationSummary {
        device: active.acquisition.device().to_string(),
        family: active.acquisition.family().map(|f| format!("{f:?}")),
        stages: active.report.stages.clone(),
        turn_on_attempts: active.report.turn_on_attempts.clone(),
        cycle_lengths: buffer.cycle_lengths(),
        shutdown: ShutdownSummary::from(&shutdown),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
