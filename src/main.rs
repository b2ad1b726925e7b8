//! ADR orchestrator command line
//!
//! Entry point for the `adr-orchestrator` binary.

use std::path::PathBuf;

use adr_orchestrator::application::coordinator::{CoordinatorError, StartRunRequest};
use adr_orchestrator::commands;
use adr_orchestrator::domain::run::{PhaseFlags, RunStatus};
use adr_orchestrator::infrastructure::logging::init_logging_with_config;
use adr_orchestrator::{AppState, ConfigManager};
use anyhow::{Result, anyhow};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "adr-orchestrator", version, about = "Scheduled vendor invoice retrieval")]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute one orchestration run and wait for it to finish
    Run(RunArgs),
    /// Show the active run and job counts
    Status,
    /// List recent runs
    History {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// Request cancellation of a run
    Cancel { run_id: Uuid },
    /// Fail runs left active by a process that is gone
    Recover,
    /// Write a default configuration file
    InitConfig,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    skip_sync: bool,
    #[arg(long)]
    skip_create: bool,
    #[arg(long)]
    skip_credentials: bool,
    #[arg(long)]
    skip_scrape: bool,
    #[arg(long)]
    skip_status: bool,
    #[arg(long, default_value = "cli")]
    requested_by: String,
}

impl RunArgs {
    const fn flags(&self) -> PhaseFlags {
        PhaseFlags {
            sync: !self.skip_sync,
            create_jobs: !self.skip_create,
            verify_credentials: !self.skip_credentials,
            scrape: !self.skip_scrape,
            check_statuses: !self.skip_status,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };

    if matches!(cli.command, Command::InitConfig) {
        if manager.initialize_default().await? {
            println!("Wrote {}", manager.config_path().display());
        } else {
            println!("{} already exists", manager.config_path().display());
        }
        return Ok(());
    }

    let config = manager.load_config()?;
    init_logging_with_config(&config.logging, &ConfigManager::resolve_log_dir(&config)?)?;
    let state = AppState::initialize(config).await?;

    match cli.command {
        Command::Run(args) => run(&state, &args).await,
        Command::Status => status(&state).await,
        Command::History { limit } => history(&state, limit).await,
        Command::Cancel { run_id } => {
            let active = commands::cancel_run(&state, run_id).await.map_err(|e| anyhow!(e))?;
            if active {
                println!("Cancellation requested for {run_id}");
            } else {
                println!("Run {run_id} is not active");
            }
            Ok(())
        }
        Command::Recover => {
            let recovered = commands::recover_interrupted_runs(&state)
                .await
                .map_err(|e| anyhow!(e))?;
            println!("Recovered {} run(s)", recovered.len());
            Ok(())
        }
        Command::InitConfig => Ok(()),
    }
}

async fn run(state: &AppState, args: &RunArgs) -> Result<()> {
    let request = StartRunRequest {
        flags: args.flags(),
        requested_by: args.requested_by.clone(),
    };
    let started = match state.coordinator.start_run(request).await {
        Ok(started) => started,
        Err(CoordinatorError::Conflict { active_run_id }) => {
            println!("Run {active_run_id} is already active");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let run_id = started.run_id;
    println!("Started run {run_id}");

    let coordinator = state.coordinator.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(%run_id, "Interrupt received, cancelling run");
            if let Err(e) = coordinator.cancel_run(run_id).await {
                warn!(error = %e, "Cancellation failed");
            }
        }
    });

    let status = started.wait().await?;
    interrupt.abort();
    info!(%run_id, %status, "Run finished");

    let summary = commands::get_recent_runs(state, 1).await.map_err(|e| anyhow!(e))?;
    if let Some(run) = summary.first() {
        println!("{}", serde_json::to_string_pretty(run)?);
    }
    if status == RunStatus::Failed {
        return Err(anyhow!("run {run_id} failed"));
    }
    Ok(())
}

async fn status(state: &AppState) -> Result<()> {
    match commands::get_current_run(state).await.map_err(|e| anyhow!(e))? {
        Some(run) => println!("{}", serde_json::to_string_pretty(&run)?),
        None => println!("No active run"),
    }
    for (status, count) in commands::get_job_counts(state).await.map_err(|e| anyhow!(e))? {
        println!("{status:<28}{count:>8}");
    }
    Ok(())
}

async fn history(state: &AppState, limit: u32) -> Result<()> {
    let runs = commands::get_recent_runs(state, limit).await.map_err(|e| anyhow!(e))?;
    if runs.is_empty() {
        println!("No runs recorded");
    }
    for run in &runs {
        println!(
            "{}  {:<10} {:<12} {}",
            run.queued_at.format("%Y-%m-%d %H:%M:%S"),
            run.status.as_str(),
            run.requested_by,
            run.run_id
        );
    }
    Ok(())
}
