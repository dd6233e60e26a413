//! Command-line interface for strata.
//!
//! Provides commands for running pipelines, generating a configuration
//! template, and inspecting the journals of earlier runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use uuid::Uuid;

use crate::adapters::{CommandToolkit, PipelineCommands};
use crate::config;
use crate::core::{EventStore, FsArtifactStore, Orchestrator, RunContext};
use crate::domain::{Run, RunState};

/// File written by `generate-config`
pub const CONFIG_TEMPLATE_NAME: &str = "strata_config.yaml";

const CONFIG_TEMPLATE: &str = r#"# strata pipeline configuration
#
# Every unit below runs through the same task graph:
#   prepare (one task per input) -> fan_out -> one shard per element -> merge -> aggregate

units:
  case-1:
    # Local path, s3://bucket/key or https://s3.amazonaws.com/bucket/key
    sample: /path/to/case-1/sample.fq.gz

shared:
  storage_location: Local           # Local, or aws:<bucket> to store results remotely
  output_folder: ./results
  # encryption_key: /path/to/key    # required when storage_location is remote
  # key_is_master: false            # derive a per-file key from this master key
  # max_cores: 8                    # default: every core on the machine

pipeline:
  inputs: [sample]
  optional_inputs: []
  literal_inputs: []
  # Commands read a JSON request on stdin and print a JSON result.
  prepare: cat
  fan_out: "echo '[1, 2, 3]'"
  # shard: ./process_shard.sh
  # merge: ./merge.sh
  # aggregate: ./report.sh
  timeout_seconds: 3600

# Options of a tool section are handed to the stage of the same name.
# Options ending in _file, _vcf, _fasta, ... are fetched before the run.
# merge:
#   reference_fasta: s3://bucket/reference/genome.fa
"#;

/// strata - Task-graph pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline configuration
    Run {
        /// Pipeline configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Cores available to this pipeline (overrides shared.max_cores)
        #[arg(long)]
        max_cores_per_job: Option<u32>,

        /// Cores available on this machine; per-job limits are clamped to it
        #[arg(long, env = "STRATA_MAX_CORES")]
        max_cores: Option<u32>,

        /// Record the run journal under the runs directory
        #[arg(long)]
        journal: bool,
    },

    /// Write a configuration template to the current directory
    GenerateConfig {
        /// Overwrite an existing template
        #[arg(short, long)]
        force: bool,
    },

    /// Check the status of a journaled run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent journaled runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved engine settings (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                config,
                max_cores_per_job,
                max_cores,
                journal,
            } => run_pipeline(&config, max_cores_per_job, max_cores, journal).await,
            Commands::GenerateConfig { force } => generate_config(force).await,
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Config => show_config(),
        }
    }
}

/// Run every unit of a pipeline configuration
async fn run_pipeline(
    config_path: &Path,
    max_cores_per_job: Option<u32>,
    max_cores: Option<u32>,
    journal: bool,
) -> Result<()> {
    let settings = config::config()?;
    let commands = PipelineCommands::from_file(config_path).await?;

    let store = FsArtifactStore::open(&settings.store)
        .await
        .with_context(|| format!("Failed to open artifact store: {}", settings.store.display()))?;
    let context = RunContext::new(Arc::new(store), settings.fetch.transport())
        .with_retry_policy(settings.fetch.retry.clone());

    let mut orchestrator = Orchestrator::new(Arc::new(CommandToolkit::new(commands)), context)
        .with_core_limits(max_cores_per_job, max_cores);
    if journal {
        orchestrator = orchestrator.with_journal(config::runs_dir()?);
    }

    match orchestrator.run_file(config_path).await {
        Ok(report) => {
            for unit in &report.units {
                println!("{}", json!({ "unit": unit.unit, "result": unit.output }));
            }
            eprintln!(
                "\n[Run {} completed: {} unit(s) processed]",
                report.outcome.run_id(),
                report.units.len()
            );
            Ok(())
        }
        Err(err) => {
            let origin = match (err.unit(), err.task()) {
                (Some(unit), Some(task)) => format!(" in unit '{}', task {}", unit, task),
                (Some(unit), None) => format!(" in unit '{}'", unit),
                _ => String::new(),
            };
            eprintln!("\n[Pipeline failed{}: {:#}]", origin, anyhow::Error::from(err));
            std::process::exit(1);
        }
    }
}

/// Write the configuration template
async fn generate_config(force: bool) -> Result<()> {
    let path = PathBuf::from(CONFIG_TEMPLATE_NAME);
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    tokio::fs::write(&path, CONFIG_TEMPLATE)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}; edit it, then run: strata run --config {}", path.display(), path.display());
    Ok(())
}

/// Show the status of a run
async fn show_status(run_id_str: &str) -> Result<()> {
    let run_id = Uuid::parse_str(run_id_str).with_context(|| format!("Invalid run ID: {}", run_id_str))?;

    let store = EventStore::open_existing(&config::runs_dir()?, run_id)
        .await?
        .with_context(|| format!("No journal found for run {}", run_id))?;
    let run = store
        .load_run()
        .await?
        .with_context(|| format!("Journal of run {} is empty", run_id))?;

    println!("Run ID: {}", run.id);
    println!("State: {}", state_label(&run.state));
    if let RunState::Failed { error } = &run.state {
        println!("Error: {}", error);
    }
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }

    println!("\nTasks:");
    println!("  {:<8} {:<24} {:<16} {:<10}", "ID", "NAME", "UNIT", "STATE");
    for (id, task) in &run.tasks {
        println!(
            "  {:<8} {:<24} {:<16} {:<10}",
            id.to_string(),
            task.name,
            task.unit.as_deref().unwrap_or("-"),
            format!("{:?}", task.state).to_lowercase()
        );
        if let Some(error) = &task.error {
            println!("           error: {}", error);
        }
    }

    Ok(())
}

/// List recent runs, newest first
async fn list_runs(limit: usize) -> Result<()> {
    let runs_dir = config::runs_dir()?;
    let mut runs: Vec<Run> = Vec::new();
    for run_id in EventStore::list_runs(&runs_dir).await? {
        let Some(store) = EventStore::open_existing(&runs_dir, run_id).await? else {
            continue;
        };
        if let Some(run) = store.load_run().await? {
            runs.push(run);
        }
    }

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    println!("{:<38} {:<26} {:<10} {:>6}", "RUN ID", "STARTED", "STATE", "TASKS");
    println!("{}", "-".repeat(83));
    for run in runs.iter().take(limit) {
        println!(
            "{:<38} {:<26} {:<10} {:>6}",
            run.id,
            run.started_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            state_label(&run.state),
            run.tasks.len()
        );
    }

    Ok(())
}

fn state_label(state: &RunState) -> &'static str {
    match state {
        RunState::Running => "running",
        RunState::Completed => "completed",
        RunState::Failed { .. } => "failed",
    }
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("strata configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Artifact store:      {}", cfg.store.display());
    println!("  Runs:                {}", config::runs_dir()?.display());
    println!();
    println!("Fetch:");
    println!("  Transport:    {}", cfg.fetch.transport);
    println!("  Helper:       {}", cfg.fetch.helper);
    println!("  Max attempts: {}", cfg.fetch.retry.max_attempts);
    println!("  First delay:  {}ms", cfg.fetch.retry.initial_delay_ms);

    Ok(())
}
