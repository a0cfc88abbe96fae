//! Command-line interface for sectorflow.
//!
//! Provides commands for running and resuming pipelines declared in YAML,
//! checking definitions, and inspecting past runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::config;
use crate::core::{EventStore, FileStore, Orchestrator, PipelineDefinition};
use crate::domain::PipelineMetrics;
use crate::error::PipelineError;
use crate::transforms::BUILTIN_TRANSFORMS;

/// sectorflow - Batch data pipelines with sector profiles
#[derive(Parser, Debug)]
#[command(name = "sectorflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline definition
    Run {
        /// Path to the pipeline YAML file
        definition: PathBuf,

        /// Re-read every source instead of using cached extractions
        #[arg(long)]
        no_cache: bool,

        /// Print the final metrics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Re-run a pipeline from a step's checkpoint
    Resume {
        /// Path to the pipeline YAML file
        definition: PathBuf,

        /// Step whose pre-step checkpoint is restored
        #[arg(long)]
        from_step: String,

        /// Print the final metrics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a pipeline definition without running it
    Check {
        /// Path to the pipeline YAML file
        definition: PathBuf,
    },

    /// Show the event log of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recorded runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                definition,
                no_cache,
                json,
            } => run_pipeline(&definition, no_cache, json).await,
            Commands::Resume {
                definition,
                from_step,
                json,
            } => resume_pipeline(&definition, &from_step, json).await,
            Commands::Check { definition } => check_definition(&definition).await,
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Config => show_config(),
        }
    }
}

/// Build a pipeline whose cache, checkpoints and run logs live under the state directory
async fn load_pipeline(path: &Path, no_cache: bool) -> Result<Orchestrator> {
    let cfg = config::config()?;
    let definition = PipelineDefinition::from_file(path)?;

    let cache = FileStore::open(cfg.cache_dir()).await?;
    let checkpoints = FileStore::open(cfg.checkpoints_dir()).await?;

    let mut builder = definition
        .into_builder(&cfg.defaults)?
        .with_cache_store(Arc::new(cache))
        .with_checkpoint_store(Arc::new(checkpoints))
        .with_event_store(cfg.runs_dir());
    if no_cache {
        builder = builder.configure(|c| c.cache_enabled = false);
    }

    Ok(builder.build()?)
}

/// Run a pipeline definition
async fn run_pipeline(path: &Path, no_cache: bool, json: bool) -> Result<()> {
    let mut pipeline = load_pipeline(path, no_cache).await?;
    let outcome = pipeline.run().await;
    report(&pipeline, outcome, json)
}

/// Resume a pipeline from a step checkpoint
async fn resume_pipeline(path: &Path, step: &str, json: bool) -> Result<()> {
    let mut pipeline = load_pipeline(path, false).await?;
    let outcome = pipeline.resume_from_checkpoint(step).await;
    report(&pipeline, outcome, json)
}

fn report(
    pipeline: &Orchestrator,
    outcome: Result<PipelineMetrics, PipelineError>,
    json: bool,
) -> Result<()> {
    if let Some(metrics) = pipeline.last_metrics() {
        if json {
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        } else {
            print_metrics(&metrics);
        }
    }

    outcome
        .map(|_| ())
        .with_context(|| format!("Pipeline '{}' did not complete", pipeline.name()))
}

fn print_metrics(metrics: &PipelineMetrics) {
    println!("Run ID:        {}", metrics.run_id);
    println!("Pipeline:      {}", metrics.pipeline_name);
    println!("Status:        {}", metrics.status);
    println!("Records:       {} processed, {} failed", metrics.records_processed, metrics.records_failed);
    println!("Quality score: {:.1}", metrics.data_quality_score);
    println!("Duration:      {:.3}s", metrics.processing_time_secs);
    println!("Steps:         {}", list_or_dash(&metrics.steps_completed));
    println!("Sinks:         {}", list_or_dash(&metrics.sinks_loaded));

    if !metrics.quality_issues.is_empty() {
        println!("\nQuality issues:");
        for issue in &metrics.quality_issues {
            println!(
                "  [{:?}] {} ({} stage): {}",
                issue.severity, issue.rule, issue.stage, issue.message
            );
        }
    }

    if metrics.has_errors() {
        println!("\nErrors:");
        for error in &metrics.errors {
            println!("  {} {}: {}", error.timestamp.format("%H:%M:%S"), error.scope, error.message);
        }
    }
}

fn list_or_dash(items: &[String]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}

/// Validate a definition and print the resolved plan
async fn check_definition(path: &Path) -> Result<()> {
    let cfg = config::config()?;
    let pipeline = PipelineDefinition::from_file(path)?
        .into_builder(&cfg.defaults)?
        .build()?;

    let config = pipeline.config();
    println!("Pipeline '{}' (sector: {}) is valid", config.name, config.sector);
    println!(
        "  error handling: {} ({} retries), workers: {}, batch size: {}",
        config.error_handling, config.retry_attempts, config.max_workers, config.batch_size
    );

    println!("\nSources:");
    for source in pipeline.sources() {
        println!("  {} [{}] {}", source.name, source.format, source.location);
    }
    println!("\nSteps:");
    for step in pipeline.steps() {
        let origin = if step.sector_specific { " (sector)" } else { "" };
        println!("  {:>4} {}{}", step.order, step.name, origin);
    }
    println!("\nSinks:");
    for sink in pipeline.sinks() {
        println!("  {} [{}]", sink.name, sink.kind);
    }
    println!("\nValidation rules:");
    for rule in pipeline.rules().rules() {
        println!("  {} ({:?})", rule.name, rule.severity);
    }

    Ok(())
}

/// Show the event log and summary of a run
async fn show_status(run_id_str: &str) -> Result<()> {
    let run_id = Uuid::parse_str(run_id_str)
        .with_context(|| format!("Invalid run ID: {}", run_id_str))?;

    let runs_dir = config::runs_dir()?;
    if !runs_dir.join(run_id.to_string()).exists() {
        anyhow::bail!("No event log found for run {}", run_id);
    }

    let store = EventStore::open_run(&runs_dir, run_id).await?;
    let events = store.replay().await?;

    println!("Run ID: {}", run_id);
    match store.read_summary().await? {
        Some(metrics) => {
            println!("Pipeline: {}", metrics.pipeline_name);
            println!("Status: {}", metrics.status);
            println!("Started: {}", metrics.start_time);
            if let Some(end) = metrics.end_time {
                println!("Ended: {}", end);
            }
        }
        None => println!("Status: running (no summary yet)"),
    }

    println!("\nEvents:");
    for event in events {
        let unit = event.unit.as_deref().unwrap_or("-");
        let duration = event
            .duration_ms
            .map(|ms| format!(" ({}ms)", ms))
            .unwrap_or_default();
        println!(
            "  {} {:<20} {:<24} {}{}",
            event.timestamp.format("%H:%M:%S%.3f"),
            format!("{:?}", event.event_type),
            unit,
            event.summary,
            duration
        );
        if let Some(error) = event.error {
            println!("      error: {}", error);
        }
    }

    Ok(())
}

/// List recent runs, newest first
async fn list_runs(limit: usize) -> Result<()> {
    let runs_dir = config::runs_dir()?;
    let mut summaries = Vec::new();

    for run_id in EventStore::list_runs(&runs_dir).await? {
        let store = EventStore::open_run(&runs_dir, run_id).await?;
        summaries.push((run_id, store.read_summary().await?));
    }

    if summaries.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    summaries.sort_by_key(|(_, summary)| {
        std::cmp::Reverse(summary.as_ref().map(|m| m.start_time))
    });

    println!("{:<38} {:<20} {:<12} {:>8}", "RUN ID", "PIPELINE", "STATUS", "QUALITY");
    println!("{}", "-".repeat(81));

    for (run_id, summary) in summaries.into_iter().take(limit) {
        match summary {
            Some(m) => println!(
                "{:<38} {:<20} {:<12} {:>8.1}",
                run_id, m.pipeline_name, m.status, m.data_quality_score
            ),
            None => println!("{:<38} {:<20} {:<12} {:>8}", run_id, "?", "running", "-"),
        }
    }

    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("sectorflow configuration");
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
    println!("  Home:        {}", cfg.home.display());
    println!("  Cache:       {}", cfg.cache_dir().display());
    println!("  Checkpoints: {}", cfg.checkpoints_dir().display());
    println!("  Runs:        {}", cfg.runs_dir().display());
    println!();
    println!("Pipeline defaults:");
    println!("{}", serde_yaml::to_string(&cfg.defaults).unwrap_or_default());
    println!("Built-in transforms: {}", BUILTIN_TRANSFORMS.join(", "));

    Ok(())
}
