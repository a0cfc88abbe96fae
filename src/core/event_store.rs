//! Append-only run event log with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL) for simplicity
//! and easy debugging/inspection. One log file per run directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::domain::{EventType, PipelineEvent, PipelineMetrics};

const EVENTS_FILE: &str = "events.jsonl";
const SUMMARY_FILE: &str = "metrics.json";

/// File-based event store using JSONL format
#[derive(Debug, Clone)]
pub struct EventStore {
    /// Directory holding the log
    dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,
}

impl EventStore {
    /// Create or open an event log in `dir`
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create event log directory: {}", dir.display()))?;

        let events_path = dir.join(EVENTS_FILE);
        Ok(Self { dir, events_path })
    }

    /// Open the log of one run under a runs directory
    pub async fn open_run(runs_dir: &Path, run_id: Uuid) -> Result<Self> {
        Self::open(runs_dir.join(run_id.to_string())).await
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Append an event to the log
    pub async fn append(&self, event: &PipelineEvent) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let mut line = serde_json::to_string(event).context("Failed to serialize event")?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<PipelineEvent>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: PipelineEvent = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Get the last event of a specific type
    pub async fn last_event_of_type(&self, event_type: EventType) -> Result<Option<PipelineEvent>> {
        let events = self.replay().await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }

    /// Persist the final metrics of the run next to the log
    pub async fn write_summary(&self, metrics: &PipelineMetrics) -> Result<()> {
        let path = self.dir.join(SUMMARY_FILE);
        let content =
            serde_json::to_string_pretty(metrics).context("Failed to serialize run summary")?;
        fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write run summary: {}", path.display()))
    }

    /// Final metrics of the run, if it has terminated
    pub async fn read_summary(&self) -> Result<Option<PipelineMetrics>> {
        let path = self.dir.join(SUMMARY_FILE);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read run summary: {}", path.display()))?;
        let metrics = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run summary: {}", path.display()))?;
        Ok(Some(metrics))
    }

    /// List run IDs that have a log directory under `runs_dir`
    pub async fn list_runs(runs_dir: &Path) -> Result<Vec<Uuid>> {
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(runs_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(uuid) = entry
                .file_name()
                .to_str()
                .and_then(|name| Uuid::parse_str(name).ok())
            {
                runs.push(uuid);
            }
        }

        Ok(runs)
    }
}
