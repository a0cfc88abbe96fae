//! Per-run metrics.
//!
//! A fresh [`PipelineMetrics`] is created when a run starts. The
//! orchestrator is its only writer; once the run reaches a terminal status
//! the snapshot is frozen and handed back to the caller.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::PipelineStatus;
use crate::core::validation::{QualityIssue, Stage};

/// Score every run starts with
pub const MAX_QUALITY_SCORE: f64 = 100.0;

/// Metrics collected during one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineMetrics {
    /// Unique identifier for this run
    pub run_id: Uuid,

    /// Pipeline that produced the run
    pub pipeline_name: String,

    /// When the run started
    pub start_time: DateTime<Utc>,

    /// When the run reached a terminal status
    pub end_time: Option<DateTime<Utc>>,

    /// Rows in the combined extraction result
    pub records_processed: usize,

    /// Rows flagged by failing rules in the last output validation
    pub records_failed: usize,

    /// Wall-clock duration in seconds (set on termination)
    pub processing_time_secs: f64,

    /// Steps whose output was adopted, in execution order
    pub steps_completed: Vec<String>,

    /// Sinks that received the final dataset, in delivery order
    pub sinks_loaded: Vec<String>,

    /// Every recorded failure, fatal or not
    pub errors: Vec<ErrorRecord>,

    /// Failed or errored validation rules across all passes
    pub quality_issues: Vec<QualityIssue>,

    /// 0-100, never increases during a run
    pub data_quality_score: f64,

    /// Status the run ended in (Running while in progress)
    pub status: PipelineStatus,
}

impl PipelineMetrics {
    pub fn new(run_id: Uuid, pipeline_name: impl Into<String>) -> Self {
        Self {
            run_id,
            pipeline_name: pipeline_name.into(),
            start_time: Utc::now(),
            end_time: None,
            records_processed: 0,
            records_failed: 0,
            processing_time_secs: 0.0,
            steps_completed: Vec::new(),
            sinks_loaded: Vec::new(),
            errors: Vec::new(),
            quality_issues: Vec::new(),
            data_quality_score: MAX_QUALITY_SCORE,
            status: PipelineStatus::Running,
        }
    }

    /// Append an error record stamped with the current time
    pub fn record_error(&mut self, scope: ErrorScope, message: impl Into<String>) {
        self.errors.push(ErrorRecord {
            timestamp: Utc::now(),
            scope,
            message: message.into(),
        });
    }

    /// Fold in the score of one validation pass, keeping the minimum
    pub fn apply_quality_score(&mut self, score: f64) {
        self.data_quality_score = self.data_quality_score.min(score);
    }

    /// Stamp end time, duration and final status
    pub fn finish(&mut self, status: PipelineStatus) {
        let end = Utc::now();
        self.processing_time_secs = (end - self.start_time)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        self.end_time = Some(end);
        self.status = status;
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// A recorded failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub scope: ErrorScope,
    pub message: String,
}

/// Which unit of work an error belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum ErrorScope {
    /// Run-level, not attributable to a single unit
    Pipeline,
    Source(String),
    Validation(Stage),
    Step(String),
    Sink(String),
}

impl fmt::Display for ErrorScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipeline => write!(f, "pipeline"),
            Self::Source(name) => write!(f, "source:{}", name),
            Self::Validation(stage) => write!(f, "validation:{}", stage),
            Self::Step(name) => write!(f, "step:{}", name),
            Self::Sink(name) => write!(f, "sink:{}", name),
        }
    }
}
