//! Monitoring events for pipeline runs.
//!
//! When monitoring is enabled every notable transition of a run is recorded
//! as an immutable event in an append-only log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single event in the run log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Source, step or sink name (if applicable)
    pub unit: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary (NO credentials)
    pub summary: String,

    /// Time taken in milliseconds
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl PipelineEvent {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        unit: Option<String>,
        event_type: EventType,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            unit,
            event_type,
            summary: summary.into(),
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    RunCompleted,
    RunFailed,
    RunCancelled,

    /// Source served from the extraction cache
    CacheHit,
    SourceExtracted,
    SourceSkipped,

    /// A validation pass finished (with or without issues)
    ValidationEvaluated,

    /// Transform phase restarted from a stored checkpoint
    CheckpointRestored,
    StepCompleted,
    StepSkipped,

    /// A unit failed and is being attempted again
    UnitRetrying,

    SinkLoaded,
    SinkFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = PipelineEvent::new(
            Uuid::new_v4(),
            Some("scale".to_string()),
            EventType::StepCompleted,
            "Step 'scale' completed",
        )
        .with_duration(12);

        let json = serde_json::to_string(&event).unwrap();
        let parsed: PipelineEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_type, EventType::StepCompleted);
        assert_eq!(parsed.duration_ms, Some(12));
        assert!(json.contains("\"step_completed\""));
    }

    #[test]
    fn test_event_with_error() {
        let event = PipelineEvent::new(Uuid::new_v4(), None, EventType::RunFailed, "Run failed")
            .with_error("connection refused");

        assert_eq!(event.error.as_deref(), Some("connection refused"));
    }
}
