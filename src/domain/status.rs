//! Lifecycle status of a pipeline orchestrator.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of a pipeline instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Built, never run
    Idle,

    /// A run is in progress
    Running,

    /// Held by an operator; runs are rejected until resumed
    Paused,

    /// Last run aborted with an error
    Failed,

    /// Last run finished all phases
    Completed,

    /// Last run was cancelled at a phase or partition boundary
    Cancelled,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl PipelineStatus {
    /// Completed, Failed and Cancelled end a run
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a new run may start from this status
    pub fn can_start(self) -> bool {
        matches!(self, Self::Idle) || self.is_terminal()
    }

    /// Allowed state machine edges
    pub fn can_transition_to(self, next: PipelineStatus) -> bool {
        use PipelineStatus::*;

        match (self, next) {
            (Running, Completed | Failed | Cancelled) => true,
            (from, Running) => from.can_start(),
            (from, Paused) => from.can_start(),
            (Paused, Idle) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use PipelineStatus::*;

        assert!(Idle.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(Failed.can_transition_to(Running));
        assert!(Completed.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Idle));

        assert!(!Running.can_transition_to(Running));
        assert!(!Running.can_transition_to(Paused));
        assert!(!Paused.can_transition_to(Running));
        assert!(!Idle.can_transition_to(Completed));
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&PipelineStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }
}
