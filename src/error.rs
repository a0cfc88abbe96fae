//! Error types for pipeline construction and execution.

use thiserror::Error;

use crate::core::validation::Stage;
use crate::domain::PipelineStatus;

/// Errors detected while building a pipeline. Never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Required field '{0}' is empty")]
    EmptyField(&'static str),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Invalid {kind} name '{name}': must not contain '/' or '\\' or be '.' or '..'")]
    InvalidName { kind: &'static str, name: String },

    #[error("Duplicate source name: {0}")]
    DuplicateSource(String),

    #[error("Duplicate transformation step name: {0}")]
    DuplicateStep(String),

    #[error("Duplicate sink name: {0}")]
    DuplicateSink(String),

    #[error("Source '{source_name}' uses unsupported format '{format}'")]
    UnsupportedFormat { source_name: String, format: String },

    #[error("Sink '{sink}' uses unsupported kind '{kind}'")]
    UnsupportedSink { sink: String, kind: String },

    #[error("Step '{step}' references unknown transform '{transform}'")]
    UnknownTransform { step: String, transform: String },

    #[error("Failed to load pipeline definition: {0:#}")]
    Definition(anyhow::Error),
}

/// Errors raised while running a pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pipeline '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Pipeline '{name}' cannot start while {status}")]
    InvalidState { name: String, status: PipelineStatus },

    #[error("Extraction from source '{source_name}' failed: {message}")]
    Extraction { source_name: String, message: String },

    #[error("Critical validation rule '{rule}' failed at {stage} stage: {message}")]
    CriticalValidation {
        stage: Stage,
        rule: String,
        message: String,
    },

    #[error("Transformation step '{step}' failed: {message}")]
    Transformation { step: String, message: String },

    #[error("Loading into sink '{sink}' failed: {message}")]
    Load { sink: String, message: String },

    #[error("No checkpoint found for step '{0}'")]
    CheckpointNotFound(String),

    #[error("Pipeline run was cancelled")]
    Cancelled,

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl PipelineError {
    /// Unit failures are recorded in metrics where they happen
    pub fn is_unit_failure(&self) -> bool {
        matches!(
            self,
            Self::Extraction { .. }
                | Self::CriticalValidation { .. }
                | Self::Transformation { .. }
                | Self::Load { .. }
        )
    }

    pub fn transformation(step: &str, error: impl std::fmt::Display) -> Self {
        Self::Transformation {
            step: step.to_string(),
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = PipelineError::CriticalValidation {
            stage: Stage::Input,
            rule: "not_empty".into(),
            message: "Dataset is empty".into(),
        };
        assert_eq!(
            err.to_string(),
            "Critical validation rule 'not_empty' failed at input stage: Dataset is empty"
        );
        assert!(err.is_unit_failure());
        assert!(!PipelineError::Cancelled.is_unit_failure());
    }

    #[test]
    fn test_fatal_from_anyhow() {
        let err: PipelineError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, PipelineError::Fatal(_)));
        assert_eq!(err.to_string(), "disk full");
    }
}
