//! Core orchestration logic.
//!
//! This module contains:
//! - Pipeline: Configuration and unit descriptors
//! - Builder/Definition: Code and YAML construction of pipelines
//! - Validation: Rule sets and quality scoring
//! - Policy: Retry, skip and fail handling for every unit
//! - Cache/Checkpoint/Store: Snapshot persistence
//! - Partition: Parallel execution of large steps
//! - EventStore: Append-only run logs
//! - Orchestrator: Main execution engine

pub mod builder;
pub mod cache;
pub mod checkpoint;
pub mod definition;
pub mod event_store;
pub mod orchestrator;
pub mod partition;
pub mod pipeline;
pub mod policy;
pub mod store;
pub mod validation;

// Re-export commonly used types
pub use builder::PipelineBuilder;
pub use definition::{ConfigOverrides, PipelineDefinition, StepDefinition};
pub use event_store::EventStore;
pub use orchestrator::{Orchestrator, PipelineHandle};
pub use pipeline::{
    Credentials, DataFormat, ErrorHandling, Params, PipelineConfig, RetryBackoff, SinkDescriptor,
    SinkKind, SourceDescriptor, TransformFn, TransformationStep, ValidatorFn,
};
pub use store::{FileStore, MemoryStore, Snapshot, SnapshotStore};
pub use validation::{
    QualityIssue, RuleOutcome, Severity, Stage, ValidationReport, ValidationRule,
    ValidationRuleSet,
};
