//! sectorflow - Sector-aware batch data pipelines
//!
//! A pipeline extracts tabular data from one or more sources, validates it,
//! runs an ordered chain of transformation steps, validates the result and
//! delivers it to sinks. Business sectors (banking, healthcare) contribute
//! their own steps and validation rules.
//!
//! # Architecture
//!
//! - Every source, step and sink runs under one error policy (retry, skip
//!   or fail)
//! - Extractions are cached and every step's input is checkpointed, so a
//!   run can be resumed from any step
//! - Large steps are split into partitions and run on a bounded worker pool
//! - Run events are appended to a per-run log when monitoring is enabled
//!
//! # Modules
//!
//! - `adapters`: Source and sink connectors (files, in-memory)
//! - `core`: Orchestration logic (Orchestrator, validation, policy, stores)
//! - `domain`: Data structures (Dataset, metrics, status, events)
//! - `transforms`: Built-in transforms and sector profiles
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline declared in YAML
//! sectorflow run loans.yaml
//!
//! # Re-run from a step's checkpoint
//! sectorflow resume loans.yaml --from-step calculate_risk_metrics
//!
//! # Inspect a run
//! sectorflow status <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod transforms;

// Re-export main types at crate root for convenience
pub use adapters::{Connector, ConnectorRegistry, FileConnector, MemoryConnector};
pub use self::core::{
    Orchestrator, PipelineBuilder, PipelineConfig, PipelineDefinition, PipelineHandle,
    SinkDescriptor, SinkKind, SourceDescriptor, TransformationStep,
};
pub use domain::{Dataset, EventType, PipelineEvent, PipelineMetrics, PipelineStatus};
pub use error::{ConfigError, PipelineError};
pub use transforms::{Sector, SectorProfile};
