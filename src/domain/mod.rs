//! Domain types for the pipeline engine.
//!
//! This module contains the core data structures:
//! - Dataset: Tabular data flowing between phases
//! - Metrics: Per-run counters, errors and quality score
//! - Status: Orchestrator lifecycle
//! - Events: Monitoring records

pub mod dataset;
pub mod events;
pub mod metrics;
pub mod status;

// Re-export commonly used types
pub use dataset::{Dataset, Row};
pub use events::{EventType, PipelineEvent};
pub use metrics::{ErrorRecord, ErrorScope, PipelineMetrics, MAX_QUALITY_SCORE};
pub use status::PipelineStatus;
