//! Fluent construction of an [`Orchestrator`].
//!
//! `build()` applies the sector profile (unless disabled), validates the
//! declaration and wires the instance-owned cache, checkpoint store and
//! worker pool.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::adapters::ConnectorRegistry;
use crate::domain::PipelineStatus;
use crate::error::ConfigError;
use crate::transforms::SectorProfile;

use super::cache::ExtractionCache;
use super::checkpoint::CheckpointStore;
use super::orchestrator::Orchestrator;
use super::partition::PartitionCoordinator;
use super::pipeline::{
    insert_step, PipelineConfig, SinkDescriptor, SourceDescriptor, TransformationStep,
};
use super::policy::ErrorPolicy;
use super::store::{MemoryStore, SnapshotStore};
use super::validation::{ValidationRule, ValidationRuleSet};

pub struct PipelineBuilder {
    config: PipelineConfig,
    sources: Vec<SourceDescriptor>,
    steps: Vec<TransformationStep>,
    sinks: Vec<SinkDescriptor>,
    rules: ValidationRuleSet,
    connectors: ConnectorRegistry,
    cache_store: Option<Arc<dyn SnapshotStore>>,
    checkpoint_store: Option<Arc<dyn SnapshotStore>>,
    runs_dir: Option<PathBuf>,
    sector_profile: bool,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>, sector: impl Into<String>) -> Self {
        Self::from_config(PipelineConfig::new(name, sector))
    }

    pub fn from_config(config: PipelineConfig) -> Self {
        Self {
            config,
            sources: Vec::new(),
            steps: Vec::new(),
            sinks: Vec::new(),
            rules: ValidationRuleSet::new(),
            connectors: ConnectorRegistry::with_defaults(),
            cache_store: None,
            checkpoint_store: None,
            runs_dir: None,
            sector_profile: true,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Adjust configuration options before building
    pub fn configure(mut self, f: impl FnOnce(&mut PipelineConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn with_source(mut self, source: SourceDescriptor) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_transformation(mut self, step: TransformationStep) -> Self {
        insert_step(&mut self.steps, step);
        self
    }

    pub fn with_sink(mut self, sink: SinkDescriptor) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_rule(mut self, rule: ValidationRule) -> Self {
        self.rules.add_rule(rule);
        self
    }

    pub fn with_parallel_processing(mut self, workers: usize) -> Self {
        self.config.parallel_processing = true;
        self.config.max_workers = workers;
        self
    }

    pub fn with_monitoring(mut self) -> Self {
        self.config.monitoring_enabled = true;
        self
    }

    /// Replace the default connector registry
    pub fn with_connectors(mut self, connectors: ConnectorRegistry) -> Self {
        self.connectors = connectors;
        self
    }

    pub fn with_cache_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    /// Write one event log per run under `runs_dir`
    pub fn with_event_store(mut self, runs_dir: impl Into<PathBuf>) -> Self {
        self.runs_dir = Some(runs_dir.into());
        self
    }

    /// Do not add sector-specific steps and rules
    pub fn without_sector_profile(mut self) -> Self {
        self.sector_profile = false;
        self
    }

    pub fn build(mut self) -> Result<Orchestrator, ConfigError> {
        if self.sector_profile {
            if let Some(profile) = SectorProfile::for_sector(&self.config.sector) {
                debug!(sector = %self.config.sector, "Applying sector profile");
                let (steps, rules) = profile.into_parts();
                for step in steps {
                    insert_step(&mut self.steps, step);
                }
                for rule in rules {
                    self.rules.add_rule(rule);
                }
            }
        }

        self.validate()?;

        let config = self.config;
        let cache = config.cache_enabled.then(|| {
            let store = self
                .cache_store
                .unwrap_or_else(|| Arc::new(MemoryStore::new()));
            ExtractionCache::new(config.name.clone(), store)
        });
        let checkpoint_store = self
            .checkpoint_store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let (status, _) = watch::channel(PipelineStatus::Idle);

        Ok(Orchestrator {
            checkpoints: CheckpointStore::new(config.name.clone(), checkpoint_store),
            partitions: PartitionCoordinator::new(
                config.parallel_processing,
                config.max_workers,
                config.batch_size,
            ),
            policy: ErrorPolicy::from_config(&config),
            config,
            sources: self.sources,
            steps: self.steps,
            sinks: self.sinks,
            rules: self.rules,
            connectors: self.connectors,
            cache,
            runs_dir: self.runs_dir,
            status: Arc::new(status),
            cancel: CancellationToken::new(),
            last_metrics: Arc::new(Mutex::new(None)),
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.config.name.trim().is_empty() {
            return Err(ConfigError::EmptyField("name"));
        }
        check_name("pipeline", &self.config.name)?;
        if self.config.sector.trim().is_empty() {
            return Err(ConfigError::EmptyField("sector"));
        }
        if self.config.max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_workers",
                reason: "must be at least 1".into(),
            });
        }
        if self.config.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batch_size",
                reason: "must be at least 1".into(),
            });
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(ConfigError::EmptyField("source.name"));
            }
            check_name("source", &source.name)?;
            if source.location.trim().is_empty() {
                return Err(ConfigError::EmptyField("source.location"));
            }
            if !seen.insert(source.name.as_str()) {
                return Err(ConfigError::DuplicateSource(source.name.clone()));
            }
            if self.connectors.source(source.format).is_none() {
                return Err(ConfigError::UnsupportedFormat {
                    source_name: source.name.clone(),
                    format: source.format.to_string(),
                });
            }
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(ConfigError::EmptyField("step.name"));
            }
            check_name("step", &step.name)?;
            if !seen.insert(step.name.as_str()) {
                return Err(ConfigError::DuplicateStep(step.name.clone()));
            }
        }

        let mut seen = HashSet::new();
        for sink in &self.sinks {
            if sink.name.trim().is_empty() {
                return Err(ConfigError::EmptyField("sink.name"));
            }
            check_name("sink", &sink.name)?;
            if !seen.insert(sink.name.as_str()) {
                return Err(ConfigError::DuplicateSink(sink.name.clone()));
            }
            if self.connectors.sink(sink.kind).is_none() {
                return Err(ConfigError::UnsupportedSink {
                    sink: sink.name.clone(),
                    kind: sink.kind.to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Names become single segments of cache and checkpoint keys
fn check_name(kind: &'static str, name: &str) -> Result<(), ConfigError> {
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(ConfigError::InvalidName {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}
