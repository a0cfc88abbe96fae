//! YAML pipeline definitions.
//!
//! ```yaml
//! name: loans
//! sector: banking
//! config:
//!   max_workers: 8
//!   error_handling: skip
//! sources:
//!   - name: accounts
//!     format: jsonl
//!     location: data/accounts-*.jsonl
//! steps:
//!   - name: double_balance
//!     transform: scale_column
//!     order: 20
//!     params: { column: balance, factor: 2 }
//! sinks:
//!   - name: report
//!     kind: file
//!     params: { path: out/report.json }
//! ```
//!
//! Relative file locations are resolved against the definition's directory.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::transforms;

use super::builder::PipelineBuilder;
use super::pipeline::{
    DataFormat, ErrorHandling, Params, PipelineConfig, RetryBackoff, SinkDescriptor, SinkKind,
    SourceDescriptor, TransformationStep,
};

/// Optional overrides of [`PipelineConfig`] fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverrides {
    pub version: Option<String>,
    pub parallel_processing: Option<bool>,
    pub max_workers: Option<usize>,
    pub batch_size: Option<usize>,
    pub cache_enabled: Option<bool>,
    pub monitoring_enabled: Option<bool>,
    pub error_handling: Option<ErrorHandling>,
    pub retry_attempts: Option<u32>,
    pub retry_backoff: Option<RetryBackoff>,
    pub checkpoint_enabled: Option<bool>,
    pub validation_enabled: Option<bool>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut PipelineConfig) {
        macro_rules! apply {
            ($($field:ident),*) => {
                $(if let Some(value) = &self.$field {
                    config.$field = value.clone();
                })*
            };
        }
        apply!(
            version,
            parallel_processing,
            max_workers,
            batch_size,
            cache_enabled,
            monitoring_enabled,
            error_handling,
            retry_attempts,
            retry_backoff,
            checkpoint_enabled,
            validation_enabled
        );
    }
}

/// A step that references a built-in transform by name
#[derive(Debug, Clone, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub transform: String,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub params: Params,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub sector: String,
    #[serde(default)]
    pub config: ConfigOverrides,
    #[serde(default)]
    pub sources: Vec<SourceDescriptor>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub sinks: Vec<SinkDescriptor>,
    /// Skip the sector's built-in steps and rules
    #[serde(default)]
    pub without_sector_profile: bool,
}

impl PipelineDefinition {
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content)
            .context("Invalid pipeline definition")
            .map_err(ConfigError::Definition)
    }

    /// Load a definition file, resolving relative paths against its directory
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))
            .map_err(ConfigError::Definition)?;
        let mut definition = Self::from_yaml(&content)?;

        if let Some(base) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            definition.resolve_paths(base);
        }
        Ok(definition)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for source in &mut self.sources {
            if matches!(source.format, DataFormat::Json | DataFormat::Jsonl)
                && Path::new(&source.location).is_relative()
            {
                source.location = base.join(&source.location).to_string_lossy().into_owned();
            }
        }

        for sink in &mut self.sinks {
            if sink.kind != SinkKind::File {
                continue;
            }
            if let Some(path) = sink.param_str("path").filter(|p| Path::new(p).is_relative()) {
                let resolved = base.join(path).to_string_lossy().into_owned();
                sink.params.insert("path".into(), resolved.into());
            }
        }
    }

    /// Check that every step names a known transform
    pub fn validate(&self) -> Result<(), ConfigError> {
        for step in &self.steps {
            if transforms::builtin(&step.transform).is_none() {
                return Err(ConfigError::UnknownTransform {
                    step: step.name.clone(),
                    transform: step.transform.clone(),
                });
            }
        }
        Ok(())
    }

    /// Resolved configuration: `defaults` first, then this definition's overrides
    pub fn config(&self, defaults: &ConfigOverrides) -> PipelineConfig {
        let mut config = PipelineConfig::new(&self.name, &self.sector);
        defaults.apply(&mut config);
        self.config.apply(&mut config);
        config
    }

    pub fn into_builder(self, defaults: &ConfigOverrides) -> Result<PipelineBuilder, ConfigError> {
        self.validate()?;

        let mut builder = PipelineBuilder::from_config(self.config(defaults));
        if self.without_sector_profile {
            builder = builder.without_sector_profile();
        }
        for source in self.sources {
            builder = builder.with_source(source);
        }
        for step in self.steps {
            let function = transforms::builtin(&step.transform).ok_or_else(|| {
                ConfigError::UnknownTransform {
                    step: step.name.clone(),
                    transform: step.transform.clone(),
                }
            })?;
            builder = builder.with_transformation(
                TransformationStep::from_fn(step.name, function)
                    .with_order(step.order)
                    .with_params(step.params),
            );
        }
        for sink in self.sinks {
            builder = builder.with_sink(sink);
        }
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DEFINITION: &str = r#"
name: loans
sector: banking
config:
  max_workers: 8
  error_handling: skip
sources:
  - name: accounts
    format: jsonl
    location: data/accounts-*.jsonl
    schema: [id, balance]
steps:
  - name: double_balance
    transform: scale_column
    order: 20
    params: { column: balance, factor: 2 }
sinks:
  - name: report
    kind: file
    params: { path: out/report.json }
"#;

    #[test]
    fn test_parse_definition() {
        let definition = PipelineDefinition::from_yaml(DEFINITION).unwrap();
        assert_eq!(definition.name, "loans");
        assert_eq!(definition.sources[0].format, DataFormat::Jsonl);
        assert_eq!(definition.steps[0].params["factor"], 2);

        let defaults = ConfigOverrides {
            batch_size: Some(500),
            max_workers: Some(2),
            ..Default::default()
        };
        let config = definition.config(&defaults);
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.error_handling, ErrorHandling::Skip);
    }

    #[test]
    fn test_into_builder_adds_sector_steps() {
        let definition = PipelineDefinition::from_yaml(DEFINITION).unwrap();
        let pipeline = definition
            .into_builder(&ConfigOverrides::default())
            .unwrap()
            .build()
            .unwrap();

        let names: Vec<&str> = pipeline.steps().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["anonymize_pii", "calculate_risk_metrics", "double_balance"]);
    }

    #[test]
    fn test_unknown_transform_rejected() {
        let yaml = "name: p\nsector: x\nsteps:\n  - name: s\n    transform: teleport\n";
        let err = PipelineDefinition::from_yaml(yaml).unwrap().validate().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTransform { .. }));
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = PipelineDefinition::from_yaml("name: [").unwrap_err();
        assert!(err.to_string().starts_with("Failed to load pipeline definition"));
    }

    #[test]
    fn test_from_file_resolves_relative_paths() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("loans.yaml");
        std::fs::write(&path, DEFINITION).unwrap();

        let definition = PipelineDefinition::from_file(&path).unwrap();

        let expected = temp.path().join("data/accounts-*.jsonl");
        assert_eq!(definition.sources[0].location, expected.to_string_lossy());
        let sink_path = definition.sinks[0].param_str("path").unwrap();
        assert!(Path::new(sink_path).starts_with(temp.path()));
    }
}
