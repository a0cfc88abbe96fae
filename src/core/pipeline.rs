//! Pipeline configuration and unit descriptors.
//!
//! Sources, transformation steps and sinks are declared up front and never
//! mutated during a run. Transformation functions and validators are plain
//! function references stored inside the step.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::Dataset;

/// Parameters passed to a transformation function
pub type Params = Map<String, Value>;

/// `dataset x params -> dataset`
pub type TransformFn = Arc<dyn Fn(Dataset, &Params) -> anyhow::Result<Dataset> + Send + Sync>;

/// Predicate over a dataset, used as step input/output validator
pub type ValidatorFn = Arc<dyn Fn(&Dataset) -> bool + Send + Sync>;

/// Pipeline-wide options, fixed once the pipeline is built
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,

    /// Business sector tag; selects a sector profile at build time
    pub sector: String,

    #[serde(default = "default_version")]
    pub version: String,

    /// Allow partitioned execution of large transform steps
    #[serde(default = "default_true")]
    pub parallel_processing: bool,

    /// Partition count and worker pool size
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Row count above which a step is partitioned
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    /// Record run events when an event store is attached
    #[serde(default = "default_true")]
    pub monitoring_enabled: bool,

    #[serde(default)]
    pub error_handling: ErrorHandling,

    /// Extra attempts per unit in retry mode
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default)]
    pub retry_backoff: RetryBackoff,

    #[serde(default = "default_true")]
    pub checkpoint_enabled: bool,

    #[serde(default = "default_true")]
    pub validation_enabled: bool,
}

fn default_version() -> String {
    "1.0".to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_workers() -> usize {
    4
}
fn default_batch_size() -> usize {
    10_000
}
fn default_retry_attempts() -> u32 {
    3
}

impl PipelineConfig {
    pub fn new(name: impl Into<String>, sector: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sector: sector.into(),
            version: default_version(),
            parallel_processing: true,
            max_workers: default_max_workers(),
            batch_size: default_batch_size(),
            cache_enabled: true,
            monitoring_enabled: true,
            error_handling: ErrorHandling::default(),
            retry_attempts: default_retry_attempts(),
            retry_backoff: RetryBackoff::default(),
            checkpoint_enabled: true,
            validation_enabled: true,
        }
    }
}

/// How a failing source, step or sink is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandling {
    /// Re-attempt the unit, then skip it
    #[default]
    Retry,
    /// Drop the unit and continue
    Skip,
    /// Abort the run on the first failure
    Fail,
}

impl fmt::Display for ErrorHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Retry => "retry",
            Self::Skip => "skip",
            Self::Fail => "fail",
        })
    }
}

/// Delay between retry attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryBackoff {
    /// Delay before the first retry in milliseconds (0 = retry immediately)
    #[serde(default)]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

fn default_max_delay() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: default_max_delay(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryBackoff {
    /// Delay after a failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64 * self.multiplier.powi((attempt - 1) as i32);
        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }
}

/// Input formats a source may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    Csv,
    Json,
    /// Newline-delimited JSON objects
    Jsonl,
    Parquet,
    Excel,
    Sql,
    Api,
    Stream,
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Jsonl => "jsonl",
            Self::Parquet => "parquet",
            Self::Excel => "excel",
            Self::Sql => "sql",
            Self::Api => "api",
            Self::Stream => "stream",
        })
    }
}

/// Connector credentials. Never serialized and redacted in Debug output.
#[derive(Clone, Default, Deserialize)]
pub struct Credentials(HashMap<String, String>);

impl Credentials {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self(values)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.0.keys().collect();
        keys.sort();
        f.debug_struct("Credentials")
            .field("keys", &keys)
            .finish_non_exhaustive()
    }
}

/// One input of the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Unique within the pipeline; part of the cache key
    pub name: String,

    pub format: DataFormat,

    /// Path, URL, connection string or glob, interpreted by the connector
    pub location: String,

    #[serde(default, skip_serializing)]
    pub credentials: Option<Credentials>,

    /// Expected columns, in order
    #[serde(default)]
    pub schema: Option<Vec<String>>,

    /// Cached extractions older than this are re-read
    #[serde(default, with = "optional_secs", rename = "refresh_interval_secs")]
    pub refresh_interval: Option<Duration>,

    /// Static `column -> value` equality filters
    #[serde(default)]
    pub filters: Option<Params>,
}

impl SourceDescriptor {
    pub fn new(name: impl Into<String>, format: DataFormat, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format,
            location: location.into(),
            credentials: None,
            schema: None,
            refresh_interval: None,
            filters: None,
        }
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    pub fn with_schema<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.schema = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_filters(mut self, filters: Params) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

mod optional_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

/// Destination categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Database,
    File,
    Api,
    Stream,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Database => "database",
            Self::File => "file",
            Self::Api => "api",
            Self::Stream => "stream",
        })
    }
}

/// One destination of the final dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkDescriptor {
    pub name: String,
    pub kind: SinkKind,

    /// Kind-specific settings (e.g. `path` for files)
    #[serde(default)]
    pub params: Params,
}

impl SinkDescriptor {
    pub fn new(name: impl Into<String>, kind: SinkKind) -> Self {
        Self {
            name: name.into(),
            kind,
            params: Params::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// A named, ordered transformation of the working dataset
#[derive(Clone)]
pub struct TransformationStep {
    /// Unique step name; also the checkpoint key
    pub name: String,

    pub function: TransformFn,

    pub params: Params,

    /// Rejecting input fails the step (not the run)
    pub input_validator: Option<ValidatorFn>,

    /// Rejecting output fails the step (not the run)
    pub output_validator: Option<ValidatorFn>,

    /// Contributed by a sector profile
    pub sector_specific: bool,

    /// Ascending execution order; ties keep insertion order
    pub order: i32,
}

impl TransformationStep {
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(Dataset, &Params) -> anyhow::Result<Dataset> + Send + Sync + 'static,
    {
        Self::from_fn(name, Arc::new(function))
    }

    pub fn from_fn(name: impl Into<String>, function: TransformFn) -> Self {
        Self {
            name: name.into(),
            function,
            params: Params::new(),
            input_validator: None,
            output_validator: None,
            sector_specific: false,
            order: 0,
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_input_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Dataset) -> bool + Send + Sync + 'static,
    {
        self.input_validator = Some(Arc::new(validator));
        self
    }

    pub fn with_output_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Dataset) -> bool + Send + Sync + 'static,
    {
        self.output_validator = Some(Arc::new(validator));
        self
    }

    pub fn sector_specific(mut self) -> Self {
        self.sector_specific = true;
        self
    }

    /// Run the function on a whole dataset
    pub fn apply(&self, input: Dataset) -> anyhow::Result<Dataset> {
        (self.function)(input, &self.params)
    }
}

impl fmt::Debug for TransformationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformationStep")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("input_validator", &self.input_validator.is_some())
            .field("output_validator", &self.output_validator.is_some())
            .field("sector_specific", &self.sector_specific)
            .field("order", &self.order)
            .finish()
    }
}

/// Insert a step keeping the list sorted by `order` (stable)
pub fn insert_step(steps: &mut Vec<TransformationStep>, step: TransformationStep) {
    steps.push(step);
    steps.sort_by_key(|s| s.order);
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CONFIG_YAML: &str = r#"
name: loans
sector: banking
max_workers: 8
error_handling: skip
retry_backoff:
  initial_delay_ms: 100
"#;

    #[test]
    fn test_config_defaults_from_yaml() {
        let config: PipelineConfig = serde_yaml::from_str(TEST_CONFIG_YAML).unwrap();

        assert_eq!(config.name, "loans");
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.batch_size, 10_000);
        assert_eq!(config.error_handling, ErrorHandling::Skip);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.retry_backoff.max_delay_ms, 30_000);
        assert!(config.checkpoint_enabled);
        assert_eq!(config.version, "1.0");
    }

    #[test]
    fn test_backoff_delays() {
        let backoff = RetryBackoff {
            initial_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 10000,
        };

        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_millis(10000)); // Capped

        assert_eq!(RetryBackoff::default().delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn test_steps_sorted_stably() {
        let noop = |d: Dataset, _: &Params| -> anyhow::Result<Dataset> { Ok(d) };
        let mut steps = Vec::new();
        insert_step(&mut steps, TransformationStep::new("late", noop).with_order(10));
        insert_step(&mut steps, TransformationStep::new("first", noop).with_order(1));
        insert_step(&mut steps, TransformationStep::new("second", noop).with_order(1));

        let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "late"]);
    }

    #[test]
    fn test_source_yaml_and_redaction() {
        let yaml = r#"
name: accounts
format: jsonl
location: data/accounts-*.jsonl
refresh_interval_secs: 60
credentials:
  token: hunter2
"#;
        let source: SourceDescriptor = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(source.format, DataFormat::Jsonl);
        assert_eq!(source.refresh_interval, Some(Duration::from_secs(60)));
        assert_eq!(source.credentials.as_ref().unwrap().get("token"), Some("hunter2"));

        let debug = format!("{:?}", source);
        assert!(!debug.contains("hunter2"));

        let json = serde_json::to_string(&source).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(json.contains("\"refresh_interval_secs\":60"));
    }
}
