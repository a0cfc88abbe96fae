//! Connector interfaces for external systems.
//!
//! Connectors read source datasets and deliver final datasets to sinks.
//! The engine treats them as opaque: it only looks them up by source
//! format or sink kind and calls them.

pub mod file;
pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::core::pipeline::{DataFormat, SinkDescriptor, SinkKind, SourceDescriptor};
use crate::domain::Dataset;

pub use file::FileConnector;
pub use memory::MemoryConnector;

/// Trait for source/sink connectors.
///
/// Implementations must not mutate their inputs and must return an error
/// (not a partial dataset) on failure.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Human-readable connector name
    fn name(&self) -> &str;

    /// Read one source
    async fn extract(&self, source: &SourceDescriptor) -> Result<Dataset> {
        anyhow::bail!(
            "Connector '{}' cannot read source '{}'",
            self.name(),
            source.name
        )
    }

    /// Deliver a dataset to one sink
    async fn load(&self, _data: &Dataset, sink: &SinkDescriptor) -> Result<()> {
        anyhow::bail!(
            "Connector '{}' cannot write sink '{}'",
            self.name(),
            sink.name
        )
    }
}

/// Connectors by source format and sink kind
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    sources: HashMap<DataFormat, Arc<dyn Connector>>,
    sinks: HashMap<SinkKind, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in file connector for json/jsonl sources and file sinks
    pub fn with_defaults() -> Self {
        let file: Arc<dyn Connector> = Arc::new(FileConnector::new());
        Self::new()
            .with_source(DataFormat::Json, file.clone())
            .with_source(DataFormat::Jsonl, file.clone())
            .with_sink(SinkKind::File, file)
    }

    pub fn with_source(mut self, format: DataFormat, connector: Arc<dyn Connector>) -> Self {
        self.sources.insert(format, connector);
        self
    }

    pub fn with_sink(mut self, kind: SinkKind, connector: Arc<dyn Connector>) -> Self {
        self.sinks.insert(kind, connector);
        self
    }

    pub fn source(&self, format: DataFormat) -> Option<&Arc<dyn Connector>> {
        self.sources.get(&format)
    }

    pub fn sink(&self, kind: SinkKind) -> Option<&Arc<dyn Connector>> {
        self.sinks.get(&kind)
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut sources: Vec<String> = self.sources.keys().map(ToString::to_string).collect();
        let mut sinks: Vec<String> = self.sinks.keys().map(ToString::to_string).collect();
        sources.sort();
        sinks.sort();
        f.debug_struct("ConnectorRegistry")
            .field("sources", &sources)
            .field("sinks", &sinks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ReadOnly;

    #[async_trait]
    impl Connector for ReadOnly {
        fn name(&self) -> &str {
            "read-only"
        }
    }

    #[test]
    fn test_default_registry() {
        let registry = ConnectorRegistry::with_defaults();

        assert!(registry.source(DataFormat::Json).is_some());
        assert!(registry.source(DataFormat::Jsonl).is_some());
        assert!(registry.source(DataFormat::Parquet).is_none());
        assert!(registry.sink(SinkKind::File).is_some());
        assert!(registry.sink(SinkKind::Database).is_none());
    }

    #[tokio::test]
    async fn test_unsupported_directions_error() {
        let connector = ReadOnly;
        let source = SourceDescriptor::new("s", DataFormat::Api, "http://x");
        let sink = SinkDescriptor::new("out", SinkKind::Api);

        let err = connector.extract(&source).await.unwrap_err();
        assert!(err.to_string().contains("cannot read source 's'"));
        assert!(connector.load(&Dataset::default(), &sink).await.is_err());
    }
}
