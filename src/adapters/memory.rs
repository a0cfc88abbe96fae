//! In-process connector.
//!
//! Serves registered datasets by source location and captures every
//! delivery per sink name. Useful for embedding and for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::Connector;
use crate::core::pipeline::{SinkDescriptor, SourceDescriptor};
use crate::domain::Dataset;

#[derive(Debug, Default)]
pub struct MemoryConnector {
    datasets: RwLock<HashMap<String, Dataset>>,
    delivered: RwLock<HashMap<String, Vec<Dataset>>>,
    extractions: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `dataset` for sources located at `location`
    pub async fn insert(&self, location: impl Into<String>, dataset: Dataset) {
        self.datasets.write().await.insert(location.into(), dataset);
    }

    /// Datasets delivered to a sink, oldest first
    pub async fn delivered(&self, sink: &str) -> Vec<Dataset> {
        self.delivered
            .read()
            .await
            .get(sink)
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of deliveries across all sinks
    pub async fn delivery_count(&self) -> usize {
        self.delivered.read().await.values().map(Vec::len).sum()
    }

    /// Number of extract calls served so far
    pub fn extraction_count(&self) -> usize {
        self.extractions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn name(&self) -> &str {
        "memory"
    }

    async fn extract(&self, source: &SourceDescriptor) -> Result<Dataset> {
        self.extractions.fetch_add(1, Ordering::SeqCst);

        let datasets = self.datasets.read().await;
        let mut dataset = datasets
            .get(&source.location)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No dataset registered at '{}'", source.location))?;
        drop(datasets);

        if let Some(columns) = &source.schema {
            dataset = dataset.conform_to(columns);
        }
        if let Some(filters) = &source.filters {
            dataset = dataset.filter_eq(filters)?;
        }
        Ok(dataset)
    }

    async fn load(&self, data: &Dataset, sink: &SinkDescriptor) -> Result<()> {
        self.delivered
            .write()
            .await
            .entry(sink.name.clone())
            .or_default()
            .push(data.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipeline::{DataFormat, SinkKind};
    use serde_json::json;

    #[tokio::test]
    async fn test_serves_and_captures() {
        let connector = MemoryConnector::new();
        let data = Dataset::from_rows(["id"], vec![vec![json!(1)]]).unwrap();
        connector.insert("mem://a", data.clone()).await;

        let source = SourceDescriptor::new("a", DataFormat::Stream, "mem://a");
        assert_eq!(connector.extract(&source).await.unwrap(), data);
        assert_eq!(connector.extraction_count(), 1);

        let sink = SinkDescriptor::new("out", SinkKind::Stream);
        connector.load(&data, &sink).await.unwrap();
        assert_eq!(connector.delivered("out").await, vec![data]);
        assert_eq!(connector.delivery_count().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_location_errors() {
        let connector = MemoryConnector::new();
        let source = SourceDescriptor::new("a", DataFormat::Stream, "mem://missing");
        assert!(connector.extract(&source).await.is_err());
    }
}
