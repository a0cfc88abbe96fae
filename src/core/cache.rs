//! Extraction cache.
//!
//! Consulted before a source is read. Entries expire once the source's
//! refresh interval has elapsed; sources without an interval never expire.
//! Each entry carries a fingerprint of the source's format, location,
//! schema and filters; an entry written for a different descriptor is a miss.
//! Backend errors are treated as misses so the cache can never break a run.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::pipeline::SourceDescriptor;
use super::store::{Snapshot, SnapshotStore};
use crate::domain::Dataset;

/// Source-keyed view over a snapshot store
#[derive(Clone)]
pub struct ExtractionCache {
    pipeline: String,
    backend: Arc<dyn SnapshotStore>,
}

impl ExtractionCache {
    pub fn new(pipeline: impl Into<String>, backend: Arc<dyn SnapshotStore>) -> Self {
        Self {
            pipeline: pipeline.into(),
            backend,
        }
    }

    /// `{pipeline}/{source}`
    pub fn key(&self, source: &SourceDescriptor) -> String {
        format!("{}/{}", self.pipeline, source.name)
    }

    /// Cached dataset for a source, if present and still fresh
    pub async fn get(&self, source: &SourceDescriptor) -> Option<Dataset> {
        let key = self.key(source);
        let snapshot = match self.backend.get(&key).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return None,
            Err(e) => {
                warn!(source = %source.name, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };

        if snapshot.fingerprint.as_deref() != Some(fingerprint(source).as_str()) {
            debug!(source = %source.name, "Cache entry written for a different source definition");
            return None;
        }

        if !is_fresh(source, snapshot.created_at, Utc::now()) {
            debug!(source = %source.name, "Cache entry expired");
            return None;
        }

        Some(snapshot.dataset)
    }

    /// Store a freshly extracted dataset; failures are only logged
    pub async fn put(&self, source: &SourceDescriptor, dataset: &Dataset) {
        let key = self.key(source);
        let snapshot = Snapshot::new(dataset.clone()).with_fingerprint(fingerprint(source));
        if let Err(e) = self.backend.put(&key, &snapshot).await {
            warn!(source = %source.name, error = %e, "Cache write failed");
        }
    }
}

/// Digest of everything that determines what a source extracts
pub fn fingerprint(source: &SourceDescriptor) -> String {
    let identity = json!({
        "format": source.format,
        "location": source.location,
        "schema": source.schema,
        "filters": source.filters,
    });
    hex::encode(Sha256::digest(identity.to_string().as_bytes()))
}

/// Entries without a refresh interval never expire
pub fn is_fresh(source: &SourceDescriptor, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let Some(interval) = source.refresh_interval else {
        return true;
    };

    match chrono::Duration::from_std(interval) {
        Ok(interval) => now.signed_duration_since(created_at) < interval,
        Err(_) => true,
    }
}
