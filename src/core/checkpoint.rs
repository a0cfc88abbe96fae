//! Pre-step checkpoints.
//!
//! Before a transformation step runs, the working dataset is saved under
//! `{pipeline}/{step}/{timestamp}`. The store keeps one live key per step;
//! re-executing a step (e.g. on retry) replaces it and deletes the
//! superseded keys from the backend.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::store::{Snapshot, SnapshotStore};
use crate::domain::Dataset;

/// Timestamp format used in checkpoint keys; sorts chronologically
const KEY_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";

pub struct CheckpointStore {
    pipeline: String,
    backend: Arc<dyn SnapshotStore>,

    /// step name -> live key
    live: RwLock<HashMap<String, String>>,
}

impl CheckpointStore {
    pub fn new(pipeline: impl Into<String>, backend: Arc<dyn SnapshotStore>) -> Self {
        Self {
            pipeline: pipeline.into(),
            backend,
            live: RwLock::new(HashMap::new()),
        }
    }

    fn step_prefix(&self, step: &str) -> String {
        format!("{}/{}/", self.pipeline, step)
    }

    /// Save the dataset a step is about to consume
    pub async fn save(&self, step: &str, dataset: &Dataset) -> Result<String> {
        let key = format!(
            "{}{}",
            self.step_prefix(step),
            Utc::now().format(KEY_TIMESTAMP_FORMAT)
        );
        self.backend
            .put(&key, &Snapshot::new(dataset.clone()))
            .await
            .with_context(|| format!("Failed to write checkpoint for step '{}'", step))?;

        debug!(%step, %key, rows = dataset.row_count(), "Checkpoint saved");
        self.live.write().await.insert(step.to_string(), key.clone());
        self.prune(step, &key).await;
        Ok(key)
    }

    /// Drop every checkpoint of `step` except `keep`; failures are only logged
    async fn prune(&self, step: &str, keep: &str) {
        let stale = match self.step_keys(step).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(%step, error = %e, "Could not list superseded checkpoints");
                return;
            }
        };

        for key in stale.iter().filter(|k| k.as_str() != keep) {
            if let Err(e) = self.backend.remove(key).await {
                warn!(%step, %key, error = %e, "Could not remove superseded checkpoint");
            }
        }
    }

    /// Backend keys belonging to exactly this step, not to `{step}/...` descendants
    async fn step_keys(&self, step: &str) -> Result<Vec<String>> {
        let prefix = self.step_prefix(step);
        let keys = self
            .backend
            .keys(&prefix)
            .await
            .with_context(|| format!("Failed to list checkpoints for step '{}'", step))?;

        Ok(keys
            .into_iter()
            .filter(|k| k.strip_prefix(&prefix).is_some_and(|ts| !ts.contains('/')))
            .collect())
    }

    /// Live key of a step: this instance's last save, else the newest key in the backend
    pub async fn latest_key(&self, step: &str) -> Result<Option<String>> {
        if let Some(key) = self.live.read().await.get(step) {
            return Ok(Some(key.clone()));
        }

        Ok(self.step_keys(step).await?.into_iter().max())
    }

    /// Load the pre-step snapshot of a step
    pub async fn restore(&self, step: &str) -> Result<Option<Snapshot>> {
        let Some(key) = self.latest_key(step).await? else {
            return Ok(None);
        };

        self.backend
            .get(&key)
            .await
            .with_context(|| format!("Failed to read checkpoint '{}'", key))
    }

    /// Steps with a live checkpoint in this instance
    pub async fn steps(&self) -> Vec<String> {
        let mut steps: Vec<String> = self.live.read().await.keys().cloned().collect();
        steps.sort();
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::{FileStore, MemoryStore};
    use serde_json::json;
    use tempfile::TempDir;

    fn dataset(n: i64) -> Dataset {
        Dataset::from_rows(["n"], vec![vec![json!(n)]]).unwrap()
    }

    #[tokio::test]
    async fn test_save_overwrites_live_entry() {
        let store = CheckpointStore::new("p", Arc::new(MemoryStore::new()));

        let first = store.save("scale", &dataset(1)).await.unwrap();
        assert!(first.starts_with("p/scale/"));
        store.save("scale", &dataset(2)).await.unwrap();

        let restored = store.restore("scale").await.unwrap().unwrap();
        assert_eq!(restored.dataset, dataset(2));
        assert_eq!(store.steps().await, vec!["scale"]);
        assert!(store.restore("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repeated_saves_keep_one_backend_key() {
        let backend = Arc::new(MemoryStore::new());
        let store = CheckpointStore::new("p", backend.clone());

        for n in 0..5 {
            store.save("scale", &dataset(n)).await.unwrap();
        }
        store.save("other", &dataset(9)).await.unwrap();

        let keys = backend.keys("p/scale/").await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(Some(keys[0].clone()), store.latest_key("scale").await.unwrap());
        assert_eq!(backend.len().await, 2);
    }

    #[tokio::test]
    async fn test_stale_keys_from_earlier_instance_are_pruned() {
        let backend = Arc::new(MemoryStore::new());
        backend
            .put("p/scale/20200101T000000.000000Z", &Snapshot::new(dataset(0)))
            .await
            .unwrap();
        backend
            .put("p/scale/20200102T000000.000000Z", &Snapshot::new(dataset(1)))
            .await
            .unwrap();

        let store = CheckpointStore::new("p", backend.clone());
        let key = store.save("scale", &dataset(2)).await.unwrap();
        assert_eq!(backend.keys("p/scale/").await.unwrap(), vec![key]);
    }

    #[tokio::test]
    async fn test_nested_keys_do_not_leak_into_step() {
        let backend = Arc::new(MemoryStore::new());
        backend
            .put("p/a/b/20300101T000000.000000Z", &Snapshot::new(dataset(7)))
            .await
            .unwrap();

        let store = CheckpointStore::new("p", backend.clone());
        assert!(store.restore("a").await.unwrap().is_none());

        store.save("a", &dataset(1)).await.unwrap();
        assert_eq!(backend.len().await, 2);

        let reader = CheckpointStore::new("p", backend);
        assert_eq!(reader.restore("a").await.unwrap().unwrap().dataset, dataset(1));
    }

    #[tokio::test]
    async fn test_restore_from_fresh_instance() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(FileStore::open(temp.path()).await.unwrap());

        let writer = CheckpointStore::new("p", backend.clone());
        writer.save("scale", &dataset(1)).await.unwrap();
        writer.save("scale", &dataset(2)).await.unwrap();

        let reader = CheckpointStore::new("p", backend.clone());
        let restored = reader.restore("scale").await.unwrap().unwrap();
        assert_eq!(restored.dataset, dataset(2));
        assert_eq!(backend.keys("p/scale/").await.unwrap().len(), 1);
    }
}
