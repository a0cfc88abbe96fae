//! Keyed snapshot storage shared by the extraction cache and checkpoints.
//!
//! Stores only need per-key get/put atomicity. Keys are `/`-separated
//! composites such as `{pipeline}/{source}` or `{pipeline}/{step}/{timestamp}`.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use crate::domain::Dataset;

/// A stored dataset and when it was taken
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub dataset: Dataset,
    pub created_at: DateTime<Utc>,

    /// Digest of whatever produced the dataset; a mismatch invalidates it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl Snapshot {
    pub fn new(dataset: Dataset) -> Self {
        Self {
            dataset,
            created_at: Utc::now(),
            fingerprint: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }
}

/// Trait for snapshot backends
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Store a snapshot, replacing any previous value for the key
    async fn put(&self, key: &str, snapshot: &Snapshot) -> Result<()>;

    /// Load a snapshot if present
    async fn get(&self, key: &str) -> Result<Option<Snapshot>>;

    /// All keys starting with `prefix`, sorted
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete a key; missing keys are not an error
    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-process store, owned by one orchestrator
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Snapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, key: &str, snapshot: &Snapshot) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), snapshot.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Snapshot>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// One JSON file per key under a root directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

const SNAPSHOT_EXT: &str = "json";

impl FileStore {
    /// Create the root directory if needed
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create store directory: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key to a file path, rejecting traversal
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            anyhow::bail!("Invalid snapshot key: '{}'", key);
        }

        let mut path = self.root.join(relative);
        let file_name = format!(
            "{}.{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or_default(),
            SNAPSHOT_EXT
        );
        path.set_file_name(file_name);
        Ok(path)
    }
}

#[async_trait]
impl SnapshotStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn put(&self, key: &str, snapshot: &Snapshot) -> Result<()> {
        let path = self.path_for(key)?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        let bytes = serde_json::to_vec(snapshot).context("Failed to serialize snapshot")?;

        // Write to a temp file in the same directory, then rename into place
        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)
                .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
            tmp.write_all(&bytes).context("Failed to write snapshot")?;
            tmp.persist(&path)
                .with_context(|| format!("Failed to persist snapshot: {}", path.display()))?;
            Ok(())
        })
        .await
        .context("Snapshot writer task panicked")?
    }

    async fn get(&self, key: &str) -> Result<Option<Snapshot>> {
        let path = self.path_for(key)?;
        if !path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("Failed to read snapshot: {}", path.display()))?;
        let snapshot = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse snapshot: {}", path.display()))?;
        Ok(Some(snapshot))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).context(format!("Failed to list {}", dir.display())),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXT) {
                    continue;
                }
                if let Some(key) = key_from_path(&self.root, &path) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(format!("Failed to remove snapshot: {}", path.display())),
        }
    }
}

fn key_from_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?.with_extension("");
    let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample() -> Snapshot {
        Snapshot::new(Dataset::from_rows(["id"], vec![vec![json!(1)], vec![json!(2)]]).unwrap())
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        store.put("p/a", &sample()).await.unwrap();
        store.put("p/b", &sample()).await.unwrap();
        store.put("q/a", &sample()).await.unwrap();

        let loaded = store.get("p/a").await.unwrap().unwrap();
        assert_eq!(loaded.dataset, sample().dataset);
        assert!(store.get("missing").await.unwrap().is_none());
        assert_eq!(store.keys("p/").await.unwrap(), vec!["p/a", "p/b"]);

        store.remove("p/a").await.unwrap();
        store.remove("p/a").await.unwrap();
        assert_eq!(store.keys("p/").await.unwrap(), vec!["p/b"]);
    }

    #[tokio::test]
    async fn test_file_store_nested_keys() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::open(temp.path()).await.unwrap();
        let snapshot = sample();

        store.put("loans/scale/20240101T000000", &snapshot).await.unwrap();
        store.put("loans/scale/20240102T000000", &snapshot).await.unwrap();
        store.put("loans/source", &snapshot).await.unwrap();

        let loaded = store.get("loans/scale/20240101T000000").await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);

        let keys = store.keys("loans/scale/").await.unwrap();
        assert_eq!(
            keys,
            vec!["loans/scale/20240101T000000", "loans/scale/20240102T000000"]
        );
        assert!(temp.path().join("loans/source.json").exists());

        store.remove("loans/scale/20240101T000000").await.unwrap();
        store.remove("loans/scale/20240101T000000").await.unwrap();
        assert_eq!(
            store.keys("loans/scale/").await.unwrap(),
            vec!["loans/scale/20240102T000000"]
        );
    }

    #[tokio::test]
    async fn test_snapshot_without_fingerprint_still_loads() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::open(temp.path()).await.unwrap();
        store.put("p/plain", &sample()).await.unwrap();
        store
            .put("p/tagged", &sample().with_fingerprint("abc"))
            .await
            .unwrap();

        let raw = std::fs::read_to_string(temp.path().join("p/plain.json")).unwrap();
        assert!(!raw.contains("fingerprint"));
        assert!(store.get("p/plain").await.unwrap().unwrap().fingerprint.is_none());
        assert_eq!(
            store.get("p/tagged").await.unwrap().unwrap().fingerprint.as_deref(),
            Some("abc")
        );
    }

    #[tokio::test]
    async fn test_file_store_rejects_traversal() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::open(temp.path()).await.unwrap();

        assert!(store.put("../escape", &sample()).await.is_err());
        assert!(store.put("/abs", &sample()).await.is_err());
        assert!(store.get("").await.is_err());
        assert!(store.remove("a/../../escape").await.is_err());
    }
}
