//! JSON / JSON-lines file connector.
//!
//! Sources: `location` is a path or a glob; matches are read in sorted order
//! and concatenated. The schema hint projects columns, filters keep rows
//! with equal values. Sinks: `params.path` is written atomically, in
//! `params.format` (`json`, the default, or `jsonl`).

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::Connector;
use crate::core::pipeline::{DataFormat, SinkDescriptor, SourceDescriptor};
use crate::domain::Dataset;

#[derive(Debug, Clone, Default)]
pub struct FileConnector;

impl FileConnector {
    pub fn new() -> Self {
        Self
    }

    /// Expand a location into concrete paths
    fn resolve_paths(location: &str) -> Result<Vec<PathBuf>> {
        if !location.contains(['*', '?', '[']) {
            return Ok(vec![PathBuf::from(location)]);
        }

        let mut paths = glob::glob(location)
            .with_context(|| format!("Invalid glob pattern: {}", location))?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read glob match")?;
        paths.sort();

        if paths.is_empty() {
            anyhow::bail!("No files match '{}'", location);
        }
        Ok(paths)
    }

    async fn read_file(path: &Path, format: DataFormat) -> Result<Dataset> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        match format {
            DataFormat::Json => {
                let value: Value = serde_json::from_str(&content)
                    .with_context(|| format!("Invalid JSON in {}", path.display()))?;
                Dataset::from_json_array(value)
                    .with_context(|| format!("Unexpected JSON shape in {}", path.display()))
            }
            DataFormat::Jsonl => parse_json_lines(&content)
                .with_context(|| format!("Invalid JSON lines in {}", path.display())),
            other => anyhow::bail!("File connector cannot read '{}' sources", other),
        }
    }
}

/// Parse newline-delimited JSON objects, skipping blank lines
pub fn parse_json_lines(content: &str) -> Result<Dataset> {
    let mut records = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line).with_context(|| format!("Line {}", i + 1))? {
            Value::Object(record) => records.push(record),
            _ => anyhow::bail!("Line {} is not a JSON object", i + 1),
        }
    }
    Ok(Dataset::from_records(records))
}

/// Serialize a dataset as a JSON array or JSON lines
pub fn render(data: &Dataset, format: &str) -> Result<Vec<u8>> {
    let records = data.to_records();
    match format {
        "json" => serde_json::to_vec_pretty(&records).context("Failed to serialize dataset"),
        "jsonl" => {
            let mut out = Vec::new();
            for record in &records {
                serde_json::to_writer(&mut out, record).context("Failed to serialize record")?;
                out.push(b'\n');
            }
            Ok(out)
        }
        other => anyhow::bail!("Unsupported file sink format '{}'", other),
    }
}

#[async_trait]
impl Connector for FileConnector {
    fn name(&self) -> &str {
        "file"
    }

    async fn extract(&self, source: &SourceDescriptor) -> Result<Dataset> {
        let paths = Self::resolve_paths(&source.location)?;

        let mut parts = Vec::with_capacity(paths.len());
        for path in &paths {
            parts.push(Self::read_file(path, source.format).await?);
        }
        let mut dataset = Dataset::concat(parts);

        if let Some(columns) = &source.schema {
            dataset = dataset.conform_to(columns);
        }
        if let Some(filters) = &source.filters {
            dataset = dataset
                .filter_eq(filters)
                .with_context(|| format!("Failed to apply filters of source '{}'", source.name))?;
        }

        debug!(
            source = %source.name,
            files = paths.len(),
            rows = dataset.row_count(),
            "Read file source"
        );
        Ok(dataset)
    }

    async fn load(&self, data: &Dataset, sink: &SinkDescriptor) -> Result<()> {
        let path = PathBuf::from(
            sink.param_str("path")
                .with_context(|| format!("Sink '{}' has no 'path' parameter", sink.name))?,
        );
        let bytes = render(data, sink.param_str("format").unwrap_or("json"))?;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)
                .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
            tmp.write_all(&bytes).context("Failed to write sink file")?;
            tmp.persist(&path)
                .with_context(|| format!("Failed to persist {}", path.display()))?;
            Ok(())
        })
        .await
        .context("File sink task panicked")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipeline::SinkKind;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_glob_sources_read_in_order() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("part-2.jsonl"), "{\"id\": 3}\n").unwrap();
        std::fs::write(temp.path().join("part-1.jsonl"), "{\"id\": 1}\n\n{\"id\": 2}\n").unwrap();

        let location = temp.path().join("part-*.jsonl");
        let source = SourceDescriptor::new("parts", DataFormat::Jsonl, location.to_string_lossy());

        let dataset = FileConnector::new().extract(&source).await.unwrap();
        let ids: Vec<i64> = dataset
            .column_values("id")
            .unwrap()
            .filter_map(Value::as_i64)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_schema_and_filters() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("accounts.json");
        std::fs::write(
            &path,
            json!([
                {"id": 1, "status": "open", "noise": true},
                {"id": 2, "status": "closed"}
            ])
            .to_string(),
        )
        .unwrap();

        let mut filters = serde_json::Map::new();
        filters.insert("status".into(), json!("open"));
        let source = SourceDescriptor::new("accounts", DataFormat::Json, path.to_string_lossy())
            .with_schema(["id", "status"])
            .with_filters(filters);

        let dataset = FileConnector::new().extract(&source).await.unwrap();
        assert_eq!(dataset.columns(), &["id", "status"]);
        assert_eq!(dataset.row_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_errors() {
        let source = SourceDescriptor::new("missing", DataFormat::Json, "/nonexistent/x.json");
        assert!(FileConnector::new().extract(&source).await.is_err());
    }

    #[tokio::test]
    async fn test_sink_writes_jsonl() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out/result.jsonl");
        let sink = SinkDescriptor::new("out", SinkKind::File)
            .with_param("path", path.to_string_lossy().to_string())
            .with_param("format", "jsonl");
        let data = Dataset::from_rows(["id"], vec![vec![json!(1)], vec![json!(2)]]).unwrap();

        FileConnector::new().load(&data, &sink).await.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(parse_json_lines(&written).unwrap(), data);
    }

    #[tokio::test]
    async fn test_sink_requires_path() {
        let sink = SinkDescriptor::new("out", SinkKind::File);
        let err = FileConnector::new()
            .load(&Dataset::default(), &sink)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no 'path' parameter"));
    }
}
