//! File Pipeline Integration Tests
//!
//! YAML-declared pipelines reading JSON lines from disk, applying sector
//! profiles, writing file sinks and recording run event logs.

use std::path::Path;

use serde_json::Value;
use tempfile::TempDir;

use sectorflow::core::{ConfigOverrides, EventStore, PipelineDefinition};
use sectorflow::domain::{EventType, PipelineStatus};
use sectorflow::PipelineError;

const LOANS: &str = r#"
name: loans
sector: banque
config:
  error_handling: fail
sources:
  - name: accounts
    format: jsonl
    location: data/accounts-*.jsonl
steps:
  - name: double_amount
    transform: scale_column
    order: 20
    params: { column: amount, factor: 2 }
sinks:
  - name: report
    kind: file
    params: { path: out/report.json }
"#;

const ACCOUNTS_1: &str = r#"{"account_number": "FR7612345678", "customer_id": "C1", "amount": 100, "loan_amount": 5000, "loan_status": "current"}
{"account_number": "FR7687654321", "customer_id": "C2", "amount": 250, "loan_amount": 12000, "loan_status": "default"}
"#;

const ACCOUNTS_2: &str = r#"{"account_number": "FR7600001111", "customer_id": "C3", "amount": 75, "loan_amount": 800, "loan_status": "overdue"}
"#;

fn write(root: &Path, relative: &str, content: &str) -> std::path::PathBuf {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, content).unwrap();
    path
}

fn loans_workspace() -> (TempDir, std::path::PathBuf) {
    let temp = TempDir::new().unwrap();
    write(temp.path(), "data/accounts-1.jsonl", ACCOUNTS_1);
    write(temp.path(), "data/accounts-2.jsonl", ACCOUNTS_2);
    let definition = write(temp.path(), "loans.yaml", LOANS);
    (temp, definition)
}

fn read_report(path: &Path) -> Vec<Value> {
    let content = std::fs::read_to_string(path).unwrap();
    serde_json::from_str(&content).unwrap()
}

#[tokio::test]
async fn test_banking_pipeline_end_to_end() {
    let (temp, definition) = loans_workspace();

    let mut pipeline = PipelineDefinition::from_file(&definition)
        .unwrap()
        .into_builder(&ConfigOverrides::default())
        .unwrap()
        .build()
        .unwrap();

    let metrics = pipeline.run().await.unwrap();

    assert_eq!(metrics.status, PipelineStatus::Completed);
    assert_eq!(metrics.records_processed, 3);
    assert_eq!(
        metrics.steps_completed,
        vec!["anonymize_pii", "calculate_risk_metrics", "double_amount"]
    );
    assert_eq!(metrics.sinks_loaded, vec!["report"]);
    assert_eq!(metrics.data_quality_score, 100.0);

    let report = read_report(&temp.path().join("out/report.json"));
    assert_eq!(report.len(), 3);

    assert_eq!(report[0]["account_number"], "****5678");
    assert_eq!(report[2]["account_number"], "****1111");
    assert_eq!(report[0]["customer_id"].as_str().unwrap().len(), 12);
    assert_ne!(report[0]["customer_id"], report[1]["customer_id"]);

    let npl: Vec<&Value> = report.iter().map(|r| &r["is_npl"]).collect();
    assert_eq!(npl, vec![&Value::Bool(false), &Value::Bool(true), &Value::Bool(true)]);

    let amounts: Vec<i64> = report.iter().map(|r| r["amount"].as_i64().unwrap()).collect();
    assert_eq!(amounts, vec![200, 500, 150]);
}

#[tokio::test]
async fn test_defaults_apply_under_definition_overrides() {
    let (_temp, definition) = loans_workspace();
    let defaults = ConfigOverrides {
        max_workers: Some(2),
        error_handling: Some(sectorflow::core::ErrorHandling::Skip),
        ..Default::default()
    };

    let pipeline = PipelineDefinition::from_file(&definition)
        .unwrap()
        .into_builder(&defaults)
        .unwrap()
        .build()
        .unwrap();

    assert_eq!(pipeline.config().max_workers, 2);
    assert_eq!(
        pipeline.config().error_handling,
        sectorflow::core::ErrorHandling::Fail
    );
}

#[tokio::test]
async fn test_event_log_records_run() {
    let (temp, definition) = loans_workspace();
    let runs_dir = temp.path().join("runs");

    let mut pipeline = PipelineDefinition::from_file(&definition)
        .unwrap()
        .into_builder(&ConfigOverrides::default())
        .unwrap()
        .with_event_store(&runs_dir)
        .build()
        .unwrap();

    let metrics = pipeline.run().await.unwrap();

    let runs = EventStore::list_runs(&runs_dir).await.unwrap();
    assert_eq!(runs, vec![metrics.run_id]);

    let store = EventStore::open_run(&runs_dir, metrics.run_id).await.unwrap();
    let events = store.replay().await.unwrap();
    let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();

    assert_eq!(types.first(), Some(&EventType::RunStarted));
    assert_eq!(types.last(), Some(&EventType::RunCompleted));
    assert_eq!(types.iter().filter(|t| **t == EventType::StepCompleted).count(), 3);
    assert_eq!(types.iter().filter(|t| **t == EventType::ValidationEvaluated).count(), 2);
    assert!(types.contains(&EventType::SourceExtracted));
    assert!(types.contains(&EventType::SinkLoaded));
    assert!(events.iter().all(|e| e.run_id == metrics.run_id));

    let summary = store.read_summary().await.unwrap().unwrap();
    assert_eq!(summary.status, PipelineStatus::Completed);
    assert_eq!(summary.records_processed, 3);

    // Second run is served from cache and gets its own log
    let second = pipeline.run().await.unwrap();
    let store = EventStore::open_run(&runs_dir, second.run_id).await.unwrap();
    let cached = store
        .last_event_of_type(EventType::CacheHit)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.unit.as_deref(), Some("accounts"));
    assert_eq!(EventStore::list_runs(&runs_dir).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_monitoring_disabled_writes_no_log() {
    let (temp, definition) = loans_workspace();
    let runs_dir = temp.path().join("runs");

    let mut pipeline = PipelineDefinition::from_file(&definition)
        .unwrap()
        .into_builder(&ConfigOverrides::default())
        .unwrap()
        .configure(|c| c.monitoring_enabled = false)
        .with_event_store(&runs_dir)
        .build()
        .unwrap();

    pipeline.run().await.unwrap();
    assert!(EventStore::list_runs(&runs_dir).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_healthcare_pipeline_rejects_blank_patient_ids() {
    let temp = TempDir::new().unwrap();
    write(
        temp.path(),
        "patients.json",
        r#"[
  {"patient_id": "P1", "patient_name": "Ada", "ssn": "123", "diagnosis_code": "J45.9"},
  {"patient_id": " ", "patient_name": "Bob", "ssn": "456", "diagnosis_code": "E11"}
]"#,
    );
    let definition = write(
        temp.path(),
        "patients.yaml",
        r#"
name: patients
sector: sante
sources:
  - name: patients
    format: json
    location: patients.json
sinks:
  - name: export
    kind: file
    params: { path: out/patients.jsonl, format: jsonl }
"#,
    );

    let mut pipeline = PipelineDefinition::from_file(&definition)
        .unwrap()
        .into_builder(&ConfigOverrides::default())
        .unwrap()
        .build()
        .unwrap();

    let err = pipeline.run().await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::CriticalValidation { ref rule, .. } if rule == "patient_id_format"
    ));
    assert!(!temp.path().join("out/patients.jsonl").exists());
}

#[tokio::test]
async fn test_healthcare_pipeline_drops_identifiers() {
    let temp = TempDir::new().unwrap();
    write(
        temp.path(),
        "patients.json",
        r#"[
  {"patient_id": "P1", "patient_name": "Ada", "ssn": "123", "diagnosis_code": "J45.9"},
  {"patient_id": "P2", "patient_name": "Bob", "ssn": "456", "diagnosis_code": "E11"}
]"#,
    );
    let definition = write(
        temp.path(),
        "patients.yaml",
        r#"
name: patients
sector: healthcare
sources:
  - name: patients
    format: json
    location: patients.json
sinks:
  - name: export
    kind: file
    params: { path: out/patients.jsonl, format: jsonl }
"#,
    );

    let mut pipeline = PipelineDefinition::from_file(&definition)
        .unwrap()
        .into_builder(&ConfigOverrides::default())
        .unwrap()
        .build()
        .unwrap();

    let metrics = pipeline.run().await.unwrap();
    assert_eq!(metrics.steps_completed, vec!["hipaa_compliance"]);

    let content = std::fs::read_to_string(temp.path().join("out/patients.jsonl")).unwrap();
    let rows: Vec<Value> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].get("patient_name").is_none());
    assert!(rows[0].get("ssn").is_none());
    assert_eq!(rows[1]["diagnosis_code"], "E11");
}

#[tokio::test]
async fn test_missing_source_file_fails_run() {
    let temp = TempDir::new().unwrap();
    let definition = write(
        temp.path(),
        "broken.yaml",
        r#"
name: broken
sector: retail
config:
  error_handling: retry
  retry_attempts: 1
sources:
  - name: missing
    format: jsonl
    location: nowhere-*.jsonl
sinks:
  - name: out
    kind: file
    params: { path: out.json }
"#,
    );

    let mut pipeline = PipelineDefinition::from_file(&definition)
        .unwrap()
        .into_builder(&ConfigOverrides::default())
        .unwrap()
        .build()
        .unwrap();

    // Retry exhaustion skips the source; the empty result then fails input validation
    let err = pipeline.run().await.unwrap_err();
    assert!(matches!(err, PipelineError::CriticalValidation { .. }));

    let metrics = pipeline.last_metrics().unwrap();
    assert!(metrics
        .errors
        .iter()
        .any(|e| e.message.contains("No files match")));
}
