//! Validation rule sets and quality scoring.
//!
//! Rules are severity-tagged predicates evaluated against the working
//! dataset at the `input` and `output` stages. Each pass yields a quality
//! score; a failed critical rule aborts the run regardless of the
//! error-handling mode.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{Dataset, MAX_QUALITY_SCORE};

/// Penalty per failed critical rule
pub const CRITICAL_PENALTY: u32 = 30;
/// Penalty per failed major rule
pub const MAJOR_PENALTY: u32 = 10;
/// Penalty per failed minor rule
pub const MINOR_PENALTY: u32 = 3;

/// Point in the run at which rules are evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Input,
    Output,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Input => "input",
            Self::Output => "output",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Aborts the run
    Critical,
    Major,
    Minor,
}

impl Severity {
    pub fn penalty(self) -> u32 {
        match self {
            Self::Critical => CRITICAL_PENALTY,
            Self::Major => MAJOR_PENALTY,
            Self::Minor => MINOR_PENALTY,
        }
    }
}

/// Result of checking one rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutcome {
    pub passed: bool,
    pub message: String,
    pub affected_records: usize,
}

impl RuleOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            message: String::new(),
            affected_records: 0,
        }
    }

    pub fn fail(message: impl Into<String>, affected_records: usize) -> Self {
        Self {
            passed: false,
            message: message.into(),
            affected_records,
        }
    }
}

pub type RuleFn = Arc<dyn Fn(&Dataset) -> anyhow::Result<RuleOutcome> + Send + Sync>;

/// A named predicate over a dataset
#[derive(Clone)]
pub struct ValidationRule {
    pub name: String,
    pub severity: Severity,

    /// Restrict to one stage; `None` runs at both
    pub stage: Option<Stage>,

    check: RuleFn,
}

impl ValidationRule {
    pub fn new<F>(name: impl Into<String>, severity: Severity, check: F) -> Self
    where
        F: Fn(&Dataset) -> anyhow::Result<RuleOutcome> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            severity,
            stage: None,
            check: Arc::new(check),
        }
    }

    pub fn at_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn applies_to(&self, stage: Stage) -> bool {
        self.stage.map_or(true, |s| s == stage)
    }

    pub fn check(&self, dataset: &Dataset) -> anyhow::Result<RuleOutcome> {
        (self.check)(dataset)
    }
}

impl fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationRule")
            .field("name", &self.name)
            .field("severity", &self.severity)
            .field("stage", &self.stage)
            .finish()
    }
}

/// A rule that failed or could not be evaluated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityIssue {
    pub rule: String,
    pub stage: Stage,
    pub severity: Severity,
    pub message: String,
    pub affected_records: usize,

    /// The rule itself raised an error; not counted in the score
    #[serde(default)]
    pub errored: bool,
}

/// Outcome of one evaluation pass
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub stage: Stage,
    pub rules_evaluated: usize,
    pub issues: Vec<QualityIssue>,
    pub score: f64,
}

impl ValidationReport {
    /// First failed critical rule, if any
    pub fn critical_failure(&self) -> Option<&QualityIssue> {
        self.issues
            .iter()
            .find(|i| !i.errored && i.severity == Severity::Critical)
    }

    /// Rows flagged by failed (non-errored) rules
    pub fn affected_records(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| !i.errored)
            .map(|i| i.affected_records)
            .sum()
    }
}

/// `max(0, 100 - sum of penalties)` over failed, non-errored issues
pub fn quality_score(issues: &[QualityIssue]) -> f64 {
    let penalty: u32 = issues
        .iter()
        .filter(|i| !i.errored)
        .map(|i| i.severity.penalty())
        .sum();
    (MAX_QUALITY_SCORE - f64::from(penalty)).max(0.0)
}

/// Baseline rules plus caller-supplied rules
#[derive(Debug, Clone)]
pub struct ValidationRuleSet {
    rules: Vec<ValidationRule>,
}

impl Default for ValidationRuleSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationRuleSet {
    /// A rule set holding only the baseline rules
    pub fn new() -> Self {
        Self {
            rules: vec![not_empty_rule(), no_duplicates_rule()],
        }
    }

    pub fn add_rule(&mut self, rule: ValidationRule) {
        self.rules.push(rule);
    }

    pub fn with_rule(mut self, rule: ValidationRule) -> Self {
        self.add_rule(rule);
        self
    }

    pub fn rules(&self) -> &[ValidationRule] {
        &self.rules
    }

    /// Evaluate every rule applying to `stage`
    pub fn evaluate(&self, dataset: &Dataset, stage: Stage) -> ValidationReport {
        let mut issues = Vec::new();
        let mut rules_evaluated = 0;

        for rule in self.rules.iter().filter(|r| r.applies_to(stage)) {
            rules_evaluated += 1;

            match rule.check(dataset) {
                Ok(outcome) if outcome.passed => {
                    debug!(rule = %rule.name, %stage, "Validation rule passed");
                }
                Ok(outcome) => {
                    warn!(
                        rule = %rule.name,
                        %stage,
                        severity = ?rule.severity,
                        affected = outcome.affected_records,
                        message = %outcome.message,
                        "Validation rule failed"
                    );
                    issues.push(QualityIssue {
                        rule: rule.name.clone(),
                        stage,
                        severity: rule.severity,
                        message: outcome.message,
                        affected_records: outcome.affected_records,
                        errored: false,
                    });
                }
                Err(e) => {
                    warn!(rule = %rule.name, %stage, error = %e, "Validation rule errored");
                    issues.push(QualityIssue {
                        rule: rule.name.clone(),
                        stage,
                        severity: rule.severity,
                        message: format!("{:#}", e),
                        affected_records: 0,
                        errored: true,
                    });
                }
            }
        }

        let score = quality_score(&issues);
        ValidationReport {
            stage,
            rules_evaluated,
            issues,
            score,
        }
    }
}

fn not_empty_rule() -> ValidationRule {
    ValidationRule::new("not_empty", Severity::Critical, |dataset| {
        Ok(if dataset.is_empty() {
            RuleOutcome::fail("Dataset is empty", 0)
        } else {
            RuleOutcome::pass()
        })
    })
}

fn no_duplicates_rule() -> ValidationRule {
    ValidationRule::new("no_duplicates", Severity::Major, |dataset| {
        let duplicates = dataset.duplicate_count();
        Ok(if duplicates == 0 {
            RuleOutcome::pass()
        } else {
            RuleOutcome::fail(format!("{} duplicate rows detected", duplicates), duplicates)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(values: &[i64]) -> Dataset {
        Dataset::from_rows(["id"], values.iter().map(|v| vec![json!(v)]).collect()).unwrap()
    }

    #[test]
    fn test_clean_dataset_scores_100() {
        let report = ValidationRuleSet::new().evaluate(&rows(&[1, 2, 3]), Stage::Input);

        assert_eq!(report.rules_evaluated, 2);
        assert!(report.issues.is_empty());
        assert_eq!(report.score, 100.0);
        assert!(report.critical_failure().is_none());
    }

    #[test]
    fn test_duplicates_cost_major_penalty() {
        let report = ValidationRuleSet::new().evaluate(&rows(&[1, 1, 2, 2]), Stage::Output);

        assert_eq!(report.score, 90.0);
        assert_eq!(report.issues[0].rule, "no_duplicates");
        assert_eq!(report.issues[0].affected_records, 2);
        assert!(report.critical_failure().is_none());
    }

    #[test]
    fn test_empty_dataset_is_critical() {
        let report = ValidationRuleSet::new().evaluate(&Dataset::new(["id"]), Stage::Input);

        assert_eq!(report.score, 70.0);
        assert_eq!(report.critical_failure().unwrap().rule, "not_empty");
    }

    #[test]
    fn test_stage_filter_and_errored_rules() {
        let set = ValidationRuleSet::new()
            .with_rule(
                ValidationRule::new("output_only", Severity::Minor, |_| {
                    Ok(RuleOutcome::fail("always", 1))
                })
                .at_stage(Stage::Output),
            )
            .with_rule(ValidationRule::new("broken", Severity::Critical, |_| {
                anyhow::bail!("column type unknown")
            }));

        let input = set.evaluate(&rows(&[1]), Stage::Input);
        assert_eq!(input.rules_evaluated, 3);
        assert_eq!(input.issues.len(), 1);
        assert!(input.issues[0].errored);
        assert_eq!(input.score, 100.0);
        assert!(input.critical_failure().is_none());

        let output = set.evaluate(&rows(&[1]), Stage::Output);
        assert_eq!(output.rules_evaluated, 4);
        assert_eq!(output.score, 97.0);
    }

    #[test]
    fn test_score_floor_is_zero() {
        let issue = QualityIssue {
            rule: "r".into(),
            stage: Stage::Input,
            severity: Severity::Critical,
            message: String::new(),
            affected_records: 0,
            errored: false,
        };
        let issues = vec![issue; 4];
        assert_eq!(quality_score(&issues), 0.0);
    }
}
