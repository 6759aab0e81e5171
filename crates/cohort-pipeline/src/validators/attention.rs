//! Key-by-key equality checks against known responses.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use cohort_types::{CohortError, Result};

use super::{invalid, Scored, Verdict};

const KIND: &str = "attention_checks";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionCheck {
    pub key: String,
    pub expected: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionChecksSpec {
    #[serde(default)]
    pub checks: Vec<AttentionCheck>,
}

#[derive(Debug, Clone)]
pub struct AttentionChecks {
    checks: Vec<AttentionCheck>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub key: String,
    pub expected: Value,
    pub actual: Value,
    pub is_correct: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionVerdict {
    pub results: Vec<CheckResult>,
}

impl AttentionChecks {
    pub fn compile(spec: &AttentionChecksSpec) -> Result<Self> {
        if spec.checks.is_empty() {
            return Err(CohortError::Configuration(
                "attention_checks validator has no checks".into(),
            ));
        }
        Ok(Self {
            checks: spec.checks.clone(),
        })
    }

    pub fn score(&self, answers: &Value) -> Result<Scored> {
        let answers = answers
            .as_object()
            .ok_or_else(|| invalid(KIND, "answers must be an object"))?;

        let results: Vec<CheckResult> = self
            .checks
            .iter()
            .map(|check| {
                let actual = answers.get(&check.key).cloned().unwrap_or(Value::Null);
                let is_correct = answers.contains_key(&check.key) && actual == check.expected;
                CheckResult {
                    key: check.key.clone(),
                    expected: check.expected.clone(),
                    actual,
                    is_correct,
                }
            })
            .collect();

        Ok(Scored {
            passed: results.iter().all(|r| r.is_correct),
            verdict: Verdict::AttentionChecks(AttentionVerdict { results }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn checks() -> AttentionChecks {
        AttentionChecks::compile(&AttentionChecksSpec {
            checks: vec![
                AttentionCheck { key: "q1".into(), expected: json!(3) },
                AttentionCheck { key: "q2".into(), expected: json!(["a", "b"]) },
            ],
        })
        .unwrap()
    }

    #[test]
    fn all_checks_correct_passes() {
        let scored = checks().score(&json!({"q1": 3, "q2": ["a", "b"], "extra": 1})).unwrap();
        assert!(scored.passed);
    }

    #[test]
    fn wrong_or_missing_key_fails() {
        let scored = checks().score(&json!({"q1": 3})).unwrap();
        assert!(!scored.passed);
        let Verdict::AttentionChecks(v) = scored.verdict else { panic!("wrong verdict kind") };
        assert!(v.results[0].is_correct);
        assert!(!v.results[1].is_correct);
        assert_eq!(v.results[1].actual, Value::Null);

        assert!(!checks().score(&json!({"q1": "3", "q2": ["a", "b"]})).unwrap().passed);
    }

    #[test]
    fn empty_check_list_is_configuration_error() {
        let err = AttentionChecks::compile(&AttentionChecksSpec { checks: vec![] }).unwrap_err();
        assert!(matches!(err, CohortError::Configuration(_)));
    }

    #[test]
    fn non_object_answers_are_invalid() {
        let err = checks().score(&json!([1, 2])).unwrap_err();
        assert!(matches!(err, CohortError::InvalidAnswers { .. }));
    }
}
