//! Validator dispatch: a closed set of scoring policies.
//!
//! A stage declares one [`ValidatorSpec`] per variant in its definition. At
//! pipeline compile time each spec becomes a [`Validator`], which precomputes
//! whatever it can (token ground truth, answer-key maps). Scoring is pure: it
//! reads the session's conditions through [`ScoreContext`] and the submitted
//! answers, and returns a [`Scored`] pass/fail with a structured [`Verdict`].
//!
//! Malformed answer shapes are reported as [`CohortError::InvalidAnswers`],
//! never as a failing verdict.

pub mod attention;
pub mod exact_match;
pub mod scale;
pub mod selection_overlap;
pub mod text;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use cohort_types::{CohortError, Result};

pub use attention::{AttentionCheck, AttentionChecks, AttentionChecksSpec, AttentionVerdict, CheckResult};
pub use exact_match::{ExactMatch, ExactMatchSpec, ExactMatchVerdict, KeyEntry};
pub use scale::{
    CheckPolicy, ScaleBounds, ScaleCheck, ScaleComparison, ScaleCompleteness, ScaleSpec, ScaleVerdict,
    Subscale,
};
pub use selection_overlap::{ItemScore, Material, OverlapVerdict, SelectionOverlap, SelectionOverlapSpec};

/// Validator configuration as written in a pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidatorSpec {
    SelectionOverlap(SelectionOverlapSpec),
    ExactMatch(ExactMatchSpec),
    ScaleCompleteness(ScaleSpec),
    AttentionChecks(AttentionChecksSpec),
}

impl ValidatorSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            ValidatorSpec::SelectionOverlap(_) => "selection_overlap",
            ValidatorSpec::ExactMatch(_) => "exact_match",
            ValidatorSpec::ScaleCompleteness(_) => "scale_completeness",
            ValidatorSpec::AttentionChecks(_) => "attention_checks",
        }
    }

    /// The condition factor this validator reads, if any.
    pub fn factor(&self) -> Option<&str> {
        match self {
            ValidatorSpec::SelectionOverlap(s) => Some(&s.factor),
            ValidatorSpec::ExactMatch(s) => Some(&s.factor),
            ValidatorSpec::ScaleCompleteness(s) => s.comparison.as_ref().map(|c| c.factor.as_str()),
            ValidatorSpec::AttentionChecks(_) => None,
        }
    }

    /// Factor values this validator carries per-value configuration for.
    pub fn keyed_values(&self) -> Vec<&str> {
        match self {
            ValidatorSpec::SelectionOverlap(s) => s.materials.keys().map(String::as_str).collect(),
            ValidatorSpec::ExactMatch(s) => s.keys.keys().map(String::as_str).collect(),
            ValidatorSpec::ScaleCompleteness(s) => s
                .comparison
                .as_ref()
                .map(|c| c.dominant.keys().map(String::as_str).collect())
                .unwrap_or_default(),
            ValidatorSpec::AttentionChecks(_) => Vec::new(),
        }
    }
}

/// Compiled, ready-to-score validator.
#[derive(Debug, Clone)]
pub enum Validator {
    SelectionOverlap(SelectionOverlap),
    ExactMatch(ExactMatch),
    ScaleCompleteness(ScaleCompleteness),
    AttentionChecks(AttentionChecks),
}

impl Validator {
    pub fn compile(spec: &ValidatorSpec) -> Result<Self> {
        Ok(match spec {
            ValidatorSpec::SelectionOverlap(s) => Validator::SelectionOverlap(SelectionOverlap::compile(s)?),
            ValidatorSpec::ExactMatch(s) => Validator::ExactMatch(ExactMatch::compile(s)?),
            ValidatorSpec::ScaleCompleteness(s) => Validator::ScaleCompleteness(ScaleCompleteness::compile(s)?),
            ValidatorSpec::AttentionChecks(s) => Validator::AttentionChecks(AttentionChecks::compile(s)?),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Validator::SelectionOverlap(_) => "selection_overlap",
            Validator::ExactMatch(_) => "exact_match",
            Validator::ScaleCompleteness(_) => "scale_completeness",
            Validator::AttentionChecks(_) => "attention_checks",
        }
    }

    pub fn score(&self, ctx: &ScoreContext<'_>, answers: &Value) -> Result<Scored> {
        match self {
            Validator::SelectionOverlap(v) => v.score(ctx, answers),
            Validator::ExactMatch(v) => v.score(ctx, answers),
            Validator::ScaleCompleteness(v) => v.score(ctx, answers),
            Validator::AttentionChecks(v) => v.score(answers),
        }
    }
}

/// Read-only view of the session a validator scores against.
#[derive(Debug, Clone, Copy)]
pub struct ScoreContext<'a> {
    pub stage_id: &'a str,
    pub variant: &'a str,
    pub conditions: &'a BTreeMap<String, String>,
}

impl<'a> ScoreContext<'a> {
    /// The session's value for `factor`; a missing value is a configuration error.
    pub fn condition(&self, factor: &str) -> Result<&'a str> {
        self.conditions
            .get(factor)
            .map(String::as_str)
            .ok_or_else(|| {
                CohortError::Configuration(format!(
                    "stage '{}' variant '{}' needs condition '{factor}', which is not assigned",
                    self.stage_id, self.variant
                ))
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    pub passed: bool,
    pub verdict: Verdict,
}

/// Structured rationale, tagged with the validator kind that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    SelectionOverlap(OverlapVerdict),
    ExactMatch(ExactMatchVerdict),
    ScaleCompleteness(ScaleVerdict),
    AttentionChecks(AttentionVerdict),
}

impl Verdict {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub(crate) fn invalid(validator: &str, message: impl Into<String>) -> CohortError {
    CohortError::InvalidAnswers {
        validator: validator.to_owned(),
        message: message.into(),
    }
}

/// Item ids may arrive as strings or numbers; both compare as strings.
pub(crate) fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spec_kind_tag_round_trips() {
        let spec: ValidatorSpec = serde_json::from_value(json!({
            "kind": "attention_checks",
            "checks": [{"key": "q1", "expected": 3}]
        }))
        .unwrap();
        assert_eq!(spec.kind(), "attention_checks");
        assert!(spec.factor().is_none());
        let back = serde_json::to_value(&spec).unwrap();
        assert_eq!(back["kind"], "attention_checks");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = serde_json::from_value::<ValidatorSpec>(json!({"kind": "stage1_magic"}));
        assert!(err.is_err());
    }

    #[test]
    fn context_reports_missing_condition() {
        let conditions = BTreeMap::new();
        let ctx = ScoreContext {
            stage_id: "stage_1",
            variant: "scramble",
            conditions: &conditions,
        };
        let err = ctx.condition("iv1").unwrap_err();
        assert!(matches!(err, CohortError::Configuration(_)));
        assert!(err.to_string().contains("iv1"));
    }

    #[test]
    fn verdict_json_carries_kind() {
        let v = Verdict::AttentionChecks(AttentionVerdict { results: vec![] });
        assert_eq!(v.to_json()["kind"], "attention_checks");
    }

    #[test]
    fn ids_accept_strings_and_numbers() {
        assert_eq!(id_string(&json!(1)).as_deref(), Some("1"));
        assert_eq!(id_string(&json!("s1")).as_deref(), Some("s1"));
        assert_eq!(id_string(&json!(null)), None);
    }
}
