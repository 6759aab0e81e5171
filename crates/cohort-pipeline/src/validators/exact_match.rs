//! Accuracy against a fixed answer key, per condition value.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use cohort_types::{CohortError, Result};

use super::text::round_to;
use super::{id_string, invalid, ScoreContext, Scored, Verdict};

const KIND: &str = "exact_match";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEntry {
    /// Item id; numbers are accepted and compared as strings.
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExactMatchSpec {
    pub factor: String,
    pub threshold_percent: f64,
    pub keys: BTreeMap<String, Vec<KeyEntry>>,
}

#[derive(Debug, Clone)]
pub struct ExactMatch {
    factor: String,
    threshold_percent: f64,
    keys: BTreeMap<String, HashMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExactMatchVerdict {
    pub factor: String,
    pub value: String,
    pub total: usize,
    pub correct: usize,
    pub accuracy: f64,
    pub threshold: f64,
}

impl ExactMatch {
    pub fn compile(spec: &ExactMatchSpec) -> Result<Self> {
        if !spec.threshold_percent.is_finite() {
            return Err(CohortError::Configuration(
                "exact_match threshold_percent must be a finite number".into(),
            ));
        }
        let keys = spec
            .keys
            .iter()
            .map(|(value, entries)| {
                let map = entries
                    .iter()
                    .map(|e| (e.id.clone(), e.answer.trim().to_lowercase()))
                    .collect();
                (value.clone(), map)
            })
            .collect();
        Ok(Self {
            factor: spec.factor.clone(),
            threshold_percent: spec.threshold_percent,
            keys,
        })
    }

    pub fn score(&self, ctx: &ScoreContext<'_>, answers: &Value) -> Result<Scored> {
        let value = ctx.condition(&self.factor)?;
        let key = self.keys.get(value).ok_or_else(|| {
            CohortError::Configuration(format!(
                "exact_match has no answer key for {}={value}",
                self.factor
            ))
        })?;

        let responses = answers
            .get("responses")
            .and_then(Value::as_array)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| invalid(KIND, "responses must be a non-empty array"))?;

        let correct = responses
            .iter()
            .filter(|r| {
                let Some(expected) = r.get("id").and_then(id_string).and_then(|id| key.get(&id)) else {
                    return false;
                };
                let given = match r.get("answer") {
                    Some(Value::String(s)) => s.trim().to_lowercase(),
                    Some(Value::Number(n)) => n.to_string(),
                    _ => String::new(),
                };
                &given == expected
            })
            .count();

        let total = responses.len();
        let accuracy = round_to(correct as f64 / total as f64 * 100.0, 2);

        Ok(Scored {
            passed: accuracy >= self.threshold_percent,
            verdict: Verdict::ExactMatch(ExactMatchVerdict {
                factor: self.factor.clone(),
                value: value.to_owned(),
                total,
                correct,
                accuracy,
                threshold: self.threshold_percent,
            }),
        })
    }
}

fn de_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    id_string(&raw).ok_or_else(|| serde::de::Error::custom("id must be a string or number"))
}
