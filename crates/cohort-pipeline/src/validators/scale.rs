//! Bounded-scale questionnaire: completeness, attention checks, subscale means.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use cohort_types::{CohortError, Result};

use super::text::round_to;
use super::{id_string, invalid, ScoreContext, Scored, Verdict};

const KIND: &str = "scale_completeness";
/// Upper bound on ids echoed back in a failing verdict.
const MAX_LISTED: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScaleBounds {
    pub min: i64,
    pub max: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscale {
    pub name: String,
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleCheck {
    pub id: String,
    pub expected: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckPolicy {
    /// Any wrong attention check fails the submission.
    #[default]
    AnyWrongFails,
    /// The submission fails only when every attention check is wrong.
    AllWrongFail,
}

/// Which subscale is expected to dominate for each value of a factor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleComparison {
    pub factor: String,
    pub dominant: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleSpec {
    pub scale: ScaleBounds,
    pub subscales: Vec<Subscale>,
    #[serde(default)]
    pub attention_checks: Vec<ScaleCheck>,
    #[serde(default)]
    pub check_policy: CheckPolicy,
    #[serde(default)]
    pub comparison: Option<ScaleComparison>,
}

#[derive(Debug, Clone)]
pub struct ScaleCompleteness {
    spec: ScaleSpec,
    expected: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScaleVerdict {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalid_items: Vec<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wrong_checks: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub means: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dominant_subscale: Option<String>,
    /// `None` when the session's factor value has no dominant subscale.
    #[serde(default)]
    pub dominant_subscale_higher: Option<bool>,
}

impl ScaleCompleteness {
    pub fn compile(spec: &ScaleSpec) -> Result<Self> {
        if spec.scale.min > spec.scale.max {
            return Err(CohortError::Configuration(format!(
                "scale_completeness bounds are inverted ({} > {})",
                spec.scale.min, spec.scale.max
            )));
        }
        if spec.subscales.is_empty() || spec.subscales.iter().any(|s| s.items.is_empty()) {
            return Err(CohortError::Configuration(
                "scale_completeness needs at least one subscale, each with items".into(),
            ));
        }
        let mut expected = BTreeSet::new();
        let ids = spec
            .subscales
            .iter()
            .flat_map(|s| s.items.iter())
            .chain(spec.attention_checks.iter().map(|c| &c.id));
        for id in ids {
            if !expected.insert(id.clone()) {
                return Err(CohortError::Configuration(format!(
                    "scale_completeness item '{id}' is listed more than once"
                )));
            }
        }
        if let Some(cmp) = &spec.comparison {
            for subscale in cmp.dominant.values() {
                if !spec.subscales.iter().any(|s| &s.name == subscale) {
                    return Err(CohortError::Configuration(format!(
                        "scale_completeness comparison names unknown subscale '{subscale}'"
                    )));
                }
            }
        }
        Ok(Self {
            spec: spec.clone(),
            expected,
        })
    }

    pub fn score(&self, ctx: &ScoreContext<'_>, answers: &Value) -> Result<Scored> {
        let responses = answers
            .get("responses")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid(KIND, "responses must be an array"))?;

        let bounds = self.spec.scale;
        let mut parsed: Vec<(String, i64)> = Vec::with_capacity(responses.len());
        let mut invalid_items = Vec::new();
        for r in responses {
            let id = r.get("id").and_then(id_string);
            let value = r.get("response").and_then(whole_number);
            match (id, value) {
                (Some(id), Some(v))
                    if self.expected.contains(&id) && (bounds.min..=bounds.max).contains(&v) =>
                {
                    parsed.push((id, v));
                }
                (id, _) => invalid_items.push(id),
            }
        }
        if !invalid_items.is_empty() {
            return Ok(fail(ScaleVerdict {
                reason: Some("invalid items".into()),
                invalid_count: Some(invalid_items.len()),
                invalid_items: invalid_items.into_iter().take(MAX_LISTED).collect(),
                ..Default::default()
            }));
        }

        let by_id: HashMap<&str, i64> = parsed.iter().map(|(id, v)| (id.as_str(), *v)).collect();
        if by_id.len() != self.expected.len() || parsed.len() != self.expected.len() {
            let missing = self
                .expected
                .iter()
                .filter(|id| !by_id.contains_key(id.as_str()))
                .take(MAX_LISTED)
                .cloned()
                .collect();
            return Ok(fail(ScaleVerdict {
                reason: Some("missing or duplicate items".into()),
                expected_count: Some(self.expected.len()),
                received_count: Some(parsed.len()),
                missing,
                ..Default::default()
            }));
        }

        let wrong_checks: Vec<String> = self
            .spec
            .attention_checks
            .iter()
            .filter(|c| by_id.get(c.id.as_str()) != Some(&c.expected))
            .map(|c| c.id.clone())
            .collect();
        let checks_failed = match self.spec.check_policy {
            CheckPolicy::AnyWrongFails => !wrong_checks.is_empty(),
            CheckPolicy::AllWrongFail => {
                !self.spec.attention_checks.is_empty()
                    && wrong_checks.len() == self.spec.attention_checks.len()
            }
        };
        if checks_failed {
            return Ok(fail(ScaleVerdict {
                reason: Some("failed attention check".into()),
                wrong_checks,
                ..Default::default()
            }));
        }

        let raw_means: BTreeMap<String, f64> = self
            .spec
            .subscales
            .iter()
            .map(|s| {
                let sum: i64 = s.items.iter().map(|id| by_id[id.as_str()]).sum();
                (s.name.clone(), sum as f64 / s.items.len() as f64)
            })
            .collect();

        let mut dominant_subscale = None;
        let mut dominant_subscale_higher = None;
        if let Some(cmp) = &self.spec.comparison {
            let value = ctx.condition(&cmp.factor)?;
            if let Some(name) = cmp.dominant.get(value) {
                let dominant = raw_means[name];
                dominant_subscale_higher = Some(
                    raw_means
                        .iter()
                        .filter(|(other, _)| *other != name)
                        .all(|(_, mean)| dominant > *mean),
                );
                dominant_subscale = Some(name.clone());
            }
        }

        Ok(Scored {
            passed: true,
            verdict: Verdict::ScaleCompleteness(ScaleVerdict {
                wrong_checks,
                means: raw_means.into_iter().map(|(k, v)| (k, round_to(v, 2))).collect(),
                dominant_subscale,
                dominant_subscale_higher,
                ..Default::default()
            }),
        })
    }
}

/// Integer responses, including floats with no fractional part (`5.0`).
fn whole_number(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite() && f.fract() == 0.0 && f.abs() <= i64::MAX as f64)
            .map(|f| f as i64)
    })
}

fn fail(verdict: ScaleVerdict) -> Scored {
    Scored {
        passed: false,
        verdict: Verdict::ScaleCompleteness(verdict),
    }
}
