//! Token-selection scoring (precision / recall / F1 per item).
//!
//! For every material the ground truth is the multiset of its tokens that
//! belong to the vocabulary of the session's condition value. True positives
//! for an item are `sum over distinct tokens of min(selected, truth)`.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use cohort_types::{CohortError, Result};

use super::text::{counts, round_to, token, tokens};
use super::{id_string, invalid, ScoreContext, Scored, Verdict};

const KIND: &str = "selection_overlap";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Material {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionOverlapSpec {
    pub factor: String,
    /// Minimum per-item F1 (inclusive).
    #[serde(default)]
    pub threshold: f64,
    pub vocabulary: BTreeMap<String, Vec<String>>,
    pub materials: BTreeMap<String, Vec<Material>>,
}

#[derive(Debug, Clone)]
struct Truth {
    counts: BTreeMap<String, usize>,
    total: usize,
}

#[derive(Debug, Clone)]
pub struct SelectionOverlap {
    factor: String,
    threshold: f64,
    /// value -> material id -> truth, plus the expected item count per value.
    truth: BTreeMap<String, (usize, BTreeMap<String, Truth>)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemScore {
    pub item_id: Option<String>,
    pub completed: bool,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub expected_count: usize,
    pub selected_count: usize,
    pub tp: usize,
    pub fp: usize,
    #[serde(rename = "fn")]
    pub fn_: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlapVerdict {
    pub factor: String,
    pub value: String,
    pub items: Vec<ItemScore>,
}

impl SelectionOverlap {
    pub fn compile(spec: &SelectionOverlapSpec) -> Result<Self> {
        if !spec.threshold.is_finite() {
            return Err(CohortError::Configuration(
                "selection_overlap threshold must be a finite number".into(),
            ));
        }
        let mut truth = BTreeMap::new();
        for (value, materials) in &spec.materials {
            let vocabulary: HashSet<String> = spec
                .vocabulary
                .get(value)
                .ok_or_else(|| {
                    CohortError::Configuration(format!(
                        "selection_overlap has materials but no vocabulary for {}={value}",
                        spec.factor
                    ))
                })?
                .iter()
                .map(|w| token(w))
                .filter(|w| !w.is_empty())
                .collect();

            let mut by_id = BTreeMap::new();
            for material in materials {
                let counts = counts(tokens(&material.text).filter(|t| vocabulary.contains(t)));
                let total = counts.values().sum();
                by_id.insert(material.id.clone(), Truth { counts, total });
            }
            truth.insert(value.clone(), (materials.len(), by_id));
        }
        Ok(Self {
            factor: spec.factor.clone(),
            threshold: spec.threshold,
            truth,
        })
    }

    pub fn score(&self, ctx: &ScoreContext<'_>, answers: &Value) -> Result<Scored> {
        let value = ctx.condition(&self.factor)?;
        let (expected_items, truth) = self.truth.get(value).ok_or_else(|| {
            CohortError::Configuration(format!(
                "selection_overlap has no materials for {}={value}",
                self.factor
            ))
        })?;

        let selections = answers
            .get("selections")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid(KIND, "selections must be an array"))?;
        if selections.len() != *expected_items {
            return Err(invalid(
                KIND,
                format!("expected {expected_items} selections, got {}", selections.len()),
            ));
        }

        let items: Vec<ItemScore> = selections
            .iter()
            .map(|item| self.score_item(item, truth))
            .collect();

        Ok(Scored {
            passed: items.iter().all(|i| i.passed),
            verdict: Verdict::SelectionOverlap(OverlapVerdict {
                factor: self.factor.clone(),
                value: value.to_owned(),
                items,
            }),
        })
    }

    fn score_item(&self, item: &Value, truth: &BTreeMap<String, Truth>) -> ItemScore {
        let item_id = item.get("itemId").and_then(id_string);
        let completed = item.get("completed").and_then(Value::as_bool) == Some(true);
        let selected: Vec<String> = item
            .get("selected")
            .and_then(Value::as_array)
            .map(|words| {
                words
                    .iter()
                    .filter_map(Value::as_str)
                    .map(token)
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let Some(truth) = item_id.as_ref().and_then(|id| truth.get(id)) else {
            return ItemScore {
                item_id,
                completed,
                passed: false,
                reason: Some("unknown item".into()),
                expected_count: 0,
                selected_count: selected.len(),
                tp: 0,
                fp: 0,
                fn_: 0,
                precision: 0.0,
                recall: 0.0,
                f1: 0.0,
                threshold: self.threshold,
            };
        };

        let selected_count = selected.len();
        let tp: usize = counts(selected)
            .iter()
            .map(|(word, n)| (*n).min(truth.counts.get(word).copied().unwrap_or(0)))
            .sum();

        let precision = if selected_count == 0 { 0.0 } else { tp as f64 / selected_count as f64 };
        let recall = if truth.total == 0 { 0.0 } else { tp as f64 / truth.total as f64 };
        let f1 = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };

        ItemScore {
            item_id,
            completed,
            passed: completed && f1 >= self.threshold,
            reason: None,
            expected_count: truth.total,
            selected_count,
            tp,
            fp: selected_count - tp,
            fn_: truth.total - tp,
            precision: round_to(precision, 3),
            recall: round_to(recall, 3),
            f1: round_to(f1, 3),
            threshold: self.threshold,
        }
    }
}
