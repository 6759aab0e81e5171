//! Assignment engine: balanced / random condition and stage-variant selection.
//!
//! Counts are never stored. Every resolution recomputes them from the
//! population of non-failed sessions handed in by the caller, optionally
//! restricted to the stratum the session belongs to. Reading the counts and
//! writing the chosen value are not atomic across sessions, so concurrent
//! resolutions may pick the same least-assigned value; balance is
//! approximate.

use std::collections::BTreeMap;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use cohort_types::{CohortError, Result, Session};

use crate::definition::{ConditionFactor, SelectionMode, StratumKey};
use crate::pipeline::{Pipeline, Stage};

/// How a value came to be locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// Already locked before this call; nothing changed.
    Locked,
    /// Pinned by a client-supplied override parameter.
    Override,
    Balanced,
    Random,
}

/// Outcome of resolving one dimension (a condition factor or a stage).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub dimension: StratumKey,
    pub value: String,
    pub source: ResolutionSource,
}

impl Resolution {
    pub fn newly_locked(&self) -> bool {
        self.source != ResolutionSource::Locked
    }
}

pub struct AssignmentEngine {
    rng: Mutex<StdRng>,
}

impl Default for AssignmentEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AssignmentEngine {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Deterministic engine for tests and simulations.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Resolve every unassigned condition factor on `session`.
    pub fn resolve_conditions(
        &self,
        factors: &[ConditionFactor],
        session: &mut Session,
        population: &[Session],
    ) -> Result<Vec<Resolution>> {
        let peers = peers(session, population);
        let mut out = Vec::with_capacity(factors.len());
        for factor in factors {
            let dimension = StratumKey::Condition(factor.name.clone());
            if let Some(existing) = session.conditions.get(&factor.name) {
                out.push(Resolution {
                    dimension,
                    value: existing.clone(),
                    source: ResolutionSource::Locked,
                });
                continue;
            }
            if factor.values.is_empty() {
                return Err(CohortError::Configuration(format!(
                    "factor '{}' has no values",
                    factor.name
                )));
            }

            let (value, source) = self.pick(factor.mode, &factor.values, |candidate| {
                peers
                    .iter()
                    .filter(|s| s.conditions.get(&factor.name).map(String::as_str) == Some(candidate))
                    .count()
            });
            session.assign_condition(&factor.name, &value);
            out.push(Resolution {
                dimension,
                value,
                source,
            });
        }
        Ok(out)
    }

    /// Lock a variant for `stage` unless one is already locked.
    ///
    /// `overrides` holds client-supplied query parameters; when the stage
    /// declares an override key and the parameter names one of its variants
    /// (case-insensitively, trimmed) that variant is locked directly.
    pub fn resolve_stage_variant(
        &self,
        stage: &Stage,
        session: &mut Session,
        population: &[Session],
        overrides: &BTreeMap<String, String>,
    ) -> Result<Resolution> {
        let dimension = StratumKey::Stage(stage.id.clone());
        if let Some(existing) = session.stage_variants.get(&stage.id) {
            return Ok(Resolution {
                dimension,
                value: existing.clone(),
                source: ResolutionSource::Locked,
            });
        }
        if stage.variants.is_empty() {
            return Err(CohortError::EmptyVariantSet {
                stage: stage.id.clone(),
            });
        }

        if let Some(requested) = requested_variant(stage, overrides) {
            session.lock_variant(&stage.id, &requested);
            return Ok(Resolution {
                dimension,
                value: requested,
                source: ResolutionSource::Override,
            });
        }

        let peers = peers(session, population);
        let stratum: Vec<&Session> = match &stage.stratify_by {
            None => peers,
            Some(key) => {
                let own = stratum_value(session, key).ok_or_else(|| CohortError::UnresolvableStratum {
                    stage: stage.id.clone(),
                    key: key.to_string(),
                })?;
                peers
                    .into_iter()
                    .filter(|s| stratum_value(s, key) == Some(own))
                    .collect()
            }
        };

        let (value, source) = self.pick(stage.mode, &stage.variants, |candidate| {
            stratum
                .iter()
                .filter(|s| s.stage_variants.get(&stage.id).map(String::as_str) == Some(candidate))
                .count()
        });
        session.lock_variant(&stage.id, &value);
        Ok(Resolution {
            dimension,
            value,
            source,
        })
    }

    /// Resolve conditions first, then stages in pipeline order, so a stage
    /// may be stratified by a condition or by any earlier stage.
    pub fn resolve_all(
        &self,
        pipeline: &Pipeline,
        session: &mut Session,
        population: &[Session],
        overrides: &BTreeMap<String, String>,
    ) -> Result<Vec<Resolution>> {
        let mut out = self.resolve_conditions(pipeline.factors(), session, population)?;
        for stage in pipeline.stages() {
            out.push(self.resolve_stage_variant(stage, session, population, overrides)?);
        }
        Ok(out)
    }

    fn pick<F>(&self, mode: SelectionMode, values: &[String], count: F) -> (String, ResolutionSource)
    where
        F: Fn(&str) -> usize,
    {
        let candidates: Vec<&String> = match mode {
            SelectionMode::Random => values.iter().collect(),
            SelectionMode::Balanced => {
                let counts: Vec<(&String, usize)> = values.iter().map(|v| (v, count(v.as_str()))).collect();
                let min = counts.iter().map(|(_, n)| *n).min().unwrap_or(0);
                tracing::debug!(?counts, min, "Balance counts");
                counts
                    .into_iter()
                    .filter(|(_, n)| *n == min)
                    .map(|(v, _)| v)
                    .collect()
            }
        };
        let idx = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            rng.random_range(0..candidates.len())
        };
        let source = match mode {
            SelectionMode::Random => ResolutionSource::Random,
            SelectionMode::Balanced => ResolutionSource::Balanced,
        };
        (candidates[idx].clone(), source)
    }
}

/// Sessions that count toward balance: not failed, not the session itself.
fn peers<'a>(session: &Session, population: &'a [Session]) -> Vec<&'a Session> {
    population
        .iter()
        .filter(|s| !s.failed && s.participant_id != session.participant_id)
        .collect()
}

fn stratum_value<'a>(session: &'a Session, key: &StratumKey) -> Option<&'a str> {
    match key {
        StratumKey::Condition(factor) => session.conditions.get(factor),
        StratumKey::Stage(stage) => session.stage_variants.get(stage),
    }
    .map(String::as_str)
}

fn requested_variant(stage: &Stage, overrides: &BTreeMap<String, String>) -> Option<String> {
    let key = stage.override_key.as_ref()?;
    let raw = overrides.get(key)?.trim().to_lowercase();
    stage
        .variants
        .iter()
        .find(|v| v.to_lowercase() == raw)
        .cloned()
}
