//! Compiled, immutable pipeline.
//!
//! A [`Pipeline`] is built once at startup from a linted
//! [`PipelineDefinition`]: inactive stages are dropped and every validator
//! spec is compiled. After that it is shared read-only behind an `Arc`.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;

use cohort_types::{CohortError, Result};

use crate::definition::{ConditionFactor, PipelineDefinition, SelectionMode, StratumKey};
use crate::validation::{validate_or_raise, Diagnostic};
use crate::validators::Validator;

#[derive(Debug, Clone)]
pub struct Stage {
    pub id: String,
    pub variants: Vec<String>,
    pub mode: SelectionMode,
    pub override_key: Option<String>,
    pub stratify_by: Option<StratumKey>,
    validators: BTreeMap<String, Validator>,
    ui: BTreeMap<String, Value>,
}

impl Stage {
    pub fn validator(&self, variant: &str) -> Result<&Validator> {
        self.validators
            .get(variant)
            .ok_or_else(|| CohortError::MissingValidator {
                stage: self.id.clone(),
                variant: variant.to_owned(),
            })
    }

    /// UI descriptor for `variant`, `Null` when none is declared.
    pub fn ui(&self, variant: &str) -> Value {
        self.ui.get(variant).cloned().unwrap_or(Value::Null)
    }

    pub fn has_variant(&self, variant: &str) -> bool {
        self.variants.iter().any(|v| v == variant)
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    code: String,
    factors: Vec<ConditionFactor>,
    stages: Vec<Stage>,
    diagnostics: Vec<Diagnostic>,
}

impl Pipeline {
    /// Lint and compile a definition.
    pub fn from_definition(def: PipelineDefinition) -> Result<Self> {
        let diagnostics = validate_or_raise(&def)?;

        let stages = def
            .stages
            .into_iter()
            .filter(|s| s.active)
            .map(|s| {
                let validators = s
                    .validators
                    .iter()
                    .map(|(variant, spec)| {
                        let compiled = Validator::compile(spec).map_err(|e| {
                            CohortError::Configuration(format!(
                                "stage '{}' variant '{variant}': {e}",
                                s.id
                            ))
                        })?;
                        Ok((variant.clone(), compiled))
                    })
                    .collect::<Result<BTreeMap<_, _>>>()?;
                Ok(Stage {
                    id: s.id,
                    variants: s.variants,
                    mode: s.mode,
                    override_key: s.override_key,
                    stratify_by: s.stratify_by,
                    validators,
                    ui: s.ui,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(pipeline = %def.code, stages = stages.len(), "Pipeline compiled");

        Ok(Self {
            code: def.code,
            factors: def.factors,
            stages,
            diagnostics,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_definition(PipelineDefinition::load(path)?)
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn factors(&self) -> &[ConditionFactor] {
        &self.factors
    }

    pub fn factor(&self, name: &str) -> Option<&ConditionFactor> {
        self.factors.iter().find(|f| f.name == name)
    }

    /// Active stages in order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage_at(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }

    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn stage_index(&self, id: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.id == id)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Non-fatal lint findings from compilation.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::Severity;

    const YAML: &str = r#"
code: study
factors:
  - name: iv1
    values: [x, y]
stages:
  - id: intro
    active: false
    variants: [only]
  - id: stage_1
    variants: [a, b]
    validators:
      a: { kind: attention_checks, checks: [{ key: q, expected: 1 }] }
      b: { kind: attention_checks, checks: [{ key: q, expected: 2 }] }
    ui:
      a: { screen: first }
  - id: stage_2
    variants: [c]
    stratify_by: condition:iv1
    validators:
      c: { kind: attention_checks, checks: [{ key: q, expected: 3 }] }
"#;

    fn pipeline() -> Pipeline {
        Pipeline::from_definition(PipelineDefinition::from_yaml_str(YAML).unwrap()).unwrap()
    }

    #[test]
    fn inactive_stages_are_dropped() {
        let p = pipeline();
        assert_eq!(p.stage_count(), 2);
        assert_eq!(p.stage_at(0).unwrap().id, "stage_1");
        assert!(p.stage("intro").is_none());
        assert_eq!(p.stage_index("stage_2"), Some(1));
    }

    #[test]
    fn validators_and_ui_are_looked_up_per_variant() {
        let p = pipeline();
        let s1 = p.stage("stage_1").unwrap();
        assert_eq!(s1.validator("a").unwrap().kind(), "attention_checks");
        assert!(matches!(
            s1.validator("zzz").unwrap_err(),
            CohortError::MissingValidator { .. }
        ));
        assert_eq!(s1.ui("a")["screen"], "first");
        assert_eq!(s1.ui("b"), Value::Null);
        assert!(s1.has_variant("b"));
    }

    #[test]
    fn warnings_are_kept_as_diagnostics() {
        let p = pipeline();
        assert!(p
            .diagnostics()
            .iter()
            .all(|d| d.severity != Severity::Error));
        assert!(p.diagnostics().iter().any(|d| d.rule == "ui_coverage"));
    }

    #[test]
    fn lint_errors_block_compilation() {
        let def = PipelineDefinition::from_yaml_str("code: c\nstages:\n  - id: s\n    variants: []\n").unwrap();
        assert!(matches!(
            Pipeline::from_definition(def).unwrap_err(),
            CohortError::ValidationError(_)
        ));
    }

    #[test]
    fn bad_validator_config_fails_compilation() {
        let def = PipelineDefinition::from_yaml_str(
            "code: c\nstages:\n  - id: s\n    variants: [a]\n    validators:\n      a: { kind: attention_checks, checks: [] }\n",
        )
        .unwrap();
        let err = Pipeline::from_definition(def).unwrap_err();
        assert!(matches!(err, CohortError::Configuration(_)));
        assert!(err.to_string().contains("stage 's' variant 'a'"));
    }
}
