//! Pipeline validation: lint rules and diagnostics.
//!
//! Checks a [`PipelineDefinition`] for structural problems before it is
//! compiled. Call [`validate`] for advisory diagnostics or
//! [`validate_or_raise`] to fail on the first `Error`-severity issue.

use std::collections::{BTreeMap, HashMap, HashSet};

use cohort_types::{CohortError, Result};

use crate::definition::{PipelineDefinition, StratumKey};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub stage_id: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Info => write!(f, "INFO"),
        }
    }
}

impl Diagnostic {
    fn error(rule: &str, stage_id: Option<&str>, message: String) -> Self {
        Self::new(rule, Severity::Error, stage_id, message)
    }

    fn new(rule: &str, severity: Severity, stage_id: Option<&str>, message: String) -> Self {
        Self {
            rule: rule.into(),
            severity,
            message,
            stage_id: stage_id.map(str::to_owned),
            fix: None,
        }
    }

    fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic>;
}

fn duplicates<'a>(items: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
    let mut seen = HashSet::new();
    let mut dups = Vec::new();
    for item in items {
        if !seen.insert(item) && !dups.contains(&item) {
            dups.push(item);
        }
    }
    dups
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct PipelineCodeRule;
impl LintRule for PipelineCodeRule {
    fn name(&self) -> &str { "pipeline_code" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        if def.code.trim().is_empty() {
            vec![Diagnostic::error(self.name(), None, "Pipeline code is empty".into())
                .with_fix("Set `code` to a stable identifier such as \"study_v1\"")]
        } else {
            vec![]
        }
    }
}

struct ActiveStagesRule;
impl LintRule for ActiveStagesRule {
    fn name(&self) -> &str { "active_stages" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        if def.active_stages().next().is_none() {
            vec![Diagnostic::error(self.name(), None, "Pipeline has no active stages".into())
                .with_fix("Add a stage or remove `active: false` from an existing one")]
        } else {
            vec![]
        }
    }
}

struct UniqueStageIdsRule;
impl LintRule for UniqueStageIdsRule {
    fn name(&self) -> &str { "unique_stage_ids" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        duplicates(def.stages.iter().map(|s| s.id.as_str()))
            .into_iter()
            .map(|id| {
                Diagnostic::error(self.name(), Some(id), format!("Stage id '{id}' is declared more than once"))
            })
            .collect()
    }
}

struct FactorValuesRule;
impl LintRule for FactorValuesRule {
    fn name(&self) -> &str { "factor_values" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        let mut out: Vec<Diagnostic> = duplicates(def.factors.iter().map(|f| f.name.as_str()))
            .into_iter()
            .map(|name| Diagnostic::error(self.name(), None, format!("Factor '{name}' is declared more than once")))
            .collect();
        for factor in &def.factors {
            if factor.values.is_empty() {
                out.push(
                    Diagnostic::error(self.name(), None, format!("Factor '{}' has no values", factor.name))
                        .with_fix("List at least one value"),
                );
            }
            for dup in duplicates(factor.values.iter().map(String::as_str)) {
                out.push(Diagnostic::error(
                    self.name(),
                    None,
                    format!("Factor '{}' lists value '{dup}' more than once", factor.name),
                ));
            }
        }
        out
    }
}

struct VariantSetRule;
impl LintRule for VariantSetRule {
    fn name(&self) -> &str { "variant_set" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for stage in def.active_stages() {
            if stage.variants.is_empty() {
                out.push(
                    Diagnostic::error(self.name(), Some(stage.id.as_str()), format!("Stage '{}' has an empty variant set", stage.id))
                        .with_fix("List at least one variant"),
                );
            }
            for dup in duplicates(stage.variants.iter().map(String::as_str)) {
                out.push(Diagnostic::error(
                    self.name(),
                    Some(stage.id.as_str()),
                    format!("Stage '{}' lists variant '{dup}' more than once", stage.id),
                ));
            }
        }
        out
    }
}

struct ValidatorCoverageRule;
impl LintRule for ValidatorCoverageRule {
    fn name(&self) -> &str { "validator_coverage" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for stage in def.active_stages() {
            for variant in &stage.variants {
                if !stage.validators.contains_key(variant) {
                    out.push(
                        Diagnostic::error(
                            self.name(),
                            Some(stage.id.as_str()),
                            format!("Stage '{}' variant '{variant}' has no validator", stage.id),
                        )
                        .with_fix(format!("Add `validators.{variant}` to stage '{}'", stage.id)),
                    );
                }
            }
            for key in stage.validators.keys() {
                if !stage.variants.contains(key) {
                    out.push(Diagnostic::new(
                        self.name(),
                        Severity::Warning,
                        Some(stage.id.as_str()),
                        format!("Stage '{}' has a validator for unknown variant '{key}'", stage.id),
                    ));
                }
            }
        }
        out
    }
}

struct UiCoverageRule;
impl LintRule for UiCoverageRule {
    fn name(&self) -> &str { "ui_coverage" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        def.active_stages()
            .flat_map(|stage| {
                stage
                    .variants
                    .iter()
                    .filter(|v| !stage.ui.contains_key(*v))
                    .map(move |v| {
                        Diagnostic::new(
                            "ui_coverage",
                            Severity::Warning,
                            Some(stage.id.as_str()),
                            format!("Stage '{}' variant '{v}' has no UI descriptor", stage.id),
                        )
                    })
            })
            .collect()
    }
}

struct StratificationTargetRule;
impl LintRule for StratificationTargetRule {
    fn name(&self) -> &str { "stratification_target" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        let mut earlier: HashSet<&str> = HashSet::new();
        for stage in def.active_stages() {
            match &stage.stratify_by {
                Some(StratumKey::Condition(factor)) if def.factor(factor).is_none() => {
                    out.push(
                        Diagnostic::error(
                            self.name(),
                            Some(stage.id.as_str()),
                            format!("Stage '{}' is stratified by unknown factor '{factor}'", stage.id),
                        )
                        .with_fix("Stratify by a declared factor"),
                    );
                }
                Some(StratumKey::Stage(target)) if !earlier.contains(target.as_str()) => {
                    out.push(
                        Diagnostic::error(
                            self.name(),
                            Some(stage.id.as_str()),
                            format!(
                                "Stage '{}' is stratified by '{target}', which is not an earlier active stage",
                                stage.id
                            ),
                        )
                        .with_fix("Stratify by a stage that precedes this one"),
                    );
                }
                _ => {}
            }
            earlier.insert(&stage.id);
        }
        out
    }
}

struct ValidatorFactorRule;
impl LintRule for ValidatorFactorRule {
    fn name(&self) -> &str { "validator_factor" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for stage in def.active_stages() {
            for (variant, spec) in &stage.validators {
                if let Some(factor) = spec.factor() {
                    if def.factor(factor).is_none() {
                        out.push(Diagnostic::error(
                            self.name(),
                            Some(stage.id.as_str()),
                            format!(
                                "Validator for stage '{}' variant '{variant}' reads unknown factor '{factor}'",
                                stage.id
                            ),
                        ));
                    }
                }
            }
        }
        out
    }
}

struct ValidatorKeysRule;
impl LintRule for ValidatorKeysRule {
    fn name(&self) -> &str { "validator_keys" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for stage in def.active_stages() {
            for (variant, spec) in &stage.validators {
                let Some(factor) = spec.factor().and_then(|f| def.factor(f)) else {
                    continue;
                };
                let keyed = spec.keyed_values();
                for value in factor.values.iter().filter(|v| !keyed.contains(&v.as_str())) {
                    out.push(Diagnostic::new(
                        self.name(),
                        Severity::Warning,
                        Some(stage.id.as_str()),
                        format!(
                            "{} validator for stage '{}' variant '{variant}' has no entry for {}={value}",
                            spec.kind(),
                            stage.id,
                            factor.name
                        ),
                    ));
                }
            }
        }
        out
    }
}

struct OverrideKeyRule;
impl LintRule for OverrideKeyRule {
    fn name(&self) -> &str { "override_key" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        let mut by_key: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for stage in def.active_stages() {
            if let Some(key) = &stage.override_key {
                by_key.entry(key.as_str()).or_default().push(&stage.id);
            }
        }
        by_key
            .into_iter()
            .filter(|(_, stages)| stages.len() > 1)
            .map(|(key, stages)| {
                Diagnostic::new(
                    self.name(),
                    Severity::Info,
                    None,
                    format!("Override key '{key}' is shared by stages {}", stages.join(", ")),
                )
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and collect diagnostics.
pub fn validate(def: &PipelineDefinition) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(PipelineCodeRule),
        Box::new(ActiveStagesRule),
        Box::new(UniqueStageIdsRule),
        Box::new(FactorValuesRule),
        Box::new(VariantSetRule),
        Box::new(ValidatorCoverageRule),
        Box::new(UiCoverageRule),
        Box::new(StratificationTargetRule),
        Box::new(ValidatorFactorRule),
        Box::new(ValidatorKeysRule),
        Box::new(OverrideKeyRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(def));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(def: &PipelineDefinition) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(def);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(CohortError::ValidationError(messages.join("; ")));
    }
    Ok(diagnostics)
}

/// Count diagnostics per severity, for CLI summaries.
pub fn severity_counts(diagnostics: &[Diagnostic]) -> HashMap<Severity, usize> {
    let mut counts = HashMap::new();
    for d in diagnostics {
        *counts.entry(d.severity).or_insert(0) += 1;
    }
    counts
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> PipelineDefinition {
        PipelineDefinition::from_yaml_str(yaml).unwrap()
    }

    fn rules_hit(diags: &[Diagnostic]) -> Vec<&str> {
        diags.iter().map(|d| d.rule.as_str()).collect()
    }

    const VALID: &str = r#"
code: study
factors:
  - name: iv1
    values: [independent, interdependent]
stages:
  - id: stage_1
    variants: [a, b]
    validators:
      a: { kind: attention_checks, checks: [{ key: q, expected: 1 }] }
      b: { kind: attention_checks, checks: [{ key: q, expected: 1 }] }
    ui:
      a: {}
      b: {}
  - id: stage_2
    variants: [x]
    stratify_by: stage:stage_1
    validators:
      x: { kind: attention_checks, checks: [{ key: q, expected: 1 }] }
    ui:
      x: {}
"#;

    #[test]
    fn valid_pipeline_passes() {
        let diags = validate(&parse(VALID));
        assert!(diags.is_empty(), "unexpected: {diags:?}");
        assert!(validate_or_raise(&parse(VALID)).is_ok());
    }

    #[test]
    fn empty_code_and_no_active_stages() {
        let def = parse("code: ''\nstages:\n  - id: s\n    active: false\n    variants: [a]\n");
        let diags = validate(&def);
        let hit = rules_hit(&diags);
        assert!(hit.contains(&"pipeline_code"));
        assert!(hit.contains(&"active_stages"));
    }

    #[test]
    fn duplicate_stage_ids_and_variants() {
        let def = parse(
            "code: c\nstages:\n  - id: s\n    variants: [a, a]\n  - id: s\n    variants: []\n",
        );
        let diags = validate(&def);
        let hit = rules_hit(&diags);
        assert!(hit.contains(&"unique_stage_ids"));
        assert_eq!(hit.iter().filter(|r| **r == "variant_set").count(), 2);
    }

    #[test]
    fn missing_validator_is_error_missing_ui_is_warning() {
        let def = parse("code: c\nstages:\n  - id: s\n    variants: [a]\n");
        let diags = validate(&def);
        let coverage = diags.iter().find(|d| d.rule == "validator_coverage").unwrap();
        assert_eq!(coverage.severity, Severity::Error);
        assert_eq!(coverage.stage_id.as_deref(), Some("s"));
        assert!(coverage.fix.is_some());
        let ui = diags.iter().find(|d| d.rule == "ui_coverage").unwrap();
        assert_eq!(ui.severity, Severity::Warning);
    }

    #[test]
    fn stratification_must_reference_factor_or_earlier_stage() {
        let def = parse(
            r#"
code: c
stages:
  - id: s1
    variants: [a]
    stratify_by: stage:s2
    validators: { a: { kind: attention_checks, checks: [{ key: q, expected: 1 }] } }
  - id: s2
    variants: [b]
    stratify_by: condition:nope
    validators: { b: { kind: attention_checks, checks: [{ key: q, expected: 1 }] } }
"#,
        );
        let diags = validate(&def);
        let strat: Vec<_> = diags.iter().filter(|d| d.rule == "stratification_target").collect();
        assert_eq!(strat.len(), 2);
        assert!(strat[0].message.contains("not an earlier active stage"));
        assert!(strat[1].message.contains("unknown factor 'nope'"));
    }

    #[test]
    fn stratifying_by_inactive_stage_is_rejected() {
        let def = parse(
            r#"
code: c
stages:
  - id: s1
    active: false
    variants: [a]
  - id: s2
    variants: [b]
    stratify_by: stage:s1
    validators: { b: { kind: attention_checks, checks: [{ key: q, expected: 1 }] } }
"#,
        );
        assert!(rules_hit(&validate(&def)).contains(&"stratification_target"));
    }

    #[test]
    fn keyed_validators_check_factor_and_coverage() {
        let def = parse(
            r#"
code: c
factors:
  - name: iv1
    values: [x, y]
stages:
  - id: s
    variants: [a, b]
    validators:
      a: { kind: exact_match, factor: iv1, threshold_percent: 50, keys: { x: [{ id: 1, answer: hi }] } }
      b: { kind: exact_match, factor: iv9, threshold_percent: 50, keys: {} }
"#,
        );
        let diags = validate(&def);
        let keys = diags.iter().find(|d| d.rule == "validator_keys").unwrap();
        assert_eq!(keys.severity, Severity::Warning);
        assert!(keys.message.contains("iv1=y"));
        let factor = diags.iter().find(|d| d.rule == "validator_factor").unwrap();
        assert!(factor.message.contains("iv9"));
    }

    #[test]
    fn shared_override_key_is_info() {
        let def = parse(
            r#"
code: c
stages:
  - id: s1
    variants: [a]
    override_key: task
    validators: { a: { kind: attention_checks, checks: [{ key: q, expected: 1 }] } }
  - id: s2
    variants: [a]
    override_key: task
    validators: { a: { kind: attention_checks, checks: [{ key: q, expected: 1 }] } }
"#,
        );
        let diags = validate(&def);
        let info = diags.iter().find(|d| d.rule == "override_key").unwrap();
        assert_eq!(info.severity, Severity::Info);
        assert!(validate_or_raise(&def).is_ok());
    }

    #[test]
    fn validate_or_raise_joins_error_messages() {
        let def = parse("code: c\nfactors:\n  - name: f\n    values: []\nstages:\n  - id: s\n    variants: [a]\n");
        let err = validate_or_raise(&def).unwrap_err();
        let CohortError::ValidationError(msg) = err else { panic!("wrong error") };
        assert!(msg.contains("Factor 'f' has no values"));
        assert!(msg.contains("has no validator"));
    }

    #[test]
    fn severity_counts_tally() {
        let def = parse("code: c\nstages:\n  - id: s\n    variants: [a]\n");
        let counts = severity_counts(&validate(&def));
        assert_eq!(counts[&Severity::Error], 1);
        assert_eq!(counts[&Severity::Warning], 1);
    }
}
