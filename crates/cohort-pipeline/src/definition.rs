//! Serialized pipeline definition as written by study authors (YAML or JSON).
//!
//! A [`PipelineDefinition`] is pure data. It is linted by
//! [`crate::validation`] and compiled into an immutable [`crate::Pipeline`]
//! before any participant touches it.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use cohort_types::Result;

use crate::validators::ValidatorSpec;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Stable identifier; part of every persisted key.
    pub code: String,
    #[serde(default)]
    pub factors: Vec<ConditionFactor>,
    pub stages: Vec<StageDefinition>,
}

/// A between-subjects variable assigned once per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionFactor {
    pub name: String,
    pub values: Vec<String>,
    #[serde(default)]
    pub mode: SelectionMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Pick uniformly among the least-assigned values.
    #[default]
    Balanced,
    /// Pick uniformly among all values.
    Random,
}

/// Restricts the population used for balance counting to sessions that share
/// this dimension's value with the session being resolved.
///
/// Written as `condition:<factor>` or `stage:<stage id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StratumKey {
    /// A condition factor, by name.
    Condition(String),
    /// Another stage's locked variant, by stage id.
    Stage(String),
}

impl TryFrom<String> for StratumKey {
    type Error = String;

    fn try_from(raw: String) -> std::result::Result<Self, Self::Error> {
        match raw.split_once(':') {
            Some(("condition", name)) if !name.trim().is_empty() => {
                Ok(StratumKey::Condition(name.trim().to_owned()))
            }
            Some(("stage", id)) if !id.trim().is_empty() => Ok(StratumKey::Stage(id.trim().to_owned())),
            _ => Err(format!(
                "invalid stratification key '{raw}', expected 'condition:<factor>' or 'stage:<stage id>'"
            )),
        }
    }
}

impl From<StratumKey> for String {
    fn from(key: StratumKey) -> Self {
        key.to_string()
    }
}

impl std::fmt::Display for StratumKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StratumKey::Condition(name) => write!(f, "condition:{name}"),
            StratumKey::Stage(id) => write!(f, "stage:{id}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    pub id: String,
    #[serde(default = "default_active")]
    pub active: bool,
    pub variants: Vec<String>,
    #[serde(default)]
    pub mode: SelectionMode,
    /// Query parameter that may pin the variant directly (deep links).
    #[serde(default)]
    pub override_key: Option<String>,
    #[serde(default)]
    pub stratify_by: Option<StratumKey>,
    #[serde(default)]
    pub validators: BTreeMap<String, ValidatorSpec>,
    /// Opaque descriptor handed to the UI collaborator, per variant.
    #[serde(default)]
    pub ui: BTreeMap<String, serde_json::Value>,
}

fn default_active() -> bool {
    true
}

impl PipelineDefinition {
    /// Load a definition from disk. `.yaml`/`.yml` files are read as YAML,
    /// everything else as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if is_yaml {
            Self::from_yaml_str(&source)
        } else {
            Self::from_json_str(&source)
        }
    }

    pub fn from_yaml_str(source: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn from_json_str(source: &str) -> Result<Self> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn factor(&self, name: &str) -> Option<&ConditionFactor> {
        self.factors.iter().find(|f| f.name == name)
    }

    pub fn active_stages(&self) -> impl Iterator<Item = &StageDefinition> {
        self.stages.iter().filter(|s| s.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const YAML: &str = r#"
code: study_v1
factors:
  - name: iv1
    values: [independent, interdependent]
  - name: iv2
    values: [A, B, C]
    mode: random
stages:
  - id: stage_1
    variants: [pronoun, scramble]
    override_key: stage1Task
    validators:
      pronoun:
        kind: attention_checks
        checks:
          - { key: q1, expected: 3 }
      scramble:
        kind: attention_checks
        checks:
          - { key: q1, expected: 3 }
    ui:
      pronoun: { screen: pronoun_selector }
  - id: stage_2
    active: false
    variants: [a]
    stratify_by: condition:iv1
"#;

    #[test]
    fn yaml_definition_parses_with_defaults() {
        let def = PipelineDefinition::from_yaml_str(YAML).unwrap();
        assert_eq!(def.code, "study_v1");
        assert_eq!(def.factors.len(), 2);
        assert_eq!(def.factors[0].mode, SelectionMode::Balanced);
        assert_eq!(def.factor("iv2").unwrap().mode, SelectionMode::Random);

        let s1 = &def.stages[0];
        assert!(s1.active);
        assert_eq!(s1.mode, SelectionMode::Balanced);
        assert_eq!(s1.override_key.as_deref(), Some("stage1Task"));
        assert_eq!(s1.validators.len(), 2);
        assert_eq!(s1.ui["pronoun"]["screen"], "pronoun_selector");

        let s2 = &def.stages[1];
        assert!(!s2.active);
        assert_eq!(s2.stratify_by, Some(StratumKey::Condition("iv1".into())));
        assert_eq!(def.active_stages().count(), 1);
    }

    #[test]
    fn load_picks_format_from_extension() {
        let dir = tempfile::tempdir().unwrap();

        let yaml_path = dir.path().join("study.yaml");
        std::fs::File::create(&yaml_path)
            .unwrap()
            .write_all(YAML.as_bytes())
            .unwrap();
        assert_eq!(PipelineDefinition::load(&yaml_path).unwrap().code, "study_v1");

        let def = PipelineDefinition::from_yaml_str(YAML).unwrap();
        let json_path = dir.path().join("study.json");
        std::fs::write(&json_path, serde_json::to_string(&def).unwrap()).unwrap();
        let loaded = PipelineDefinition::load(&json_path).unwrap();
        assert_eq!(loaded.stages.len(), 2);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PipelineDefinition::load(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, cohort_types::CohortError::Io(_)));
    }

    #[test]
    fn stratum_key_rejects_unknown_prefix() {
        let err = PipelineDefinition::from_yaml_str(
            "code: x\nstages:\n  - id: s\n    variants: [a]\n    stratify_by: cohort:iv1\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid stratification key"), "{err}");
    }

    #[test]
    fn stratum_key_display() {
        assert_eq!(StratumKey::Stage("stage_1".into()).to_string(), "stage:stage_1");
        assert_eq!(StratumKey::Condition("iv1".into()).to_string(), "condition:iv1");
    }
}
