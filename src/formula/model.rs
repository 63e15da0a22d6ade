//! Formula Data Model
//!
//! Authored workflow templates and their frozen, cooked expansion.
//!
//! # Example YAML Format
//!
//! ```yaml
//! formula: mol-polecat-work
//! version: 2
//! extends:
//!   - mol-base
//! vars:
//!   issue:
//!     required: true
//!   branch:
//!     default: main
//! steps:
//!   - id: load-context
//!     title: Load context for {{issue}}
//!
//!   - id: implement
//!     title: Implement {{issue}} on {{branch}}
//!     needs:
//!       - load-context
//! exit: implement
//! ```

use std::collections::BTreeMap;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

/// A variable declared by a formula.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct VarDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Value used when pour supplies none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    /// Pour fails unless a value (or default) is present
    #[serde(default)]
    pub required: bool,
}

/// One authored step of a formula.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FormulaStep {
    pub id: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub description: String,

    /// Ids of steps that must be closed before this one is ready
    #[serde(default, deserialize_with = "single_or_vec")]
    pub needs: Vec<String>,
}

impl FormulaStep {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            title: title.into(),
            description: String::new(),
            needs: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Adds a dependency on another step.
    pub fn needs(mut self, step_id: impl Into<String>) -> Self {
        self.needs.push(step_id.into());
        self
    }
}

/// Accepts either `needs: a` or `needs: [a, b]`.
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = serde_yaml::Value::deserialize(deserializer)?;
    match val {
        serde_yaml::Value::Null => Ok(Vec::new()),
        serde_yaml::Value::String(s) if s.is_empty() => Ok(Vec::new()),
        serde_yaml::Value::String(s) => Ok(vec![s]),
        serde_yaml::Value::Sequence(seq) => seq
            .into_iter()
            .map(|v| match v {
                serde_yaml::Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

/// An authored workflow template.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Formula {
    /// Formula name, unique within a library
    #[serde(rename = "formula")]
    pub name: String,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub description: String,

    /// Parent formulas merged underneath this one, in order
    #[serde(default, deserialize_with = "single_or_vec")]
    pub extends: Vec<String>,

    #[serde(default)]
    pub vars: BTreeMap<String, VarDef>,

    #[serde(default)]
    pub steps: Vec<FormulaStep>,

    /// Step whose closing ends the instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<String>,
}

fn default_version() -> u32 {
    1
}

impl Formula {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            description: String::new(),
            extends: Vec::new(),
            vars: BTreeMap::new(),
            steps: Vec::new(),
            exit: None,
        }
    }

    pub fn with_step(mut self, step: FormulaStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_var(mut self, name: impl Into<String>, var: VarDef) -> Self {
        self.vars.insert(name.into(), var);
        self
    }

    pub fn extending(mut self, parent: impl Into<String>) -> Self {
        self.extends.push(parent.into());
        self
    }

    /// Cache identity: name plus version.
    pub fn key(&self) -> FormulaKey {
        FormulaKey {
            name: self.name.clone(),
            version: self.version,
        }
    }
}

/// Identity under which cooked output is cached.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FormulaKey {
    pub name: String,
    pub version: u32,
}

impl std::fmt::Display for FormulaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}

/// A step of a cooked template; placeholders are still unbound.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProtoStep {
    pub id: String,
    pub title: String,
    pub description: String,
    pub needs: Vec<String>,
}

/// Frozen, fully merged expansion of a formula.
///
/// Fields are private so a cooked template cannot be changed after
/// [`cook`](super::cook) returns it; pours only ever read from it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Protomolecule {
    key: FormulaKey,
    description: String,
    vars: BTreeMap<String, VarDef>,
    steps: Vec<ProtoStep>,
    exit: String,
}

impl Protomolecule {
    pub(crate) fn new(
        key: FormulaKey,
        description: String,
        vars: BTreeMap<String, VarDef>,
        steps: Vec<ProtoStep>,
        exit: String,
    ) -> Self {
        Self {
            key,
            description,
            vars,
            steps,
            exit,
        }
    }

    pub fn key(&self) -> &FormulaKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn vars(&self) -> &BTreeMap<String, VarDef> {
        &self.vars
    }

    /// Steps in declaration order.
    pub fn steps(&self) -> &[ProtoStep] {
        &self.steps
    }

    pub fn exit(&self) -> &str {
        &self.exit
    }

    pub fn get_step(&self, id: &str) -> Option<&ProtoStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}
