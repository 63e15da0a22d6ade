//! Error Types
//!
//! One crate-level [`Error`] with a variant per failure family. Compile,
//! binding and transition failures carry their own enums so callers can
//! match on the precise cause.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::ledger::LedgerError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for every engine operation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("binding error: {0}")]
    Binding(#[from] BindingError),

    #[error("transition error: {0}")]
    Transition(#[from] TransitionError),

    /// Attach target does not have the `<scope>/polecats/<name>` shape.
    #[error("invalid polecat agent format '{0}': expected <scope>/polecats/<name>")]
    TargetFormat(String),

    #[error("'{operation}' exceeded its {limit:?} timeout")]
    Timeout { operation: String, limit: Duration },

    /// The condition collaborator could not be reached.
    #[error("external condition source unavailable: {0}")]
    ExternalUnavailable(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// Operation is well-formed but the record is in the wrong state for it.
    #[error("{0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Failures while cooking a formula into a protomolecule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("formula '{0}' has cyclic step dependencies")]
    Cyclic(String),

    #[error("step '{step}' needs unknown step '{dependency}'")]
    UnresolvedDependency { step: String, dependency: String },

    #[error("duplicate step id '{step}' in formula '{formula}'")]
    DuplicateStep { formula: String, step: String },

    #[error("formula '{0}' not found")]
    UnknownFormula(String),

    #[error("formula '{0}' extends itself through its parents")]
    ExtendsCycle(String),

    #[error("formula '{0}' has no steps")]
    EmptyFormula(String),

    #[error("exit step '{exit}' is not a step of formula '{formula}'")]
    UnknownExit { formula: String, exit: String },
}

/// Failures while binding variables during pour/wisp.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    #[error("placeholder '{{{{{placeholder}}}}}' in step '{step}' is unbound")]
    Unbound { step: String, placeholder: String },

    #[error("required variable '{0}' has no value")]
    MissingRequired(String),
}

/// Rejected step status changes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("step '{step}' cannot move from {from} to {to}")]
    Illegal { step: String, from: String, to: String },

    #[error("step '{step}' still waits on open dependencies: {open:?}")]
    DependenciesOpen { step: String, open: Vec<String> },

    #[error("molecule '{molecule}' has no step '{step}'")]
    UnknownStep { molecule: String, step: String },
}
