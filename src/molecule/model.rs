//! Molecule Data Model
//!
//! Live workflow instances. A persisted molecule and an ephemeral wisp share
//! this one model; [`Tier`] only changes how the instance is stored and how
//! it ends, never how its steps are scheduled.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::formula::FormulaKey;

/// Persistence tier of an instance.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Audited molecule: archived at the end, never deleted
    Persistent,
    /// Wisp: squashed into a digest or burned at the end
    Ephemeral,
}

/// Status of a single step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Closed,
    Skipped,
}

impl StepStatus {
    /// True for the legal single-hop transitions
    /// `pending -> in_progress -> {closed, skipped}`.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (StepStatus::Pending, StepStatus::InProgress)
                | (StepStatus::InProgress, StepStatus::Closed)
                | (StepStatus::InProgress, StepStatus::Skipped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Closed | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Closed => "closed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "in_progress" => Ok(StepStatus::InProgress),
            "closed" => Ok(StepStatus::Closed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("unknown step status '{}'", other)),
        }
    }
}

/// A step belonging to exactly one instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub needs: Vec<String>,
    pub status: StepStatus,

    /// When the step moved to `in_progress`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the step reached `closed` or `skipped`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Lifecycle of the instance as a whole.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MoleculeStatus {
    Active,
    /// Persistent molecule whose exit step closed; kept for audit
    Archived,
}

/// A live workflow instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Molecule {
    pub id: String,
    pub formula: FormulaKey,
    pub tier: Tier,
    pub status: MoleculeStatus,

    /// Bound variable values
    #[serde(default)]
    pub vars: BTreeMap<String, String>,

    /// Steps in declaration order
    pub steps: Vec<Step>,

    /// Id of the step whose closing ends the instance
    pub exit: String,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
}

impl Molecule {
    pub fn is_wisp(&self) -> bool {
        self.tier == Tier::Ephemeral
    }

    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub(crate) fn get_step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// True once the exit step is closed.
    pub fn exit_reached(&self) -> bool {
        self.get_step(&self.exit)
            .map(|s| s.status == StepStatus::Closed)
            .unwrap_or(false)
    }

    /// Number of steps in each status.
    pub fn progress(&self) -> BTreeMap<StepStatus, usize> {
        let mut counts = BTreeMap::new();
        for step in &self.steps {
            *counts.entry(step.status).or_insert(0) += 1;
        }
        counts
    }
}

/// Append-only condensed record of a squashed wisp or a completed run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    pub id: String,

    /// Instance or plugin the digest condenses
    pub source: String,

    #[serde(default)]
    pub labels: Vec<String>,

    pub summary: String,

    pub created_at: DateTime<Utc>,
}
