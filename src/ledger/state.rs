//! Ledger State
//!
//! The full record set one pull returns: agent beads, instances with their
//! steps, gates, digests and plugin bookkeeping, plus the revision the
//! snapshot was taken at.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::bead::{AgentBead, BeadStatus};
use crate::error::{Error, Result};
use crate::gate::model::{Gate, GateStatus};
use crate::molecule::model::{Digest, Molecule, Step, StepStatus};
use crate::plugin::runner::PluginState;

/// Snapshot of a ledger at one revision.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct LedgerState {
    /// Revision this snapshot was pulled at
    #[serde(default)]
    pub revision: u64,

    /// Counter behind [`LedgerState::next_id`]
    #[serde(default)]
    pub sequence: u64,

    #[serde(default)]
    pub beads: BTreeMap<String, AgentBead>,

    #[serde(default)]
    pub molecules: BTreeMap<String, Molecule>,

    #[serde(default)]
    pub gates: BTreeMap<String, Gate>,

    /// Append-only
    #[serde(default)]
    pub digests: Vec<Digest>,

    #[serde(default)]
    pub plugins: BTreeMap<String, PluginState>,
}

/// Step query: parent instance and/or status.
#[derive(Debug, Clone, Default)]
pub struct StepFilter {
    pub parent: Option<String>,
    pub status: Option<StepStatus>,
}

/// Gate query: status, `await_type` prefix, owner and/or waiter.
#[derive(Debug, Clone, Default)]
pub struct GateFilter {
    pub status: Option<GateStatus>,
    pub await_prefix: Option<String>,
    pub owner: Option<String>,
    pub waiter: Option<String>,
}

/// Bead query: status and/or assignee.
#[derive(Debug, Clone, Default)]
pub struct BeadFilter {
    pub status: Option<BeadStatus>,
    pub assignee: Option<String>,
}

impl LedgerState {
    /// Allocates a fresh id such as `gate-17`.
    ///
    /// The counter is part of the state, so an id taken by a push that lost a
    /// conflict is simply reallocated on the retry.
    pub fn next_id(&mut self, prefix: &str) -> String {
        self.sequence += 1;
        format!("{}-{}", prefix, self.sequence)
    }

    pub fn molecule(&self, id: &str) -> Result<&Molecule> {
        self.molecules
            .get(id)
            .ok_or_else(|| Error::not_found("molecule", id))
    }

    pub fn molecule_mut(&mut self, id: &str) -> Result<&mut Molecule> {
        self.molecules
            .get_mut(id)
            .ok_or_else(|| Error::not_found("molecule", id))
    }

    pub fn gate(&self, id: &str) -> Result<&Gate> {
        self.gates.get(id).ok_or_else(|| Error::not_found("gate", id))
    }

    pub fn gate_mut(&mut self, id: &str) -> Result<&mut Gate> {
        self.gates
            .get_mut(id)
            .ok_or_else(|| Error::not_found("gate", id))
    }

    pub fn bead(&self, id: &str) -> Result<&AgentBead> {
        self.beads.get(id).ok_or_else(|| Error::not_found("bead", id))
    }

    pub fn bead_mut(&mut self, id: &str) -> Result<&mut AgentBead> {
        self.beads
            .get_mut(id)
            .ok_or_else(|| Error::not_found("bead", id))
    }

    /// Steps matching `filter`, grouped by instance id order.
    pub fn steps(&self, filter: &StepFilter) -> Vec<(&Molecule, &Step)> {
        self.molecules
            .values()
            .filter(|m| filter.parent.as_deref().map_or(true, |p| m.id == p))
            .flat_map(|m| m.steps.iter().map(move |s| (m, s)))
            .filter(|(_, s)| filter.status.map_or(true, |st| s.status == st))
            .collect()
    }

    /// Gates matching `filter`, oldest first.
    pub fn gates(&self, filter: &GateFilter) -> Vec<&Gate> {
        let mut gates: Vec<&Gate> = self
            .gates
            .values()
            .filter(|g| filter.status.map_or(true, |st| g.status == st))
            .filter(|g| {
                filter
                    .await_prefix
                    .as_deref()
                    .map_or(true, |p| g.await_type.to_string().starts_with(p))
            })
            .filter(|g| {
                filter
                    .owner
                    .as_deref()
                    .map_or(true, |o| g.owner.as_deref() == Some(o))
            })
            .filter(|g| {
                filter
                    .waiter
                    .as_deref()
                    .map_or(true, |w| g.waiters.iter().any(|x| x == w))
            })
            .collect();
        gates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        gates
    }

    pub fn beads(&self, filter: &BeadFilter) -> Vec<&AgentBead> {
        self.beads
            .values()
            .filter(|b| filter.status.map_or(true, |st| b.status == st))
            .filter(|b| {
                filter
                    .assignee
                    .as_deref()
                    .map_or(true, |a| b.assignee.as_deref() == Some(a))
            })
            .collect()
    }
}
