//! Attach / Pin Protocol
//!
//! Binds a molecule to exactly one worker identity:
//! - A bead that already carries an attachment is left untouched, so a
//!   recovered worker can replay `attach` freely
//! - An `open` bead is pinned first
//! - `deferred` and `closed` beads refuse new work
//!
//! The target string is validated before the ledger is touched.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use super::bead::{AgentBead, Attachment, BeadStatus};
use super::target::PolecatTarget;
use crate::config::EngineConfig;
use crate::error::{CompileError, Error, Result};
use crate::formula::{Cookbook, FormulaLibrary};
use crate::ledger::{LedgerClient, LedgerState};
use crate::molecule::model::{MoleculeStatus, Tier};
use crate::molecule::pour::instantiate;

/// Result of an attach call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached { molecule: String },
    /// The bead already carried this attachment; nothing was written
    AlreadyAttached { molecule: String },
}

impl AttachOutcome {
    pub fn molecule(&self) -> &str {
        match self {
            AttachOutcome::Attached { molecule } | AttachOutcome::AlreadyAttached { molecule } => {
                molecule
            }
        }
    }
}

/// Creates the agent bead for `target` if it does not exist yet.
pub fn register_agent(
    client: &LedgerClient,
    config: &EngineConfig,
    target: &PolecatTarget,
) -> Result<AgentBead> {
    let id = target.bead_id(config.prefix_for(&target.scope));
    let now = Utc::now();
    client.transact(|state| Ok(ensure_bead(state, &id, target, now)))
}

fn ensure_bead(
    state: &mut LedgerState,
    id: &str,
    target: &PolecatTarget,
    now: DateTime<Utc>,
) -> AgentBead {
    state
        .beads
        .entry(id.to_string())
        .or_insert_with(|| {
            info!("Registered agent bead {}", id);
            AgentBead::new(id, target.to_string(), now)
        })
        .clone()
}

/// Pins a bead. Pinning a pinned bead is a no-op.
pub fn pin(client: &LedgerClient, bead_id: &str) -> Result<()> {
    let changed = client.transact(|state| pin_bead(state.bead_mut(bead_id)?))?;
    if changed {
        info!("Pinned bead {}", bead_id);
    }
    Ok(())
}

fn pin_bead(bead: &mut AgentBead) -> Result<bool> {
    match bead.status {
        BeadStatus::Pinned => Ok(false),
        BeadStatus::Open => {
            bead.status = BeadStatus::Pinned;
            Ok(true)
        }
        other => Err(Error::InvalidState(format!(
            "bead {} is {} and cannot take work",
            bead.id, other
        ))),
    }
}

/// Attaches `molecule_id` to the bead of `target`.
pub fn attach(
    client: &LedgerClient,
    config: &EngineConfig,
    target: &str,
    molecule_id: &str,
) -> Result<AttachOutcome> {
    let target = PolecatTarget::parse(target)?;
    let bead_id = target.bead_id(config.prefix_for(&target.scope));
    let now = Utc::now();

    let outcome = client.transact(|state| {
        state.molecule(molecule_id)?;
        if state.bead(&bead_id)?.attached_molecule().is_none() {
            ensure_attachable(state, &bead_id, molecule_id)?;
        }
        attach_in(state.bead_mut(&bead_id)?, molecule_id, now)
    })?;
    log_outcome(&bead_id, molecule_id, &outcome);
    Ok(outcome)
}

/// A molecule binds to at most one bead, and only while it is active.
fn ensure_attachable(state: &LedgerState, bead_id: &str, molecule_id: &str) -> Result<()> {
    if state.molecule(molecule_id)?.status == MoleculeStatus::Archived {
        return Err(Error::InvalidState(format!(
            "molecule {} is archived and cannot be attached",
            molecule_id
        )));
    }
    let holder = state
        .beads
        .values()
        .find(|b| b.id != bead_id && b.attached_molecule() == Some(molecule_id));
    if let Some(holder) = holder {
        return Err(Error::InvalidState(format!(
            "molecule {} is already attached to {}",
            molecule_id, holder.id
        )));
    }
    Ok(())
}

fn attach_in(bead: &mut AgentBead, molecule_id: &str, now: DateTime<Utc>) -> Result<AttachOutcome> {
    if let Some(existing) = bead.attached_molecule() {
        return Ok(AttachOutcome::AlreadyAttached {
            molecule: existing.to_string(),
        });
    }

    if pin_bead(bead)? {
        info!("Pinned bead {}", bead.id);
    }
    bead.attachment = Some(Attachment {
        molecule: molecule_id.to_string(),
        attached_at: now,
    });
    Ok(AttachOutcome::Attached {
        molecule: molecule_id.to_string(),
    })
}

fn log_outcome(bead_id: &str, requested: &str, outcome: &AttachOutcome) {
    match outcome {
        AttachOutcome::Attached { molecule } => info!("Attached {} to {}", molecule, bead_id),
        AttachOutcome::AlreadyAttached { molecule } if molecule == requested => {
            debug!("Bead {} already carries {}", bead_id, molecule)
        }
        AttachOutcome::AlreadyAttached { molecule } => warn!(
            "Bead {} already carries {}, not attaching {}",
            bead_id, molecule, requested
        ),
    }
}

/// Gives a worker its work molecule.
///
/// An already attached bead is returned as is: no cook, no pour, no pin.
/// Otherwise the formula is cooked first and the pour, pin and attach land in
/// one ledger push.
pub fn attach_work_molecule(
    client: &LedgerClient,
    config: &EngineConfig,
    cookbook: &Cookbook,
    library: &FormulaLibrary,
    target: &str,
    formula: &str,
    vars: &BTreeMap<String, String>,
) -> Result<AttachOutcome> {
    let target = PolecatTarget::parse(target)?;
    let bead_id = target.bead_id(config.prefix_for(&target.scope));

    let current = client.read()?;
    if let Some(molecule) = current.beads.get(&bead_id).and_then(|b| b.attached_molecule()) {
        debug!("Bead {} already carries {}, skipping cook", bead_id, molecule);
        return Ok(AttachOutcome::AlreadyAttached {
            molecule: molecule.to_string(),
        });
    }

    let formula = library
        .get(formula)
        .ok_or_else(|| CompileError::UnknownFormula(formula.to_string()))?;
    let proto = cookbook.cook(formula, library)?;
    let now = Utc::now();
    let template = instantiate(&proto, vars, String::new(), Tier::Persistent, now)?;

    let outcome = client.transact(|state| {
        let bead = ensure_bead(state, &bead_id, &target, now);
        if let Some(molecule) = bead.attached_molecule() {
            return Ok(AttachOutcome::AlreadyAttached {
                molecule: molecule.to_string(),
            });
        }

        let mut molecule = template.clone();
        molecule.id = state.next_id("mol");
        let id = molecule.id.clone();
        state.molecules.insert(id.clone(), molecule);
        attach_in(state.bead_mut(&bead_id)?, &id, now)
    })?;

    if let AttachOutcome::Attached { molecule } = &outcome {
        info!("Poured {} from {} for {}", molecule, proto.key(), target);
    }
    log_outcome(&bead_id, outcome.molecule(), &outcome);
    Ok(outcome)
}

/// Clears a bead's attachment and unpins it.
///
/// Returns the molecule that was attached, if any.
pub fn detach(client: &LedgerClient, bead_id: &str) -> Result<Option<String>> {
    let detached = client.transact(|state| Ok(release(state.bead_mut(bead_id)?)))?;
    if let Some(molecule) = &detached {
        info!("Detached {} from {}", molecule, bead_id);
    }
    Ok(detached)
}

/// Detaches every bead carrying `molecule_id` inside an ongoing transaction.
pub(crate) fn release_molecule(state: &mut LedgerState, molecule_id: &str) -> Vec<String> {
    let mut released = Vec::new();
    for bead in state.beads.values_mut() {
        if bead.attached_molecule() == Some(molecule_id) {
            release(bead);
            released.push(bead.id.clone());
        }
    }
    released
}

fn release(bead: &mut AgentBead) -> Option<String> {
    let attachment = bead.attachment.take()?;
    if bead.status == BeadStatus::Pinned {
        bead.status = BeadStatus::Open;
    }
    Some(attachment.molecule)
}
