//! Crash Recovery and Parking
//!
//! A restarted worker rebuilds its position from the ledger alone:
//! 1. its bead's attachment
//! 2. the attached instance's step statuses
//! 3. open gates blocking its steps
//!
//! The first `in_progress` step wins; otherwise work continues from the
//! ready set.

use chrono::{DateTime, Utc};
use log::{debug, info};

use super::target::PolecatTarget;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::gate::service::{insert_gate, GateRequest};
use crate::gate::{AwaitType, Gate, GateStatus, StepRef};
use crate::ledger::{GateFilter, LedgerClient, LedgerState};
use crate::molecule::model::{MoleculeStatus, StepStatus};
use crate::molecule::scheduler::ready;

/// Where a worker should pick up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePoint {
    /// Nothing attached
    Idle,
    /// Continue an interrupted step
    Resume { molecule: String, step: String },
    /// Interrupted step waits on open gates; stay parked
    Parked {
        molecule: String,
        step: String,
        gates: Vec<String>,
    },
    /// Start the next ready step (first of `ready`)
    Next { molecule: String, ready: Vec<String> },
    /// Exit step closed or instance archived
    Finished { molecule: String },
    /// Nothing in progress and nothing ready
    Blocked { molecule: String },
}

/// Computes the resume point of a bead from a ledger snapshot.
pub fn resume_point(state: &LedgerState, bead_id: &str) -> Result<ResumePoint> {
    let bead = state.bead(bead_id)?;
    let Some(molecule_id) = bead.attached_molecule() else {
        return Ok(ResumePoint::Idle);
    };
    let molecule = state.molecule(molecule_id)?;
    let id = molecule.id.clone();

    if molecule.status == MoleculeStatus::Archived || molecule.exit_reached() {
        return Ok(ResumePoint::Finished { molecule: id });
    }

    if let Some(step) = molecule
        .steps
        .iter()
        .find(|s| s.status == StepStatus::InProgress)
    {
        let gates = blocking_gates(state, &id, &step.id);
        return Ok(if gates.is_empty() {
            ResumePoint::Resume {
                molecule: id,
                step: step.id.clone(),
            }
        } else {
            ResumePoint::Parked {
                molecule: id,
                step: step.id.clone(),
                gates,
            }
        });
    }

    let ready: Vec<String> = ready(molecule).into_iter().map(|s| s.id.clone()).collect();
    Ok(if ready.is_empty() {
        ResumePoint::Blocked { molecule: id }
    } else {
        ResumePoint::Next { molecule: id, ready }
    })
}

/// Ids of open gates recorded as blocking `step`.
pub fn blocking_gates(state: &LedgerState, molecule: &str, step: &str) -> Vec<String> {
    state
        .gates(&GateFilter {
            status: Some(GateStatus::Open),
            ..Default::default()
        })
        .into_iter()
        .filter(|g| {
            g.blocks
                .as_ref()
                .map_or(false, |b| b.molecule == molecule && b.step == step)
        })
        .map(|g| g.id.clone())
        .collect()
}

/// Resume point for a bead, read fresh from the ledger.
pub fn recover(client: &LedgerClient, bead_id: &str) -> Result<ResumePoint> {
    let state = client.read()?;
    let point = resume_point(&state, bead_id)?;
    info!("Recovered {} at {:?}", bead_id, point);
    Ok(point)
}

/// Same as [`recover`], addressed by worker target.
pub fn recover_target(
    client: &LedgerClient,
    config: &EngineConfig,
    target: &str,
) -> Result<ResumePoint> {
    let target = PolecatTarget::parse(target)?;
    recover(client, &target.bead_id(config.prefix_for(&target.scope)))
}

/// Parks an `in_progress` step on a new gate.
///
/// The bead is registered as waiter and owner. Parking again on the same
/// step and condition returns the existing open gate.
pub fn park(
    client: &LedgerClient,
    bead_id: &str,
    molecule_id: &str,
    step_id: &str,
    await_type: AwaitType,
    now: DateTime<Utc>,
) -> Result<Gate> {
    let blocks = StepRef {
        molecule: molecule_id.to_string(),
        step: step_id.to_string(),
    };

    let (gate, created) = client.transact(|state| {
        state.bead(bead_id)?;
        let molecule = state.molecule(molecule_id)?;
        let step = molecule.get_step(step_id).ok_or_else(|| {
            Error::InvalidState(format!("molecule {} has no step {}", molecule_id, step_id))
        })?;
        if step.status != StepStatus::InProgress {
            return Err(Error::InvalidState(format!(
                "step {}/{} is {}, only in_progress steps can park",
                molecule_id, step_id, step.status
            )));
        }

        let existing = state
            .gates
            .values()
            .find(|g| g.is_open() && g.blocks.as_ref() == Some(&blocks) && g.await_type == await_type);
        if let Some(gate) = existing {
            return Ok((gate.clone(), false));
        }

        let request = GateRequest::new(await_type.clone())
            .waiter(bead_id)
            .owner(bead_id)
            .blocking(blocks.clone());
        Ok((insert_gate(state, &request, now), true))
    })?;

    if created {
        info!("Parked {}/{} on gate {} ({})", molecule_id, step_id, gate.id, gate.await_type);
    } else {
        debug!("{}/{} already parked on gate {}", molecule_id, step_id, gate.id);
    }
    Ok(gate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::attach::{attach, register_agent};
    use crate::formula::{cook, Formula, FormulaLibrary, FormulaStep};
    use crate::gate::{service, LogWake};
    use crate::ledger::MemoryLedger;
    use crate::molecule::pour::pour;
    use crate::molecule::scheduler::update;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const TARGET: &str = "gastown/polecats/Nux";
    const BEAD: &str = "gt-gastown-polecat-Nux";

    fn setup() -> (Arc<MemoryLedger>, LedgerClient, String) {
        let ledger = Arc::new(MemoryLedger::new());
        let client = LedgerClient::new(ledger.clone(), 4);
        let config = EngineConfig::default();
        register_agent(&client, &config, &PolecatTarget::parse(TARGET).unwrap()).unwrap();

        let formula = Formula::new("chain")
            .with_step(FormulaStep::new("a", "A"))
            .with_step(FormulaStep::new("b", "B").needs("a"));
        let proto = cook(&formula, &FormulaLibrary::new()).unwrap();
        let mol = pour(&client, &proto, &BTreeMap::new()).unwrap().id;
        attach(&client, &config, TARGET, &mol).unwrap();
        (ledger, client, mol)
    }

    #[test]
    fn test_unattached_bead_is_idle() {
        let ledger = Arc::new(MemoryLedger::new());
        let client = LedgerClient::new(ledger, 4);
        let config = EngineConfig::default();
        register_agent(&client, &config, &PolecatTarget::parse(TARGET).unwrap()).unwrap();
        assert_eq!(recover(&client, BEAD).unwrap(), ResumePoint::Idle);
    }

    #[test]
    fn test_resume_walks_the_molecule() {
        let (_, client, mol) = setup();
        assert_eq!(
            recover(&client, BEAD).unwrap(),
            ResumePoint::Next { molecule: mol.clone(), ready: vec!["a".into()] }
        );

        update(&client, &mol, "a", StepStatus::InProgress).unwrap();
        // Crash here: the in-progress step is where we pick up
        assert_eq!(
            recover_target(&client, &EngineConfig::default(), TARGET).unwrap(),
            ResumePoint::Resume { molecule: mol.clone(), step: "a".into() }
        );

        update(&client, &mol, "a", StepStatus::Closed).unwrap();
        update(&client, &mol, "b", StepStatus::InProgress).unwrap();
        update(&client, &mol, "b", StepStatus::Closed).unwrap();
        assert_eq!(recover(&client, BEAD).unwrap(), ResumePoint::Finished { molecule: mol });
    }

    #[test]
    fn test_skipped_step_leaves_molecule_blocked() {
        let (_, client, mol) = setup();
        update(&client, &mol, "a", StepStatus::InProgress).unwrap();
        update(&client, &mol, "a", StepStatus::Skipped).unwrap();
        assert_eq!(recover(&client, BEAD).unwrap(), ResumePoint::Blocked { molecule: mol });
    }

    #[test]
    fn test_park_and_wake() {
        let (ledger, client, mol) = setup();
        update(&client, &mol, "a", StepStatus::InProgress).unwrap();

        let pr: AwaitType = "pr-merge:42".parse().unwrap();
        let gate = park(&client, BEAD, &mol, "a", pr.clone(), Utc::now()).unwrap();
        assert_eq!(gate.waiters, vec![BEAD.to_string()]);

        let pushes = ledger.push_count();
        let again = park(&client, BEAD, &mol, "a", pr, Utc::now()).unwrap();
        assert_eq!(again.id, gate.id);
        assert_eq!(ledger.push_count(), pushes);

        assert_eq!(
            recover(&client, BEAD).unwrap(),
            ResumePoint::Parked { molecule: mol.clone(), step: "a".into(), gates: vec![gate.id.clone()] }
        );

        service::close(&client, &LogWake, &gate.id, "PR #42 merged", Utc::now()).unwrap();
        assert_eq!(
            recover(&client, BEAD).unwrap(),
            ResumePoint::Resume { molecule: mol, step: "a".into() }
        );
    }

    #[test]
    fn test_park_requires_in_progress_step() {
        let (ledger, client, mol) = setup();
        let pushes = ledger.push_count();
        let err = park(&client, BEAD, &mol, "a", AwaitType::Human, Utc::now()).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(ledger.push_count(), pushes);
    }
}
