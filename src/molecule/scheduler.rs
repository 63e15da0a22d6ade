//! Step Scheduler
//!
//! Computes which steps are ready and guards status changes:
//! - A step is ready when it is `pending` and every step it needs is `closed`
//! - Ready steps come back in declaration order so every worker asking at
//!   the same revision picks the same next step
//! - Only `pending -> in_progress -> {closed, skipped}` is allowed
//! - Dependencies are re-checked against the freshly pulled state before a
//!   step may start or close, so a stale read cannot sneak one through

use chrono::{DateTime, Utc};
use log::{debug, info};

use super::model::{Molecule, MoleculeStatus, Step, StepStatus};
use crate::error::{Error, Result, TransitionError};
use crate::ledger::LedgerClient;

/// Whether an update changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// Step already had the requested status (a replay)
    Unchanged,
}

/// Ready steps of `molecule`, in declaration order.
pub fn ready(molecule: &Molecule) -> Vec<&Step> {
    molecule
        .steps
        .iter()
        .filter(|step| step.status == StepStatus::Pending)
        .filter(|step| open_dependencies(molecule, step).is_empty())
        .collect()
}

/// Ids of dependencies of `step` that are not yet closed.
pub fn open_dependencies(molecule: &Molecule, step: &Step) -> Vec<String> {
    step.needs
        .iter()
        .filter(|dep| {
            molecule
                .get_step(dep)
                .map_or(true, |d| d.status != StepStatus::Closed)
        })
        .cloned()
        .collect()
}

/// Applies a status change to one step of `molecule`.
pub fn apply_transition(
    molecule: &mut Molecule,
    step_id: &str,
    to: StepStatus,
    now: DateTime<Utc>,
) -> std::result::Result<Transition, TransitionError> {
    let step = molecule
        .get_step(step_id)
        .ok_or_else(|| TransitionError::UnknownStep {
            molecule: molecule.id.clone(),
            step: step_id.to_string(),
        })?;

    if step.status == to {
        return Ok(Transition::Unchanged);
    }

    if !step.status.can_transition_to(to) {
        return Err(TransitionError::Illegal {
            step: step_id.to_string(),
            from: step.status.to_string(),
            to: to.to_string(),
        });
    }

    if matches!(to, StepStatus::InProgress | StepStatus::Closed) {
        let open = open_dependencies(molecule, step);
        if !open.is_empty() {
            return Err(TransitionError::DependenciesOpen {
                step: step_id.to_string(),
                open,
            });
        }
    }

    if let Some(step) = molecule.get_step_mut(step_id) {
        step.status = to;
        match to {
            StepStatus::InProgress => step.started_at = Some(now),
            StepStatus::Closed | StepStatus::Skipped => step.finished_at = Some(now),
            StepStatus::Pending => {}
        }
    }
    Ok(Transition::Applied)
}

/// Ready steps of a stored instance.
pub fn ready_steps(client: &LedgerClient, molecule_id: &str) -> Result<Vec<Step>> {
    let state = client.read()?;
    let molecule = state.molecule(molecule_id)?;
    let steps: Vec<Step> = ready(molecule).into_iter().cloned().collect();
    debug!(
        "Molecule {} ready: {:?}",
        molecule_id,
        steps.iter().map(|s| &s.id).collect::<Vec<_>>()
    );
    Ok(steps)
}

/// Changes the status of a stored step.
pub fn update(
    client: &LedgerClient,
    molecule_id: &str,
    step_id: &str,
    to: StepStatus,
) -> Result<Transition> {
    let now = Utc::now();
    let transition = client.transact(|state| {
        let molecule = state.molecule_mut(molecule_id)?;
        if molecule.status != MoleculeStatus::Active {
            return Err(Error::InvalidState(format!(
                "molecule {} is archived",
                molecule_id
            )));
        }
        Ok(apply_transition(molecule, step_id, to, now)?)
    })?;

    match transition {
        Transition::Applied => info!("Step {}/{} -> {}", molecule_id, step_id, to),
        Transition::Unchanged => debug!("Step {}/{} already {}", molecule_id, step_id, to),
    }
    Ok(transition)
}
