//! Instance Endings
//!
//! Once the exit step closes, an instance ends according to its tier:
//! - Persistent molecules are archived and kept for audit
//! - Wisps are squashed into a digest or burned
//!
//! Each ending is a single ledger push, so a wisp is never left half gone,
//! and each ending releases the beads that carried the instance. Replaying
//! an ending that already happened changes nothing.

use chrono::{DateTime, Utc};
use log::{debug, info};

use super::model::{Digest, Molecule, MoleculeStatus, StepStatus, Tier};
use crate::agent::attach::release_molecule;
use crate::error::{Error, Result};
use crate::gate::service::close_blocking;
use crate::ledger::{LedgerClient, LedgerState};
use crate::monitoring::record::{RecordKind, RecordSink, RunRecord};

/// How a wisp ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WispEnd {
    /// Keep a digest; `None` derives the summary from step progress
    Squash {
        summary: Option<String>,
        labels: Vec<String>,
    },
    Burn,
}

/// What `finish` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ending {
    Archived(String),
    Squashed(Digest),
    Burned(String),
}

/// Archives a persistent molecule whose exit step is closed.
pub fn archive(client: &LedgerClient, molecule_id: &str, now: DateTime<Utc>) -> Result<Molecule> {
    let (molecule, released) = client.transact(|state| {
        let molecule = state.molecule_mut(molecule_id)?;
        if molecule.tier != Tier::Persistent {
            return Err(Error::InvalidState(format!(
                "{} is a wisp; squash or burn it instead",
                molecule_id
            )));
        }
        if molecule.status == MoleculeStatus::Archived {
            return Ok((molecule.clone(), Vec::new()));
        }
        require_exit(molecule)?;

        molecule.status = MoleculeStatus::Archived;
        molecule.archived_at = Some(now);
        let archived = molecule.clone();
        close_blocking(state, molecule_id, "molecule archived", now);
        Ok((archived, release_molecule(state, molecule_id)))
    })?;

    info!("Archived molecule {} (released {:?})", molecule.id, released);
    Ok(molecule)
}

/// Condenses a finished wisp into a digest and removes it.
pub fn squash(
    client: &LedgerClient,
    wisp_id: &str,
    summary: Option<&str>,
    labels: &[String],
    now: DateTime<Utc>,
) -> Result<Digest> {
    let digest = client.transact(|state| {
        if let Some(done) = already_squashed(state, wisp_id) {
            return Ok(done);
        }

        let wisp = take_wisp(state, wisp_id, true, now)?;
        let digest = Digest {
            id: state.next_id("digest"),
            source: wisp.id.clone(),
            labels: labels.to_vec(),
            summary: summary.map_or_else(|| condense(&wisp), str::to_string),
            created_at: now,
        };
        state.digests.push(digest.clone());
        Ok(digest)
    })?;

    info!("Squashed wisp {} into {}", wisp_id, digest.id);
    Ok(digest)
}

/// Discards a wisp without a trace. Burning a missing wisp is a no-op.
pub fn burn(client: &LedgerClient, wisp_id: &str) -> Result<()> {
    let burned = client.transact(|state| {
        if !state.molecules.contains_key(wisp_id) {
            return Ok(false);
        }
        take_wisp(state, wisp_id, false, Utc::now())?;
        Ok(true)
    })?;

    if burned {
        info!("Burned wisp {}", wisp_id);
    } else {
        debug!("Wisp {} already gone", wisp_id);
    }
    Ok(())
}

/// Ends an instance according to its tier and emits a run record.
///
/// `wisp_end` is only consulted for wisps.
pub fn finish(
    client: &LedgerClient,
    records: &dyn RecordSink,
    molecule_id: &str,
    wisp_end: WispEnd,
) -> Result<Ending> {
    let now = Utc::now();
    let state = client.read()?;

    let tier = match state.molecules.get(molecule_id) {
        Some(molecule) => molecule.tier,
        // A squashed wisp is gone but its digest remains
        None if already_squashed(&state, molecule_id).is_some() => Tier::Ephemeral,
        None => return Err(Error::not_found("molecule", molecule_id)),
    };
    let formula = state
        .molecules
        .get(molecule_id)
        .map(|m| m.formula.name.clone())
        .unwrap_or_default();

    let (ending, record) = match (tier, wisp_end) {
        (Tier::Persistent, _) => {
            let molecule = archive(client, molecule_id, now)?;
            let record = RunRecord::new(RecordKind::Molecule, &molecule.id, true, condense(&molecule), now);
            (Ending::Archived(molecule.id), record)
        }
        (Tier::Ephemeral, WispEnd::Squash { summary, labels }) => {
            let digest = squash(client, molecule_id, summary.as_deref(), &labels, now)?;
            let record = RunRecord::new(RecordKind::Wisp, molecule_id, true, digest.summary.clone(), now)
                .with_labels(&labels)
                .with_digest(&digest.id);
            (Ending::Squashed(digest), record)
        }
        (Tier::Ephemeral, WispEnd::Burn) => {
            burn(client, molecule_id)?;
            let record = RunRecord::new(RecordKind::Wisp, molecule_id, true, "burned", now);
            (Ending::Burned(molecule_id.to_string()), record)
        }
    };

    let record = if formula.is_empty() || record.labels.contains(&formula) {
        record
    } else {
        let mut labels = record.labels.clone();
        labels.push(formula);
        record.with_labels(&labels)
    };
    records.record(&record);
    Ok(ending)
}

fn require_exit(molecule: &Molecule) -> Result<()> {
    if molecule.exit_reached() {
        Ok(())
    } else {
        Err(Error::InvalidState(format!(
            "exit step {} of {} is not closed",
            molecule.exit, molecule.id
        )))
    }
}

/// Removes a wisp from the state, releases its beads and closes the gates
/// its steps were parked on.
fn take_wisp(
    state: &mut LedgerState,
    wisp_id: &str,
    finished: bool,
    now: DateTime<Utc>,
) -> Result<Molecule> {
    let wisp = state.molecule(wisp_id)?;
    if wisp.tier != Tier::Ephemeral {
        return Err(Error::InvalidState(format!(
            "{} is a persistent molecule and is never deleted",
            wisp_id
        )));
    }
    if finished {
        require_exit(wisp)?;
    }

    let reason = if finished { "wisp squashed" } else { "wisp burned" };
    let closed = close_blocking(state, wisp_id, reason, now);
    if !closed.is_empty() {
        debug!("Closed gates {:?} parked on {}", closed, wisp_id);
    }
    release_molecule(state, wisp_id);
    state
        .molecules
        .remove(wisp_id)
        .ok_or_else(|| Error::not_found("molecule", wisp_id))
}

fn already_squashed(state: &LedgerState, wisp_id: &str) -> Option<Digest> {
    if state.molecules.contains_key(wisp_id) {
        return None;
    }
    state.digests.iter().find(|d| d.source == wisp_id).cloned()
}

/// One-line progress summary, e.g. `patrol@v1: 3/3 closed`.
fn condense(molecule: &Molecule) -> String {
    let progress = molecule.progress();
    let closed = progress.get(&StepStatus::Closed).copied().unwrap_or(0);
    let skipped = progress.get(&StepStatus::Skipped).copied().unwrap_or(0);
    let mut summary = format!("{}: {}/{} closed", molecule.formula, closed, molecule.steps.len());
    if skipped > 0 {
        summary.push_str(&format!(", {} skipped", skipped));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{attach, register_agent, BeadStatus, PolecatTarget};
    use crate::config::EngineConfig;
    use crate::formula::{cook, Formula, FormulaLibrary, FormulaStep, Protomolecule};
    use crate::gate::service::{create, open_external, GateRequest};
    use crate::gate::{AwaitType, GateStatus, StepRef};
    use crate::ledger::MemoryLedger;
    use crate::molecule::pour::{pour, wisp};
    use crate::molecule::scheduler::update;
    use crate::monitoring::record::MemoryRecords;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn proto() -> Protomolecule {
        let formula = Formula::new("patrol")
            .with_step(FormulaStep::new("check", "Check"))
            .with_step(FormulaStep::new("report", "Report").needs("check"));
        cook(&formula, &FormulaLibrary::new()).unwrap()
    }

    fn client() -> (Arc<MemoryLedger>, LedgerClient) {
        let ledger = Arc::new(MemoryLedger::new());
        (ledger.clone(), LedgerClient::new(ledger, 4))
    }

    fn run_to_exit(client: &LedgerClient, id: &str) {
        for step in ["check", "report"] {
            update(client, id, step, StepStatus::InProgress).unwrap();
            update(client, id, step, StepStatus::Closed).unwrap();
        }
    }

    #[test]
    fn test_archive_requires_exit() {
        let (_, client) = client();
        let mol = pour(&client, &proto(), &BTreeMap::new()).unwrap();
        assert!(matches!(archive(&client, &mol.id, Utc::now()), Err(Error::InvalidState(_))));

        run_to_exit(&client, &mol.id);
        let archived = archive(&client, &mol.id, Utc::now()).unwrap();
        assert_eq!(archived.status, MoleculeStatus::Archived);
        assert!(client.read().unwrap().molecules.contains_key(&mol.id));
    }

    #[test]
    fn test_archive_releases_bead() {
        let (_, client) = client();
        let config = EngineConfig::default();
        let target = PolecatTarget::parse("town/polecats/ace").unwrap();
        register_agent(&client, &config, &target).unwrap();
        let mol = pour(&client, &proto(), &BTreeMap::new()).unwrap();
        attach(&client, &config, "town/polecats/ace", &mol.id).unwrap();

        run_to_exit(&client, &mol.id);
        archive(&client, &mol.id, Utc::now()).unwrap();

        let state = client.read().unwrap();
        let bead = state.bead(&target.bead_id("gt")).unwrap();
        assert!(bead.attachment.is_none());
        assert_eq!(bead.status, BeadStatus::Open);
    }

    #[test]
    fn test_squash_is_atomic_and_replayable() {
        let (ledger, client) = client();
        let w = wisp(&client, &proto(), &BTreeMap::new()).unwrap();
        run_to_exit(&client, &w.id);

        let pushes = ledger.push_count();
        let digest = squash(&client, &w.id, None, &["patrol".to_string()], Utc::now()).unwrap();
        assert_eq!(ledger.push_count(), pushes + 1);
        assert_eq!(digest.summary, "patrol@v1: 2/2 closed");

        let state = client.read().unwrap();
        assert!(!state.molecules.contains_key(&w.id));
        assert_eq!(state.digests, vec![digest.clone()]);

        let replay = squash(&client, &w.id, None, &[], Utc::now()).unwrap();
        assert_eq!(replay, digest);
        assert_eq!(ledger.push_count(), pushes + 1);
    }

    #[test]
    fn test_persistent_molecule_cannot_be_burned() {
        let (_, client) = client();
        let mol = pour(&client, &proto(), &BTreeMap::new()).unwrap();
        assert!(matches!(burn(&client, &mol.id), Err(Error::InvalidState(_))));
        assert!(client.read().unwrap().molecules.contains_key(&mol.id));
    }

    #[test]
    fn test_burn_discards_unfinished_wisp() {
        let (_, client) = client();
        let w = wisp(&client, &proto(), &BTreeMap::new()).unwrap();
        burn(&client, &w.id).unwrap();
        burn(&client, &w.id).unwrap();

        let state = client.read().unwrap();
        assert!(state.molecules.is_empty());
        assert!(state.digests.is_empty());
    }

    fn park_on(client: &LedgerClient, molecule: &str, step: &str) -> String {
        let request = GateRequest::new("pr-merge:42".parse().unwrap()).blocking(StepRef {
            molecule: molecule.to_string(),
            step: step.to_string(),
        });
        create(client, request, Utc::now()).unwrap().id
    }

    #[test]
    fn test_burn_closes_parked_gates() {
        let (_, client) = client();
        let w = wisp(&client, &proto(), &BTreeMap::new()).unwrap();
        update(&client, &w.id, "check", StepStatus::InProgress).unwrap();
        let gate = park_on(&client, &w.id, "check");
        let unrelated = create(&client, GateRequest::new(AwaitType::Human), Utc::now()).unwrap();

        burn(&client, &w.id).unwrap();

        let state = client.read().unwrap();
        assert_eq!(state.gate(&gate).unwrap().status, GateStatus::Closed);
        assert_eq!(state.gate(&gate).unwrap().reason.as_deref(), Some("wisp burned"));
        assert!(state.gate(&unrelated.id).unwrap().is_open());
        assert!(open_external(&client).unwrap().is_empty());
    }

    #[test]
    fn test_squash_and_archive_close_parked_gates() {
        let (_, client) = client();
        let w = wisp(&client, &proto(), &BTreeMap::new()).unwrap();
        let stale = park_on(&client, &w.id, "check");
        run_to_exit(&client, &w.id);
        squash(&client, &w.id, None, &[], Utc::now()).unwrap();

        let mol = pour(&client, &proto(), &BTreeMap::new()).unwrap();
        let leftover = park_on(&client, &mol.id, "report");
        run_to_exit(&client, &mol.id);
        archive(&client, &mol.id, Utc::now()).unwrap();

        let state = client.read().unwrap();
        assert_eq!(state.gate(&stale).unwrap().reason.as_deref(), Some("wisp squashed"));
        assert_eq!(state.gate(&leftover).unwrap().reason.as_deref(), Some("molecule archived"));
    }

    #[test]
    fn test_finish_emits_record_per_tier() {
        let (_, client) = client();
        let records = MemoryRecords::new();

        let mol = pour(&client, &proto(), &BTreeMap::new()).unwrap();
        run_to_exit(&client, &mol.id);
        let ending = finish(&client, &records, &mol.id, WispEnd::Burn).unwrap();
        assert_eq!(ending, Ending::Archived(mol.id.clone()));

        let w = wisp(&client, &proto(), &BTreeMap::new()).unwrap();
        run_to_exit(&client, &w.id);
        let labels = vec!["deacon".to_string()];
        let ending = finish(
            &client,
            &records,
            &w.id,
            WispEnd::Squash { summary: Some("all clear".into()), labels: labels.clone() },
        )
        .unwrap();
        assert!(matches!(ending, Ending::Squashed(ref d) if d.summary == "all clear"));

        let emitted = records.records();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].kind, RecordKind::Molecule);
        assert_eq!(emitted[1].kind, RecordKind::Wisp);
        assert_eq!(emitted[1].labels, vec!["deacon".to_string(), "patrol".to_string()]);
        assert!(emitted[1].digest.is_some());
    }
}
