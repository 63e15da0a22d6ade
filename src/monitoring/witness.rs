//! Witness Survey
//!
//! Periodic health check over every agent bead. Each worker is classified
//! from ledger state alone, the same way a restarted worker would find its
//! position:
//! - `Idle`: nothing attached
//! - `Working`: has an in-progress step or a ready one to take
//! - `Parked`: in-progress step waits on open gates
//! - `Stalled`: in-progress step older than the stall threshold with no
//!   gate, or attached work that cannot advance
//! - `Done`: exit step closed, waiting to be archived or squashed

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;

use crate::agent::recovery::{resume_point, ResumePoint};
use crate::ledger::LedgerState;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    Idle,
    Working,
    Parked,
    Stalled,
    Done,
}

impl fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerHealth::Idle => "idle",
            WorkerHealth::Working => "working",
            WorkerHealth::Parked => "parked",
            WorkerHealth::Stalled => "stalled",
            WorkerHealth::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkerCheck {
    pub bead: String,
    pub health: WorkerHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub molecule: Option<String>,
    /// Human-readable detail
    pub detail: String,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct WitnessReport {
    pub checked: usize,
    pub idle: usize,
    pub working: usize,
    pub parked: usize,
    pub stalled: usize,
    pub done: usize,
    pub checks: Vec<WorkerCheck>,
}

impl WitnessReport {
    pub fn stalled(&self) -> impl Iterator<Item = &WorkerCheck> {
        self.checks
            .iter()
            .filter(|c| c.health == WorkerHealth::Stalled)
    }
}

/// Classifies every agent bead in `state`.
pub fn survey(state: &LedgerState, now: DateTime<Utc>, stale_after: Duration) -> WitnessReport {
    let stale_after = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
    let mut report = WitnessReport::default();

    for bead in state.beads.values() {
        let check = classify(state, &bead.id, now, stale_after);
        match check.health {
            WorkerHealth::Idle => report.idle += 1,
            WorkerHealth::Working => report.working += 1,
            WorkerHealth::Parked => report.parked += 1,
            WorkerHealth::Stalled => {
                warn!("Worker {} looks stalled: {}", check.bead, check.detail);
                report.stalled += 1
            }
            WorkerHealth::Done => report.done += 1,
        }
        report.checks.push(check);
    }

    report.checked = report.checks.len();
    debug!(
        "Witness checked {} workers: {} parked, {} stalled",
        report.checked, report.parked, report.stalled
    );
    report
}

fn classify(
    state: &LedgerState,
    bead_id: &str,
    now: DateTime<Utc>,
    stale_after: chrono::Duration,
) -> WorkerCheck {
    let check = |health, molecule: Option<&str>, detail: String| WorkerCheck {
        bead: bead_id.to_string(),
        health,
        molecule: molecule.map(str::to_string),
        detail,
    };

    let point = match resume_point(state, bead_id) {
        Ok(point) => point,
        Err(e) => return check(WorkerHealth::Stalled, None, e.to_string()),
    };

    match point {
        ResumePoint::Idle => check(WorkerHealth::Idle, None, "nothing attached".to_string()),
        ResumePoint::Finished { molecule } => {
            check(WorkerHealth::Done, Some(molecule.as_str()), "exit step closed".to_string())
        }
        ResumePoint::Parked { molecule, step, gates } => check(
            WorkerHealth::Parked,
            Some(molecule.as_str()),
            format!("{} waits on {}", step, gates.join(", ")),
        ),
        ResumePoint::Next { molecule, ready } => check(
            WorkerHealth::Working,
            Some(molecule.as_str()),
            format!("ready: {}", ready.join(", ")),
        ),
        ResumePoint::Blocked { molecule } => check(
            WorkerHealth::Stalled,
            Some(molecule.as_str()),
            "no step in progress and none ready".to_string(),
        ),
        ResumePoint::Resume { molecule, step } => {
            let started = state
                .molecules
                .get(&molecule)
                .and_then(|m| m.get_step(&step))
                .and_then(|s| s.started_at);
            match started {
                Some(at) if now.signed_duration_since(at) >= stale_after => check(
                    WorkerHealth::Stalled,
                    Some(molecule.as_str()),
                    format!("{} in progress since {}", step, at.to_rfc3339()),
                ),
                _ => check(WorkerHealth::Working, Some(molecule.as_str()), format!("on {}", step)),
            }
        }
    }
}
