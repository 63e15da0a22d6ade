//! Gate Operations
//!
//! Ledger-backed create/close for gates. Every close, including a repeated
//! one, wakes all waiters after the ledger write lands.

use chrono::{DateTime, Utc};
use log::{debug, info};

use super::await_type::AwaitType;
use super::model::{CloseOutcome, Gate, GateStatus, StepRef};
use super::wake::WakeSink;
use crate::error::Result;
use crate::ledger::{GateFilter, LedgerClient};

/// Parameters for a new gate.
#[derive(Debug, Clone)]
pub struct GateRequest {
    pub await_type: AwaitType,
    pub waiters: Vec<String>,
    pub owner: Option<String>,
    pub blocks: Option<StepRef>,
}

impl GateRequest {
    pub fn new(await_type: AwaitType) -> Self {
        Self {
            await_type,
            waiters: Vec::new(),
            owner: None,
            blocks: None,
        }
    }

    pub fn waiter(mut self, waiter: impl Into<String>) -> Self {
        self.waiters.push(waiter.into());
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn blocking(mut self, step: StepRef) -> Self {
        self.blocks = Some(step);
        self
    }
}

/// Builds an open gate inside an ongoing transaction.
pub(crate) fn insert_gate(
    state: &mut crate::ledger::LedgerState,
    request: &GateRequest,
    now: DateTime<Utc>,
) -> Gate {
    let id = state.next_id("gate");
    let mut gate = Gate::new(id, request.await_type.clone(), request.waiters.clone(), now);
    gate.owner = request.owner.clone();
    gate.blocks = request.blocks.clone();
    state.gates.insert(gate.id.clone(), gate.clone());
    gate
}

/// Closes the open gates parked on steps of `molecule_id` inside an ongoing
/// transaction. Returns the ids closed.
pub(crate) fn close_blocking(
    state: &mut crate::ledger::LedgerState,
    molecule_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut closed = Vec::new();
    for gate in state.gates.values_mut() {
        let parked_here = gate.blocks.as_ref().map_or(false, |b| b.molecule == molecule_id);
        if parked_here && gate.close(reason, now) == CloseOutcome::Closed {
            closed.push(gate.id.clone());
        }
    }
    closed
}

/// Creates an open gate.
pub fn create(client: &LedgerClient, request: GateRequest, now: DateTime<Utc>) -> Result<Gate> {
    let gate = client.transact(|state| Ok(insert_gate(state, &request, now)))?;
    info!("Created gate {} awaiting {}", gate.id, gate.await_type);
    Ok(gate)
}

/// Closes a gate and wakes its waiters.
///
/// Only the first close records `reason`; later calls change nothing in the
/// ledger but still deliver wakes.
pub fn close(
    client: &LedgerClient,
    wake: &dyn WakeSink,
    gate_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<CloseOutcome> {
    let (outcome, gate) = client.transact(|state| {
        let gate = state.gate_mut(gate_id)?;
        let outcome = gate.close(reason, now);
        Ok((outcome, gate.clone()))
    })?;

    match outcome {
        CloseOutcome::Closed => info!("Closed gate {}: {}", gate.id, reason),
        CloseOutcome::AlreadyClosed => debug!(
            "Gate {} already closed ({}), ignoring reason '{}'",
            gate.id,
            gate.reason.as_deref().unwrap_or(""),
            reason
        ),
    }

    deliver_wakes(wake, &gate);
    Ok(outcome)
}

/// Closes every open time-based gate whose deadline has passed.
///
/// Returns the ids closed by this call.
pub fn sweep_elapsed(
    client: &LedgerClient,
    wake: &dyn WakeSink,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let closed = client.transact(|state| {
        let mut closed = Vec::new();
        for gate in state.gates.values_mut() {
            if gate.is_open() && gate.await_type.is_self_closing() && gate.has_elapsed(now) {
                let reason = match gate.await_type {
                    AwaitType::Cooldown { .. } => "cooldown elapsed",
                    _ => "timer elapsed",
                };
                gate.close(reason, now);
                closed.push(gate.clone());
            }
        }
        Ok(closed)
    })?;

    for gate in &closed {
        info!("Gate {} self-closed: {}", gate.id, gate.await_type);
        deliver_wakes(wake, gate);
    }
    Ok(closed.into_iter().map(|g| g.id).collect())
}

/// Authoritative status read.
pub fn status(client: &LedgerClient, gate_id: &str) -> Result<GateStatus> {
    Ok(client.read()?.gate(gate_id)?.status)
}

/// Open gates whose await type is evaluated by an external system.
pub fn open_external(client: &LedgerClient) -> Result<Vec<Gate>> {
    let state = client.read()?;
    Ok(state
        .gates(&GateFilter {
            status: Some(GateStatus::Open),
            ..Default::default()
        })
        .into_iter()
        .filter(|g| g.await_type.is_external())
        .cloned()
        .collect())
}

fn deliver_wakes(wake: &dyn WakeSink, gate: &Gate) {
    for waiter in &gate.waiters {
        wake.wake(&gate.id, waiter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::wake::{ChannelWake, WakeSignal};
    use crate::ledger::MemoryLedger;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn client() -> (Arc<MemoryLedger>, LedgerClient) {
        let ledger = Arc::new(MemoryLedger::new());
        (ledger.clone(), LedgerClient::new(ledger, 4))
    }

    #[test]
    fn test_pr_merge_scenario() {
        let (_, client) = client();
        let (wake, mut rx) = ChannelWake::new();

        let gate = create(
            &client,
            GateRequest::new("pr-merge:42".parse().unwrap())
                .waiter("gt-gastown-polecat-Toast")
                .waiter("mayor"),
            t0(),
        )
        .unwrap();
        assert_eq!(status(&client, &gate.id).unwrap(), GateStatus::Open);

        let outcome = close(&client, &wake, &gate.id, "PR #42 merged", t0()).unwrap();
        assert_eq!(outcome, CloseOutcome::Closed);

        let mut woken = vec![rx.try_recv().unwrap(), rx.try_recv().unwrap()];
        woken.sort_by(|a, b| a.waiter.cmp(&b.waiter));
        assert_eq!(
            woken,
            vec![
                WakeSignal { gate_id: gate.id.clone(), waiter: "gt-gastown-polecat-Toast".into() },
                WakeSignal { gate_id: gate.id.clone(), waiter: "mayor".into() },
            ]
        );

        let again = close(&client, &wake, &gate.id, "ignored", t0()).unwrap();
        assert_eq!(again, CloseOutcome::AlreadyClosed);

        let state = client.read().unwrap();
        let stored = state.gate(&gate.id).unwrap();
        assert_eq!(stored.status, GateStatus::Closed);
        assert_eq!(stored.reason.as_deref(), Some("PR #42 merged"));
    }

    #[test]
    fn test_repeated_close_does_not_push() {
        let (ledger, client) = client();
        let (wake, mut rx) = ChannelWake::new();
        let gate = create(&client, GateRequest::new(AwaitType::Human).waiter("w"), t0()).unwrap();

        close(&client, &wake, &gate.id, "done", t0()).unwrap();
        let pushes = ledger.push_count();
        close(&client, &wake, &gate.id, "again", t0()).unwrap();

        assert_eq!(ledger.push_count(), pushes);
        // Both closes woke the waiter
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_close_unknown_gate() {
        let (_, client) = client();
        let (wake, _rx) = ChannelWake::new();
        assert!(close(&client, &wake, "gate-404", "x", t0()).is_err());
    }

    #[test]
    fn test_sweep_closes_only_elapsed_time_gates() {
        let (_, client) = client();
        let (wake, _rx) = ChannelWake::new();

        let cooldown = create(
            &client,
            GateRequest::new(AwaitType::Cooldown { duration: Duration::from_secs(60) }),
            t0(),
        )
        .unwrap();
        let pr = create(&client, GateRequest::new("pr-merge:1".parse().unwrap()), t0()).unwrap();

        let early = sweep_elapsed(&client, &wake, t0() + chrono::Duration::seconds(59)).unwrap();
        assert!(early.is_empty());

        let due = sweep_elapsed(&client, &wake, t0() + chrono::Duration::seconds(60)).unwrap();
        assert_eq!(due, vec![cooldown.id.clone()]);
        assert_eq!(status(&client, &pr.id).unwrap(), GateStatus::Open);

        let state = client.read().unwrap();
        assert_eq!(state.gate(&cooldown.id).unwrap().reason.as_deref(), Some("cooldown elapsed"));
    }

    #[test]
    fn test_open_external_lists_pollable_gates() {
        let (_, client) = client();
        create(&client, GateRequest::new("pr-merge:3".parse().unwrap()), t0()).unwrap();
        create(&client, GateRequest::new(AwaitType::Human), t0()).unwrap();
        create(&client, GateRequest::new("gh:run:8".parse().unwrap()), t0()).unwrap();

        let external = open_external(&client).unwrap();
        assert_eq!(external.len(), 2);
    }
}
