//! Gate Data Model
//!
//! A gate is a named wait condition. It starts `open` and moves to `closed`
//! exactly once; the reason given by that first close is kept forever.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::await_type::AwaitType;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Open,
    Closed,
}

/// A step held up by a gate.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepRef {
    pub molecule: String,
    pub step: String,
}

/// Result of a close request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// This call closed the gate
    Closed,
    /// The gate was already closed; nothing changed
    AlreadyClosed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Gate {
    pub id: String,
    pub await_type: AwaitType,
    pub status: GateStatus,

    /// Reason recorded by the first close
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Addresses woken when the gate closes
    #[serde(default)]
    pub waiters: Vec<String>,

    /// Creator, e.g. `plugin:<name>` for cooldown gates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// Step parked on this gate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocks: Option<StepRef>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl Gate {
    pub fn new(
        id: impl Into<String>,
        await_type: AwaitType,
        waiters: Vec<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut gate = Self {
            id: id.into(),
            await_type,
            status: GateStatus::Open,
            reason: None,
            waiters: Vec::with_capacity(waiters.len()),
            owner: None,
            blocks: None,
            created_at,
            closed_at: None,
        };
        for waiter in waiters {
            gate.add_waiter(waiter);
        }
        gate
    }

    pub fn is_open(&self) -> bool {
        self.status == GateStatus::Open
    }

    /// Closes the gate. Later closes leave the first reason in place.
    pub fn close(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> CloseOutcome {
        if self.status == GateStatus::Closed {
            return CloseOutcome::AlreadyClosed;
        }
        self.status = GateStatus::Closed;
        self.reason = Some(reason.into());
        self.closed_at = Some(now);
        CloseOutcome::Closed
    }

    /// Adds a waiter unless already registered.
    pub fn add_waiter(&mut self, waiter: impl Into<String>) {
        let waiter = waiter.into();
        if !self.waiters.contains(&waiter) {
            self.waiters.push(waiter);
        }
    }

    /// Instant a time-based gate closes itself.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.await_type.deadline(self.created_at)
    }

    /// True once a time-based gate's deadline has been reached.
    pub fn has_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.deadline().map_or(false, |deadline| now >= deadline)
    }
}
