//! Agent Beads
//!
//! A bead is a worker's identity and assignment slot in the ledger. It holds
//! at most one attachment at a time.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BeadStatus {
    Open,
    /// Authoritative current attachment target
    Pinned,
    Deferred,
    Closed,
}

impl fmt::Display for BeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BeadStatus::Open => "open",
            BeadStatus::Pinned => "pinned",
            BeadStatus::Deferred => "deferred",
            BeadStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Attachment metadata.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub molecule: String,
    pub attached_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AgentBead {
    pub id: String,
    pub title: String,
    pub status: BeadStatus,

    /// Target string of the worker that owns this slot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,

    pub created_at: DateTime<Utc>,
}

impl AgentBead {
    pub fn new(id: impl Into<String>, assignee: impl Into<String>, now: DateTime<Utc>) -> Self {
        let assignee = assignee.into();
        Self {
            id: id.into(),
            title: format!("Agent {}", assignee),
            status: BeadStatus::Open,
            assignee: Some(assignee),
            attachment: None,
            created_at: now,
        }
    }

    pub fn attached_molecule(&self) -> Option<&str> {
        self.attachment.as_ref().map(|a| a.molecule.as_str())
    }
}
