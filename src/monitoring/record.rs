//! Run Records
//!
//! Structured record emitted for every plugin execution and for every
//! instance that reaches its exit step. Records go to a [`RecordSink`];
//! the ledger itself only keeps digests.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

/// What produced a record.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Plugin,
    Molecule,
    Wisp,
}

/// Condensed outcome of one run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub kind: RecordKind,
    /// Plugin name or instance id
    pub source: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub success: bool,
    pub summary: String,
    /// Digest appended to the ledger for this run, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(
        kind: RecordKind,
        source: impl Into<String>,
        success: bool,
        summary: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            source: source.into(),
            labels: Vec::new(),
            success,
            summary: summary.into(),
            digest: None,
            timestamp,
        }
    }

    pub fn with_labels(mut self, labels: &[String]) -> Self {
        self.labels = labels.to_vec();
        self
    }

    pub fn with_digest(mut self, digest_id: impl Into<String>) -> Self {
        self.digest = Some(digest_id.into());
        self
    }
}

/// Consumer of run records (monitoring, mail, dashboards).
pub trait RecordSink: Send + Sync {
    fn record(&self, record: &RunRecord);
}

/// Writes each record to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRecords;

impl RecordSink for LogRecords {
    fn record(&self, record: &RunRecord) {
        let labels = if record.labels.is_empty() {
            String::new()
        } else {
            format!(" [{}]", record.labels.join(","))
        };
        if record.success {
            info!("Run {}{}: {}", record.source, labels, record.summary);
        } else {
            warn!("Run {}{} failed: {}", record.source, labels, record.summary);
        }
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryRecords {
    records: Mutex<Vec<RunRecord>>,
}

impl MemoryRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    pub fn records(&self) -> Vec<RunRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl RecordSink for MemoryRecords {
    fn record(&self, record: &RunRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record.clone()),
            Err(poisoned) => poisoned.into_inner().push(record.clone()),
        }
    }
}
