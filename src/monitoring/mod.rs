//! Monitoring Module
//!
//! What the engine reports outward.
//!
//! # Components
//!
//! - [`record`]: Run records per plugin execution and finished instance
//! - [`notify`]: Escalation of repeated plugin failures
//! - [`witness`]: Worker health survey over the ledger

pub mod notify;
pub mod record;
pub mod witness;

pub use notify::{LogNotifier, Notification, Notifier, Severity};
pub use record::{LogRecords, MemoryRecords, RecordKind, RecordSink, RunRecord};
pub use witness::{survey, WitnessReport, WorkerCheck, WorkerHealth};
