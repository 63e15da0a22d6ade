//! Gate Subsystem
//!
//! Named asynchronous wait conditions bridging worker loops to external
//! events.
//!
//! - [`await_type`]: Tagged wait condition, parsed once
//! - [`model`]: Gate record and its one-way open -> closed lifecycle
//! - [`service`]: Ledger-backed create/close/sweep
//! - [`wake`]: Best-effort wake delivery to waiters

pub mod await_type;
pub mod model;
pub mod service;
pub mod wake;

pub use await_type::AwaitType;
pub use model::{CloseOutcome, Gate, GateStatus, StepRef};
pub use service::GateRequest;
pub use wake::{ChannelWake, LogWake, WakeSignal, WakeSink};
