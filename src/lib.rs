//! Molegate - Molecule/Gate Coordination Engine
//!
//! Coordinates many independent worker processes executing multi-step work
//! against a shared, persisted ledger. Workers survive crashes by rebuilding
//! their position from the ledger, and wait on external events by parking
//! on gates instead of blocking.
//!
//! # Architecture
//!
//! - [`formula`]: Authored templates and the `cook` compiler
//! - [`molecule`]: Instances, the step scheduler and instance endings
//! - [`agent`]: Worker identities, attach/pin and crash recovery
//! - [`gate`]: Asynchronous wait conditions and wake delivery
//! - [`plugin`]: Cooldown-gated periodic checks
//! - [`ledger`]: Optimistic pull/apply/push access to shared state
//! - [`monitoring`]: Run records, escalation and the witness survey
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//!
//! use molegate::config::EngineConfig;
//! use molegate::molecule::{ready_steps, update, StepStatus};
//! use molegate::Workspace;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let workspace = Workspace::open(EngineConfig::load_or_default()?)?;
//!
//!     // Pour a persistent molecule from a library formula
//!     let mol = workspace.pour("polecat-work", &BTreeMap::new())?;
//!
//!     // Work the first ready step
//!     let step = &ready_steps(workspace.client(), &mol.id)?[0];
//!     update(workspace.client(), &mol.id, &step.id, StepStatus::InProgress)?;
//!     update(workspace.client(), &mol.id, &step.id, StepStatus::Closed)?;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod formula;
pub mod gate;
pub mod ledger;
pub mod molecule;
pub mod monitoring;
pub mod plugin;
pub mod workspace;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use formula::{cook, Formula, Protomolecule};
pub use gate::{AwaitType, Gate};
pub use ledger::{LedgerClient, LedgerState};
pub use molecule::{Molecule, Step, StepStatus};
pub use workspace::Workspace;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Molegate";
