//! Molecule Module
//!
//! Live workflow instances:
//! - [`model`]: Instance, step and digest records
//! - [`pour`]: Variable binding and instantiation (`pour`/`wisp`)
//! - [`scheduler`]: Ready set and guarded status transitions
//! - [`lifecycle`]: Archive, squash and burn

pub mod lifecycle;
pub mod model;
pub mod pour;
pub mod scheduler;

pub use lifecycle::{archive, burn, finish, squash, Ending, WispEnd};
pub use model::{Digest, Molecule, MoleculeStatus, Step, StepStatus, Tier};
pub use pour::{pour, wisp};
pub use scheduler::{ready, ready_steps, update, Transition};
