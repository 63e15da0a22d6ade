//! Agent Module
//!
//! Worker identities and their work:
//! - [`target`]: `<scope>/polecats/<name>` addressing
//! - [`bead`]: Identity/assignment slot record
//! - [`attach`]: Idempotent attach/pin protocol
//! - [`recovery`]: Resume position after a restart, and parking on gates

pub mod attach;
pub mod bead;
pub mod recovery;
pub mod target;

pub use attach::{attach, attach_work_molecule, detach, pin, register_agent, AttachOutcome};
pub use bead::{AgentBead, Attachment, BeadStatus};
pub use recovery::{park, recover, recover_target, resume_point, ResumePoint};
pub use target::PolecatTarget;
