//! Plugin Module
//!
//! Periodic check routines run under cooldown gates.
//!
//! - [`spec`]: YAML plugin declarations
//! - [`runner`]: Claim, execute and record each tick
//! - [`poller`]: Built-in plugin closing external gates

pub mod poller;
pub mod runner;
pub mod spec;

pub use poller::{ConditionSource, ConditionState, FileConditions, GatePoller, GATE_POLLER};
pub use runner::{
    Plugin, PluginContext, PluginFuture, PluginOutcome, PluginRunner, PluginState, TickReport,
};
pub use spec::{load_dir, PluginSpec};
