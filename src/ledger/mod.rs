//! Ledger Collaborator
//!
//! The shared, persisted record store every process coordinates through.
//! Storage and transport belong to the ledger; this crate only relies on a
//! pull/push contract with revision checks:
//!
//! 1. pull the latest state
//! 2. compute the intended change
//! 3. push; if the revision moved, pull again and reapply
//!
//! There is no cross-process locking. Replays are safe because every
//! mutation in this crate is idempotent when reapplied to fresher state.

pub mod file;
pub mod memory;
pub mod state;

use std::sync::Arc;

use log::debug;
use thiserror::Error;

use crate::error::Result;

pub use file::FileLedger;
pub use memory::MemoryLedger;
pub use state::{BeadFilter, GateFilter, LedgerState, StepFilter};

/// Errors raised by ledger implementations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Push rejected because someone else pushed since our pull.
    #[error("push conflict: pulled at revision {base}, ledger is at {current}")]
    Conflict { base: u64, current: u64 },

    #[error("gave up after {attempts} conflicting push attempts")]
    RetriesExhausted { attempts: usize },

    #[error("ledger data is corrupt: {0}")]
    Corrupt(String),

    #[error("ledger IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pull/push access to a shared ledger.
pub trait Ledger: Send + Sync {
    /// Returns the latest state.
    fn pull(&self) -> std::result::Result<LedgerState, LedgerError>;

    /// Stores `state` if the ledger is still at `state.revision`.
    ///
    /// Returns the new revision.
    fn push(&self, state: &LedgerState) -> std::result::Result<u64, LedgerError>;
}

/// Ledger handle carrying the conflict retry policy.
#[derive(Clone)]
pub struct LedgerClient {
    ledger: Arc<dyn Ledger>,
    retries: usize,
}

impl LedgerClient {
    pub fn new(ledger: Arc<dyn Ledger>, retries: usize) -> Self {
        Self {
            ledger,
            retries: retries.max(1),
        }
    }

    /// Latest state, for read-only queries.
    pub fn read(&self) -> Result<LedgerState> {
        Ok(self.ledger.pull()?)
    }

    /// Runs `apply` against fresh state and pushes the result.
    ///
    /// On a push conflict the state is pulled again and `apply` reapplied,
    /// up to the retry bound. If `apply` leaves the state unchanged nothing
    /// is pushed. Errors from `apply` abort without pushing.
    pub fn transact<T, F>(&self, mut apply: F) -> Result<T>
    where
        F: FnMut(&mut LedgerState) -> Result<T>,
    {
        for attempt in 1..=self.retries {
            let base = self.ledger.pull()?;
            let mut working = base.clone();
            let value = apply(&mut working)?;

            if working == base {
                return Ok(value);
            }

            match self.ledger.push(&working) {
                Ok(revision) => {
                    debug!("Pushed ledger revision {}", revision);
                    return Ok(value);
                }
                Err(LedgerError::Conflict { base, current }) => {
                    debug!(
                        "Push conflict on attempt {} (base {}, current {}), reapplying",
                        attempt, base, current
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(LedgerError::RetriesExhausted {
            attempts: self.retries,
        }
        .into())
    }
}
