//! In-memory ledger.
//!
//! Several [`LedgerClient`](super::LedgerClient)s sharing one `MemoryLedger`
//! behave like separate processes sharing a ledger: each pull is a private
//! copy and pushes are revision-checked.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{Ledger, LedgerError, LedgerState};

#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    pushes: AtomicUsize,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful pushes so far.
    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Ledger for MemoryLedger {
    fn pull(&self) -> Result<LedgerState, LedgerError> {
        Ok(self.lock().clone())
    }

    fn push(&self, state: &LedgerState) -> Result<u64, LedgerError> {
        let mut current = self.lock();
        if current.revision != state.revision {
            return Err(LedgerError::Conflict {
                base: state.revision,
                current: current.revision,
            });
        }

        let mut next = state.clone();
        next.revision += 1;
        let revision = next.revision;
        *current = next;
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(revision)
    }
}
