//! File-backed ledger.
//!
//! Stores the whole state as one JSON document. Pushes hold an exclusive
//! lock on `<ledger>.lock` from the revision check until the new document is
//! renamed into place, so concurrent processes serialize on the check and
//! the loser sees a `Conflict`. Writes go to a uniquely named temporary file
//! in the same directory, so readers never observe a half-written ledger and
//! pulls need no lock.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use log::{debug, info};
use tempfile::NamedTempFile;

use super::{Ledger, LedgerError, LedgerState};

#[derive(Debug, Clone)]
pub struct FileLedger {
    path: PathBuf,
}

impl FileLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the advisory lock file next to the ledger.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".lock");
        PathBuf::from(name)
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    fn ensure_dir(&self) -> Result<(), LedgerError> {
        let dir = self.dir();
        if !dir.exists() {
            fs::create_dir_all(dir)?;
            info!("Created ledger directory: {}", dir.display());
        }
        Ok(())
    }

    /// Blocks until this process holds the push lock. Released on drop.
    fn lock(&self) -> Result<File, LedgerError> {
        self.ensure_dir()?;
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path())?;
        lock.lock_exclusive()?;
        Ok(lock)
    }

    fn read_state(&self) -> Result<LedgerState, LedgerError> {
        if !self.path.exists() {
            debug!("Ledger {} does not exist yet, starting empty", self.path.display());
            return Ok(LedgerState::default());
        }
        let content = fs::read_to_string(&self.path)?;
        serde_json::from_str(&content).map_err(|e| {
            LedgerError::Corrupt(format!("{}: {}", self.path.display(), e))
        })
    }

    fn write_atomic(&self, state: &LedgerState) -> Result<(), LedgerError> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| LedgerError::Corrupt(e.to_string()))?;

        let mut tmp = NamedTempFile::new_in(self.dir())?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| LedgerError::Io(e.error))?;
        Ok(())
    }
}

impl Ledger for FileLedger {
    fn pull(&self) -> Result<LedgerState, LedgerError> {
        self.read_state()
    }

    fn push(&self, state: &LedgerState) -> Result<u64, LedgerError> {
        let _lock = self.lock()?;

        let current = self.read_state()?.revision;
        if current != state.revision {
            return Err(LedgerError::Conflict {
                base: state.revision,
                current,
            });
        }

        let mut next = state.clone();
        next.revision += 1;
        self.write_atomic(&next)?;
        debug!("Wrote ledger {} at revision {}", self.path.display(), next.revision);
        Ok(next.revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerClient;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_empty_state() {
        let dir = tempdir().unwrap();
        let ledger = FileLedger::new(dir.path().join("ledger.json"));
        let state = ledger.pull().unwrap();
        assert_eq!(state, LedgerState::default());
    }

    #[test]
    fn test_push_persists_and_bumps_revision() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested");
        let ledger = FileLedger::new(nested.join("ledger.json"));

        let mut state = ledger.pull().unwrap();
        state.next_id("mol");
        assert_eq!(ledger.push(&state).unwrap(), 1);

        // A second handle on the same file sees the write
        let reopened = FileLedger::new(ledger.path());
        let loaded = reopened.pull().unwrap();
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.sequence, 1);

        // Only the ledger and its lock file remain
        let mut names: Vec<_> = fs::read_dir(&nested)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["ledger.json", "ledger.json.lock"]);
    }

    #[test]
    fn test_stale_push_conflicts() {
        let dir = tempdir().unwrap();
        let ledger = FileLedger::new(dir.path().join("ledger.json"));

        let stale = ledger.pull().unwrap();
        ledger.push(&ledger.pull().unwrap()).unwrap();

        assert!(matches!(
            ledger.push(&stale),
            Err(LedgerError::Conflict { base: 0, current: 1 })
        ));
    }

    #[test]
    fn test_concurrent_writers_lose_no_updates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        // Each thread is a separate handle, like a separate worker process
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let client = LedgerClient::new(Arc::new(FileLedger::new(&path)), 256);
                thread::spawn(move || {
                    for _ in 0..25 {
                        client.transact(|state| Ok(state.next_id("mol"))).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let state = FileLedger::new(&path).pull().unwrap();
        assert_eq!(state.sequence, 200);
        assert_eq!(state.revision, 200);
    }

    #[test]
    fn test_lock_path_sits_next_to_ledger() {
        let ledger = FileLedger::new("/var/lib/molegate/ledger.json");
        assert_eq!(ledger.lock_path(), PathBuf::from("/var/lib/molegate/ledger.json.lock"));
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(FileLedger::new(&path).pull(), Err(LedgerError::Corrupt(_))));
    }
}
