//! Read-only summary of a run's persisted progress for `evolve status`.

use std::fmt;
use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use crate::io::ledger::LedgerStore;
use crate::io::state_store::StateStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub iteration_count: u32,
    pub ledger_entries: usize,
    pub last_desires_hash: Option<String>,
    pub tracked_files: usize,
    pub updated_at: Option<String>,
}

impl StatusReport {
    /// Ledger and state agree on how many iterations were committed.
    ///
    /// They drift apart when the state file is deleted to restart a run, or
    /// when a crash hits between the ledger append and the state save.
    pub fn is_consistent(&self) -> bool {
        self.ledger_entries == self.iteration_count as usize
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "iterations committed: {}", self.iteration_count)?;
        writeln!(f, "ledger entries: {}", self.ledger_entries)?;
        writeln!(f, "tracked files: {}", self.tracked_files)?;
        writeln!(
            f,
            "desires hash: {}",
            self.last_desires_hash.as_deref().unwrap_or("-")
        )?;
        write!(f, "updated at: {}", self.updated_at.as_deref().unwrap_or("-"))?;
        if !self.is_consistent() {
            write!(f, "\nwarning: ledger and state disagree")?;
        }
        Ok(())
    }
}

pub fn status_report(state_path: &Path, ledger_path: &Path) -> Result<StatusReport> {
    let state = StateStore::new(state_path).load()?;
    let ledger_entries = LedgerStore::new(ledger_path).count_entries()?;
    Ok(StatusReport {
        iteration_count: state.iteration_count,
        ledger_entries,
        last_desires_hash: state.last_desires_hash,
        tracked_files: state.last_applied_file_hashes.len(),
        updated_at: state.updated_at,
    })
}
