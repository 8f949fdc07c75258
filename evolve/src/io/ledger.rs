//! Append-only ledger file.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::ledger_block::{count_entries, render_block, tail_entries};
use crate::core::types::LedgerEntry;

/// Human-readable history of committed iterations.
///
/// The file is only ever opened for append; earlier blocks are never read
/// back for validation or rewritten.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &LedgerEntry) -> Result<()> {
        let block = render_block(entry);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open ledger {}", self.path.display()))?;
        file.write_all(block.as_bytes())
            .with_context(|| format!("append ledger {}", self.path.display()))?;
        file.sync_data()
            .with_context(|| format!("sync ledger {}", self.path.display()))?;
        debug!(iteration = entry.iteration, "ledger entry appended");
        Ok(())
    }

    /// The last `limit` blocks, for the prompt. Missing ledger reads as empty.
    pub fn read_tail(&self, limit: usize) -> Result<String> {
        Ok(tail_entries(&self.read()?, limit))
    }

    pub fn count_entries(&self) -> Result<usize> {
        Ok(count_entries(&self.read()?))
    }

    fn read(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err).with_context(|| format!("read ledger {}", self.path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(iteration: u32) -> LedgerEntry {
        LedgerEntry {
            iteration,
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
            source: "test".to_string(),
            desires_changed: iteration % 2 == 0,
            files_changed: vec![format!("f{iteration}.txt")],
            summary: "desires unchanged; wrote 1 file".to_string(),
        }
    }

    /// Verifies appends only extend the file: earlier bytes stay intact and
    /// entries stay in iteration order.
    #[test]
    fn appends_are_monotonic() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = LedgerStore::new(temp.path().join("ledger.md"));
        assert_eq!(ledger.count_entries().expect("count"), 0);

        ledger.append(&entry(1)).expect("append 1");
        let after_one = fs::read(ledger.path()).expect("read");
        ledger.append(&entry(2)).expect("append 2");
        ledger.append(&entry(3)).expect("append 3");
        let after_three = fs::read(ledger.path()).expect("read");

        assert!(after_three.starts_with(&after_one));
        assert_eq!(ledger.count_entries().expect("count"), 3);
        let text = String::from_utf8(after_three).expect("utf8");
        let first = text.find("## Iteration 1").expect("1");
        let second = text.find("## Iteration 2").expect("2");
        let third = text.find("## Iteration 3").expect("3");
        assert!(first < second && second < third);
    }

    #[test]
    fn keeps_existing_content() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("ledger.md");
        fs::write(&path, "# Ledger\n\n").expect("write");
        let ledger = LedgerStore::new(&path);

        ledger.append(&entry(1)).expect("append");
        let text = fs::read_to_string(&path).expect("read");
        assert!(text.starts_with("# Ledger\n\n## Iteration 1\n"));
    }

    #[test]
    fn tail_returns_latest_blocks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = LedgerStore::new(temp.path().join("ledger.md"));
        assert_eq!(ledger.read_tail(3).expect("empty tail"), "");

        for i in 1..=4 {
            ledger.append(&entry(i)).expect("append");
        }
        let tail = ledger.read_tail(1).expect("tail");
        assert!(tail.starts_with("## Iteration 4"));
        assert!(tail.contains("f4.txt"));
    }
}
