//! Shared deterministic types for the evolve loop.
//!
//! These types define stable contracts between the loop components. They do
//! not touch the filesystem; persistence lives in `io`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// A proposed file write exactly as the model stated it.
///
/// `path` is untrusted and unresolved until the change applier checks it
/// against the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub content: String,
}

/// A fully validated model proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Replacement content for the desires document.
    pub desires: String,
    /// Ordered file writes; empty when the model proposed none.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub files: Vec<FileChange>,
}

/// `null` reads the same as an absent list.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// A file committed by the change applier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedFile {
    /// Path relative to the base directory, `/`-separated.
    pub path: String,
    /// `sha256:<hex>` digest of the written content.
    pub sha256: String,
    pub bytes: u64,
}

/// What to do with the rest of the run when an iteration fails.
///
/// There is deliberately no `Default`: callers must pick one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop the run at the first failed iteration.
    Abort,
    /// Record the failure and continue with the next attempt.
    Skip,
}

impl FailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            FailurePolicy::Abort => "abort",
            FailurePolicy::Skip => "skip",
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(FailurePolicy::Abort),
            "skip" => Ok(FailurePolicy::Skip),
            other => Err(format!("unknown failure policy '{other}' (expected abort|skip)")),
        }
    }
}

/// Step of the iteration state machine where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    LoadContext,
    Invoke,
    Parse,
    Apply,
    Record,
}

/// One human-facing ledger record. Rendered by [`crate::core::ledger_block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Iteration number (1-indexed) this entry commits.
    pub iteration: u32,
    pub timestamp: String,
    pub source: String,
    pub desires_changed: bool,
    /// Paths relative to the base directory, in write order.
    pub files_changed: Vec<String>,
    pub summary: String,
}

/// Resumable loop bookkeeping, overwritten wholesale after each committed
/// iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Number of committed iterations.
    pub iteration_count: u32,
    /// Digest of the desires document as of the last committed iteration.
    pub last_desires_hash: Option<String>,
    /// Latest digest written for every path the loop has touched.
    #[serde(default)]
    pub last_applied_file_hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl StateSnapshot {
    /// Snapshot after committing one more iteration.
    pub fn advance(&self, desires_hash: String, applied: &[AppliedFile], now: String) -> Self {
        let mut hashes = self.last_applied_file_hashes.clone();
        for file in applied {
            hashes.insert(file.path.clone(), file.sha256.clone());
        }
        Self {
            iteration_count: self.iteration_count + 1,
            last_desires_hash: Some(desires_hash),
            last_applied_file_hashes: hashes,
            updated_at: Some(now),
        }
    }
}
