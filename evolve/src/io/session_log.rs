//! JSON Lines transcript of every iteration attempt.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{AppliedFile, Phase};
use crate::io::context::ContextSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Taxonomy name, e.g. `schema_error`.
    pub kind: String,
    pub phase: Phase,
    pub message: String,
}

/// One self-contained audit record per attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Iteration number this attempt would commit (`iteration_count + 1`).
    pub iteration: u32,
    /// 1-indexed attempt within the current run.
    pub attempt: u32,
    pub source: String,
    pub started_at: String,
    pub finished_at: String,
    pub duration_ms: u64,
    pub outcome: Outcome,
    pub error: Option<ErrorRecord>,
    pub context: Vec<ContextSummary>,
    pub prompt_bytes: Option<u64>,
    pub raw_response: Option<String>,
    pub desires_changed: Option<bool>,
    pub files: Vec<AppliedFile>,
}

#[derive(Debug, Clone)]
pub struct SessionLog {
    path: PathBuf,
}

impl SessionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `record` as a single line.
    pub fn append(&self, record: &SessionRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("serialize session record")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open session log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append session log {}", self.path.display()))?;
        file.sync_data()
            .with_context(|| format!("sync session log {}", self.path.display()))?;
        debug!(
            iteration = record.iteration,
            outcome = ?record.outcome,
            "session record appended"
        );
        Ok(())
    }

    /// Every record in file order. A missing log reads as empty.
    pub fn read_records(&self) -> Result<Vec<SessionRecord>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read session log {}", self.path.display()));
            }
        };
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).with_context(|| {
                    format!("parse session log {} line {}", self.path.display(), idx + 1)
                })
            })
            .collect()
    }
}
