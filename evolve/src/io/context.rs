//! Best-effort context loading for the model prompt.
//!
//! Context is never a hard dependency: a file that cannot be read becomes an
//! explicit `Unavailable` entry and the iteration carries on.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Loaded content for one requested path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextContent {
    Available(String),
    Unavailable { reason: String },
}

/// One entry of a [`ContextBundle`], keyed by the path as the caller gave it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextEntry {
    pub requested: String,
    pub content: ContextContent,
}

/// Per-entry summary recorded in the session log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub path: String,
    pub available: bool,
    pub bytes: u64,
}

/// Ordered, read-only mapping of requested path to content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextBundle {
    entries: Vec<ContextEntry>,
}

impl ContextBundle {
    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    pub fn get(&self, requested: &str) -> Option<&ContextContent> {
        self.entries
            .iter()
            .find(|entry| entry.requested == requested)
            .map(|entry| &entry.content)
    }

    pub fn summaries(&self) -> Vec<ContextSummary> {
        self.entries
            .iter()
            .map(|entry| match &entry.content {
                ContextContent::Available(text) => ContextSummary {
                    path: entry.requested.clone(),
                    available: true,
                    bytes: text.len() as u64,
                },
                ContextContent::Unavailable { .. } => ContextSummary {
                    path: entry.requested.clone(),
                    available: false,
                    bytes: 0,
                },
            })
            .collect()
    }
}

/// Load every requested path, relative to `base_dir` unless absolute.
///
/// Order follows `requested`; a path requested twice is loaded once.
pub fn load_context(base_dir: &Path, requested: &[PathBuf]) -> ContextBundle {
    let mut entries: Vec<ContextEntry> = Vec::with_capacity(requested.len());
    for path in requested {
        let key = path.display().to_string();
        if entries.iter().any(|entry| entry.requested == key) {
            continue;
        }
        let resolved = base_dir.join(path);
        let content = match fs::read_to_string(&resolved) {
            Ok(text) => {
                debug!(path = %resolved.display(), bytes = text.len(), "context loaded");
                ContextContent::Available(text)
            }
            Err(err) => {
                warn!(path = %resolved.display(), err = %err, "context unavailable");
                ContextContent::Unavailable {
                    reason: err.to_string(),
                }
            }
        };
        entries.push(ContextEntry {
            requested: key,
            content,
        });
    }
    ContextBundle { entries }
}
