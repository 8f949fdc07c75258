//! Scripted collaborators and a throwaway workspace for loop tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::core::types::StateSnapshot;
use crate::io::bootstrap::{BootstrapError, BootstrapHook, HookContext};
use crate::io::model::{ModelClient, ModelRequest, TransportError};
use crate::io::session_log::{SessionLog, SessionRecord};
use crate::io::state_store::StateStore;
use crate::iteration::RunPaths;

/// Model client that replays canned replies in order and remembers prompts.
///
/// Once the script runs out every call fails with a connect error.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    replies: RefCell<VecDeque<Result<String, TransportError>>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<String, TransportError>>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    /// Successful replies with the given raw texts.
    pub fn replying(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|text| Ok(text.to_string())).collect())
    }

    pub fn calls(&self) -> usize {
        self.prompts.borrow().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl ModelClient for ScriptedModel {
    fn invoke(&self, request: &ModelRequest<'_>) -> Result<String, TransportError> {
        self.prompts.borrow_mut().push(request.prompt.to_string());
        self.replies
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| {
                Err(TransportError::Connect {
                    url: "scripted://model".to_string(),
                    message: "no scripted reply left".to_string(),
                })
            })
    }
}

/// Bootstrap hook with scripted results; succeeds once the script is used up.
#[derive(Debug, Default)]
pub struct ScriptedHook {
    results: RefCell<VecDeque<Result<(), BootstrapError>>>,
    seen: RefCell<Vec<u32>>,
}

impl ScriptedHook {
    pub fn new(results: Vec<Result<(), BootstrapError>>) -> Self {
        Self {
            results: RefCell::new(results.into()),
            seen: RefCell::new(Vec::new()),
        }
    }

    /// Iteration numbers the hook was called for, in order.
    pub fn iterations_seen(&self) -> Vec<u32> {
        self.seen.borrow().clone()
    }
}

impl BootstrapHook for ScriptedHook {
    fn run_pre_iteration(&self, ctx: &HookContext<'_>) -> Result<(), BootstrapError> {
        self.seen.borrow_mut().push(ctx.iteration);
        self.results.borrow_mut().pop_front().unwrap_or(Ok(()))
    }
}

/// Temporary base directory with all run files inside it.
///
/// Layout: `work/desires.md`, `work/ledger.md`, `work/state.json`,
/// `work/session.jsonl`. Only the desires file exists up front.
pub struct Workspace {
    temp: TempDir,
    paths: RunPaths,
}

impl Workspace {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp dir")?;
        let work = temp.path().join("work");
        fs::create_dir(&work).context("create work dir")?;
        let paths = RunPaths::new(
            work.join("desires.md"),
            work.join("ledger.md"),
            work.join("state.json"),
            work.join("session.jsonl"),
        );
        Ok(Self { temp, paths })
    }

    pub fn with_desires(text: &str) -> Result<Self> {
        let ws = Self::new()?;
        fs::write(&ws.paths.desires, text).context("write desires")?;
        Ok(ws)
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    /// The sandbox root.
    pub fn base(&self) -> &Path {
        self.paths.base_dir()
    }

    /// Directory above the base, for checking that nothing escaped.
    pub fn outer(&self) -> &Path {
        self.temp.path()
    }

    pub fn read(&self, relative: &str) -> String {
        fs::read_to_string(self.base().join(relative)).expect("read workspace file")
    }

    /// File bytes, or empty when it does not exist.
    pub fn read_bytes(&self, path: &Path) -> Vec<u8> {
        fs::read(path).unwrap_or_default()
    }

    pub fn desires(&self) -> String {
        fs::read_to_string(&self.paths.desires).expect("read desires")
    }

    pub fn ledger(&self) -> String {
        fs::read_to_string(&self.paths.ledger).unwrap_or_default()
    }

    pub fn state(&self) -> StateSnapshot {
        StateStore::new(&self.paths.state).load().expect("load state")
    }

    pub fn session_records(&self) -> Vec<SessionRecord> {
        SessionLog::new(&self.paths.session_log)
            .read_records()
            .expect("read session log")
    }

    /// Relative paths of every entry below the outer temp dir, sorted.
    pub fn tree(&self) -> Vec<String> {
        let mut out = Vec::new();
        walk(self.outer(), self.outer(), &mut out);
        out.sort();
        out
    }
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if let Ok(relative) = path.strip_prefix(root) {
            out.push(relative.to_string_lossy().replace('\\', "/"));
        }
        if path.is_dir() && !path.is_symlink() {
            walk(root, &path, out);
        }
    }
}
