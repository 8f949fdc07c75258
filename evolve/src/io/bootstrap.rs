//! Pre-iteration bootstrap hook.
//!
//! The loop only knows that the hook either succeeded or failed; what it does
//! is up to the caller. The stock implementation runs an executable.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::io::process::run_with_timeout;
use crate::iteration::RunPaths;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootstrapError {
    #[error("bootstrap script {} does not exist", path.display())]
    Missing { path: PathBuf },
    #[error("could not start bootstrap {}: {message}", path.display())]
    Spawn { path: PathBuf, message: String },
    #[error("bootstrap {} timed out after {timeout_secs}s", path.display())]
    TimedOut { path: PathBuf, timeout_secs: u64 },
    #[error("bootstrap {} exited with {}: {detail}", path.display(), exit_label(*code))]
    Failed {
        path: PathBuf,
        code: Option<i32>,
        detail: String,
    },
    #[error("bootstrap failed: {0}")]
    Other(String),
}

fn exit_label(code: Option<i32>) -> String {
    code.map_or_else(|| "a signal".to_string(), |code| format!("status {code}"))
}

/// What the hook gets to see about the upcoming attempt.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    /// Iteration number the attempt would commit.
    pub iteration: u32,
    pub paths: &'a RunPaths,
    pub base_dir: &'a Path,
    pub source: &'a str,
}

pub trait BootstrapHook {
    fn run_pre_iteration(&self, ctx: &HookContext<'_>) -> Result<(), BootstrapError>;
}

/// No bootstrap configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHook;

impl BootstrapHook for NoHook {
    fn run_pre_iteration(&self, _ctx: &HookContext<'_>) -> Result<(), BootstrapError> {
        Ok(())
    }
}

/// Runs an executable in the base directory before each iteration.
///
/// The child sees `EVOLVE_*` variables describing the run; any non-zero exit,
/// timeout or spawn failure fails the hook.
#[derive(Debug, Clone)]
pub struct CommandHook {
    script: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandHook {
    pub fn new(script: impl Into<PathBuf>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            script: script.into(),
            timeout,
            output_limit_bytes,
        }
    }
}

impl BootstrapHook for CommandHook {
    #[instrument(skip_all, fields(script = %self.script.display(), iteration = ctx.iteration))]
    fn run_pre_iteration(&self, ctx: &HookContext<'_>) -> Result<(), BootstrapError> {
        let script = absolute(&self.script);
        if !script.is_file() {
            return Err(BootstrapError::Missing { path: script });
        }

        let mut cmd = Command::new(&script);
        cmd.current_dir(ctx.base_dir)
            .env("EVOLVE_ITERATION", ctx.iteration.to_string())
            .env("EVOLVE_DESIRES_PATH", absolute(&ctx.paths.desires))
            .env("EVOLVE_LEDGER_PATH", absolute(&ctx.paths.ledger))
            .env("EVOLVE_STATE_PATH", absolute(&ctx.paths.state))
            .env("EVOLVE_SESSION_LOG_PATH", absolute(&ctx.paths.session_log))
            .env("EVOLVE_BASE_DIR", ctx.base_dir)
            .env("EVOLVE_SOURCE", ctx.source);

        info!("running bootstrap");
        let output = run_with_timeout(cmd, self.timeout, self.output_limit_bytes).map_err(
            |err| BootstrapError::Spawn {
                path: script.clone(),
                message: format!("{err:#}"),
            },
        )?;
        debug!(
            stdout = %String::from_utf8_lossy(&output.stdout),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "bootstrap output"
        );

        if output.timed_out {
            return Err(BootstrapError::TimedOut {
                path: script,
                timeout_secs: self.timeout.as_secs(),
            });
        }
        if !output.status.success() {
            return Err(BootstrapError::Failed {
                path: script,
                code: output.status.code(),
                detail: output.diagnostic(3),
            });
        }
        Ok(())
    }
}

/// Run paths are handed over absolute: the child starts in the base
/// directory, not in our working directory.
fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
