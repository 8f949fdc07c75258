//! Advisory lock that keeps two runs off the same state file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use thiserror::Error;
use tracing::debug;

/// Another process holds the run lock.
#[derive(Debug, Error)]
#[error("another run holds {}", path.display())]
pub struct RunLockHeldError {
    pub path: PathBuf,
}

/// Exclusive lock held for as long as the value lives.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock without waiting. Fails with [`RunLockHeldError`] when
    /// someone else has it.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("open lock file {}", path.display()))?;
        if let Err(err) = file.try_lock_exclusive() {
            if err.kind() == fs2::lock_contended_error().kind() {
                return Err(RunLockHeldError {
                    path: path.to_path_buf(),
                }
                .into());
            }
            return Err(err).with_context(|| format!("lock {}", path.display()));
        }
        debug!(path = %path.display(), "run lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json.lock");

        let first = RunLock::acquire(&path).expect("first lock");
        let err = RunLock::acquire(&path).unwrap_err();
        assert!(err.downcast_ref::<RunLockHeldError>().is_some());

        drop(first);
        RunLock::acquire(&path).expect("lock after release");
    }
}
