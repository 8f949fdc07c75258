//! Sandboxed, all-or-nothing application of model file changes.
//!
//! Every proposed path is checked before anything touches the disk. A single
//! rejected path rejects the whole batch. Accepted writes are staged into
//! temporary files next to their destinations and renamed into place only
//! once every file has been staged.

use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::core::digest::content_hash;
use crate::core::path::{Containment, containment, normalize_lexically, relative_display};
use crate::core::types::{AppliedFile, FileChange};

/// Why a proposed path was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationReason {
    /// The resolved path lies outside the base directory.
    OutsideBase,
    /// The path resolves to the base directory itself.
    BaseItself,
    /// The path names a run file with its own writer.
    Protected(String),
    /// The path contains a NUL byte, which no filesystem accepts.
    NulByte,
    /// An existing entry on the path could not be resolved (e.g. a dangling
    /// symlink).
    Unresolvable(String),
}

impl fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationReason::OutsideBase => f.write_str("resolves outside the base directory"),
            ViolationReason::BaseItself => f.write_str("resolves to the base directory itself"),
            ViolationReason::Protected(name) => write!(f, "targets the protected {name}"),
            ViolationReason::NulByte => f.write_str("contains a NUL byte"),
            ViolationReason::Unresolvable(detail) => write!(f, "cannot be resolved ({detail})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("files[{index}] path '{path}' {reason}")]
pub struct SandboxViolation {
    pub index: usize,
    pub path: String,
    pub reason: ViolationReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Sandbox(#[from] SandboxViolation),
    #[error("write {path}: {message}")]
    Write { path: String, message: String },
}

impl ApplyError {
    fn write(path: impl Into<String>, message: impl fmt::Display) -> Self {
        ApplyError::Write {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

/// A path that passed the sandbox check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Real location on disk, symlinks in existing ancestors resolved.
    pub absolute: PathBuf,
    /// Location relative to the base directory, `/`-separated.
    pub relative: String,
}

/// The write boundary for one run.
#[derive(Debug, Clone)]
pub struct Sandbox {
    base: PathBuf,
    protected: Vec<(PathBuf, String)>,
}

impl Sandbox {
    /// Create a sandbox rooted at the canonical form of `base`.
    pub fn new(base: &Path) -> Result<Self> {
        let base = fs::canonicalize(base)
            .with_context(|| format!("resolve base directory {}", base.display()))?;
        Ok(Self {
            base,
            protected: Vec::new(),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Refuse model writes to `path`, reported under `name`.
    pub fn protect(mut self, path: &Path, name: &str) -> Self {
        let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let normalized = normalize_lexically(&absolute).unwrap_or(absolute);
        let real = resolve_existing(&normalized).unwrap_or(normalized);
        self.protected.push((real, name.to_string()));
        self
    }

    /// Resolve a model-supplied path, or explain why it is refused.
    ///
    /// Relative paths are joined to the base; absolute paths are taken as
    /// given. `.` and `..` are collapsed lexically, then symlinks in the
    /// deepest existing ancestor are resolved and the real location must be
    /// strictly inside the base.
    pub fn resolve(&self, raw: &str) -> Result<ResolvedPath, ViolationReason> {
        if raw.contains('\0') {
            return Err(ViolationReason::NulByte);
        }
        let joined = self.base.join(raw);
        let normalized = normalize_lexically(&joined).ok_or(ViolationReason::OutsideBase)?;
        let real = resolve_existing(&normalized).map_err(ViolationReason::Unresolvable)?;

        match containment(&self.base, &real) {
            Containment::Inside => {}
            Containment::Base => return Err(ViolationReason::BaseItself),
            Containment::Outside => return Err(ViolationReason::OutsideBase),
        }
        if let Some((_, name)) = self.protected.iter().find(|(path, _)| *path == real) {
            return Err(ViolationReason::Protected(name.clone()));
        }
        let relative = relative_display(&self.base, &real).ok_or(ViolationReason::OutsideBase)?;
        Ok(ResolvedPath {
            absolute: real,
            relative,
        })
    }

    /// Check every change and the on-disk preconditions without writing.
    pub fn prepare(&self, changes: &[FileChange]) -> Result<PreparedBatch, ApplyError> {
        let mut targets: Vec<Target> = Vec::with_capacity(changes.len());
        for (index, change) in changes.iter().enumerate() {
            let resolved = self.resolve(&change.path).map_err(|reason| {
                warn!(
                    security = true,
                    index,
                    path = %change.path,
                    reason = %reason,
                    "sandbox violation; rejecting batch"
                );
                SandboxViolation {
                    index,
                    path: change.path.clone(),
                    reason,
                }
            })?;

            match targets
                .iter_mut()
                .find(|target| target.absolute == resolved.absolute)
            {
                Some(existing) => {
                    debug!(path = %resolved.relative, "duplicate path; last write wins");
                    existing.content = change.content.clone();
                }
                None => targets.push(Target {
                    absolute: resolved.absolute,
                    relative: resolved.relative,
                    content: change.content.clone(),
                    reported: true,
                }),
            }
        }

        let batch = PreparedBatch {
            base: self.base.clone(),
            targets,
        };
        batch.check_preconditions()?;
        Ok(batch)
    }
}

#[derive(Debug, Clone)]
struct Target {
    absolute: PathBuf,
    relative: String,
    content: String,
    /// Whether the write appears in the applied-file list.
    reported: bool,
}

/// Checked writes waiting to be committed together.
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    base: PathBuf,
    targets: Vec<Target>,
}

impl PreparedBatch {
    /// Add a run-owned document (the desires file) to the same commit.
    ///
    /// The document is written with the batch but not listed in the result.
    pub fn with_document(mut self, path: &Path, content: String) -> Result<Self, ApplyError> {
        let absolute = std::path::absolute(path)
            .map_err(|err| ApplyError::write(path.display().to_string(), err))?;
        let normalized = normalize_lexically(&absolute).unwrap_or(absolute);
        let real = resolve_existing(&normalized)
            .map_err(|detail| ApplyError::write(path.display().to_string(), detail))?;
        let relative =
            relative_display(&self.base, &real).unwrap_or_else(|| real.display().to_string());
        self.targets.push(Target {
            absolute: real,
            relative,
            content,
            reported: false,
        });
        self.check_preconditions()?;
        Ok(self)
    }

    /// Relative paths of the files that will be reported, in write order.
    pub fn paths(&self) -> Vec<&str> {
        self.targets
            .iter()
            .filter(|target| target.reported)
            .map(|target| target.relative.as_str())
            .collect()
    }

    fn check_preconditions(&self) -> Result<(), ApplyError> {
        for target in &self.targets {
            if target.absolute.is_dir() {
                return Err(ApplyError::write(
                    &target.relative,
                    "destination is an existing directory",
                ));
            }
            for ancestor in target.absolute.ancestors().skip(1) {
                match fs::metadata(ancestor) {
                    Ok(meta) if meta.is_dir() => break,
                    Ok(_) => {
                        return Err(ApplyError::write(
                            &target.relative,
                            format!("{} exists and is not a directory", ancestor.display()),
                        ));
                    }
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(ApplyError::write(&target.relative, err)),
                }
            }
            if let Some(other) = self.targets.iter().find(|other| {
                other.absolute != target.absolute && other.absolute.starts_with(&target.absolute)
            }) {
                return Err(ApplyError::write(
                    &target.relative,
                    format!("also used as a directory by {}", other.relative),
                ));
            }
        }
        Ok(())
    }

    /// Stage every write, then rename each into place.
    ///
    /// If staging fails nothing is renamed, and directories created for the
    /// batch are removed again.
    pub fn commit(self) -> Result<Vec<AppliedFile>, ApplyError> {
        let mut created_dirs: Vec<PathBuf> = Vec::new();
        let staged = match self.stage(&mut created_dirs) {
            Ok(staged) => staged,
            Err(err) => {
                for dir in created_dirs.iter().rev() {
                    let _ = fs::remove_dir(dir);
                }
                return Err(err);
            }
        };

        let mut applied = Vec::new();
        for (temp, target) in staged.into_iter().zip(&self.targets) {
            temp.persist(&target.absolute).map_err(|err| {
                error!(path = %target.relative, err = %err.error, "rename into place failed");
                ApplyError::write(&target.relative, err.error)
            })?;
            debug!(path = %target.relative, bytes = target.content.len(), "file written");
            if target.reported {
                applied.push(AppliedFile {
                    path: target.relative.clone(),
                    sha256: content_hash(&target.content),
                    bytes: target.content.len() as u64,
                });
            }
        }
        info!(files = applied.len(), "batch committed");
        Ok(applied)
    }

    fn stage(&self, created_dirs: &mut Vec<PathBuf>) -> Result<Vec<NamedTempFile>, ApplyError> {
        let mut staged = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            let parent = target
                .absolute
                .parent()
                .ok_or_else(|| ApplyError::write(&target.relative, "path has no parent"))?;
            create_missing_dirs(parent, created_dirs)
                .map_err(|err| ApplyError::write(&target.relative, err))?;
            let temp = stage_file(parent, &target.absolute, &target.content)
                .map_err(|err| ApplyError::write(&target.relative, err))?;
            staged.push(temp);
        }
        Ok(staged)
    }
}

/// Check and commit `changes` in one step.
pub fn apply_changes(
    sandbox: &Sandbox,
    changes: &[FileChange],
) -> Result<Vec<AppliedFile>, ApplyError> {
    sandbox.prepare(changes)?.commit()
}

/// Resolve symlinks in the deepest existing ancestor of an already
/// normalized path, keeping the not-yet-existing remainder as is.
fn resolve_existing(path: &Path) -> Result<PathBuf, String> {
    for ancestor in path.ancestors() {
        match fs::symlink_metadata(ancestor) {
            Ok(_) => {
                let real = fs::canonicalize(ancestor)
                    .map_err(|err| format!("{}: {err}", ancestor.display()))?;
                let rest = path.strip_prefix(ancestor).map_err(|err| err.to_string())?;
                return Ok(if rest.as_os_str().is_empty() {
                    real
                } else {
                    real.join(rest)
                });
            }
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(format!("{}: {err}", ancestor.display())),
        }
    }
    Err(format!("no existing ancestor for {}", path.display()))
}

fn create_missing_dirs(dir: &Path, created: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let missing: Vec<&Path> = dir.ancestors().take_while(|a| !a.exists()).collect();
    for path in missing.into_iter().rev() {
        fs::create_dir(path)?;
        created.push(path.to_path_buf());
    }
    Ok(())
}

fn stage_file(dir: &Path, destination: &Path, content: &str) -> std::io::Result<NamedTempFile> {
    let mut temp = tempfile::Builder::new()
        .prefix(".evolve-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    temp.write_all(content.as_bytes())?;
    temp.as_file().sync_all()?;
    match fs::metadata(destination) {
        Ok(meta) => fs::set_permissions(temp.path(), meta.permissions())?,
        Err(_) => set_default_permissions(temp.path())?,
    }
    Ok(temp)
}

#[cfg(unix)]
fn set_default_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_default_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
