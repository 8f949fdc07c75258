//! State snapshot storage.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::types::StateSnapshot;

/// Whole-snapshot JSON storage at a fixed path.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Temp file used while saving; must never be a model write target.
    pub fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    /// Load the snapshot, or the zero snapshot when the file does not exist.
    pub fn load(&self) -> Result<StateSnapshot> {
        debug!(path = %self.path.display(), "loading state");
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("no state file; starting from iteration 0");
                return Ok(StateSnapshot::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read state {}", self.path.display()));
            }
        };
        let state: StateSnapshot = serde_json::from_str(&contents)
            .with_context(|| format!("parse state {}", self.path.display()))?;
        debug!(iteration_count = state.iteration_count, "state loaded");
        Ok(state)
    }

    /// Atomically replace the snapshot (temp file + rename).
    pub fn save(&self, state: &StateSnapshot) -> Result<()> {
        debug!(
            path = %self.path.display(),
            iteration_count = state.iteration_count,
            "writing state"
        );
        let mut buf = serde_json::to_string_pretty(state)?;
        buf.push('\n');
        self.write_atomic(&buf)
    }

    fn write_atomic(&self, contents: &str) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let tmp_path = self.temp_path();
        fs::write(&tmp_path, contents)
            .with_context(|| format!("write temp state {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("replace state {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::AppliedFile;

    #[test]
    fn missing_file_loads_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(temp.path().join("state.json"));
        let state = store.load().expect("load");
        assert_eq!(state, StateSnapshot::default());
        assert_eq!(state.iteration_count, 0);
        assert!(!store.path().exists(), "load must not create the file");
    }

    /// Verifies save then load preserves every field, and no temp file
    /// survives the rename.
    #[test]
    fn state_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(temp.path().join("nested/state.json"));
        let state = StateSnapshot::default().advance(
            "sha256:abc".to_string(),
            &[AppliedFile {
                path: "x/y.txt".to_string(),
                sha256: "sha256:def".to_string(),
                bytes: 5,
            }],
            "2026-01-01T00:00:00+00:00".to_string(),
        );

        store.save(&state).expect("save");
        assert_eq!(store.load().expect("load"), state);
        assert!(!store.temp_path().exists());
    }

    /// Ensures the default snapshot serializes to a known, stable JSON format.
    #[test]
    fn state_format_is_deterministic() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(temp.path().join("state.json"));
        store.save(&StateSnapshot::default()).expect("save");
        let contents = fs::read_to_string(store.path()).expect("read");
        let expected = "{\n  \"iteration_count\": 0,\n  \"last_desires_hash\": null,\n  \"last_applied_file_hashes\": {},\n  \"updated_at\": null\n}\n";
        assert_eq!(contents, expected);
    }

    #[test]
    fn corrupt_state_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(temp.path().join("state.json"));
        fs::write(store.path(), "not json").expect("write");
        let err = store.load().unwrap_err();
        assert!(format!("{err:#}").contains("parse state"));
    }
}
