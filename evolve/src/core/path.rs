//! Lexical path helpers for sandbox checks.
//!
//! These functions never consult the filesystem. Symlink resolution happens in
//! `io::apply` on top of them.

use std::path::{Component, Path, PathBuf};

/// Where a candidate path sits relative to a base directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Containment {
    /// Strictly below the base directory.
    Inside,
    /// The base directory itself.
    Base,
    Outside,
}

/// Collapse `.` and `..` segments without touching the filesystem.
///
/// Returns `None` when `..` would climb above the root (or above the start of
/// a relative path), which callers treat as an escape.
pub fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut anchor = PathBuf::new();
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => anchor.push(prefix.as_os_str()),
            Component::RootDir => anchor.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::Normal(part) => parts.push(part),
        }
    }
    let mut normalized = anchor;
    for part in parts {
        normalized.push(part);
    }
    Some(normalized)
}

/// Classify `candidate` against `base`. Both must already be normalized.
pub fn containment(base: &Path, candidate: &Path) -> Containment {
    if candidate == base {
        return Containment::Base;
    }
    if candidate.starts_with(base) {
        return Containment::Inside;
    }
    Containment::Outside
}

/// Render `path` relative to `base` with `/` separators.
///
/// Returns `None` when `path` is not below `base`.
pub fn relative_display(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_dot_segments() {
        let normalized = normalize_lexically(Path::new("/base/./a/../b/c")).expect("normalized");
        assert_eq!(normalized, PathBuf::from("/base/b/c"));
    }

    #[test]
    fn normalize_rejects_climbing_above_root() {
        assert_eq!(normalize_lexically(Path::new("/base/../../etc")), None);
        assert_eq!(normalize_lexically(Path::new("../x")), None);
    }

    #[test]
    fn containment_is_strict() {
        let base = Path::new("/srv/base");
        assert_eq!(containment(base, Path::new("/srv/base/a.txt")), Containment::Inside);
        assert_eq!(containment(base, Path::new("/srv/base")), Containment::Base);
        assert_eq!(containment(base, Path::new("/srv/basement/a")), Containment::Outside);
        assert_eq!(containment(base, Path::new("/etc/passwd")), Containment::Outside);
    }

    #[test]
    fn relative_display_uses_forward_slashes() {
        let base = Path::new("/srv/base");
        assert_eq!(
            relative_display(base, &base.join("x").join("y.txt")),
            Some("x/y.txt".to_string())
        );
        assert_eq!(relative_display(base, base), None);
        assert_eq!(relative_display(base, Path::new("/elsewhere")), None);
    }
}
