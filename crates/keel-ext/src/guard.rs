use std::path::{Component, Path, PathBuf};

use keel_core::{KeelError, Result};

/// Code file extensions an entry point may have.
pub const SAFE_ENTRY_EXTENSIONS: &[&str] = &["wasm"];

/// Confines extension code to the configured roots.
///
/// Both checks are pure: they look only at path text, never at the
/// filesystem. Callers resolve symlinks first and run the checks on the
/// resolved path.
#[derive(Debug, Clone)]
pub struct PathGuard {
    roots: Vec<PathBuf>,
}

/// Collapse `.` and `..` without touching the filesystem.
///
/// A `..` that would climb above the path's start is kept, so the result
/// still records that the path escapes.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out.iter().collect()
}

/// Path of `path` relative to `root`, or `None` if it escapes upward or
/// lies outside `root` entirely.
pub fn relative_to(root: &Path, path: &Path) -> Option<PathBuf> {
    let root = normalize(root);
    let path = normalize(path);
    let rel = path.strip_prefix(&root).ok()?;
    if rel
        .components()
        .next()
        .is_some_and(|c| matches!(c, Component::ParentDir))
    {
        return None;
    }
    Some(rel.to_path_buf())
}

/// Resolve symlinks in `path` even when its tail does not exist yet.
///
/// The deepest existing ancestor is canonicalized and the missing
/// components are appended unchanged. `None` if no ancestor resolves.
pub fn canonicalize_existing(path: &Path) -> Option<PathBuf> {
    let path = normalize(path);
    let mut missing = Vec::new();
    for ancestor in path.ancestors() {
        if let Ok(resolved) = std::fs::canonicalize(ancestor) {
            return Some(missing.iter().rev().fold(resolved, |acc: PathBuf, c| acc.join(c)));
        }
        missing.push(ancestor.file_name()?.to_os_string());
    }
    None
}

impl PathGuard {
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// True if `resolved` lies inside one of the roots.
    pub fn is_allowed_path(&self, resolved: &Path) -> bool {
        if !resolved.is_absolute() {
            return false;
        }
        self.roots
            .iter()
            .any(|root| relative_to(root, resolved).is_some_and(|rel| !rel.as_os_str().is_empty()))
    }

    /// True if the file has one of the whitelisted code extensions.
    pub fn is_safe_entry_file(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                SAFE_ENTRY_EXTENSIONS
                    .iter()
                    .any(|safe| safe.eq_ignore_ascii_case(ext))
            })
    }

    /// Run both checks; either failing is `LoadRejected`.
    pub fn check(&self, extension: &str, entry: &Path) -> Result<()> {
        if !self.is_allowed_path(entry) {
            return Err(KeelError::LoadRejected {
                extension: extension.to_string(),
                reason: format!("{} is outside the extension directories", entry.display()),
            });
        }
        if !Self::is_safe_entry_file(entry) {
            return Err(KeelError::LoadRejected {
                extension: extension.to_string(),
                reason: format!(
                    "{} is not an allowed entry file type (allowed: {})",
                    entry.display(),
                    SAFE_ENTRY_EXTENSIONS.join(", ")
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> PathGuard {
        PathGuard::new(["/home/u/.keel/extensions", "/home/u/dev-ext"])
    }

    #[test]
    fn canonicalize_existing_keeps_the_missing_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let base = std::fs::canonicalize(tmp.path()).unwrap();
        assert_eq!(
            canonicalize_existing(&base.join("not/yet/here")),
            Some(base.join("not/yet/here"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn canonicalize_existing_resolves_symlinked_ancestors() {
        let tmp = tempfile::tempdir().unwrap();
        let base = std::fs::canonicalize(tmp.path()).unwrap();
        std::fs::create_dir(base.join("real-home")).unwrap();
        std::os::unix::fs::symlink(base.join("real-home"), base.join("home")).unwrap();

        let resolved = canonicalize_existing(&base.join("home/.keel/extensions")).unwrap();
        assert_eq!(resolved, base.join("real-home/.keel/extensions"));
    }

    #[test]
    fn normalize_collapses_dots() {
        assert_eq!(normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(normalize(Path::new("/../a")), PathBuf::from("/a"));
        assert_eq!(normalize(Path::new("../a")), PathBuf::from("../a"));
    }

    #[test]
    fn inside_root_is_allowed() {
        let g = guard();
        assert!(g.is_allowed_path(Path::new("/home/u/.keel/extensions/demo/demo.wasm")));
        assert!(g.is_allowed_path(Path::new("/home/u/dev-ext/demo/build/demo.wasm")));
    }

    #[test]
    fn traversal_out_of_root_is_rejected() {
        let g = guard();
        assert!(!g.is_allowed_path(Path::new("/home/u/.keel/extensions/demo/../../../etc/passwd")));
        assert!(!g.is_allowed_path(Path::new("/home/u/.keel/extensions/../secrets.wasm")));
    }

    #[test]
    fn absolute_path_elsewhere_is_rejected() {
        let g = guard();
        assert!(!g.is_allowed_path(Path::new("/tmp/evil.wasm")));
        assert!(!g.is_allowed_path(Path::new("/home/u/.keel/extensions-other/x.wasm")));
    }

    #[test]
    fn relative_and_root_itself_are_rejected() {
        let g = guard();
        assert!(!g.is_allowed_path(Path::new("demo/demo.wasm")));
        assert!(!g.is_allowed_path(Path::new("/home/u/dev-ext")));
    }

    #[test]
    fn entry_file_whitelist() {
        assert!(PathGuard::is_safe_entry_file(Path::new("/x/demo.wasm")));
        assert!(PathGuard::is_safe_entry_file(Path::new("/x/DEMO.WASM")));
        assert!(!PathGuard::is_safe_entry_file(Path::new("/x/demo.so")));
        assert!(!PathGuard::is_safe_entry_file(Path::new("/x/demo.sh")));
        assert!(!PathGuard::is_safe_entry_file(Path::new("/x/demo")));
    }

    #[test]
    fn check_reports_load_rejected() {
        let g = guard();
        let err = g.check("demo", Path::new("/tmp/demo.wasm")).unwrap_err();
        assert!(matches!(err, KeelError::LoadRejected { .. }));
        let err = g
            .check("demo", Path::new("/home/u/dev-ext/demo/run.sh"))
            .unwrap_err();
        assert!(err.to_string().contains("entry file type"));
        assert!(g.check("demo", Path::new("/home/u/dev-ext/demo/demo.wasm")).is_ok());
    }
}
