//! Per-extension key/value persistence.
//!
//! Each namespace maps to `<root>/<namespace>/data/`, one JSON file per key.
//! Keys and values are validated before any backend call is made.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use keel_core::{KeelError, Result};

const VALUE_SUFFIX: &str = ".json";

/// Raw file operations used by the sandbox.
pub trait StorageBackend: Send + Sync {
    /// Read a file; `Ok(None)` if it does not exist.
    fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>>;
    /// Replace a file's contents, creating parent directories as needed.
    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
    /// Remove a file; `Ok(false)` if it did not exist.
    fn remove(&self, path: &Path) -> io::Result<bool>;
    /// File names directly inside `dir`; empty if `dir` does not exist.
    fn list(&self, dir: &Path) -> io::Result<Vec<String>>;
    /// Remove a directory tree if it exists.
    fn remove_dir(&self, dir: &Path) -> io::Result<()>;
}

/// The real filesystem. Writes go to a dot-prefixed temp file, then rename.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsBackend;

impl StorageBackend for FsBackend {
    fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
        std::fs::create_dir_all(dir)?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        let tmp = dir.join(format!(".{file_name}.tmp"));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)
    }

    fn remove(&self, path: &Path) -> io::Result<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<String>> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn remove_dir(&self, dir: &Path) -> io::Result<()> {
        match std::fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StorageLimits {
    /// Maximum serialized size of one value, in bytes.
    pub quota_bytes: usize,
    pub max_key_length: usize,
}

impl Default for StorageLimits {
    fn default() -> Self {
        Self {
            quota_bytes: 1024 * 1024,
            max_key_length: 128,
        }
    }
}

impl From<&keel_config::ExtensionsConfig> for StorageLimits {
    fn from(config: &keel_config::ExtensionsConfig) -> Self {
        Self {
            quota_bytes: config.storage_quota_bytes,
            max_key_length: config.max_key_length,
        }
    }
}

/// Namespaced key/value storage shared by all extensions.
pub struct StorageSandbox {
    root: PathBuf,
    limits: StorageLimits,
    backend: Arc<dyn StorageBackend>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

fn violation(namespace: &str, reason: impl Into<String>) -> KeelError {
    KeelError::StorageViolation {
        namespace: namespace.to_string(),
        reason: reason.into(),
    }
}

fn is_safe_segment(s: &str) -> bool {
    !s.starts_with('.')
        && !s.contains("..")
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl StorageSandbox {
    pub fn new(root: impl Into<PathBuf>, limits: StorageLimits) -> Self {
        Self::with_backend(root, limits, Arc::new(FsBackend))
    }

    pub fn with_backend(
        root: impl Into<PathBuf>,
        limits: StorageLimits,
        backend: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            root: root.into(),
            limits,
            backend,
            locks: DashMap::new(),
        }
    }

    pub fn limits(&self) -> StorageLimits {
        self.limits
    }

    /// Directory holding a namespace's values. Derived only from `namespace`.
    pub fn namespace_dir(&self, namespace: &str) -> Result<PathBuf> {
        if namespace.is_empty() || !is_safe_segment(namespace) {
            return Err(violation(namespace, "invalid namespace"));
        }
        Ok(self.root.join(namespace).join("data"))
    }

    /// Validate a key without touching the filesystem.
    pub fn validate_key(&self, namespace: &str, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(violation(namespace, "key must not be empty"));
        }
        if key.len() > self.limits.max_key_length {
            return Err(violation(
                namespace,
                format!("key is {} bytes, limit is {}", key.len(), self.limits.max_key_length),
            ));
        }
        if !is_safe_segment(key) {
            return Err(violation(
                namespace,
                format!("key '{key}' contains a path separator, traversal sequence or disallowed character"),
            ));
        }
        Ok(())
    }

    /// Serialize and size-check a value without touching the filesystem.
    pub fn encode_value<T: Serialize + ?Sized>(&self, namespace: &str, value: &T) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| violation(namespace, format!("value is not serializable: {e}")))?;
        if bytes.len() > self.limits.quota_bytes {
            return Err(violation(
                namespace,
                format!("value is {} bytes, quota is {}", bytes.len(), self.limits.quota_bytes),
            ));
        }
        Ok(bytes)
    }

    fn key_path(&self, namespace: &str, key: &str) -> Result<PathBuf> {
        self.validate_key(namespace, key)?;
        Ok(self.namespace_dir(namespace)?.join(format!("{key}{VALUE_SUFFIX}")))
    }

    fn lock(&self, namespace: &str) -> Arc<Mutex<()>> {
        self.locks.entry(namespace.to_string()).or_default().clone()
    }

    fn read_value(&self, namespace: &str, path: &Path) -> Result<Option<Value>> {
        match self.backend.read(path)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| violation(namespace, format!("stored value is corrupt: {e}"))),
            None => Ok(None),
        }
    }

    /// `Ok(None)` means the key is absent.
    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let path = self.key_path(namespace, key)?;
        let lock = self.lock(namespace);
        let _guard = lock.lock();
        self.read_value(namespace, &path)
    }

    pub fn set<T: Serialize + ?Sized>(&self, namespace: &str, key: &str, value: &T) -> Result<()> {
        let path = self.key_path(namespace, key)?;
        let bytes = self.encode_value(namespace, value)?;
        let lock = self.lock(namespace);
        let _guard = lock.lock();
        self.backend.write(&path, &bytes)?;
        debug!(namespace, key, bytes = bytes.len(), "storage write");
        Ok(())
    }

    /// Returns whether the key existed.
    pub fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let path = self.key_path(namespace, key)?;
        let lock = self.lock(namespace);
        let _guard = lock.lock();
        Ok(self.backend.remove(&path)?)
    }

    /// Remove every key in the namespace.
    pub fn clear(&self, namespace: &str) -> Result<()> {
        let dir = self.namespace_dir(namespace)?;
        let lock = self.lock(namespace);
        let _guard = lock.lock();
        self.backend.remove_dir(&dir)?;
        debug!(namespace, "storage cleared");
        Ok(())
    }

    /// Keys currently stored in the namespace, sorted.
    pub fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        let dir = self.namespace_dir(namespace)?;
        let lock = self.lock(namespace);
        let _guard = lock.lock();
        let mut keys: Vec<String> = self
            .backend
            .list(&dir)?
            .into_iter()
            .filter(|name| !name.starts_with('.'))
            .filter_map(|name| name.strip_suffix(VALUE_SUFFIX).map(str::to_string))
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Read-modify-write under the namespace lock.
    ///
    /// `f` receives the current value (or `None`) and returns the new value;
    /// returning `None` deletes the key.
    pub fn update<F>(&self, namespace: &str, key: &str, f: F) -> Result<Option<Value>>
    where
        F: FnOnce(Option<Value>) -> Option<Value>,
    {
        let path = self.key_path(namespace, key)?;
        let lock = self.lock(namespace);
        let _guard = lock.lock();
        let current = self.read_value(namespace, &path)?;
        match f(current) {
            Some(next) => {
                let bytes = self.encode_value(namespace, &next)?;
                self.backend.write(&path, &bytes)?;
                Ok(Some(next))
            }
            None => {
                self.backend.remove(&path)?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts every backend call before delegating to the real filesystem.
    #[derive(Default)]
    struct CountingBackend {
        calls: AtomicUsize,
    }

    impl CountingBackend {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
        fn touch(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl StorageBackend for CountingBackend {
        fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
            self.touch();
            FsBackend.read(path)
        }
        fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
            self.touch();
            FsBackend.write(path, bytes)
        }
        fn remove(&self, path: &Path) -> io::Result<bool> {
            self.touch();
            FsBackend.remove(path)
        }
        fn list(&self, dir: &Path) -> io::Result<Vec<String>> {
            self.touch();
            FsBackend.list(dir)
        }
        fn remove_dir(&self, dir: &Path) -> io::Result<()> {
            self.touch();
            FsBackend.remove_dir(dir)
        }
    }

    fn sandbox(root: &Path) -> (StorageSandbox, Arc<CountingBackend>) {
        let backend = Arc::new(CountingBackend::default());
        let sandbox = StorageSandbox::with_backend(root, StorageLimits::default(), backend.clone());
        (sandbox, backend)
    }

    #[test]
    fn set_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let (s, _) = sandbox(dir.path());
        let value = json!({"count": 3, "tags": ["a", "b"], "nested": {"ok": true}});
        s.set("demo", "k", &value).unwrap();
        assert_eq!(s.get("demo", "k").unwrap(), Some(value));
        assert!(dir.path().join("demo/data/k.json").exists());
    }

    #[test]
    fn missing_key_is_absent_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let (s, _) = sandbox(dir.path());
        assert_eq!(s.get("demo", "nope").unwrap(), None);
    }

    #[test]
    fn delete_then_get_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let (s, _) = sandbox(dir.path());
        s.set("demo", "k", &json!(1)).unwrap();
        assert!(s.delete("demo", "k").unwrap());
        assert_eq!(s.get("demo", "k").unwrap(), None);
        assert!(!s.delete("demo", "k").unwrap());
    }

    #[test]
    fn bad_keys_never_reach_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let (s, backend) = sandbox(dir.path());
        let long = "x".repeat(129);
        for key in ["../escape", "a/b", "a\\b", "..", ".", "", ".hidden", "x..y", long.as_str()] {
            assert!(
                matches!(s.get("demo", key), Err(KeelError::StorageViolation { .. })),
                "get {key:?}"
            );
            assert!(s.set("demo", key, &json!(1)).is_err(), "set {key:?}");
            assert!(s.delete("demo", key).is_err(), "delete {key:?}");
        }
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn oversized_value_is_rejected_before_write() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(CountingBackend::default());
        let s = StorageSandbox::with_backend(
            dir.path(),
            StorageLimits {
                quota_bytes: 16,
                max_key_length: 128,
            },
            backend.clone(),
        );
        let err = s.set("demo", "big", &"x".repeat(64)).unwrap_err();
        assert!(err.to_string().contains("quota"));
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn namespaces_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let (s, _) = sandbox(dir.path());
        s.set("alpha", "k", &json!("a")).unwrap();
        s.set("beta", "k", &json!("b")).unwrap();
        assert_eq!(s.get("alpha", "k").unwrap(), Some(json!("a")));
        assert_eq!(s.get("beta", "k").unwrap(), Some(json!("b")));
        s.clear("alpha").unwrap();
        assert_eq!(s.get("alpha", "k").unwrap(), None);
        assert_eq!(s.get("beta", "k").unwrap(), Some(json!("b")));
    }

    #[test]
    fn bad_namespace_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (s, backend) = sandbox(dir.path());
        assert!(s.get("../other", "k").is_err());
        assert!(s.clear("").is_err());
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn keys_lists_sorted_without_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let (s, _) = sandbox(dir.path());
        s.set("demo", "b", &json!(2)).unwrap();
        s.set("demo", "a", &json!(1)).unwrap();
        std::fs::write(dir.path().join("demo/data/.a.json.tmp"), b"junk").unwrap();
        assert_eq!(s.keys("demo").unwrap(), vec!["a", "b"]);
        assert!(s.keys("empty").unwrap().is_empty());
    }

    #[test]
    fn update_is_read_modify_write() {
        let dir = tempfile::tempdir().unwrap();
        let s = Arc::new(StorageSandbox::new(dir.path(), StorageLimits::default()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&s);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        s.update("demo", "counter", |v| {
                            let n = v.and_then(|v| v.as_u64()).unwrap_or(0);
                            Some(json!(n + 1))
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(s.get("demo", "counter").unwrap(), Some(json!(80)));
    }

    #[test]
    fn update_returning_none_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let (s, _) = sandbox(dir.path());
        s.set("demo", "k", &json!(1)).unwrap();
        assert_eq!(s.update("demo", "k", |_| None).unwrap(), None);
        assert_eq!(s.get("demo", "k").unwrap(), None);
    }
}
