//! Key-value persistence surface
//!
//! The content cache and the offline queue persist through [`KvStore`], a
//! small synchronous string-to-string interface. Two backends are provided:
//!
//! - [`InMemoryKvStore`]: `DashMap` backed, with an optional byte budget so
//!   tests can simulate a full store
//! - [`FileKvStore`]: one file per key under a directory, loaded into memory
//!   on open and written through on every change

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;
use tracing::{debug, info, trace, warn};

use crate::error::StorageError;

/// Synchronous key-value persistence
///
/// Callers treat every error as "store full or unavailable" and carry on.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removing an absent key is not an error
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// In-memory implementation of KvStore
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    entries: DashMap<String, String>,
    /// Maximum total bytes of keys plus values (None = unbounded)
    max_bytes: Option<usize>,
    used_bytes: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryKvStore {
    /// Create an unbounded store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that rejects writes beyond `max_bytes`
    pub fn with_capacity(max_bytes: usize) -> Self {
        Self {
            max_bytes: Some(max_bytes),
            ..Self::default()
        }
    }

    /// Make every operation fail, as a locked-down browser store would
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StorageError::unavailable("store disabled"))
        } else {
            Ok(())
        }
    }
}

impl KvStore for InMemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check_available()?;
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check_available()?;
        let previous = self
            .entries
            .get(key)
            .map(|v| key.len() + v.len())
            .unwrap_or(0);
        let added = key.len() + value.len();
        let current = self.used_bytes.load(Ordering::SeqCst);
        let projected = current.saturating_sub(previous).saturating_add(added);

        if let Some(max) = self.max_bytes
            && projected > max
        {
            trace!(key, projected, max, "Rejecting write over byte budget");
            return Err(StorageError::CapacityExceeded);
        }

        self.entries.insert(key.to_string(), value.to_string());
        self.used_bytes.fetch_add(added, Ordering::SeqCst);
        self.used_bytes.fetch_sub(previous, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.check_available()?;
        if let Some((k, v)) = self.entries.remove(key) {
            self.used_bytes.fetch_sub(k.len() + v.len(), Ordering::SeqCst);
        }
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.check_available()?;
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect())
    }
}

/// File-backed implementation of KvStore
///
/// Each key is stored in its own file named by the hex encoding of the key.
/// All entries are read into memory when the store is opened; writes go to a
/// temporary file that is renamed over the target.
#[derive(Debug)]
pub struct FileKvStore {
    dir: PathBuf,
    entries: DashMap<String, String>,
}

impl FileKvStore {
    /// Open (or create) a store rooted at `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let store = Self {
            dir,
            entries: DashMap::new(),
        };
        store.load()?;
        Ok(store)
    }

    fn load(&self) -> Result<(), StorageError> {
        let mut loaded = 0;
        let mut skipped = 0;

        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some() {
                // leftover temp file
                continue;
            }
            let Some(key) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| hex::decode(n).ok())
                .and_then(|bytes| String::from_utf8(bytes).ok())
            else {
                skipped += 1;
                continue;
            };
            match std::fs::read_to_string(&path) {
                Ok(value) => {
                    self.entries.insert(key, value);
                    loaded += 1;
                }
                Err(e) => {
                    skipped += 1;
                    warn!(path = ?path, error = %e, "Failed to read stored value, skipping");
                }
            }
        }

        info!(dir = ?self.dir, loaded, skipped, "Loaded key-value store");
        Ok(())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(hex::encode(key.as_bytes()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        self.entries.insert(key.to_string(), value.to_string());
        debug!(key, bytes = value.len(), "Persisted value");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        if self.entries.remove(key).is_some() {
            match std::fs::remove_file(self.path_for(key)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_in_memory_set_get_remove() {
        let kv = InMemoryKvStore::new();
        assert_eq!(kv.get("a").unwrap(), None);
        kv.set("a", "1").unwrap();
        kv.set("a", "22").unwrap();
        assert_eq!(kv.get("a").unwrap().as_deref(), Some("22"));
        assert_eq!(kv.used_bytes(), 3);
        kv.remove("a").unwrap();
        kv.remove("a").unwrap();
        assert!(kv.is_empty());
        assert_eq!(kv.used_bytes(), 0);
    }

    #[test]
    fn test_in_memory_capacity() {
        let kv = InMemoryKvStore::with_capacity(10);
        kv.set("k", "12345").unwrap();
        assert!(matches!(
            kv.set("k2", "1234567"),
            Err(StorageError::CapacityExceeded)
        ));
        // Overwriting in place frees the old value first
        kv.set("k", "123456789").unwrap();
    }

    #[test]
    fn test_in_memory_unavailable() {
        let kv = InMemoryKvStore::new();
        kv.set_unavailable(true);
        assert!(kv.get("a").is_err());
        assert!(kv.set("a", "1").is_err());
        kv.set_unavailable(false);
        assert!(kv.set("a", "1").is_ok());
    }

    #[test]
    fn test_prefix_listing() {
        let kv = InMemoryKvStore::new();
        kv.set("cache:1", "x").unwrap();
        kv.set("cache:2", "x").unwrap();
        kv.set("queue", "x").unwrap();
        let mut keys = kv.keys_with_prefix("cache:").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["cache:1", "cache:2"]);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let kv = FileKvStore::open(dir.path()).unwrap();
            kv.set("folio:offline-queue", "[\"abc\"]").unwrap();
            kv.set("folio:cache:30023:pk:post", "{}").unwrap();
            kv.remove("folio:cache:30023:pk:post").unwrap();
        }

        let kv = FileKvStore::open(dir.path()).unwrap();
        assert_eq!(
            kv.get("folio:offline-queue").unwrap().as_deref(),
            Some("[\"abc\"]")
        );
        assert_eq!(kv.get("folio:cache:30023:pk:post").unwrap(), None);
    }
}
