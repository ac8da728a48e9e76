//! Key-value persistence.
//!
//! The client registry, the client's local tree and every target-side
//! fingerprint map sit on a [`KvStore`]. Two backends: an in-memory map for
//! tests and ephemeral use, and a JSON file rewritten on every mutation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::fingerprint::FingerprintMap;

const STORAGE_VERSION: u32 = 1;

/// String-keyed, string-valued store.
pub trait KvStore: Send + Sync {
    fn put(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
    fn get(&self, key: &str) -> Option<String>;
    fn delete(&mut self, key: &str) -> Result<(), StoreError>;
    /// All entries, sorted by key.
    fn entries(&self) -> BTreeMap<String, String>;
    /// Drop every entry and insert `entries` in one write.
    fn replace(&mut self, entries: BTreeMap<String, String>) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn put(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    fn entries(&self) -> BTreeMap<String, String> {
        self.entries.clone()
    }

    fn replace(&mut self, entries: BTreeMap<String, String>) -> Result<(), StoreError> {
        self.entries = entries;
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredData {
    version: u32,
    entries: BTreeMap<String, String>,
}

/// A store kept in memory and flushed to one JSON file on every write.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl JsonFileStore {
    /// Open `path`, creating an empty store if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = if path.exists() {
            let raw = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
            let data: StoredData = serde_json::from_slice(&raw)?;
            if data.version != STORAGE_VERSION {
                return Err(StoreError::Version {
                    path,
                    found: data.version,
                });
            }
            data.entries
        } else {
            BTreeMap::new()
        };

        let store = Self { path, entries };
        store.flush()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let data = StoredData {
            version: STORAGE_VERSION,
            entries: self.entries.clone(),
        };
        let encoded = serde_json::to_vec_pretty(&data)?;

        // Write beside the target and rename so readers never see half a file.
        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(&encoded)
            .and_then(|_| file.sync_all())
            .map_err(|e| StoreError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::io(&self.path, e))?;

        tracing::trace!(path = %self.path.display(), entries = self.entries.len(), "store flushed");
        Ok(())
    }
}

impl KvStore for JsonFileStore {
    fn put(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value.to_string());
        self.flush()
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        if self.entries.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }

    fn entries(&self) -> BTreeMap<String, String> {
        self.entries.clone()
    }

    fn replace(&mut self, entries: BTreeMap<String, String>) -> Result<(), StoreError> {
        self.entries = entries;
        self.flush()
    }
}

/// File key to freshness token, on top of any [`KvStore`].
pub struct FingerprintStore {
    inner: Box<dyn KvStore>,
}

impl FingerprintStore {
    pub fn new(inner: Box<dyn KvStore>) -> Self {
        Self { inner }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStore::new()))
    }

    pub fn token(&self, key: &str) -> Option<String> {
        self.inner.get(key)
    }

    pub fn update(&mut self, key: &str, token: &str) -> Result<(), StoreError> {
        self.inner.put(key, token)
    }

    pub fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key)
    }

    /// Rebuild from scratch, forgetting keys absent from `map`.
    pub fn replace_all(&mut self, map: FingerprintMap) -> Result<(), StoreError> {
        self.inner.replace(map)
    }

    pub fn snapshot(&self) -> FingerprintMap {
        self.inner.entries()
    }
}

impl std::fmt::Debug for FingerprintStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FingerprintStore")
            .field("entries", &self.inner.entries().len())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{path}: unsupported storage version {found}")]
    Version { path: PathBuf, found: u32 },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
