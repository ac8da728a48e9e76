//! On-disk storage for backed-up files.
//!
//! Layout under the storage root:
//!
//! ```text
//! <root>/<client>/<file key>         file contents
//! <root>/.stowage/<client>.json      fingerprint map for that client
//! ```

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use stowage_core::{FingerprintMap, FingerprintStore, JsonFileStore, StoreError, unix_millis};

const META_DIR: &str = ".stowage";

pub struct TargetStore {
    root: PathBuf,
    clients: HashMap<String, FingerprintStore>,
}

impl TargetStore {
    /// Open a storage root, picking up clients registered in earlier runs.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, TargetError> {
        let root = root.into();
        let meta = root.join(META_DIR);
        fs::create_dir_all(&meta).map_err(|e| TargetError::io(&meta, e))?;

        let mut store = Self {
            root,
            clients: HashMap::new(),
        };
        for entry in fs::read_dir(&meta).map_err(|e| TargetError::io(&meta, e))? {
            let path = entry.map_err(|e| TargetError::io(&meta, e))?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                    store.register_client(name)?;
                }
            }
        }
        tracing::debug!(root = %store.root.display(), clients = store.clients.len(), "target store opened");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the client's directory and fingerprint map. Idempotent.
    pub fn register_client(&mut self, client_name: &str) -> Result<(), TargetError> {
        if self.clients.contains_key(client_name) {
            return Ok(());
        }
        if !is_single_component(client_name) {
            return Err(TargetError::InvalidName(client_name.to_string()));
        }

        let dir = self.root.join(client_name);
        fs::create_dir_all(&dir).map_err(|e| TargetError::io(&dir, e))?;
        let map = JsonFileStore::open(self.root.join(META_DIR).join(format!("{client_name}.json")))?;
        self.clients
            .insert(client_name.to_string(), FingerprintStore::new(Box::new(map)));

        tracing::info!(client = client_name, "client registered on target");
        Ok(())
    }

    pub fn is_registered(&self, client_name: &str) -> bool {
        self.clients.contains_key(client_name)
    }

    /// Write a file and stamp it with the current time.
    pub fn update_file(
        &mut self,
        client_name: &str,
        file_key: &str,
        content: &[u8],
    ) -> Result<String, TargetError> {
        let token = unix_millis().to_string();
        self.update_file_with_token(client_name, file_key, content, &token)?;
        Ok(token)
    }

    /// Write a file and stamp it with the client's own freshness token, so
    /// the next comparison sees it as current.
    pub fn update_file_with_token(
        &mut self,
        client_name: &str,
        file_key: &str,
        content: &[u8],
        token: &str,
    ) -> Result<(), TargetError> {
        let path = self.file_path(client_name, file_key)?;
        let fingerprints = self
            .clients
            .get_mut(client_name)
            .ok_or_else(|| TargetError::UnknownClient(client_name.to_string()))?;

        write_atomic(&path, content)?;
        fingerprints.update(file_key, token)?;

        tracing::debug!(client = client_name, key = file_key, bytes = content.len(), "file stored");
        Ok(())
    }

    pub fn read_file(&self, client_name: &str, file_key: &str) -> Result<Vec<u8>, TargetError> {
        let path = self.file_path(client_name, file_key)?;
        fs::read(&path).map_err(|e| TargetError::io(&path, e))
    }

    /// Everything held for a client; empty for unknown clients.
    pub fn tree(&self, client_name: &str) -> FingerprintMap {
        self.clients
            .get(client_name)
            .map(FingerprintStore::snapshot)
            .unwrap_or_default()
    }

    /// Whether a file with this token must be (re)sent.
    pub fn needs_transfer(&self, client_name: &str, file_key: &str, token: &str) -> bool {
        self.clients
            .get(client_name)
            .and_then(|fingerprints| fingerprints.token(file_key))
            .is_none_or(|held| held != token)
    }

    fn file_path(&self, client_name: &str, file_key: &str) -> Result<PathBuf, TargetError> {
        if !self.clients.contains_key(client_name) {
            return Err(TargetError::UnknownClient(client_name.to_string()));
        }
        let relative = Path::new(file_key);
        let plain = !file_key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(TargetError::InvalidKey(file_key.to_string()));
        }
        Ok(self.root.join(client_name).join(relative))
    }
}

fn is_single_component(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none()
        && !name.starts_with('.')
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<(), TargetError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| TargetError::io(parent, e))?;
    }
    let tmp = path.with_extension("stowage-part");
    let mut file = fs::File::create(&tmp).map_err(|e| TargetError::io(&tmp, e))?;
    file.write_all(content)
        .and_then(|_| file.sync_all())
        .map_err(|e| TargetError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| TargetError::io(path, e))
}

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("client `{0}` is not registered on this target")]
    UnknownClient(String),
    #[error("invalid client name `{0}`")]
    InvalidName(String),
    #[error("file key `{0}` must be a relative path without `..`")]
    InvalidKey(String),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TargetError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
