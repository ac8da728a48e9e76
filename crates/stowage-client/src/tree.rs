//! The client's view of its own files.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

use stowage_core::fingerprint::file_fingerprint;
use stowage_core::{FingerprintMap, FingerprintOptions, FingerprintStore, StoreError};

/// Lists the files to back up, as paths relative to a root.
pub trait FileEnumerator: Send + Sync {
    fn root(&self) -> &Path;
    fn list_tracked_files(&self) -> io::Result<Vec<(PathBuf, SystemTime)>>;
}

/// Every regular file below `root`, minus excluded subtrees.
pub struct WalkDirEnumerator {
    root: PathBuf,
    excluded: Vec<PathBuf>,
}

impl WalkDirEnumerator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            excluded: Vec::new(),
        }
    }

    /// Skip everything under `path`, e.g. the client's own data directory.
    pub fn exclude(mut self, path: impl Into<PathBuf>) -> Self {
        self.excluded.push(path.into());
        self
    }
}

impl FileEnumerator for WalkDirEnumerator {
    fn root(&self) -> &Path {
        &self.root
    }

    fn list_tracked_files(&self) -> io::Result<Vec<(PathBuf, SystemTime)>> {
        let mut files = Vec::new();
        let walker = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !self.excluded.iter().any(|ex| entry.path().starts_with(ex)));

        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| io::Error::other(e.to_string()))?;
            files.push((relative.to_path_buf(), modified));
        }
        Ok(files)
    }
}

/// Local fingerprints plus the path each key came from.
pub struct LocalTree {
    fingerprints: FingerprintStore,
    paths: HashMap<String, PathBuf>,
    options: FingerprintOptions,
}

impl LocalTree {
    pub fn new(fingerprints: FingerprintStore, options: FingerprintOptions) -> Self {
        Self {
            fingerprints,
            paths: HashMap::new(),
            options,
        }
    }

    /// Recompute every fingerprint from the file system.
    pub fn rebuild(&mut self, files: &dyn FileEnumerator) -> Result<usize, TreeError> {
        let root = files.root();
        let mut map = FingerprintMap::new();
        let mut paths = HashMap::new();

        for (relative, modified) in files.list_tracked_files().map_err(|e| TreeError::io(root, e))? {
            let (key, token) = file_fingerprint(&relative, modified, self.options);
            paths.insert(key.clone(), root.join(&relative));
            map.insert(key, token);
        }

        let count = map.len();
        self.fingerprints.replace_all(map)?;
        self.paths = paths;
        tracing::debug!(root = %root.display(), files = count, "local tree rebuilt");
        Ok(count)
    }

    pub fn snapshot(&self) -> FingerprintMap {
        self.fingerprints.snapshot()
    }

    pub fn token(&self, key: &str) -> Option<String> {
        self.fingerprints.token(key)
    }

    pub fn path_of(&self, key: &str) -> Option<&Path> {
        self.paths.get(key).map(PathBuf::as_path)
    }

    pub fn read(&self, key: &str) -> Result<Vec<u8>, TreeError> {
        let path = self
            .path_of(key)
            .ok_or_else(|| TreeError::UnknownKey(key.to_string()))?;
        fs::read(path).map_err(|e| TreeError::io(path, e))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("no tracked file for key `{0}`")]
    UnknownKey(String),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TreeError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
