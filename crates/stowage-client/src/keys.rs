//! Where a client's key pair lives between runs.

use std::fs;
use std::path::{Path, PathBuf};

use stowage_core::{KeyError, KeyPair, unix_millis};

const PUBLIC_FILE: &str = "public.pem";
const PRIVATE_FILE: &str = "private.pem";
const INFO_FILE: &str = "info.txt";

pub trait KeyProvider {
    /// Load the identity's keys, generating and persisting them on first use.
    fn load_or_create(&self, identity_name: &str) -> Result<KeyPair, KeyFileError>;
}

/// Keys as PEM files under `<root>/<name>/rsa_keys/`.
///
/// `info.txt` is written last and marks the pair as complete; a directory
/// without it is regenerated.
pub struct PemKeyDir {
    root: PathBuf,
    bits: usize,
}

impl PemKeyDir {
    pub fn new(root: impl Into<PathBuf>, bits: usize) -> Self {
        Self {
            root: root.into(),
            bits,
        }
    }

    pub fn key_dir(&self, identity_name: &str) -> PathBuf {
        self.root.join(identity_name).join("rsa_keys")
    }

    fn create(&self, dir: &Path) -> Result<KeyPair, KeyFileError> {
        fs::create_dir_all(dir).map_err(|e| KeyFileError::io(dir, e))?;
        let pair = KeyPair::generate(self.bits)?;

        write(&dir.join(PRIVATE_FILE), pair.private_pem())?;
        restrict(&dir.join(PRIVATE_FILE))?;
        write(&dir.join(PUBLIC_FILE), pair.public_pem())?;
        write(
            &dir.join(INFO_FILE),
            &format!("key_size={}\ntimestamp={}\n", self.bits, unix_millis() / 1000),
        )?;

        tracing::info!(dir = %dir.display(), bits = self.bits, "generated client key pair");
        Ok(pair)
    }
}

impl KeyProvider for PemKeyDir {
    fn load_or_create(&self, identity_name: &str) -> Result<KeyPair, KeyFileError> {
        let dir = self.key_dir(identity_name);
        if !dir.join(INFO_FILE).exists() {
            return self.create(&dir);
        }
        let public = read(&dir.join(PUBLIC_FILE))?;
        let private = read(&dir.join(PRIVATE_FILE))?;
        Ok(KeyPair::from_pem(public, private)?)
    }
}

fn read(path: &Path) -> Result<String, KeyFileError> {
    fs::read_to_string(path).map_err(|e| KeyFileError::io(path, e))
}

fn write(path: &Path, contents: &str) -> Result<(), KeyFileError> {
    fs::write(path, contents).map_err(|e| KeyFileError::io(path, e))
}

#[cfg(unix)]
fn restrict(path: &Path) -> Result<(), KeyFileError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|e| KeyFileError::io(path, e))
}

#[cfg(not(unix))]
fn restrict(_path: &Path) -> Result<(), KeyFileError> {
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum KeyFileError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Key(#[from] KeyError),
}

impl KeyFileError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
