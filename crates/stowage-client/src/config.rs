use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use stowage_core::FingerprintOptions;
use stowage_core::identity::DEFAULT_KEY_BITS;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub client_name: String,
    /// Base URL of the server, e.g. `http://127.0.0.1:8400`.
    pub server_address: String,
    pub targets: Vec<String>,
    /// Length of the random message signed for each job.
    pub auto_signature_len: usize,
    pub hash_filenames: bool,
    pub hash_times: bool,
    /// Directory that receives a plain copy of every transferred file.
    pub local_target: Option<PathBuf>,
    /// Holds keys and the local fingerprint map, one subdirectory per client.
    pub data_dir: PathBuf,
    /// Directory tree being backed up.
    pub watch_root: PathBuf,
    pub request_timeout_secs: u64,
    pub key_bits: usize,
    /// Largest request body a flush builds. Keep it under the server's
    /// `max_body_bytes`; a single job larger than this is sent on its own.
    pub max_batch_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: "client".to_string(),
            server_address: "http://127.0.0.1:8400".to_string(),
            targets: Vec::new(),
            auto_signature_len: 32,
            hash_filenames: false,
            hash_times: false,
            local_target: None,
            data_dir: PathBuf::from("client_data"),
            watch_root: PathBuf::from("."),
            request_timeout_secs: 30,
            key_bits: DEFAULT_KEY_BITS,
            max_batch_bytes: 32 * 1024 * 1024,
        }
    }
}

impl ClientConfig {
    pub fn fingerprint_options(&self) -> FingerprintOptions {
        FingerprintOptions {
            hash_filenames: self.hash_filenames,
            hash_times: self.hash_times,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// `<data_dir>/<client_name>`
    pub fn client_dir(&self) -> PathBuf {
        self.data_dir.join(&self.client_name)
    }

    pub fn queue_file(&self) -> PathBuf {
        self.client_dir().join("queues.json")
    }
}
