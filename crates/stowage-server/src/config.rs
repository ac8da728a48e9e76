use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Holds the client registry.
    pub data_dir: PathBuf,
    /// A client with no checkin for this long is no longer live.
    pub client_ttl_secs: u64,
    /// A target with no announce or poll for this long is offline.
    pub target_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_body_bytes: usize,
    /// When set, only these target names may announce themselves.
    pub allowed_targets: Option<BTreeSet<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: ([127, 0, 0, 1], 8400).into(),
            data_dir: PathBuf::from("server_data"),
            client_ttl_secs: 300,
            target_ttl_secs: 120,
            sweep_interval_secs: 30,
            max_body_bytes: 64 * 1024 * 1024,
            allowed_targets: None,
        }
    }
}

impl ServerConfig {
    pub fn client_ttl(&self) -> Duration {
        Duration::from_secs(self.client_ttl_secs)
    }

    pub fn target_ttl(&self) -> Duration {
        Duration::from_secs(self.target_ttl_secs)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("client_registry.json")
    }

    pub fn target_allowed(&self, name: &str) -> bool {
        self.allowed_targets
            .as_ref()
            .is_none_or(|allowed| allowed.contains(name))
    }
}
