use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub target_name: String,
    /// Base URL of the server, e.g. `http://127.0.0.1:8400`.
    pub server_address: String,
    pub storage_root: PathBuf,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            target_name: "target".to_string(),
            server_address: "http://127.0.0.1:8400".to_string(),
            storage_root: PathBuf::from("target_data"),
            poll_interval_secs: 5,
            request_timeout_secs: 30,
        }
    }
}

impl TargetConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
