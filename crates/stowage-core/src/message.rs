//! Target-plane messages.
//!
//! Targets talk to the server over their own endpoint: they announce
//! themselves, poll for work queued by client jobs, and report what they hold.
//! Targets are trusted by connection, like a `local:` identity on a LAN.

use serde::{Deserialize, Serialize};

use crate::encoding::base64_bytes;
use crate::fingerprint::FingerprintMap;

/// Messages sent from a target to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetMessage {
    /// Mark the target live.
    Announce { target_name: String },
    /// Mark the target offline. Work queued for it is kept until it returns.
    Disconnect { target_name: String },
    /// Refresh liveness and drain queued tasks.
    Poll { target_name: String },
    /// Answer a [`TargetTask::ReportTree`].
    ReportTree {
        target_name: String,
        client_name: String,
        job_uuid: String,
        tree: FingerprintMap,
    },
}

impl TargetMessage {
    pub fn target_name(&self) -> &str {
        match self {
            TargetMessage::Announce { target_name }
            | TargetMessage::Disconnect { target_name }
            | TargetMessage::Poll { target_name }
            | TargetMessage::ReportTree { target_name, .. } => target_name,
        }
    }
}

/// Work the server queues for a target on behalf of a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetTask {
    /// Report the fingerprints held for `client_name`.
    ReportTree { client_name: String, job_uuid: String },
    /// Write one file for `client_name`.
    StoreFile {
        client_name: String,
        job_uuid: String,
        path_fingerprint: String,
        token: String,
        #[serde(with = "base64_bytes")]
        content: Vec<u8>,
    },
}

impl TargetTask {
    pub fn client_name(&self) -> &str {
        match self {
            TargetTask::ReportTree { client_name, .. }
            | TargetTask::StoreFile { client_name, .. } => client_name,
        }
    }
}

/// Messages sent from the server to a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetReply {
    Ack,
    Tasks { tasks: Vec<TargetTask> },
    Error { code: String, message: String },
}
