//! Core types for stowage.
//!
//! This crate holds the protocol primitives shared by client, server and
//! target: signed identities, the job model and its results, fingerprint
//! comparison, target-plane messages and the key-value store contract.

mod encoding;
pub mod fingerprint;
pub mod identity;
pub mod job;
mod message;
mod result;
pub mod store;

pub use fingerprint::{FingerprintMap, FingerprintOptions, SyncPlan};
pub use identity::{AuthProof, Identity, KeyError, KeyPair};
pub use job::{Batch, Job, JobError, JobKind, Request};
pub use message::{TargetMessage, TargetReply, TargetTask};
pub use result::{ErrorKind, JobResult, Response};
pub use store::{FingerprintStore, JsonFileStore, KvStore, MemoryStore, StoreError};

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
