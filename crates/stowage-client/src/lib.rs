//! The stowage client.
//!
//! A [`Coordinator`] signs every job with the client's key, keeps per-target
//! delivery queues that follow the liveness reported at checkin, and diffs
//! its local fingerprints against what each target holds so that only
//! changed files are sent.

mod config;
mod coordinator;
mod keys;
mod queues;
mod transport;
mod tree;

pub use config::ClientConfig;
pub use coordinator::{
    CheckinOutcome, Coordinator, CoordinatorError, CycleReport, Delivery, FlushReport, SyncOutcome,
};
pub use keys::{KeyFileError, KeyProvider, PemKeyDir};
pub use queues::{DeliveryQueues, JobSummary, QueueFileError, QueueSummary};
pub use transport::{HttpTransport, Transport, TransportError};
pub use tree::{FileEnumerator, LocalTree, TreeError, WalkDirEnumerator};
