//! A stowage backup target.
//!
//! Holds one directory and one fingerprint map per client, and decides from
//! fingerprints alone whether a file needs to be written again.

mod agent;
mod config;
mod store;

pub use agent::{HttpLink, LinkError, ServerLink, TargetAgent};
pub use config::TargetConfig;
pub use store::{TargetError, TargetStore};
