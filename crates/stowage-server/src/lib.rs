//! The stowage server.
//!
//! Authenticates every client job against the registered public key, keeps
//! track of which clients and targets are live, and relays work to targets
//! through per-target task queues that targets drain by polling.

mod config;
mod http;
mod registry;
mod router;

pub use config::ServerConfig;
pub use http::{app, serve, serve_on};
pub use registry::{LiveClient, LiveTarget, ServerStatus};
pub use router::JobRouter;
