//! Live state kept by the router. Nothing here is persisted.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use stowage_core::TargetTask;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveClient {
    pub last_checkin_ms: u64,
    pub online_targets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveTarget {
    pub last_seen_ms: u64,
    pub reachable: bool,
}

impl LiveTarget {
    /// Reachable and heard from within `ttl`.
    pub fn is_online(&self, now_ms: u64, ttl: Duration) -> bool {
        self.reachable && is_fresh(self.last_seen_ms, now_ms, ttl)
    }
}

pub fn is_fresh(last_ms: u64, now_ms: u64, ttl: Duration) -> bool {
    now_ms.saturating_sub(last_ms) <= ttl.as_millis() as u64
}

/// Tasks waiting for one target, kept per client in arrival order.
#[derive(Debug, Default)]
pub struct TaskQueue {
    by_client: HashMap<String, VecDeque<TargetTask>>,
}

impl TaskQueue {
    pub fn push(&mut self, task: TargetTask) {
        self.by_client
            .entry(task.client_name().to_string())
            .or_default()
            .push_back(task);
    }

    /// Take everything queued, each client's tasks in order.
    pub fn drain(&mut self) -> Vec<TargetTask> {
        let mut clients: Vec<_> = self.by_client.drain().collect();
        clients.sort_by(|a, b| a.0.cmp(&b.0));
        clients.into_iter().flat_map(|(_, tasks)| tasks).collect()
    }

    pub fn len(&self) -> usize {
        self.by_client.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_client.values().all(VecDeque::is_empty)
    }
}

/// Counts reported by `GET /status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub registered_clients: usize,
    pub live_clients: usize,
    pub online_targets: Vec<String>,
    pub queued_tasks: usize,
}
