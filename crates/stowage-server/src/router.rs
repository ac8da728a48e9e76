//! The job router: the single trust boundary between clients and targets.
//!
//! Each registry sits behind its own lock, and a handler holds at most one
//! write lock at a time. Authentication always happens before any registry
//! is touched; registration is the one write gated on its own proof.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use stowage_core::fingerprint::sha256_hex;
use stowage_core::identity::verify;
use stowage_core::job::{CheckinClient, Decoded, GetTree, RegisterClient, SendFile};
use stowage_core::{
    AuthProof, ErrorKind, FingerprintMap, Job, JobError, JobResult, JsonFileStore, KvStore,
    Request, Response, StoreError, TargetMessage, TargetReply, TargetTask, unix_millis,
};

use crate::config::ServerConfig;
use crate::registry::{LiveClient, LiveTarget, ServerStatus, TaskQueue, is_fresh};

const AUTH_FAILED: &str = "Could not authenticate client!";

pub struct JobRouter {
    config: ServerConfig,
    /// client name -> registered PEM public key
    clients: RwLock<Box<dyn KvStore>>,
    live_clients: RwLock<HashMap<String, LiveClient>>,
    live_targets: RwLock<HashMap<String, LiveTarget>>,
    queues: Mutex<HashMap<String, TaskQueue>>,
    /// (target, client) -> tree the target last reported
    trees: RwLock<HashMap<(String, String), FingerprintMap>>,
}

impl JobRouter {
    pub fn new(config: ServerConfig, registry: Box<dyn KvStore>) -> Self {
        Self {
            config,
            clients: RwLock::new(registry),
            live_clients: RwLock::new(HashMap::new()),
            live_targets: RwLock::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            trees: RwLock::new(HashMap::new()),
        }
    }

    /// Router backed by the on-disk client registry under `data_dir`.
    pub fn open(config: ServerConfig) -> Result<Self, StoreError> {
        let registry = JsonFileStore::open(config.registry_path())?;
        Ok(Self::new(config, Box::new(registry)))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Handle a raw wire submission.
    pub async fn handle_value(&self, value: Value) -> Response {
        self.handle_request(Request::decode(value)).await
    }

    pub async fn handle_request(&self, request: Request) -> Response {
        match request {
            Request::Single(decoded) => Response::Single(self.handle_decoded(decoded).await),
            Request::Batch(members) => {
                tracing::debug!(jobs = members.len(), "batch received");
                let mut results = Vec::with_capacity(members.len());
                for member in members {
                    results.push(self.handle_decoded(member).await);
                }
                Response::Batch(results)
            }
        }
    }

    /// Handle an already-typed job; a batch yields one result per member.
    pub async fn handle_job(&self, job: Job) -> Response {
        match job {
            Job::Batch(batch) => {
                let mut results = Vec::with_capacity(batch.jobs.len());
                for member in batch.jobs {
                    results.push(self.dispatch(member).await);
                }
                Response::Batch(results)
            }
            job => Response::Single(self.dispatch(job).await),
        }
    }

    async fn handle_decoded(&self, decoded: Decoded) -> JobResult {
        match decoded.job {
            Ok(job) => self.dispatch(job).await,
            Err(e) => {
                tracing::debug!(uuid = %decoded.uuid, "rejected job: {}", e);
                JobResult::failed(decoded.uuid, ErrorKind::Structural, e.to_string())
            }
        }
    }

    async fn dispatch(&self, job: Job) -> JobResult {
        let kind = job.kind();
        let uuid = job.uuid();
        let result = match job {
            Job::RegisterClient(job) => self.register_client(job).await,
            Job::CheckinClient(job) => self.checkin_client(job).await,
            Job::GetTree(job) => self.get_tree(job).await,
            Job::SendFile(job) => self.send_file(job).await,
            Job::Batch(_) => JobResult::failed(
                uuid.to_string(),
                ErrorKind::Structural,
                JobError::NestedBatch.to_string(),
            ),
        };

        match result.error {
            Some(ErrorKind::Authentication) => {
                tracing::warn!(%kind, %uuid, "authentication failed")
            }
            _ => tracing::debug!(%kind, %uuid, success = result.success, "job handled"),
        }
        result
    }

    /// Verify `auth` against the key stored for `client_name`.
    async fn authenticate(&self, client_name: &str, auth: &AuthProof) -> Result<(), String> {
        let stored = self.clients.read().await.get(client_name);
        match stored {
            Some(public_key) if verify(auth, &public_key) => Ok(()),
            Some(_) => Err(AUTH_FAILED.to_string()),
            None => Err(format!("{AUTH_FAILED} Unknown client `{client_name}`.")),
        }
    }

    async fn register_client(&self, job: RegisterClient) -> JobResult {
        let uuid = job.uuid.to_string();

        // The registering key must sign its own registration.
        if !verify(&job.auth, &job.public_key) {
            return JobResult::failed(uuid, ErrorKind::Authentication, AUTH_FAILED);
        }

        let mut clients = self.clients.write().await;
        match clients.get(&job.client_name) {
            Some(existing) if existing == job.public_key => {
                return JobResult::ok(uuid).with_msg("Client already registered.");
            }
            Some(existing) => {
                // Replacing a key needs the old key's signature over the new one.
                let endorsed = job.renewal.as_ref().is_some_and(|renewal| {
                    renewal.message == sha256_hex(job.public_key.as_bytes())
                        && verify(renewal, &existing)
                });
                if !endorsed {
                    return JobResult::failed(
                        uuid,
                        ErrorKind::Authentication,
                        format!("Client `{}` is registered with another key.", job.client_name),
                    );
                }
                tracing::info!(client = %job.client_name, "client key renewed");
            }
            None => tracing::info!(client = %job.client_name, "client registered"),
        }

        if let Err(e) = clients.put(&job.client_name, &job.public_key) {
            tracing::warn!(client = %job.client_name, "registry write failed: {}", e);
            return JobResult {
                success: false,
                msg: Some(format!("Could not store registration: {e}")),
                ..JobResult::ok(uuid)
            };
        }
        JobResult::ok(uuid)
    }

    async fn checkin_client(&self, job: CheckinClient) -> JobResult {
        let uuid = job.uuid.to_string();
        if let Err(msg) = self.authenticate(&job.client_name, &job.auth).await {
            return JobResult::failed(uuid, ErrorKind::Authentication, msg);
        }

        let now = unix_millis();
        let (online, offline): (Vec<String>, Vec<String>) = {
            let targets = self.live_targets.read().await;
            let ttl = self.config.target_ttl();
            job.target_names.into_iter().partition(|name| {
                targets
                    .get(name)
                    .is_some_and(|target| target.is_online(now, ttl))
            })
        };

        self.live_clients.write().await.insert(
            job.client_name.clone(),
            LiveClient {
                last_checkin_ms: now,
                online_targets: online.clone(),
            },
        );
        tracing::debug!(client = %job.client_name, ?online, ?offline, "checkin");

        let mut result = JobResult::ok(uuid);
        result.online_targets = Some(online);
        result.offline_targets = Some(offline);
        result
    }

    async fn get_tree(&self, job: GetTree) -> JobResult {
        let uuid = job.uuid.to_string();
        if let Err(msg) = self.authenticate(&job.client_name, &job.auth).await {
            return JobResult::failed(uuid, ErrorKind::Authentication, msg);
        }
        if !self.target_online(&job.target_name).await {
            return offline(uuid, &job.target_name);
        }

        self.enqueue(
            &job.target_name,
            TargetTask::ReportTree {
                client_name: job.client_name.clone(),
                job_uuid: uuid.clone(),
            },
        )
        .await;

        let tree = self
            .trees
            .read()
            .await
            .get(&(job.target_name, job.client_name))
            .cloned();

        let mut result = JobResult::ok(uuid).with_msg("\"GetTree\" job queued.");
        result.tree = tree;
        result
    }

    async fn send_file(&self, job: SendFile) -> JobResult {
        let uuid = job.uuid.to_string();
        if let Err(msg) = self.authenticate(&job.client_name, &job.auth).await {
            return JobResult::failed(uuid, ErrorKind::Authentication, msg);
        }
        if !self.target_online(&job.target_name).await {
            return offline(uuid, &job.target_name);
        }

        self.enqueue(
            &job.target_name,
            TargetTask::StoreFile {
                client_name: job.client_name,
                job_uuid: uuid.clone(),
                path_fingerprint: job.path_fingerprint,
                token: job.token,
                content: job.content,
            },
        )
        .await;
        JobResult::ok(uuid).with_msg("\"SendFile\" job queued.")
    }

    async fn target_online(&self, target_name: &str) -> bool {
        let now = unix_millis();
        self.live_targets
            .read()
            .await
            .get(target_name)
            .is_some_and(|target| target.is_online(now, self.config.target_ttl()))
    }

    async fn enqueue(&self, target_name: &str, task: TargetTask) {
        self.queues
            .lock()
            .await
            .entry(target_name.to_string())
            .or_default()
            .push(task);
    }

    /// Handle a message from a target.
    pub async fn handle_target(&self, message: TargetMessage) -> TargetReply {
        let target_name = message.target_name().to_string();
        if !self.config.target_allowed(&target_name) {
            tracing::warn!(%target_name, "target not allowed");
            return TargetReply::Error {
                code: "forbidden".into(),
                message: format!("Target `{target_name}` is not allowed."),
            };
        }

        match message {
            TargetMessage::Announce { .. } => {
                self.mark_seen(&target_name).await;
                tracing::info!(%target_name, "target online");
                TargetReply::Ack
            }
            TargetMessage::Disconnect { .. } => {
                if let Some(target) = self.live_targets.write().await.get_mut(&target_name) {
                    target.reachable = false;
                }
                tracing::info!(%target_name, "target disconnected");
                TargetReply::Ack
            }
            TargetMessage::Poll { .. } => {
                self.mark_seen(&target_name).await;
                let tasks = self
                    .queues
                    .lock()
                    .await
                    .get_mut(&target_name)
                    .filter(|queue| !queue.is_empty())
                    .map(TaskQueue::drain)
                    .unwrap_or_default();
                if !tasks.is_empty() {
                    tracing::debug!(%target_name, tasks = tasks.len(), "tasks delivered");
                }
                TargetReply::Tasks { tasks }
            }
            TargetMessage::ReportTree {
                client_name,
                job_uuid,
                tree,
                ..
            } => {
                tracing::debug!(%target_name, client = %client_name, %job_uuid,
                    files = tree.len(), "tree reported");
                self.trees
                    .write()
                    .await
                    .insert((target_name, client_name), tree);
                TargetReply::Ack
            }
        }
    }

    async fn mark_seen(&self, target_name: &str) {
        self.live_targets.write().await.insert(
            target_name.to_string(),
            LiveTarget {
                last_seen_ms: unix_millis(),
                reachable: true,
            },
        );
    }

    /// Drop live entries that have not been refreshed within their TTL.
    ///
    /// Queued tasks survive so a target that comes back still gets them.
    pub async fn sweep(&self) {
        let now = unix_millis();
        let evicted_clients = evict(&self.live_clients, self.config.client_ttl(), now, |c| {
            c.last_checkin_ms
        })
        .await;
        let evicted_targets = evict(&self.live_targets, self.config.target_ttl(), now, |t| {
            t.last_seen_ms
        })
        .await;

        if !evicted_clients.is_empty() || !evicted_targets.is_empty() {
            tracing::info!(?evicted_clients, ?evicted_targets, "stale entries evicted");
        }
    }

    pub async fn live_client(&self, client_name: &str) -> Option<LiveClient> {
        self.live_clients.read().await.get(client_name).cloned()
    }

    pub async fn status(&self) -> ServerStatus {
        let now = unix_millis();
        let registered_clients = self.clients.read().await.entries().len();
        let live_clients = self
            .live_clients
            .read()
            .await
            .values()
            .filter(|c| is_fresh(c.last_checkin_ms, now, self.config.client_ttl()))
            .count();
        let mut online_targets: Vec<String> = self
            .live_targets
            .read()
            .await
            .iter()
            .filter(|(_, t)| t.is_online(now, self.config.target_ttl()))
            .map(|(name, _)| name.clone())
            .collect();
        online_targets.sort();
        let queued_tasks = self.queues.lock().await.values().map(TaskQueue::len).sum();

        ServerStatus {
            registered_clients,
            live_clients,
            online_targets,
            queued_tasks,
        }
    }
}

fn offline(uuid: String, target_name: &str) -> JobResult {
    JobResult::failed(
        uuid,
        ErrorKind::UnavailableTarget,
        format!("Target `{target_name}` is offline -- job cannot be queued."),
    )
}

async fn evict<T>(
    map: &RwLock<HashMap<String, T>>,
    ttl: Duration,
    now: u64,
    last_seen: impl Fn(&T) -> u64,
) -> Vec<String> {
    let mut map = map.write().await;
    let stale: Vec<String> = map
        .iter()
        .filter(|(_, entry)| !is_fresh(last_seen(entry), now, ttl))
        .map(|(name, _)| name.clone())
        .collect();
    for name in &stale {
        map.remove(name);
    }
    stale
}
