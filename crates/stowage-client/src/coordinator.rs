//! Builds and signs jobs, and keeps them queued until the server answers.

use std::collections::HashSet;
use std::fs;
use std::mem;
use std::path::{Path, PathBuf};

use serde::Serialize;
use stowage_core::fingerprint::diff;
use stowage_core::{
    Batch, FingerprintStore, Identity, Job, JobResult, JsonFileStore, KeyError, KeyPair, Response,
    StoreError, SyncPlan,
};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::keys::{KeyFileError, KeyProvider};
use crate::queues::{DeliveryQueues, QueueFileError, QueueSummary};
use crate::transport::{Transport, TransportError};
use crate::tree::{FileEnumerator, LocalTree, TreeError, WalkDirEnumerator};

/// Room for a batch's own fields around its jobs.
const BATCH_OVERHEAD: usize = 128;

pub struct Coordinator<T> {
    config: ClientConfig,
    identity: Identity,
    transport: T,
    queues: DeliveryQueues,
    /// Where the queues are saved after every change, if anywhere.
    queue_file: Option<PathBuf>,
    tree: LocalTree,
    files: Box<dyn FileEnumerator>,
}

#[derive(Debug, Clone)]
pub struct CheckinOutcome {
    pub result: JobResult,
    pub online: Vec<String>,
    pub offline: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub result: JobResult,
    /// `None` until the target has reported a tree for this client.
    pub plan: Option<SyncPlan>,
}

/// The server's answer to one flushed job.
#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    pub target: String,
    pub job_uuid: String,
    pub result: JobResult,
}

/// What a flush got through before it finished or stopped.
#[derive(Debug, Default)]
pub struct FlushReport {
    pub deliveries: Vec<Delivery>,
    /// Why the flush stopped early. Jobs without an answer stay queued.
    pub error: Option<CoordinatorError>,
}

/// What one `run_cycle` did.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub online: Vec<String>,
    pub offline: Vec<String>,
    pub queued: usize,
    pub mirrored: usize,
    pub deliveries: Vec<Delivery>,
    pub flush_error: Option<CoordinatorError>,
}

impl<T: Transport> Coordinator<T> {
    pub fn new(
        config: ClientConfig,
        keys: KeyPair,
        transport: T,
        files: Box<dyn FileEnumerator>,
        fingerprints: FingerprintStore,
    ) -> Self {
        let identity = Identity::new(config.client_name.clone(), keys, config.auto_signature_len);
        let queues = DeliveryQueues::new(config.targets.iter().cloned());
        let tree = LocalTree::new(fingerprints, config.fingerprint_options());
        Self {
            config,
            identity,
            transport,
            queues,
            queue_file: None,
            tree,
            files,
        }
    }

    /// Load keys from `provider`, persist fingerprints and queues under the
    /// client's data directory and watch `watch_root`.
    pub fn open(
        config: ClientConfig,
        provider: &dyn KeyProvider,
        transport: T,
    ) -> Result<Self, CoordinatorError> {
        let keys = provider.load_or_create(&config.client_name)?;
        let client_dir = config.client_dir();
        let fingerprints = JsonFileStore::open(client_dir.join("tree.json"))?;
        let queue_file = config.queue_file();
        let queues = DeliveryQueues::load(&queue_file, config.targets.iter().cloned())?;

        let mut files =
            WalkDirEnumerator::new(absolute(&config.watch_root)).exclude(absolute(&config.data_dir));
        if let Some(mirror) = &config.local_target {
            files = files.exclude(absolute(mirror));
        }

        let mut coordinator = Self::new(
            config,
            keys,
            transport,
            Box::new(files),
            FingerprintStore::new(Box::new(fingerprints)),
        );
        coordinator.queues = queues;
        coordinator.queue_file = Some(queue_file);
        Ok(coordinator)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn queues(&self) -> &DeliveryQueues {
        &self.queues
    }

    pub fn local_tree(&self) -> &LocalTree {
        &self.tree
    }

    /// Rescan the watched files.
    pub fn refresh_tree(&mut self) -> Result<usize, CoordinatorError> {
        Ok(self.tree.rebuild(self.files.as_ref())?)
    }

    /// Register the public key with the server. The raw result is returned
    /// whatever it says.
    pub async fn register(&self) -> Result<JobResult, CoordinatorError> {
        let job = Job::register_client(
            self.identity.name(),
            self.identity.public_pem(),
            self.identity.prove(None)?,
        );
        let result = self.submit_one(&job).await?;
        tracing::info!(success = result.success, msg = ?result.msg, "registration answered");
        Ok(result)
    }

    /// Tell the server we are alive and learn which targets are reachable.
    ///
    /// Queues move only on a successful answer.
    pub async fn checkin(&mut self) -> Result<CheckinOutcome, CoordinatorError> {
        let job = Job::checkin_client(
            self.identity.name(),
            self.config.targets.iter().cloned(),
            self.identity.prove(None)?,
        );
        let result = self.submit_one(&job).await?;
        if !result.success {
            tracing::warn!(msg = ?result.msg, "checkin refused");
            return Ok(CheckinOutcome {
                result,
                online: Vec::new(),
                offline: Vec::new(),
            });
        }

        let online = result.online_targets.clone().unwrap_or_default();
        let offline = result.offline_targets.clone().unwrap_or_default();
        self.queues.apply_checkin(&online, &offline);
        self.persist()?;
        tracing::debug!(?online, ?offline, "checked in");
        Ok(CheckinOutcome {
            result,
            online,
            offline,
        })
    }

    /// Ask for the target's tree and diff it against the local snapshot.
    ///
    /// The server answers with the last tree the target reported and asks it
    /// for a fresh one, so that tree can predate recent deliveries. Files
    /// delivered since are counted as held until a report shows them.
    pub async fn sync_target(&mut self, target: &str) -> Result<SyncOutcome, CoordinatorError> {
        let job = Job::get_tree(self.identity.name(), target, self.identity.prove(None)?);
        let result = self.submit_one(&job).await?;

        let plan = match &result.tree {
            Some(reported) if result.success => {
                let held = self.queues.reconcile(target, reported);
                self.persist()?;
                Some(diff(&self.tree.snapshot(), &held))
            }
            _ => None,
        };
        if let Some(plan) = &plan {
            tracing::debug!(target_name = %target, transfer = plan.transfer.len(),
                delete = plan.delete.len(), "sync plan");
            if !plan.delete.is_empty() {
                tracing::info!(target_name = %target, keys = ?plan.delete,
                    "target holds files no longer present locally");
            }
        }
        Ok(SyncOutcome { result, plan })
    }

    /// Queue a signed `SendFile` for every key the plan says to transfer.
    ///
    /// A transfer already waiting for the same key and token is not queued
    /// twice. Returns the number of jobs added.
    pub fn queue_transfers(
        &mut self,
        target: &str,
        plan: &SyncPlan,
    ) -> Result<usize, CoordinatorError> {
        let mut queued = 0;
        for key in &plan.transfer {
            let Some(token) = self.tree.token(key) else {
                continue;
            };
            if self.queues.has_transfer(target, key, &token) {
                continue;
            }
            let content = self.tree.read(key)?;
            let job = Job::send_file(
                self.identity.name(),
                target,
                key.as_str(),
                token,
                content,
                self.identity.prove(None)?,
            );
            self.queues.enqueue(target, job);
            queued += 1;
        }
        if queued > 0 {
            self.persist()?;
            tracing::info!(target_name = %target, jobs = queued, "transfers queued");
        }
        Ok(queued)
    }

    /// Submit every online target's active jobs in batches of at most
    /// `max_batch_bytes`.
    ///
    /// Each batch leaves the queues as soon as it is answered, whatever the
    /// answers say; failures are reported back, not retried. The flush stops
    /// at the first error, keeping what was delivered until then, and every
    /// job without an answer stays where it was.
    pub async fn flush(&mut self) -> FlushReport {
        let mut report = FlushReport::default();
        if let Err(e) = self.flush_into(&mut report.deliveries).await {
            tracing::warn!(delivered = report.deliveries.len(), "Flush stopped: {}", e);
            report.error = Some(e);
        }
        report
    }

    async fn flush_into(&mut self, deliveries: &mut Vec<Delivery>) -> Result<(), CoordinatorError> {
        let targets: Vec<String> = self.queues.online_targets().map(str::to_string).collect();
        for target in targets {
            for batch in self.split_batches(&target)? {
                self.deliver(&target, batch, deliveries).await?;
            }
        }
        Ok(())
    }

    fn split_batches(&self, target: &str) -> Result<Vec<Batch>, CoordinatorError> {
        let budget = self.config.max_batch_bytes;
        let mut batches = Vec::new();
        let mut batch = Batch::new();
        let mut size = BATCH_OVERHEAD;

        for job in self.queues.active(target) {
            // One separating comma per member.
            let len = serde_json::to_vec(job)?.len() + 1;
            if !batch.is_empty() && size + len > budget {
                batches.push(mem::take(&mut batch));
                size = BATCH_OVERHEAD;
            }
            if BATCH_OVERHEAD + len > budget {
                tracing::warn!(target_name = %target, job = %job.uuid(), bytes = len,
                    "job exceeds max_batch_bytes, sending it alone");
            }
            size += len;
            batch.add(job.clone());
        }
        if !batch.is_empty() {
            batches.push(batch);
        }
        Ok(batches)
    }

    /// Submit one batch and acknowledge every job the answer accounts for.
    async fn deliver(
        &mut self,
        target: &str,
        batch: Batch,
        deliveries: &mut Vec<Delivery>,
    ) -> Result<(), CoordinatorError> {
        let submitted: Vec<(Uuid, Option<(String, String)>)> = batch
            .jobs
            .iter()
            .map(|job| {
                let file = match job {
                    Job::SendFile(f) => Some((f.path_fingerprint.clone(), f.token.clone())),
                    _ => None,
                };
                (job.uuid(), file)
            })
            .collect();
        let results = self.transport.submit(&Job::Batch(batch)).await?.into_results();

        // Answers come back in submission order. If some are missing, only
        // the ones naming a submitted job can be paired.
        let answered: Vec<(usize, JobResult)> = if results.len() == submitted.len() {
            results.into_iter().enumerate().collect()
        } else {
            results
                .into_iter()
                .filter_map(|result| {
                    let index = submitted
                        .iter()
                        .position(|(uuid, _)| result.job_uuid == uuid.to_string())?;
                    Some((index, result))
                })
                .collect()
        };

        let acknowledged: HashSet<Uuid> = answered.iter().map(|(i, _)| submitted[*i].0).collect();
        self.queues.acknowledge(target, &acknowledged);
        let mut failed = 0;
        for (index, result) in answered {
            let (uuid, file) = &submitted[index];
            if !result.success {
                failed += 1;
            } else if let Some((key, token)) = file {
                self.queues.record_delivery(target, key, token);
            }
            deliveries.push(Delivery {
                target: target.to_string(),
                job_uuid: uuid.to_string(),
                result,
            });
        }
        self.persist()?;
        tracing::info!(target_name = %target, jobs = acknowledged.len(), failed, "batch delivered");

        if acknowledged.len() != submitted.len() {
            return Err(CoordinatorError::UnexpectedResponse(format!(
                "{} jobs submitted, {} answered",
                submitted.len(),
                acknowledged.len()
            )));
        }
        Ok(())
    }

    pub fn list_jobs(&self) -> Vec<QueueSummary> {
        self.queues.summary()
    }

    /// Copy the plan's files into `local_target`, if one is configured.
    pub fn mirror_locally(&self, plan: &SyncPlan) -> Result<usize, CoordinatorError> {
        let Some(mirror) = &self.config.local_target else {
            return Ok(0);
        };
        let base = mirror.join(&self.config.client_name);

        let mut copied = 0;
        for key in &plan.transfer {
            let Some(source) = self.tree.path_of(key) else {
                continue;
            };
            let dest = base.join(key);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| CoordinatorError::io(parent, e))?;
            }
            fs::copy(source, &dest).map_err(|e| CoordinatorError::io(&dest, e))?;
            copied += 1;
        }
        if copied > 0 {
            tracing::debug!(mirror = %base.display(), files = copied, "mirrored locally");
        }
        Ok(copied)
    }

    /// Rescan, check in, sync every online target and flush.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, CoordinatorError> {
        self.refresh_tree()?;
        let checkin = self.checkin().await?;
        if !checkin.result.success {
            return Err(CoordinatorError::Rejected(checkin.result));
        }

        let mut report = CycleReport {
            online: checkin.online,
            offline: checkin.offline,
            ..CycleReport::default()
        };
        for target in report.online.clone() {
            let sync = self.sync_target(&target).await?;
            if let Some(plan) = sync.plan {
                report.queued += self.queue_transfers(&target, &plan)?;
                report.mirrored += self.mirror_locally(&plan)?;
            }
        }
        let flushed = self.flush().await;
        report.deliveries = flushed.deliveries;
        report.flush_error = flushed.error;
        Ok(report)
    }

    fn persist(&self) -> Result<(), CoordinatorError> {
        match &self.queue_file {
            Some(path) => Ok(self.queues.save(path)?),
            None => Ok(()),
        }
    }

    async fn submit_one(&self, job: &Job) -> Result<JobResult, CoordinatorError> {
        match self.transport.submit(job).await? {
            Response::Single(result) => Ok(result),
            Response::Batch(_) => Err(CoordinatorError::UnexpectedResponse(format!(
                "{} answered with a batch",
                job.kind()
            ))),
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("signing: {0}")]
    Key(#[from] KeyError),
    #[error(transparent)]
    KeyFile(#[from] KeyFileError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Queues(#[from] QueueFileError),
    #[error("encoding job: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("server refused: {}", .0.msg.as_deref().unwrap_or("no reason given"))]
    Rejected(JobResult),
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl CoordinatorError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the failure left queued jobs untouched for a later attempt.
    pub fn is_transport(&self) -> bool {
        matches!(self, CoordinatorError::Transport(_))
    }
}
