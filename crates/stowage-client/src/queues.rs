//! Per-target delivery queues.
//!
//! Each target has an `active` queue (sent on the next flush) and a
//! `deferred` queue (held while the server reports the target offline). A
//! job sits in exactly one of the two until it is acknowledged.
//!
//! Files the server accepted for a target are remembered until a tree the
//! target reports shows them, because trees lag behind deliveries.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stowage_core::{FingerprintMap, Job, JobKind};
use uuid::Uuid;

const QUEUE_FILE_VERSION: u32 = 1;

/// Reported trees that may omit a delivered file before it counts as lost.
const UNCONFIRMED_REPORT_LIMIT: u32 = 3;

#[derive(Debug, Default, Serialize, Deserialize)]
struct TargetQueue {
    active: VecDeque<Job>,
    deferred: VecDeque<Job>,
    #[serde(default)]
    unconfirmed: BTreeMap<String, Unconfirmed>,
    /// Liveness from the last checkin; `None` before the first one.
    #[serde(skip)]
    online: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Unconfirmed {
    token: String,
    /// Trees reported since delivery that did not show `token`.
    missed: u32,
}

#[derive(Serialize, Deserialize)]
struct StoredQueues<T> {
    version: u32,
    targets: T,
}

#[derive(Debug, Default)]
pub struct DeliveryQueues {
    targets: BTreeMap<String, TargetQueue>,
}

impl DeliveryQueues {
    pub fn new(targets: impl IntoIterator<Item = String>) -> Self {
        Self {
            targets: targets
                .into_iter()
                .map(|name| (name, TargetQueue::default()))
                .collect(),
        }
    }

    /// Queue a job. It is deferred straight away if the target was last
    /// reported offline.
    pub fn enqueue(&mut self, target: &str, job: Job) {
        let queue = self.targets.entry(target.to_string()).or_default();
        if queue.online == Some(false) {
            queue.deferred.push_back(job);
        } else {
            queue.active.push_back(job);
        }
    }

    /// Read queues saved by [`DeliveryQueues::save`], or start empty if
    /// `path` does not exist. Liveness is not persisted.
    pub fn load(
        path: &Path,
        targets: impl IntoIterator<Item = String>,
    ) -> Result<Self, QueueFileError> {
        let mut queues = if path.exists() {
            let raw = fs::read(path).map_err(|e| QueueFileError::io(path, e))?;
            let stored: StoredQueues<BTreeMap<String, TargetQueue>> =
                serde_json::from_slice(&raw).map_err(|e| QueueFileError::format(path, e))?;
            if stored.version != QUEUE_FILE_VERSION {
                return Err(QueueFileError::Version {
                    path: path.to_path_buf(),
                    found: stored.version,
                });
            }
            Self {
                targets: stored.targets,
            }
        } else {
            Self::default()
        };
        for name in targets {
            queues.targets.entry(name).or_default();
        }
        tracing::debug!(path = %path.display(), jobs = queues.pending(), "queues loaded");
        Ok(queues)
    }

    /// Write every queue to `path`, replacing it atomically.
    pub fn save(&self, path: &Path) -> Result<(), QueueFileError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| QueueFileError::io(parent, e))?;
        }
        let stored = StoredQueues {
            version: QUEUE_FILE_VERSION,
            targets: &self.targets,
        };
        let encoded = serde_json::to_vec(&stored).map_err(|e| QueueFileError::format(path, e))?;

        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).map_err(|e| QueueFileError::io(&tmp, e))?;
        file.write_all(&encoded)
            .and_then(|_| file.sync_all())
            .map_err(|e| QueueFileError::io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| QueueFileError::io(path, e))?;
        tracing::trace!(path = %path.display(), jobs = self.pending(), "queues saved");
        Ok(())
    }

    /// Move jobs between `active` and `deferred` from a checkin's partition.
    ///
    /// Repeating a checkin with the same partition changes nothing.
    pub fn apply_checkin(&mut self, online: &[String], offline: &[String]) {
        for name in offline {
            let queue = self.targets.entry(name.clone()).or_default();
            let moved = queue.active.len();
            queue.deferred.extend(queue.active.drain(..));
            queue.online = Some(false);
            if moved > 0 {
                tracing::info!(target_name = %name, jobs = moved, "target offline, jobs deferred");
            }
        }
        for name in online {
            let queue = self.targets.entry(name.clone()).or_default();
            let moved = queue.deferred.len();
            queue.active.extend(queue.deferred.drain(..));
            queue.online = Some(true);
            if moved > 0 {
                tracing::info!(target_name = %name, jobs = moved, "target online, jobs resumed");
            }
        }
    }

    pub fn active(&self, target: &str) -> impl Iterator<Item = &Job> {
        self.targets
            .get(target)
            .into_iter()
            .flat_map(|queue| queue.active.iter())
    }

    pub fn deferred(&self, target: &str) -> impl Iterator<Item = &Job> {
        self.targets
            .get(target)
            .into_iter()
            .flat_map(|queue| queue.deferred.iter())
    }

    pub fn is_online(&self, target: &str) -> Option<bool> {
        self.targets.get(target).and_then(|queue| queue.online)
    }

    /// Targets the last checkin reported online.
    pub fn online_targets(&self) -> impl Iterator<Item = &str> {
        self.targets
            .iter()
            .filter(|(_, queue)| queue.online == Some(true))
            .map(|(name, _)| name.as_str())
    }

    pub fn contains(&self, uuid: Uuid) -> bool {
        self.targets.values().any(|queue| {
            queue
                .active
                .iter()
                .chain(queue.deferred.iter())
                .any(|job| job.uuid() == uuid)
        })
    }

    /// Whether a transfer of `key` at `token` is already waiting for `target`.
    pub fn has_transfer(&self, target: &str, key: &str, token: &str) -> bool {
        let Some(queue) = self.targets.get(target) else {
            return false;
        };
        queue.active.iter().chain(queue.deferred.iter()).any(|job| {
            matches!(job, Job::SendFile(f) if f.path_fingerprint == key && f.token == token)
        })
    }

    /// Total number of unresolved jobs.
    pub fn pending(&self) -> usize {
        self.targets
            .values()
            .map(|queue| queue.active.len() + queue.deferred.len())
            .sum()
    }

    /// Drop jobs the server has answered.
    pub fn acknowledge(&mut self, target: &str, uuids: &HashSet<Uuid>) {
        if let Some(queue) = self.targets.get_mut(target) {
            queue.active.retain(|job| !uuids.contains(&job.uuid()));
            queue.deferred.retain(|job| !uuids.contains(&job.uuid()));
        }
    }

    /// Remember that the server accepted `key` at `token` for `target`.
    pub fn record_delivery(&mut self, target: &str, key: &str, token: &str) {
        self.targets.entry(target.to_string()).or_default().unconfirmed.insert(
            key.to_string(),
            Unconfirmed {
                token: token.to_string(),
                missed: 0,
            },
        );
    }

    /// The tree `target` holds once deliveries it has not reported yet are
    /// laid over `reported`.
    ///
    /// Deliveries the report shows are forgotten. So are deliveries missing
    /// from too many reports, which lets the next diff send them again.
    pub fn reconcile(&mut self, target: &str, reported: &FingerprintMap) -> FingerprintMap {
        let mut held = reported.clone();
        let Some(queue) = self.targets.get_mut(target) else {
            return held;
        };
        queue.unconfirmed.retain(|key, sent| {
            if reported.get(key) == Some(&sent.token) {
                return false;
            }
            sent.missed += 1;
            if sent.missed > UNCONFIRMED_REPORT_LIMIT {
                tracing::warn!(target_name = %target, %key, "delivered file never showed up");
                return false;
            }
            held.insert(key.clone(), sent.token.clone());
            true
        });
        held
    }

    /// Deliveries to `target` still waiting for a report that shows them.
    pub fn unconfirmed(&self, target: &str) -> usize {
        self.targets
            .get(target)
            .map_or(0, |queue| queue.unconfirmed.len())
    }

    pub fn summary(&self) -> Vec<QueueSummary> {
        let describe = |jobs: &VecDeque<Job>| -> Vec<JobSummary> {
            jobs.iter()
                .map(|job| JobSummary {
                    uuid: job.uuid(),
                    kind: job.kind(),
                })
                .collect()
        };
        self.targets
            .iter()
            .map(|(name, queue)| QueueSummary {
                target: name.clone(),
                online: queue.online,
                active: describe(&queue.active),
                deferred: describe(&queue.deferred),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSummary {
    pub target: String,
    pub online: Option<bool>,
    pub active: Vec<JobSummary>,
    pub deferred: Vec<JobSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub uuid: Uuid,
    #[serde(serialize_with = "kind_name")]
    pub kind: JobKind,
}

fn kind_name<S: serde::Serializer>(kind: &JobKind, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(kind.as_str())
}

#[derive(Debug, thiserror::Error)]
pub enum QueueFileError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path}: unsupported queue file version {found}")]
    Version { path: PathBuf, found: u32 },
}

impl QueueFileError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn format(path: &Path, source: serde_json::Error) -> Self {
        Self::Format {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_core::AuthProof;

    fn job() -> Job {
        let auth = AuthProof {
            message: "m".into(),
            hex_signature: "00".into(),
        };
        Job::send_file("alice", "t", "k", "1", Vec::new(), auth)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn uuids<'a>(jobs: impl Iterator<Item = &'a Job>) -> Vec<Uuid> {
        jobs.map(Job::uuid).collect()
    }

    #[test]
    fn offline_target_defers_active_jobs() {
        let mut queues = DeliveryQueues::new(names(&["targetA", "targetB"]));
        let (a, b) = (job(), job());
        let (a_id, b_id) = (a.uuid(), b.uuid());
        queues.enqueue("targetA", a);
        queues.enqueue("targetB", b);

        queues.apply_checkin(&names(&["targetA"]), &names(&["targetB"]));

        assert_eq!(uuids(queues.active("targetA")), vec![a_id]);
        assert_eq!(uuids(queues.deferred("targetB")), vec![b_id]);
        assert_eq!(queues.active("targetB").count(), 0);
        assert_eq!(queues.is_online("targetB"), Some(false));
    }

    #[test]
    fn checkin_is_idempotent() {
        let mut queues = DeliveryQueues::new(names(&["targetA", "targetB"]));
        for _ in 0..3 {
            queues.enqueue("targetA", job());
            queues.enqueue("targetB", job());
        }
        let online = names(&["targetA"]);
        let offline = names(&["targetB"]);

        queues.apply_checkin(&online, &offline);
        let before = (
            uuids(queues.active("targetA")),
            uuids(queues.deferred("targetB")),
        );
        queues.apply_checkin(&online, &offline);
        let after = (
            uuids(queues.active("targetA")),
            uuids(queues.deferred("targetB")),
        );
        assert_eq!(before, after);
    }

    #[test]
    fn resumed_jobs_keep_order_and_never_duplicate() {
        let mut queues = DeliveryQueues::new(names(&["t"]));
        let first = job();
        let first_id = first.uuid();
        queues.enqueue("t", first);

        queues.apply_checkin(&[], &names(&["t"]));
        let second = job();
        let second_id = second.uuid();
        queues.enqueue("t", second);
        assert_eq!(uuids(queues.deferred("t")), vec![first_id, second_id]);

        queues.apply_checkin(&names(&["t"]), &[]);
        assert_eq!(uuids(queues.active("t")), vec![first_id, second_id]);
        assert_eq!(queues.deferred("t").count(), 0);
        assert_eq!(queues.pending(), 2);

        // Each job is in exactly one queue.
        for id in [first_id, second_id] {
            let in_active = queues.active("t").any(|j| j.uuid() == id);
            let in_deferred = queues.deferred("t").any(|j| j.uuid() == id);
            assert!(in_active ^ in_deferred);
        }
    }

    #[test]
    fn acknowledge_removes_only_answered_jobs() {
        let mut queues = DeliveryQueues::new(names(&["t"]));
        let (a, b) = (job(), job());
        let (a_id, b_id) = (a.uuid(), b.uuid());
        queues.enqueue("t", a);
        queues.enqueue("t", b);

        queues.acknowledge("t", &HashSet::from([a_id]));
        assert!(!queues.contains(a_id));
        assert!(queues.contains(b_id));
    }

    #[test]
    fn duplicate_transfers_are_detected() {
        let mut queues = DeliveryQueues::default();
        queues.enqueue("t", job());
        assert!(queues.has_transfer("t", "k", "1"));
        assert!(!queues.has_transfer("t", "k", "2"));
        assert!(!queues.has_transfer("other", "k", "1"));
    }

    #[test]
    fn saved_queues_come_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("laptop/queues.json");
        let mut queues = DeliveryQueues::new(names(&["t", "u"]));
        let (a, b) = (job(), job());
        let (a_id, b_id) = (a.uuid(), b.uuid());
        queues.enqueue("t", a);
        queues.apply_checkin(&[], &names(&["t"]));
        queues.enqueue("t", b);
        queues.record_delivery("u", "k", "9");
        queues.save(&path).unwrap();

        let loaded = DeliveryQueues::load(&path, names(&["t", "u", "new"])).unwrap();
        assert_eq!(uuids(loaded.deferred("t")), vec![a_id, b_id]);
        assert_eq!(loaded.unconfirmed("u"), 1);
        assert_eq!(loaded.is_online("t"), None);
        assert_eq!(loaded.summary().len(), 3);
    }

    #[test]
    fn missing_queue_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let queues = DeliveryQueues::load(&dir.path().join("queues.json"), names(&["t"])).unwrap();
        assert_eq!(queues.pending(), 0);
        assert_eq!(queues.summary().len(), 1);
    }

    #[test]
    fn unknown_queue_file_version_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queues.json");
        fs::write(&path, br#"{"version":7,"targets":{}}"#).unwrap();
        assert!(matches!(
            DeliveryQueues::load(&path, names(&["t"])),
            Err(QueueFileError::Version { found: 7, .. })
        ));
    }

    #[test]
    fn stale_reports_are_covered_until_confirmed() {
        let mut queues = DeliveryQueues::default();
        queues.record_delivery("t", "a", "2");

        // Report from before the delivery.
        let stale = FingerprintMap::from([("a".to_string(), "1".to_string())]);
        let held = queues.reconcile("t", &stale);
        assert_eq!(held.get("a").map(String::as_str), Some("2"));
        assert_eq!(queues.unconfirmed("t"), 1);

        let fresh = FingerprintMap::from([("a".to_string(), "2".to_string())]);
        assert_eq!(queues.reconcile("t", &fresh), fresh);
        assert_eq!(queues.unconfirmed("t"), 0);
    }

    #[test]
    fn delivery_missing_from_every_report_is_given_up() {
        let mut queues = DeliveryQueues::default();
        queues.record_delivery("t", "a", "2");
        let empty = FingerprintMap::new();
        for _ in 0..UNCONFIRMED_REPORT_LIMIT {
            assert!(queues.reconcile("t", &empty).contains_key("a"));
        }
        assert!(queues.reconcile("t", &empty).is_empty());
        assert_eq!(queues.unconfirmed("t"), 0);
    }
}
