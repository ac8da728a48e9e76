//! Client, server and target wired together in-process.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use stowage_client::{
    ClientConfig, Coordinator, CoordinatorError, Delivery, FlushReport, HttpTransport, PemKeyDir,
    Transport, TransportError, WalkDirEnumerator,
};
use stowage_core::{
    FingerprintStore, Job, KeyPair, MemoryStore, Response, SyncPlan, TargetMessage, TargetReply,
};
use stowage_server::{JobRouter, ServerConfig, serve_on};
use stowage_target::{LinkError, ServerLink, TargetAgent, TargetConfig, TargetStore};

fn client_keys() -> KeyPair {
    static KEYS: OnceLock<KeyPair> = OnceLock::new();
    KEYS.get_or_init(|| KeyPair::generate(1024).unwrap()).clone()
}

/// Goes through the JSON wire form in both directions.
#[derive(Clone)]
struct Loopback {
    router: Arc<JobRouter>,
    down: Arc<AtomicBool>,
}

impl Loopback {
    fn new(router: Arc<JobRouter>) -> Self {
        Self {
            router,
            down: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Transport for Loopback {
    async fn submit(&self, job: &Job) -> Result<Response, TransportError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("connection refused".into()));
        }
        let request = serde_json::to_value(job)?;
        let response = self.router.handle_value(request).await;
        let body = serde_json::to_vec(&response)?;
        Ok(serde_json::from_slice(&body)?)
    }
}

struct TargetLink(Arc<JobRouter>);

impl ServerLink for TargetLink {
    async fn send(&self, message: &TargetMessage) -> Result<TargetReply, LinkError> {
        Ok(self.0.handle_target(message.clone()).await)
    }
}

fn router() -> Arc<JobRouter> {
    Arc::new(JobRouter::new(
        ServerConfig::default(),
        Box::new(MemoryStore::new()),
    ))
}

fn target(router: &Arc<JobRouter>, name: &str, root: &Path) -> TargetAgent<TargetLink> {
    let config = TargetConfig {
        target_name: name.into(),
        storage_root: root.to_path_buf(),
        ..TargetConfig::default()
    };
    let store = TargetStore::open(root).unwrap();
    TargetAgent::new(&config, store, TargetLink(router.clone()))
}

fn client(transport: Loopback, watch: &Path) -> Coordinator<Loopback> {
    let config = ClientConfig {
        client_name: "laptop".into(),
        targets: vec!["nas".into(), "offsite".into()],
        watch_root: watch.to_path_buf(),
        ..ClientConfig::default()
    };
    Coordinator::new(
        config,
        client_keys(),
        transport,
        Box::new(WalkDirEnumerator::new(watch)),
        FingerprintStore::in_memory(),
    )
}

fn populate(root: &Path) {
    fs::create_dir_all(root.join("docs")).unwrap();
    fs::write(root.join("a.txt"), b"alpha").unwrap();
    fs::write(root.join("docs/b.txt"), b"beta").unwrap();
}

fn everything<T: Transport>(coordinator: &Coordinator<T>) -> SyncPlan {
    SyncPlan {
        transfer: coordinator.local_tree().snapshot().into_keys().collect(),
        ..SyncPlan::default()
    }
}

fn delivered(report: FlushReport) -> Vec<Delivery> {
    if let Some(e) = report.error {
        panic!("flush stopped early: {e}");
    }
    report.deliveries
}

#[tokio::test]
async fn files_reach_the_target_and_sync_converges() {
    let router = router();
    let watch = tempfile::tempdir().unwrap();
    let storage = tempfile::tempdir().unwrap();
    populate(watch.path());

    let mut nas = target(&router, "nas", storage.path());
    nas.announce().await.unwrap();

    let mut coordinator = client(Loopback::new(router.clone()), watch.path());
    assert!(coordinator.register().await.unwrap().success);
    assert_eq!(coordinator.refresh_tree().unwrap(), 2);

    let checkin = coordinator.checkin().await.unwrap();
    assert_eq!(checkin.online, vec!["nas".to_string()]);
    assert_eq!(checkin.offline, vec!["offsite".to_string()]);

    // No tree reported yet.
    let first = coordinator.sync_target("nas").await.unwrap();
    assert!(first.result.success);
    assert!(first.plan.is_none());
    nas.poll_once().await.unwrap();

    let plan = coordinator.sync_target("nas").await.unwrap().plan.unwrap();
    assert_eq!(plan.transfer.len(), 2);
    assert!(plan.delete.is_empty());

    assert_eq!(coordinator.queue_transfers("nas", &plan).unwrap(), 2);
    // Same plan again: already waiting.
    assert_eq!(coordinator.queue_transfers("nas", &plan).unwrap(), 0);

    let deliveries = delivered(coordinator.flush().await);
    assert_eq!(deliveries.len(), 2);
    assert!(deliveries.iter().all(|d| d.result.success && d.target == "nas"));
    assert_eq!(coordinator.queues().pending(), 0);

    nas.poll_once().await.unwrap();
    assert_eq!(nas.store().read_file("laptop", "a.txt").unwrap(), b"alpha");
    assert_eq!(nas.store().read_file("laptop", "docs/b.txt").unwrap(), b"beta");
    assert_eq!(nas.store().tree("laptop"), coordinator.local_tree().snapshot());

    // Trees lag by one report: ask again, let the target answer, then diff.
    coordinator.sync_target("nas").await.unwrap();
    nas.poll_once().await.unwrap();
    let settled = coordinator.sync_target("nas").await.unwrap().plan.unwrap();
    assert!(settled.is_empty());
}

#[tokio::test]
async fn offline_target_holds_jobs_until_it_returns() {
    let router = router();
    let watch = tempfile::tempdir().unwrap();
    let storage = tempfile::tempdir().unwrap();
    populate(watch.path());

    let mut coordinator = client(Loopback::new(router.clone()), watch.path());
    coordinator.register().await.unwrap();
    coordinator.refresh_tree().unwrap();

    // Queued before any checkin: active until told otherwise.
    let plan = everything(&coordinator);
    coordinator.queue_transfers("offsite", &plan).unwrap();
    assert_eq!(coordinator.queues().active("offsite").count(), 2);

    coordinator.checkin().await.unwrap();
    assert_eq!(coordinator.queues().active("offsite").count(), 0);
    assert_eq!(coordinator.queues().deferred("offsite").count(), 2);
    assert!(delivered(coordinator.flush().await).is_empty());

    // A second identical checkin moves nothing.
    coordinator.checkin().await.unwrap();
    assert_eq!(coordinator.queues().deferred("offsite").count(), 2);

    let mut offsite = target(&router, "offsite", storage.path());
    offsite.announce().await.unwrap();
    let checkin = coordinator.checkin().await.unwrap();
    assert!(checkin.online.contains(&"offsite".to_string()));
    assert_eq!(coordinator.queues().active("offsite").count(), 2);

    let deliveries = delivered(coordinator.flush().await);
    assert_eq!(deliveries.len(), 2);
    assert_eq!(offsite.poll_once().await.unwrap(), 2);
    assert_eq!(offsite.store().tree("laptop").len(), 2);
}

#[tokio::test]
async fn unreachable_server_keeps_jobs_queued() {
    let router = router();
    let watch = tempfile::tempdir().unwrap();
    let storage = tempfile::tempdir().unwrap();
    populate(watch.path());

    let nas = target(&router, "nas", storage.path());
    nas.announce().await.unwrap();

    let transport = Loopback::new(router.clone());
    let down = transport.down.clone();
    let mut coordinator = client(transport, watch.path());
    coordinator.register().await.unwrap();
    coordinator.refresh_tree().unwrap();
    coordinator.checkin().await.unwrap();

    let plan = everything(&coordinator);
    coordinator.queue_transfers("nas", &plan).unwrap();
    let queued: Vec<_> = coordinator.queues().active("nas").map(Job::uuid).collect();

    down.store(true, Ordering::SeqCst);
    let report = coordinator.flush().await;
    assert!(report.deliveries.is_empty());
    let err = report.error.unwrap();
    assert!(err.is_transport());
    assert!(matches!(err, CoordinatorError::Transport(_)));
    let still: Vec<_> = coordinator.queues().active("nas").map(Job::uuid).collect();
    assert_eq!(queued, still);

    down.store(false, Ordering::SeqCst);
    let deliveries = delivered(coordinator.flush().await);
    let answered: Vec<_> = deliveries.iter().map(|d| d.job_uuid.clone()).collect();
    let expected: Vec<_> = queued.iter().map(|u| u.to_string()).collect();
    assert_eq!(answered, expected);
    assert_eq!(coordinator.queues().pending(), 0);
}

#[tokio::test]
async fn refused_checkin_leaves_queues_alone() {
    let router = router();
    let watch = tempfile::tempdir().unwrap();
    populate(watch.path());

    // Never registered, so the server cannot authenticate us.
    let mut coordinator = client(Loopback::new(router), watch.path());
    coordinator.refresh_tree().unwrap();
    let plan = everything(&coordinator);
    coordinator.queue_transfers("nas", &plan).unwrap();

    let checkin = coordinator.checkin().await.unwrap();
    assert!(!checkin.result.success);
    assert_eq!(coordinator.queues().active("nas").count(), 2);
    assert_eq!(coordinator.queues().is_online("nas"), None);
}

#[tokio::test]
async fn local_mirror_copies_planned_files() {
    let router = router();
    let watch = tempfile::tempdir().unwrap();
    let mirror = tempfile::tempdir().unwrap();
    populate(watch.path());

    let config = ClientConfig {
        client_name: "laptop".into(),
        local_target: Some(mirror.path().to_path_buf()),
        ..ClientConfig::default()
    };
    let mut coordinator = Coordinator::new(
        config,
        client_keys(),
        Loopback::new(router),
        Box::new(WalkDirEnumerator::new(watch.path())),
        FingerprintStore::in_memory(),
    );
    coordinator.refresh_tree().unwrap();

    let plan = everything(&coordinator);
    assert_eq!(coordinator.mirror_locally(&plan).unwrap(), 2);
    let copied = fs::read(mirror.path().join("laptop/docs/b.txt")).unwrap();
    assert_eq!(copied, b"beta");
}

#[tokio::test]
async fn repeated_cycles_send_each_file_once() {
    let router = router();
    let watch = tempfile::tempdir().unwrap();
    let storage = tempfile::tempdir().unwrap();
    populate(watch.path());

    let mut nas = target(&router, "nas", storage.path());
    nas.announce().await.unwrap();
    let mut coordinator = client(Loopback::new(router.clone()), watch.path());
    assert!(coordinator.register().await.unwrap().success);

    // The target reports each tree before it applies the files delivered in
    // the same cycle, so every report seen lags one cycle behind.
    let mut sent = 0;
    for _ in 0..5 {
        let report = coordinator.run_cycle().await.unwrap();
        assert!(report.flush_error.is_none());
        sent += report.deliveries.len();
        nas.poll_once().await.unwrap();
    }

    assert_eq!(sent, 2);
    assert_eq!(nas.store().tree("laptop"), coordinator.local_tree().snapshot());
    assert_eq!(coordinator.queues().unconfirmed("nas"), 0);
}

#[tokio::test]
async fn queue_larger_than_the_body_limit_goes_in_several_batches() {
    let config = ServerConfig {
        max_body_bytes: 4096,
        ..ServerConfig::default()
    };
    let router = Arc::new(JobRouter::new(config, Box::new(MemoryStore::new())));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(serve_on(listener, router.clone(), std::future::pending()));

    let watch = tempfile::tempdir().unwrap();
    let storage = tempfile::tempdir().unwrap();
    fs::write(watch.path().join("a.bin"), vec![b'a'; 2000]).unwrap();
    fs::write(watch.path().join("b.bin"), vec![b'b'; 2000]).unwrap();

    let mut nas = target(&router, "nas", storage.path());
    nas.announce().await.unwrap();

    let config = ClientConfig {
        client_name: "laptop".into(),
        server_address: address.clone(),
        targets: vec!["nas".into()],
        max_batch_bytes: 4096,
        ..ClientConfig::default()
    };
    let transport = HttpTransport::new(&address, Duration::from_secs(10)).unwrap();
    let mut coordinator = Coordinator::new(
        config,
        client_keys(),
        transport,
        Box::new(WalkDirEnumerator::new(watch.path())),
        FingerprintStore::in_memory(),
    );
    assert!(coordinator.register().await.unwrap().success);
    coordinator.refresh_tree().unwrap();
    coordinator.checkin().await.unwrap();
    let plan = everything(&coordinator);
    assert_eq!(coordinator.queue_transfers("nas", &plan).unwrap(), 2);

    // Either file fits under the limit; both together do not.
    let deliveries = delivered(coordinator.flush().await);
    assert_eq!(deliveries.len(), 2);
    assert!(deliveries.iter().all(|d| d.result.success));
    assert_eq!(coordinator.queues().pending(), 0);

    assert_eq!(nas.poll_once().await.unwrap(), 2);
    assert_eq!(nas.store().read_file("laptop", "b.bin").unwrap().len(), 2000);
}

#[tokio::test]
async fn queued_jobs_survive_a_restart() {
    let router = router();
    let watch = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let storage = tempfile::tempdir().unwrap();
    populate(watch.path());

    let config = ClientConfig {
        client_name: "laptop".into(),
        targets: vec!["nas".into()],
        watch_root: watch.path().to_path_buf(),
        data_dir: data.path().to_path_buf(),
        key_bits: 1024,
        ..ClientConfig::default()
    };
    let keys = PemKeyDir::new(data.path(), config.key_bits);

    let mut first = Coordinator::open(config.clone(), &keys, Loopback::new(router.clone())).unwrap();
    first.refresh_tree().unwrap();
    let plan = everything(&first);
    first.queue_transfers("nas", &plan).unwrap();
    let queued: Vec<_> = first.queues().active("nas").map(Job::uuid).collect();
    drop(first);

    let mut second = Coordinator::open(config.clone(), &keys, Loopback::new(router.clone())).unwrap();
    let reloaded: Vec<_> = second.queues().active("nas").map(Job::uuid).collect();
    assert_eq!(reloaded, queued);
    assert_eq!(second.list_jobs()[0].active.len(), 2);

    let nas = target(&router, "nas", storage.path());
    nas.announce().await.unwrap();
    assert!(second.register().await.unwrap().success);
    second.checkin().await.unwrap();
    assert_eq!(delivered(second.flush().await).len(), 2);
    drop(second);

    let third = Coordinator::open(config, &keys, Loopback::new(router)).unwrap();
    assert_eq!(third.queues().pending(), 0);
    assert_eq!(third.queues().unconfirmed("nas"), 2);
}

/// Lets a fixed number of batches through, then reports the server gone.
struct FailsAfter {
    inner: Loopback,
    batches: Arc<AtomicUsize>,
}

impl Transport for FailsAfter {
    async fn submit(&self, job: &Job) -> Result<Response, TransportError> {
        if matches!(job, Job::Batch(_)) {
            let left = self.batches.load(Ordering::SeqCst);
            if left == 0 {
                return Err(TransportError::Unreachable("connection reset".into()));
            }
            self.batches.store(left - 1, Ordering::SeqCst);
        }
        self.inner.submit(job).await
    }
}

#[tokio::test]
async fn deliveries_before_a_failure_are_still_reported() {
    let router = router();
    let watch = tempfile::tempdir().unwrap();
    let nas_dir = tempfile::tempdir().unwrap();
    let offsite_dir = tempfile::tempdir().unwrap();
    populate(watch.path());

    target(&router, "nas", nas_dir.path()).announce().await.unwrap();
    target(&router, "offsite", offsite_dir.path()).announce().await.unwrap();

    let transport = FailsAfter {
        inner: Loopback::new(router.clone()),
        batches: Arc::new(AtomicUsize::new(1)),
    };
    let config = ClientConfig {
        client_name: "laptop".into(),
        targets: vec!["nas".into(), "offsite".into()],
        ..ClientConfig::default()
    };
    let mut coordinator = Coordinator::new(
        config,
        client_keys(),
        transport,
        Box::new(WalkDirEnumerator::new(watch.path())),
        FingerprintStore::in_memory(),
    );
    coordinator.register().await.unwrap();
    coordinator.refresh_tree().unwrap();
    coordinator.checkin().await.unwrap();
    let plan = everything(&coordinator);
    coordinator.queue_transfers("nas", &plan).unwrap();
    coordinator.queue_transfers("offsite", &plan).unwrap();

    // Targets flush in name order: nas gets through, offsite does not.
    let report = coordinator.flush().await;
    assert_eq!(report.deliveries.len(), 2);
    assert!(report.deliveries.iter().all(|d| d.target == "nas"));
    assert!(report.error.unwrap().is_transport());
    assert_eq!(coordinator.queues().active("nas").count(), 0);
    assert_eq!(coordinator.queues().active("offsite").count(), 2);
}

/// Answers batches with their last result missing.
struct DropsLastAnswer(Loopback);

impl Transport for DropsLastAnswer {
    async fn submit(&self, job: &Job) -> Result<Response, TransportError> {
        match self.0.submit(job).await? {
            Response::Batch(mut results) => {
                results.pop();
                Ok(Response::Batch(results))
            }
            single => Ok(single),
        }
    }
}

#[tokio::test]
async fn unanswered_jobs_stay_queued() {
    let router = router();
    let watch = tempfile::tempdir().unwrap();
    let storage = tempfile::tempdir().unwrap();
    populate(watch.path());
    target(&router, "nas", storage.path()).announce().await.unwrap();

    let config = ClientConfig {
        client_name: "laptop".into(),
        targets: vec!["nas".into()],
        ..ClientConfig::default()
    };
    let mut coordinator = Coordinator::new(
        config,
        client_keys(),
        DropsLastAnswer(Loopback::new(router)),
        Box::new(WalkDirEnumerator::new(watch.path())),
        FingerprintStore::in_memory(),
    );
    coordinator.register().await.unwrap();
    coordinator.refresh_tree().unwrap();
    coordinator.checkin().await.unwrap();
    let plan = everything(&coordinator);
    coordinator.queue_transfers("nas", &plan).unwrap();
    let queued: Vec<_> = coordinator.queues().active("nas").map(Job::uuid).collect();

    let report = coordinator.flush().await;
    assert!(matches!(report.error, Some(CoordinatorError::UnexpectedResponse(_))));
    assert_eq!(report.deliveries.len(), 1);
    assert_eq!(report.deliveries[0].job_uuid, queued[0].to_string());
    let left: Vec<_> = coordinator.queues().active("nas").map(Job::uuid).collect();
    assert_eq!(left, vec![queued[1]]);
}
