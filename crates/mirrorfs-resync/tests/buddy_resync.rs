//! Outage, resync and switchover of a storage buddy group

use bytes::Bytes;
use mirrorfs_common::config::{GroupConfig, ResyncConfig};
use mirrorfs_common::{ConsistencyState, GroupId, ReachabilityState, TargetId};
use mirrorfs_mirror::op::{UnlinkChunkOp, WriteChunkOp};
use mirrorfs_mirror::{
    EngineConfig, ForwardOutcome, LocalTransport, MirrorEngine, MirrorRequest, NodeRouter,
    Operation, RetryPolicy, TargetData,
};
use mirrorfs_registry::{Registry, StateCause};
use mirrorfs_resync::{JobState, ResyncCoordinator, StartOptions};
use mirrorfs_store::ChunkStore;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const P: TargetId = TargetId(1);
const S: TargetId = TargetId(2);
const G: GroupId = GroupId(5);

struct Cluster {
    registry: Arc<Registry>,
    transport: Arc<LocalTransport>,
    primary: Arc<MirrorEngine>,
    secondary: Arc<MirrorEngine>,
    coordinator: Arc<ResyncCoordinator>,
    _dirs: (TempDir, TempDir),
}

impl Cluster {
    fn new() -> Self {
        let dir_p = tempfile::tempdir().unwrap();
        let dir_s = tempfile::tempdir().unwrap();
        let registry = Arc::new(
            Registry::from_groups(&[GroupConfig {
                id: G,
                primary: P,
                secondary: S,
            }])
            .unwrap(),
        );
        let transport = Arc::new(LocalTransport::new());
        let config = EngineConfig {
            retry: RetryPolicy {
                retries: 1,
                timeout: Duration::from_millis(500),
                backoff_base: Duration::from_millis(1),
                backoff_max: Duration::from_millis(2),
            },
            lock_timeout: Duration::from_secs(5),
            execute_timeout: Duration::from_secs(5),
        };
        let engine = |id: TargetId, dir: &TempDir| {
            Arc::new(MirrorEngine::new(
                id,
                TargetData::Chunks(Arc::new(ChunkStore::open(dir.path()).unwrap())),
                Arc::clone(&registry),
                transport.clone(),
                config,
            ))
        };
        let primary = engine(P, &dir_p);
        let secondary = engine(S, &dir_s);

        let router = Arc::new(NodeRouter::new());
        router.add_engine(Arc::clone(&primary));
        router.add_engine(Arc::clone(&secondary));
        transport.register(P, router.clone());
        transport.register(S, router.clone());

        let coordinator = Arc::new(ResyncCoordinator::new(
            Arc::clone(&registry),
            router,
            ResyncConfig {
                gather_workers: 3,
                sync_workers: 3,
                max_consecutive_push_failures: 4,
                ..ResyncConfig::default()
            },
        ));
        primary.set_resync_hook(coordinator.clone());
        secondary.set_resync_hook(coordinator.clone());

        Self {
            registry,
            transport,
            primary,
            secondary,
            coordinator,
            _dirs: (dir_p, dir_s),
        }
    }

    fn chunks(engine: &MirrorEngine) -> &ChunkStore {
        engine.data().chunks().unwrap()
    }
}

fn write(target: TargetId, path: &str, data: impl Into<Bytes>) -> MirrorRequest {
    MirrorRequest::mirrored(
        target,
        G,
        Operation::WriteChunk(WriteChunkOp {
            path: path.to_string(),
            offset: 0,
            data: data.into(),
        }),
    )
}

/// Every file below `root` with its contents
fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
                out.insert(rel, std::fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

#[tokio::test]
async fn test_outage_resync_and_switchover() {
    let cluster = Cluster::new();
    let p_chunks = Cluster::chunks(&cluster.primary);
    let s_chunks = Cluster::chunks(&cluster.secondary);

    let response = cluster.primary.handle(write(P, "u1/c1", "one")).await;
    assert_eq!(response.forward, ForwardOutcome::Acknowledged);

    // Outage: the first failed forward takes the secondary out of service
    cluster.transport.set_reachable(S, false);
    let response = cluster.primary.handle(write(P, "u1/c2", "two")).await;
    assert!(response.result.is_ok());
    assert_eq!(response.forward, ForwardOutcome::CommFailed);
    let state = cluster.registry.state(S).unwrap();
    assert_eq!(state.reachability, ReachabilityState::Offline);
    assert_eq!(state.consistency, ConsistencyState::Bad);

    let response = cluster
        .primary
        .handle(MirrorRequest::mirrored(
            P,
            G,
            Operation::UnlinkChunk(UnlinkChunkOp {
                path: "u1/c1".into(),
            }),
        ))
        .await;
    assert_eq!(response.forward, ForwardOutcome::Skipped);

    // Left over on the secondary from before the outage
    s_chunks.replace("u2/orphan", b"stale").unwrap();

    // Offline secondaries are not resynced
    assert!(cluster
        .coordinator
        .start(P, StartOptions::default())
        .is_err());

    cluster.transport.set_reachable(S, true);
    cluster.registry.report_online(S).unwrap();

    let stats = cluster
        .coordinator
        .start(P, StartOptions::default())
        .unwrap()
        .await
        .unwrap();
    assert_eq!(stats.state, JobState::Completed, "{:?}", stats.last_error);
    assert!(stats.synced_files >= 1);
    assert!(stats.synced_dirs >= 1);
    assert!(cluster.registry.state(S).unwrap().is_online_good());
    assert_eq!(
        snapshot(s_chunks.mirror_root()),
        snapshot(p_chunks.mirror_root())
    );
    assert!(s_chunks.read_all("u1/c1").is_err());
    assert!(s_chunks.read_all("u2/orphan").is_err());

    // Live forwarding resumes
    let response = cluster.primary.handle(write(P, "u1/c3", "three")).await;
    assert_eq!(response.forward, ForwardOutcome::Acknowledged);
    assert_eq!(&s_chunks.read_all("u1/c3").unwrap()[..], b"three");

    // The primary fails: the group switches over to the in-sync secondary
    cluster
        .registry
        .set_state(
            P,
            ConsistencyState::Bad,
            ReachabilityState::Offline,
            StateCause::Admin,
        )
        .unwrap();
    assert_eq!(cluster.registry.check_all_switchovers(), vec![G]);
    assert_eq!(cluster.registry.resolve(G).unwrap(), (S, P));

    let response = cluster.primary.handle(write(P, "u1/c4", "four")).await;
    assert!(response.result.is_err());
    let response = cluster.secondary.handle(write(S, "u1/c4", "four")).await;
    assert!(response.result.is_ok());
    assert_eq!(response.forward, ForwardOutcome::Skipped);
}

#[tokio::test]
async fn test_writes_during_pass_reach_the_secondary() {
    let cluster = Cluster::new();
    let s_chunks = Cluster::chunks(&cluster.secondary);
    let p_chunks = Cluster::chunks(&cluster.primary);

    cluster
        .registry
        .set_consistency(S, ConsistencyState::NeedsResync, StateCause::Admin)
        .unwrap();
    for i in 0..100 {
        let path = format!("d{}/c{i}", i % 7);
        let response = cluster
            .primary
            .handle(write(P, &path, format!("v0-{i}")))
            .await;
        assert_eq!(response.forward, ForwardOutcome::Skipped);
    }

    let pass = cluster
        .coordinator
        .start(P, StartOptions::default())
        .unwrap();
    assert!(cluster.coordinator.is_running(P));
    assert!(matches!(
        cluster.coordinator.start(P, StartOptions::default()),
        Err(mirrorfs_common::Error::ResyncAlreadyRunning(_))
    ));

    // Overwrite chunks while the pass runs; each write is either recorded
    // for the pass or forwarded once the secondary is good again
    let writer = {
        let primary = Arc::clone(&cluster.primary);
        tokio::spawn(async move {
            for i in 0..50 {
                let path = format!("d{}/c{}", i % 7, i * 2);
                let response = primary.handle(write(P, &path, format!("v1-{i}"))).await;
                assert!(response.result.is_ok());
                assert_ne!(response.forward, ForwardOutcome::CommFailed);
                tokio::task::yield_now().await;
            }
        })
    };

    let stats = pass.await.unwrap();
    writer.await.unwrap();
    assert_eq!(stats.state, JobState::Completed, "{:?}", stats.last_error);
    assert_eq!(stats.error_files, 0);
    assert!(cluster.registry.state(S).unwrap().is_online_good());
    assert_eq!(
        snapshot(s_chunks.mirror_root()),
        snapshot(p_chunks.mirror_root())
    );

    let report = cluster.coordinator.stats(P).unwrap();
    assert_eq!(report.state, JobState::Completed);
    assert!(report.gather.matched_files >= 100);
}

#[tokio::test]
async fn test_buddy_check_starts_pass_and_stop_aborts() {
    let cluster = Cluster::new();
    for i in 0..20 {
        cluster
            .primary
            .handle(write(P, &format!("c{i}"), "x"))
            .await;
    }

    // Nothing to do while the secondary is good
    assert!(cluster.coordinator.check_buddies().is_empty());

    cluster
        .registry
        .set_consistency(S, ConsistencyState::NeedsResync, StateCause::Admin)
        .unwrap();
    assert_eq!(cluster.coordinator.check_buddies(), vec![P]);

    // The pass either completes or is stopped; a stopped pass leaves the
    // secondary flagged
    let _ = cluster.coordinator.stop(P);
    tokio::time::timeout(Duration::from_secs(10), async {
        while cluster.coordinator.is_running(P) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let stats = cluster.coordinator.stats(P).unwrap();
    let secondary = cluster.registry.state(S).unwrap();
    match stats.state {
        JobState::Completed => assert!(secondary.is_online_good()),
        JobState::Aborted => {
            assert_eq!(secondary.consistency, ConsistencyState::NeedsResync);
            assert!(stats.last_error.is_some());
        }
        other => panic!("unexpected job state {other:?}"),
    }

    let mut metrics = String::new();
    cluster.coordinator.write_prometheus(&mut metrics);
    assert!(metrics.contains("mirrorfs_resync_running{target_id=\"1\"} 0"));
}
