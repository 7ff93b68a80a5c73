//! MirrorFS Node - Buddy mirroring daemon
//!
//! This binary serves the local targets of one node: it executes and mirrors
//! requests, keeps the buddy group registry persisted, resyncs secondaries
//! that fell behind, and exposes an admin/metrics HTTP surface.

mod admin;

use admin::AdminState;
use anyhow::{Context, Result};
use clap::Parser;
use mirrorfs_common::{Config, TargetKind};
use mirrorfs_mirror::{EngineConfig, MirrorEngine, NodeRouter, TargetData, TcpTransport, serve};
use mirrorfs_registry::{JsonStateFile, PersistHandle, Registry, load_or_bootstrap};
use mirrorfs_resync::ResyncCoordinator;
use mirrorfs_store::{ChunkStore, MetaStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Check intervals without a report before a target is probably offline
const PROBABLY_OFFLINE_INTERVALS: u32 = 3;
/// Check intervals without a report before a target is offline
const OFFLINE_INTERVALS: u32 = 6;

#[derive(Parser, Debug)]
#[command(name = "mirrorfs-node")]
#[command(about = "MirrorFS buddy mirroring node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/mirrorfs/node.toml")]
    config: PathBuf,

    /// Listen address for mirroring requests
    #[arg(short, long)]
    listen: Option<String>,

    /// Listen address for the admin and metrics HTTP server
    #[arg(long)]
    admin_listen: Option<String>,

    /// Registry state file
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("failed to load config file {}", args.config.display()))?;

    // CLI takes precedence over the config file
    if let Some(listen) = args.listen {
        config.network.listen = listen;
    }
    if let Some(admin_listen) = args.admin_listen {
        config.network.admin_listen = admin_listen;
    }
    if let Some(state_file) = args.state_file {
        config.persistence.state_file = state_file;
    }
    let log_level = if args.log_level == "info" {
        config.logging.level.clone()
    } else {
        args.log_level
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting MirrorFS node {}", config.node.name);
    info!("Config file: {}", args.config.display());

    if config.node.local_targets.is_empty() {
        warn!("No local targets configured, the node only serves its admin surface");
    }

    let backend = Arc::new(JsonStateFile::new(&config.persistence.state_file));
    let registry = Arc::new(load_or_bootstrap(backend.as_ref(), || {
        Registry::from_groups(&config.groups)
    })?);
    for target in &config.node.local_targets {
        registry.add_target(target.id);
    }
    let persist = PersistHandle::spawn(
        Arc::clone(&registry),
        backend,
        Duration::from_millis(config.persistence.flush_interval_ms),
    );

    let transport = Arc::new(TcpTransport::new(
        &config.network.peers,
        config.mirroring.forward_timeout(),
    ));
    // Local buddies are reached through our own request server
    let self_address = local_address(&config.network.listen);
    for target in &config.node.local_targets {
        if config.peer_address(target.id).is_none() {
            transport.set_peer(target.id, self_address.clone());
        }
    }

    let engine_config = EngineConfig::from_config(&config.mirroring);
    let router = Arc::new(NodeRouter::new());
    for target in &config.node.local_targets {
        let data = match target.kind {
            TargetKind::Meta => TargetData::Meta(Arc::new(MetaStore::new())),
            TargetKind::Storage => TargetData::Chunks(Arc::new(
                ChunkStore::open(&target.data_dir).with_context(|| {
                    format!("failed to open target {} at {}", target.id, target.data_dir.display())
                })?,
            )),
        };
        info!(
            target_id = %target.id,
            kind = ?target.kind,
            "Serving target from {}",
            target.data_dir.display()
        );
        router.add_engine(Arc::new(MirrorEngine::new(
            target.id,
            data,
            Arc::clone(&registry),
            transport.clone(),
            engine_config,
        )));
    }

    let coordinator = Arc::new(ResyncCoordinator::new(
        Arc::clone(&registry),
        Arc::clone(&router),
        config.resync.clone(),
    ));
    for engine in router.engines() {
        engine.set_resync_hook(coordinator.clone());
    }

    let check_handle = tokio::spawn(buddy_check_loop(
        Arc::clone(&registry),
        Arc::clone(&router),
        Arc::clone(&coordinator),
        config.resync.check_interval(),
    ));

    let listener = TcpListener::bind(&config.network.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.network.listen))?;
    info!("Serving mirroring requests on {}", config.network.listen);
    let server_handle = tokio::spawn(serve(listener, router.clone()));

    let admin_state = Arc::new(AdminState {
        registry: Arc::clone(&registry),
        router: Arc::clone(&router),
        coordinator,
        node_name: config.node.name.clone(),
        start_time: Instant::now(),
    });
    let admin_listener = TcpListener::bind(&config.network.admin_listen)
        .await
        .with_context(|| format!("failed to bind {}", config.network.admin_listen))?;
    info!("Admin and metrics available at http://{}", config.network.admin_listen);

    axum::serve(admin_listener, admin::router(admin_state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    check_handle.abort();
    server_handle.abort();
    // Requests still waiting for a lock fail instead of running after shutdown
    for engine in router.engines() {
        engine.locks().shutdown();
    }
    if let Err(e) = persist.shutdown().await {
        error!("Failed to write final registry state: {}", e);
    }

    info!("Node shut down gracefully");
    Ok(())
}

/// Periodic liveness and buddy-needs-resync checks
async fn buddy_check_loop(
    registry: Arc<Registry>,
    router: Arc<NodeRouter>,
    coordinator: Arc<ResyncCoordinator>,
    interval: Duration,
) {
    // A zero period would make the ticker panic
    let interval = interval.max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        buddy_check_tick(&registry, &router, &coordinator, interval).await;
    }
}

/// One round of buddy checks.
///
/// Each node ages reachability in its own registry, so a node never switches
/// groups over here; switchover goes through the admin surface.
async fn buddy_check_tick(
    registry: &Registry,
    router: &NodeRouter,
    coordinator: &Arc<ResyncCoordinator>,
    interval: Duration,
) {
    for engine in router.engines() {
        if let Err(e) = registry.report_online(engine.target()) {
            debug!(target_id = %engine.target(), "cannot refresh local target: {}", e);
        }
    }
    coordinator.contact_buddies().await;

    let aged = registry.age_reachability(
        interval * PROBABLY_OFFLINE_INTERVALS,
        interval * OFFLINE_INTERVALS,
    );
    for (target, reachability) in aged {
        warn!(target_id = %target, "Target is now {}", reachability);
    }

    let started = coordinator.check_buddies();
    if !started.is_empty() {
        info!("Started resync for targets {:?}", started);
    }
}

/// Address at which this node reaches its own request server
fn local_address(listen: &str) -> String {
    match listen.rsplit_once(':') {
        Some(("0.0.0.0", port)) => format!("127.0.0.1:{port}"),
        Some(("[::]", port)) => format!("[::1]:{port}"),
        _ => listen.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_address() {
        assert_eq!(local_address("0.0.0.0:8005"), "127.0.0.1:8005");
        assert_eq!(local_address("[::]:8005"), "[::1]:8005");
        assert_eq!(local_address("10.0.0.1:9000"), "10.0.0.1:9000");
    }

    #[tokio::test]
    async fn test_buddy_checks_never_switch_groups_over() {
        use mirrorfs_common::config::{GroupConfig, ResyncConfig};
        use mirrorfs_common::{
            ConsistencyState, EntryId, ErrorCode, GroupId, ReachabilityState, TargetId,
        };
        use mirrorfs_mirror::op::SetAttrOp;
        use mirrorfs_mirror::{LocalTransport, MirrorRequest, Operation, RetryPolicy};
        use mirrorfs_store::SetAttrs;

        let (group, primary, secondary) = (GroupId(5), TargetId(1), TargetId(2));
        // Node B hosts only the secondary and cannot reach the primary's node
        let registry = Arc::new(
            Registry::from_groups(&[GroupConfig {
                id: group,
                primary,
                secondary,
            }])
            .unwrap(),
        );
        let router = Arc::new(NodeRouter::new());
        router.add_engine(Arc::new(MirrorEngine::new(
            secondary,
            TargetData::Meta(Arc::new(MetaStore::new())),
            Arc::clone(&registry),
            Arc::new(LocalTransport::new()),
            EngineConfig {
                retry: RetryPolicy {
                    retries: 0,
                    timeout: Duration::from_millis(100),
                    backoff_base: Duration::from_millis(1),
                    backoff_max: Duration::from_millis(1),
                },
                lock_timeout: Duration::from_secs(1),
                execute_timeout: Duration::from_secs(1),
            },
        )));
        let coordinator = Arc::new(ResyncCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&router),
            ResyncConfig::default(),
        ));

        let interval = Duration::from_millis(20);
        tokio::time::sleep(interval * OFFLINE_INTERVALS * 2).await;
        buddy_check_tick(&registry, &router, &coordinator, interval).await;

        // Node B sees a failed primary and a good secondary...
        assert_eq!(
            registry.state(primary).unwrap().reachability,
            ReachabilityState::Offline
        );
        let secondary_state = registry.state(secondary).unwrap();
        assert_eq!(secondary_state.reachability, ReachabilityState::Online);
        assert_eq!(secondary_state.consistency, ConsistencyState::Good);

        // ...but leaves the group alone, so the secondary keeps refusing writes
        assert_eq!(registry.resolve(group).unwrap(), (primary, secondary));
        let engine = router.engine(secondary).unwrap();
        let response = engine
            .handle(MirrorRequest::mirrored(
                secondary,
                group,
                Operation::SetAttr(SetAttrOp {
                    id: EntryId::root(),
                    attrs: SetAttrs::default(),
                    stamp: None,
                }),
            ))
            .await;
        assert_eq!(response.result.unwrap_err().code, ErrorCode::NotPrimary);
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "mirrorfs-node",
            "--config",
            "/tmp/node.toml",
            "--listen",
            "127.0.0.1:7000",
            "--log-level",
            "debug",
        ]);
        assert_eq!(args.config, PathBuf::from("/tmp/node.toml"));
        assert_eq!(args.listen.as_deref(), Some("127.0.0.1:7000"));
        assert_eq!(args.log_level, "debug");
        assert!(args.admin_listen.is_none());
    }
}
