//! Admin and metrics HTTP surface

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mirrorfs_common::{
    ConsistencyState, Error, GroupId, ReachabilityState, TargetId,
};
use mirrorfs_mirror::NodeRouter;
use mirrorfs_mirror::metrics::write_header;
use mirrorfs_registry::{Registry, StateCause};
use mirrorfs_resync::{ResyncCoordinator, StartOptions};
use serde::Deserialize;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

pub struct AdminState {
    pub registry: Arc<Registry>,
    pub router: Arc<NodeRouter>,
    pub coordinator: Arc<ResyncCoordinator>,
    pub node_name: String,
    pub start_time: Instant,
}

/// Error reply of an admin request
#[derive(Debug)]
pub struct AdminError {
    pub status: StatusCode,
    pub message: String,
}

impl From<Error> for AdminError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::UnknownTarget(_) | Error::UnknownGroup(_) | Error::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Error::InvalidArgument(_) | Error::TargetInUse(_) | Error::GroupExists(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::ResyncAlreadyRunning(_)
            | Error::ResyncNotRunning(_)
            | Error::ResyncRefused(_)
            | Error::Again => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "code": self.status.as_u16(),
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type AdminResult<T> = Result<T, AdminError>;

pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/state", get(get_state))
        .route("/targets/{id}/state", post(set_target_state))
        .route("/groups/{id}/switchover", post(switchover))
        .route("/switchovers/check", post(check_switchovers))
        .route("/resync/{target}", get(resync_stats))
        .route("/resync/{target}/start", post(start_resync))
        .route("/resync/{target}/stop", post(stop_resync))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(state)
}

async fn get_state(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(state.registry.snapshot())
}

#[derive(Debug, Deserialize)]
pub struct SetStateBody {
    pub consistency: ConsistencyState,
    pub reachability: ReachabilityState,
}

async fn set_target_state(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<u16>,
    Json(body): Json<SetStateBody>,
) -> AdminResult<impl IntoResponse> {
    let target = TargetId(id);
    let old = state.registry.set_state(
        target,
        body.consistency,
        body.reachability,
        StateCause::Admin,
    )?;
    info!(target_id = %target, "Target state set by admin (was {})", old);
    Ok(Json(serde_json::json!({
        "target": target,
        "old": old,
        "new": state.registry.state(target)?,
    })))
}

async fn switchover(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<u16>,
) -> AdminResult<impl IntoResponse> {
    let group = state.registry.switchover(GroupId(id))?;
    Ok(Json(group))
}

/// Switch over every group whose primary failed while its secondary is good.
///
/// Nodes never switch groups on their own; the operator runs this against
/// the registry that acts as the authority and distributes the result.
async fn check_switchovers(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let switched = state.registry.check_all_switchovers();
    for group in &switched {
        info!(group_id = %group, "Switched over buddy group after primary failure");
    }
    Json(serde_json::json!({ "switched": switched }))
}

async fn start_resync(
    State(state): State<Arc<AdminState>>,
    Path(target): Path<u16>,
    Query(options): Query<StartOptions>,
) -> AdminResult<impl IntoResponse> {
    let target = TargetId(target);
    // The pass reports through its job statistics
    drop(state.coordinator.start(target, options)?);
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "target": target, "state": "running" })),
    ))
}

async fn stop_resync(
    State(state): State<Arc<AdminState>>,
    Path(target): Path<u16>,
) -> AdminResult<impl IntoResponse> {
    state.coordinator.stop(TargetId(target))?;
    Ok(StatusCode::OK)
}

async fn resync_stats(
    State(state): State<Arc<AdminState>>,
    Path(target): Path<u16>,
) -> AdminResult<impl IntoResponse> {
    let target = TargetId(target);
    state.coordinator.stats(target).map(Json).ok_or_else(|| AdminError {
        status: StatusCode::NOT_FOUND,
        message: format!("no resync job for target {target}"),
    })
}

async fn metrics(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let mut output = String::with_capacity(8 * 1024);

    let _ = writeln!(output, "# HELP mirrorfs_node_info Node information");
    let _ = writeln!(output, "# TYPE mirrorfs_node_info gauge");
    let _ = writeln!(output, "mirrorfs_node_info{{node=\"{}\"}} 1", state.node_name);

    let _ = writeln!(output, "# HELP mirrorfs_node_uptime_seconds Node uptime in seconds");
    let _ = writeln!(output, "# TYPE mirrorfs_node_uptime_seconds counter");
    let _ = writeln!(
        output,
        "mirrorfs_node_uptime_seconds {}",
        state.start_time.elapsed().as_secs()
    );

    let snapshot = state.registry.snapshot();
    let _ = writeln!(
        output,
        "# HELP mirrorfs_target_good Whether a target is consistent (1=good)"
    );
    let _ = writeln!(output, "# TYPE mirrorfs_target_good gauge");
    let _ = writeln!(
        output,
        "# HELP mirrorfs_target_online Whether a target is reachable (1=online)"
    );
    let _ = writeln!(output, "# TYPE mirrorfs_target_online gauge");
    for record in &snapshot.targets {
        let _ = writeln!(
            output,
            "mirrorfs_target_good{{target_id=\"{}\"}} {}",
            record.id,
            u8::from(record.state.consistency == ConsistencyState::Good)
        );
        let _ = writeln!(
            output,
            "mirrorfs_target_online{{target_id=\"{}\"}} {}",
            record.id,
            u8::from(record.state.reachability == ReachabilityState::Online)
        );
    }

    write_header(&mut output);
    for engine in state.router.engines() {
        engine
            .metrics()
            .write_prometheus(&mut output, engine.target().0);
    }

    state.coordinator.write_prometheus(&mut output);

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        output,
    )
}

/// Unhealthy while a local target is not good
async fn health(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let healthy = state.router.engines().iter().all(|engine| {
        state
            .registry
            .state(engine.target())
            .is_ok_and(|s| s.consistency == ConsistencyState::Good)
    });

    if healthy {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "UNHEALTHY")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorfs_common::config::{GroupConfig, ResyncConfig};
    use mirrorfs_mirror::{EngineConfig, LocalTransport, MirrorEngine, TargetData};
    use mirrorfs_store::MetaStore;

    fn admin_state() -> Arc<AdminState> {
        let registry = Arc::new(
            Registry::from_groups(&[GroupConfig {
                id: GroupId(3),
                primary: TargetId(1),
                secondary: TargetId(2),
            }])
            .unwrap(),
        );
        let router = Arc::new(NodeRouter::new());
        router.add_engine(Arc::new(MirrorEngine::new(
            TargetId(1),
            TargetData::Meta(Arc::new(MetaStore::new())),
            Arc::clone(&registry),
            Arc::new(LocalTransport::new()),
            EngineConfig::default(),
        )));
        let coordinator = Arc::new(ResyncCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&router),
            ResyncConfig::default(),
        ));
        Arc::new(AdminState {
            registry,
            router,
            coordinator,
            node_name: "test".to_string(),
            start_time: Instant::now(),
        })
    }

    #[tokio::test]
    async fn test_set_state_and_switchover() {
        let state = admin_state();
        let body = SetStateBody {
            consistency: ConsistencyState::Bad,
            reachability: ReachabilityState::Offline,
        };
        set_target_state(State(state.clone()), Path(1), Json(body))
            .await
            .unwrap();
        let current = state.registry.state(TargetId(1)).unwrap();
        assert_eq!(current.consistency, ConsistencyState::Bad);

        let err = set_target_state(
            State(state.clone()),
            Path(9),
            Json(SetStateBody {
                consistency: ConsistencyState::Good,
                reachability: ReachabilityState::Online,
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        switchover(State(state.clone()), Path(3)).await.unwrap();
        assert_eq!(
            state.registry.resolve(GroupId(3)).unwrap(),
            (TargetId(2), TargetId(1))
        );
    }

    #[tokio::test]
    async fn test_check_switchovers_only_switches_failed_primaries() {
        let state = admin_state();
        let body = check_switchovers(State(state.clone()))
            .await
            .into_response()
            .into_body();
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        let reply: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reply["switched"], serde_json::json!([]));
        assert_eq!(
            state.registry.resolve(GroupId(3)).unwrap(),
            (TargetId(1), TargetId(2))
        );

        state
            .registry
            .set_state(
                TargetId(1),
                ConsistencyState::Good,
                ReachabilityState::Offline,
                StateCause::Admin,
            )
            .unwrap();
        let body = check_switchovers(State(state.clone()))
            .await
            .into_response()
            .into_body();
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        let reply: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reply["switched"], serde_json::json!([3]));
        assert_eq!(
            state.registry.resolve(GroupId(3)).unwrap(),
            (TargetId(2), TargetId(1))
        );
    }

    #[tokio::test]
    async fn test_resync_errors_map_to_statuses() {
        let state = admin_state();
        let err = stop_resync(State(state.clone()), Path(1))
            .await
            .err()
            .unwrap();
        assert_eq!(err.status, StatusCode::CONFLICT);

        // Metadata targets are not resynced
        let err = start_resync(
            State(state.clone()),
            Path(1),
            Query(StartOptions::default()),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.status, StatusCode::CONFLICT);

        let err = resync_stats(State(state), Path(1)).await.err().unwrap();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_and_health() {
        let state = admin_state();
        let response = metrics(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let response = health(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        state
            .registry
            .set_consistency(TargetId(1), ConsistencyState::NeedsResync, StateCause::Admin)
            .unwrap();
        let response = health(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
