//! Per-node request router

use crate::engine::MirrorEngine;
use crate::message::{MirrorRequest, MirrorResponse};
use crate::transport::RequestHandler;
use async_trait::async_trait;
use mirrorfs_common::{Error, TargetId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::error;

/// Dispatches requests to the engine of their target.
///
/// Every request runs in its own detached task: once accepted, a request
/// completes (local effect and forward) even if the caller goes away.
#[derive(Default)]
pub struct NodeRouter {
    engines: RwLock<BTreeMap<TargetId, Arc<MirrorEngine>>>,
}

impl NodeRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_engine(&self, engine: Arc<MirrorEngine>) {
        self.engines.write().insert(engine.target(), engine);
    }

    #[must_use]
    pub fn engine(&self, target: TargetId) -> Option<Arc<MirrorEngine>> {
        self.engines.read().get(&target).cloned()
    }

    /// All local engines, ordered by target
    #[must_use]
    pub fn engines(&self) -> Vec<Arc<MirrorEngine>> {
        self.engines.read().values().cloned().collect()
    }
}

#[async_trait]
impl RequestHandler for NodeRouter {
    async fn handle(&self, request: MirrorRequest) -> MirrorResponse {
        let Some(engine) = self.engine(request.target) else {
            return MirrorResponse::error(&Error::UnknownTarget(request.target));
        };

        let task = tokio::spawn(async move { engine.handle(request).await });
        match task.await {
            Ok(response) => response,
            Err(e) => {
                error!("request task failed: {}", e);
                MirrorResponse::error(&Error::internal(format!("request task failed: {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::op::{Operation, TargetData};
    use crate::transport::LocalTransport;
    use mirrorfs_common::ErrorCode;
    use mirrorfs_registry::Registry;
    use mirrorfs_store::MetaStore;

    #[tokio::test]
    async fn test_unknown_target_is_rejected() {
        let router = NodeRouter::new();
        let response = router
            .handle(MirrorRequest::local(TargetId(4), Operation::Ping))
            .await;
        assert_eq!(response.result.unwrap_err().code, ErrorCode::UnknownTarget);
    }

    #[tokio::test]
    async fn test_routes_to_engine() {
        let router = NodeRouter::new();
        router.add_engine(Arc::new(MirrorEngine::new(
            TargetId(4),
            TargetData::Meta(Arc::new(MetaStore::new())),
            Arc::new(Registry::new()),
            Arc::new(LocalTransport::new()),
            EngineConfig::default(),
        )));

        let response = router
            .handle(MirrorRequest::local(TargetId(4), Operation::Ping))
            .await;
        assert!(response.into_result().is_ok());
        assert_eq!(router.engines().len(), 1);
    }
}
