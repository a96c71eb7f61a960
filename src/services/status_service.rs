use tracing::warn;

use crate::{
    dto::cluster::{ClusterStatusResponse, PingResponse, StoreStatusResponse},
    state::{SharedState, watermark::now_ms},
};

/// Liveness answer, also carrying the active set for gossip.
pub fn ping(state: &SharedState) -> PingResponse {
    let node = state.node_state();
    PingResponse {
        node_id: state.node_id().to_owned(),
        is_primary: node.is_primary,
        active_nodes: node.active_nodes,
        timestamp_ms: now_ms(),
    }
}

pub fn cluster_status(state: &SharedState) -> ClusterStatusResponse {
    let node = state.node_state();
    ClusterStatusResponse {
        node_id: state.node_id().to_owned(),
        is_primary: node.is_primary,
        total_nodes: node.active_nodes.len() + 1,
        active_nodes: node.active_nodes,
    }
}

/// Storage view of the node. `connected` holds only when a store is installed, the node is not
/// degraded and the store answers a health check now.
pub async fn store_status(state: &SharedState) -> StoreStatusResponse {
    let healthy = match state.store().await {
        Some(store) => match store.health_check().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "storage health check failed");
                false
            }
        },
        None => {
            warn!("storage unavailable (degraded mode)");
            false
        }
    };

    let node = state.node_state();
    StoreStatusResponse {
        connected: healthy && !state.is_degraded(),
        node_id: state.node_id().to_owned(),
        is_primary: node.is_primary,
        nodes_count: node.active_nodes.len() + 1,
        active_nodes: node.active_nodes,
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Arc};

    use futures::future::BoxFuture;
    use uuid::Uuid;

    use super::*;
    use crate::{
        dao::{
            models::{ChangeLogEntity, GameMode, ReplicationLogEntity, SaveOutcome, ScoreEntity},
            score_store::ScoreStore,
            storage::{StorageError, StorageResult},
        },
        services::test_support::memory_state,
    };

    /// Store whose server went away after it was installed.
    struct UnreachableStore;

    fn down<T: Send + 'static>() -> BoxFuture<'static, StorageResult<T>> {
        Box::pin(async {
            Err(StorageError::unavailable(
                "server selection timeout".into(),
                io::Error::from(io::ErrorKind::ConnectionRefused),
            ))
        })
    }

    impl ScoreStore for UnreachableStore {
        fn save_score(&self, _: ScoreEntity) -> BoxFuture<'static, StorageResult<SaveOutcome>> {
            down()
        }
        fn top_scores(
            &self,
            _: GameMode,
            _: usize,
        ) -> BoxFuture<'static, StorageResult<Vec<ScoreEntity>>> {
            down()
        }
        fn all_scores(&self) -> BoxFuture<'static, StorageResult<Vec<ScoreEntity>>> {
            down()
        }
        fn append_outbox(&self, _: ReplicationLogEntity) -> BoxFuture<'static, StorageResult<()>> {
            down()
        }
        fn pending_outbox(
            &self,
            _: String,
        ) -> BoxFuture<'static, StorageResult<Vec<ReplicationLogEntity>>> {
            down()
        }
        fn mark_outbox_synced(&self, _: Uuid) -> BoxFuture<'static, StorageResult<()>> {
            down()
        }
        fn append_change(&self, _: ChangeLogEntity) -> BoxFuture<'static, StorageResult<()>> {
            down()
        }
        fn changes_since(
            &self,
            _: String,
            _: i64,
        ) -> BoxFuture<'static, StorageResult<Vec<ChangeLogEntity>>> {
            down()
        }
        fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
            down()
        }
        fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
            down()
        }
    }

    #[tokio::test]
    async fn connected_reflects_a_live_health_check() {
        let (state, _store) = memory_state().await;
        assert!(store_status(&state).await.connected);

        state.set_store(Arc::new(UnreachableStore)).await;
        assert!(!state.is_degraded());
        assert!(!store_status(&state).await.connected);
    }

    #[tokio::test]
    async fn degraded_node_reports_disconnected() {
        let (state, _store) = memory_state().await;
        state.update_degraded(true);
        let status = store_status(&state).await;
        assert!(!status.connected);
        assert_eq!(status.nodes_count, 1);
    }
}
