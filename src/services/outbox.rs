use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, warn};

use crate::{
    dto::replication::ChangeEvent, error::ServiceError, services::change_feed,
    state::SharedState,
};

/// One outbox pass: deliver every pending local entry to the active peers and retire it.
///
/// An entry is marked synced once delivery was attempted on every active peer, whatever the
/// individual results. With no active peer the pass is skipped and entries stay pending.
pub async fn flush_once(state: &SharedState) -> Result<usize, ServiceError> {
    let active = state.node_state().active_nodes;
    if active.is_empty() {
        return Ok(0);
    }

    let store = state.require_store().await?;
    let pending = store.pending_outbox(state.node_id().to_owned()).await?;
    let limit = state.timings().replication_timeout;

    for entry in &pending {
        let event = ChangeEvent::from_outbox(entry);
        let delivered = change_feed::push_to_peers(state, &event, &active, limit).await;
        if delivered < active.len() {
            warn!(
                entry = %entry.id,
                delivered,
                peers = active.len(),
                "retiring outbox entry after partial delivery"
            );
        }
        store.mark_outbox_synced(entry.id).await?;
    }

    Ok(pending.len())
}

/// Background outbox flusher.
pub async fn run(state: SharedState) {
    let mut ticker = interval(state.timings().outbox_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        match flush_once(&state).await {
            Ok(0) | Err(ServiceError::StoreUnavailable) => {}
            Ok(count) => debug!(count, "outbox entries delivered"),
            Err(err) => warn!(error = %err, "outbox pass failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dao::{models::GameMode, score_store::ScoreStore},
        dto::scores::SaveScoreRequest,
        services::{score_service, test_support::memory_state},
        state::node::NodeState,
    };

    #[tokio::test]
    async fn entries_stay_pending_without_peers_and_retire_after_an_attempt() {
        let (state, store) = memory_state().await;
        score_service::save_score(
            &state,
            SaveScoreRequest {
                level: 1,
                score: 1500,
                time: 120.5,
                mode: GameMode::Single,
            },
        )
        .await
        .unwrap();

        assert_eq!(flush_once(&state).await.unwrap(), 0);
        let pending = store.pending_outbox(state.node_id().to_owned()).await.unwrap();
        assert_eq!(pending.len(), 1);

        // Nothing listens on the discard port, so delivery fails and the entry still retires.
        state.publish_node_state(NodeState {
            is_primary: true,
            active_nodes: vec!["127.0.0.1:9".into()],
            last_sync_timestamp_ms: 0,
        });
        assert_eq!(flush_once(&state).await.unwrap(), 1);
        assert!(
            store
                .pending_outbox(state.node_id().to_owned())
                .await
                .unwrap()
                .is_empty()
        );
    }
}
