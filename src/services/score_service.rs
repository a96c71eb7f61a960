use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    dao::models::{
        ChangeAction, ChangeLogEntity, GameMode, ReplicationLogEntity, SaveOutcome, ScoreEntity,
        ScorePayload,
    },
    dto::{
        replication::ChangeEvent,
        scores::{SaveScoreRequest, SaveScoreResponse, ScoreRow},
    },
    error::ServiceError,
    services::change_feed,
    state::SharedState,
};

/// Store a score submitted by the game and propagate it to the active peers right away.
///
/// A score whose natural key is already stored is acknowledged without writing anything.
pub async fn save_score(
    state: &SharedState,
    request: SaveScoreRequest,
) -> Result<SaveScoreResponse, ServiceError> {
    let Some(change) = record_local_write(state, request.mode, request.payload()).await? else {
        debug!(mode = %request.mode, "score already recorded");
        return Ok(SaveScoreResponse {
            success: true,
            message: "Score already recorded".into(),
        });
    };

    let event = ChangeEvent::from_change(&change);
    change_feed::publish_change(state, event.clone());
    let delivered = change_feed::push_to_active_peers(state, &event).await;
    info!(
        mode = %request.mode,
        score = request.score,
        delivered,
        "score saved"
    );

    Ok(SaveScoreResponse {
        success: true,
        message: "Score saved".into(),
    })
}

/// Best scores of `mode`, ordered for display.
pub async fn best_scores(
    state: &SharedState,
    mode: GameMode,
    limit: usize,
) -> Result<Vec<ScoreRow>, ServiceError> {
    let store = state.require_store().await?;
    let rows = store.top_scores(mode, limit).await?;
    Ok(rows.iter().map(ScoreRow::from).collect())
}

/// Persist a write originating on this node together with its outbox and change log entries.
///
/// Returns the change log entry, or `None` when the row was a duplicate.
pub(crate) async fn record_local_write(
    state: &SharedState,
    mode: GameMode,
    payload: ScorePayload,
) -> Result<Option<ChangeLogEntity>, ServiceError> {
    let store = state.require_store().await?;
    let record = ScoreEntity::new(mode, payload);
    let record_id = record.id;
    if store.save_score(record).await? == SaveOutcome::DuplicateIgnored {
        return Ok(None);
    }

    let _ordered = state.local_write_guard().await;
    let timestamp_ms = state.clock().next();
    let table_name = mode.table_name().to_owned();
    store
        .append_outbox(ReplicationLogEntity {
            id: Uuid::new_v4(),
            table_name: table_name.clone(),
            record_id,
            action: ChangeAction::Insert,
            payload,
            origin_node_id: state.node_id().to_owned(),
            synced: false,
            created_at_ms: timestamp_ms,
        })
        .await?;

    let change = ChangeLogEntity {
        id: Uuid::new_v4(),
        table_name,
        record_id,
        action: ChangeAction::Insert,
        new_data: payload,
        timestamp_ms,
        origin_node_id: state.node_id().to_owned(),
    };
    store.append_change(change.clone()).await?;
    Ok(Some(change))
}
