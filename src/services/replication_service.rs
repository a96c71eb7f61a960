use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dao::{
        models::{ChangeAction, ChangeLogEntity, GameMode, SaveOutcome, ScoreEntity, ScorePayload},
        score_store::leaderboard_order,
    },
    dto::{
        replication::{ChangeEvent, TableRows},
        scores::ScoreRow,
    },
    error::ServiceError,
    services::{change_feed, score_service},
    state::SharedState,
};

/// What a receiver did with a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The row was new and is now stored.
    Applied,
    /// The row was already stored.
    Duplicate,
    /// The event was written by this node.
    OwnOrigin,
    /// Not newer than the watermark of its origin.
    Stale,
}

/// Apply a change event received from a peer.
pub async fn apply_change(
    state: &SharedState,
    event: ChangeEvent,
) -> Result<ApplyOutcome, ServiceError> {
    if event.origin_node_id == state.node_id() {
        return Ok(ApplyOutcome::OwnOrigin);
    }
    if !event.replay
        && !state
            .watermarks()
            .is_fresh(&event.origin_node_id, event.timestamp_ms)
    {
        return Ok(ApplyOutcome::Stale);
    }

    let (mode, row) = decode_event(&event)?;
    let outcome = store_replicated(
        state,
        mode,
        row.into(),
        &event.origin_node_id,
        event.timestamp_ms,
    )
    .await?;

    // Replays may be older than what was already seen from that origin.
    if !event.replay {
        state
            .watermarks()
            .advance(&event.origin_node_id, event.timestamp_ms);
    }
    debug!(
        origin = %event.origin_node_id,
        table = %event.table,
        replay = event.replay,
        ?outcome,
        "change event processed"
    );
    Ok(outcome)
}

fn decode_event(event: &ChangeEvent) -> Result<(GameMode, ScoreRow), ServiceError> {
    event
        .action
        .parse::<ChangeAction>()
        .map_err(ServiceError::InvalidPayload)?;
    let mode = GameMode::from_table(&event.table)
        .ok_or_else(|| ServiceError::InvalidPayload(format!("unknown table `{}`", event.table)))?;
    let row: ScoreRow = serde_json::from_value(event.data.clone())
        .map_err(|err| ServiceError::InvalidPayload(format!("malformed row: {err}")))?;
    row.validate()
        .map_err(|err| ServiceError::InvalidPayload(format!("invalid row: {err}")))?;
    Ok((mode, row))
}

/// Store a row written elsewhere. Replicated rows get a change log entry under their origin
/// but never an outbox entry: only the origin is responsible for delivering them.
async fn store_replicated(
    state: &SharedState,
    mode: GameMode,
    payload: ScorePayload,
    origin_node_id: &str,
    timestamp_ms: i64,
) -> Result<ApplyOutcome, ServiceError> {
    let store = state.require_store().await?;
    let record = ScoreEntity::new(mode, payload);
    let record_id = record.id;
    if store.save_score(record).await? == SaveOutcome::DuplicateIgnored {
        return Ok(ApplyOutcome::Duplicate);
    }

    store
        .append_change(ChangeLogEntity {
            id: Uuid::new_v4(),
            table_name: mode.table_name().to_owned(),
            record_id,
            action: ChangeAction::Insert,
            new_data: payload,
            timestamp_ms,
            origin_node_id: origin_node_id.to_owned(),
        })
        .await?;
    Ok(ApplyOutcome::Applied)
}

/// Bulk merge of rows accumulated elsewhere (typically a client's fallback host).
///
/// The whole request is validated before anything is written. Merged rows become local writes
/// of this node so the outbox and the poller spread them through the cluster.
pub async fn merge_from_remote(state: &SharedState, data: TableRows) -> Result<usize, ServiceError> {
    let mut batches = Vec::with_capacity(data.len());
    for (table, rows) in data {
        let mode = GameMode::from_table(&table)
            .ok_or_else(|| ServiceError::InvalidInput(format!("unknown table `{table}`")))?;
        for row in &rows {
            row.validate()
                .map_err(|err| ServiceError::InvalidInput(format!("invalid row in `{table}`: {err}")))?;
        }
        batches.push((mode, rows));
    }

    let mut count = 0;
    for (mode, rows) in batches {
        for row in rows {
            if let Some(change) = score_service::record_local_write(state, mode, row.into()).await? {
                change_feed::publish_change(state, ChangeEvent::from_change(&change));
                count += 1;
            }
        }
    }

    info!(count, "merged remote rows");
    Ok(count)
}

/// Every stored row, grouped by table. Both tables are always present.
pub async fn export_all(state: &SharedState) -> Result<TableRows, ServiceError> {
    let store = state.require_store().await?;
    let mut rows = store.all_scores().await?;
    rows.sort_by(|a, b| a.mode.cmp(&b.mode).then_with(|| leaderboard_order(a, b)));

    let mut data: TableRows = GameMode::ALL
        .iter()
        .map(|mode| (mode.table_name().to_owned(), Vec::new()))
        .collect();
    for row in &rows {
        data.entry(row.mode.table_name().to_owned())
            .or_default()
            .push(ScoreRow::from(row));
    }
    Ok(data)
}

/// Pull the full dataset of a peer that just joined the active set and store what is missing.
pub async fn reconcile_from_peer(
    state: &SharedState,
    address: &str,
    origin_node_id: &str,
) -> Result<usize, ServiceError> {
    let data = state
        .peers()
        .export_all(address, state.timings().merge_timeout)
        .await
        .map_err(|err| ServiceError::PeerUnreachable {
            address: address.to_owned(),
            message: err.to_string(),
        })?;

    let mut applied = 0;
    for (table, rows) in data {
        let Some(mode) = GameMode::from_table(&table) else {
            warn!(peer = %address, table = %table, "skipping unknown table during reconciliation");
            continue;
        };
        for row in rows {
            if let Err(err) = row.validate() {
                warn!(peer = %address, error = %err, "skipping invalid row during reconciliation");
                continue;
            }
            let timestamp_ms = state.clock().next();
            let outcome =
                store_replicated(state, mode, row.into(), origin_node_id, timestamp_ms).await?;
            if outcome == ApplyOutcome::Applied {
                applied += 1;
            }
        }
    }
    Ok(applied)
}
