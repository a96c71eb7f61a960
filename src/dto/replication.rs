//! Wire types of the cluster-internal replication endpoints.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    dao::models::{ChangeLogEntity, ReplicationLogEntity},
    dto::scores::ScoreRow,
};

/// Rows of every score table keyed by table name.
pub type TableRows = BTreeMap<String, Vec<ScoreRow>>;

/// A single row-level mutation travelling between nodes.
///
/// `action` and `data` stay loosely typed on the wire so a malformed event can be
/// rejected as an invalid payload instead of failing request parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub table: String,
    pub action: String,
    #[schema(value_type = Object)]
    pub data: serde_json::Value,
    pub timestamp_ms: i64,
    pub origin_node_id: String,
    /// Set by outbox deliveries, which must be applied even when older than the receiver's
    /// watermark for this origin.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replay: bool,
}

impl ChangeEvent {
    /// Event announcing a change log entry right after it was written.
    pub fn from_change(entry: &ChangeLogEntity) -> Self {
        Self {
            table: entry.table_name.clone(),
            action: entry.action.as_str().to_owned(),
            data: row_value(ScoreRow::from(entry.new_data)),
            timestamp_ms: entry.timestamp_ms,
            origin_node_id: entry.origin_node_id.clone(),
            replay: false,
        }
    }

    /// Event re-delivering an outbox entry.
    pub fn from_outbox(entry: &ReplicationLogEntity) -> Self {
        Self {
            table: entry.table_name.clone(),
            action: entry.action.as_str().to_owned(),
            data: row_value(ScoreRow::from(entry.payload)),
            timestamp_ms: entry.created_at_ms,
            origin_node_id: entry.origin_node_id.clone(),
            replay: true,
        }
    }
}

fn row_value(row: ScoreRow) -> serde_json::Value {
    serde_json::json!({
        "level": row.level,
        "score": row.score,
        "time": row.time,
    })
}

/// Acknowledgement of `/apply-change`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApplyChangeResponse {
    pub success: bool,
}

/// Body of `/merge-from-remote`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MergeRequest {
    pub data: TableRows,
}

/// Result of a bulk merge.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MergeResponse {
    pub success: bool,
    /// Rows that were new to the receiving node.
    pub count: usize,
}

/// Full dump of a node's score tables.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ExportResponse {
    pub success: bool,
    pub data: TableRows,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_event_uses_camel_case_and_hides_replay_flag() {
        let event = ChangeEvent {
            table: "scores_single".into(),
            action: "INSERT".into(),
            data: serde_json::json!({"level": 1, "score": 1500, "time": 120.5}),
            timestamp_ms: 42,
            origin_node_id: "node-a".into(),
            replay: false,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["timestampMs"], 42);
        assert_eq!(value["originNodeId"], "node-a");
        assert!(value.get("replay").is_none());

        let parsed: ChangeEvent = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, event);
    }
}
