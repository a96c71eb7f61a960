use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Liveness answer of a node, also used as the gossip carrier between peers.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    pub node_id: String,
    pub is_primary: bool,
    /// Addresses of the peers this node currently considers alive.
    pub active_nodes: Vec<String>,
    pub timestamp_ms: i64,
}

/// Cluster view of a node.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatusResponse {
    pub node_id: String,
    pub is_primary: bool,
    pub active_nodes: Vec<String>,
    /// Active peers plus this node.
    pub total_nodes: usize,
}

/// Storage and cluster view of a node.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatusResponse {
    /// False while the node runs without a working store (degraded mode).
    pub connected: bool,
    pub node_id: String,
    pub is_primary: bool,
    pub active_nodes: Vec<String>,
    pub nodes_count: usize,
}
