use uuid::Uuid;

/// Identity of a node, fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_id: String,
    /// Address peers use to reach the node (`host:port`).
    pub address: String,
}

impl NodeIdentity {
    /// Fresh identity with a random node id.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            node_id: Uuid::new_v4().simple().to_string(),
            address: address.into(),
        }
    }
}

/// Cluster view rebuilt by the registry on every health tick. Handlers only read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    pub is_primary: bool,
    /// Peers that answered the last probe round, in probe order.
    pub active_nodes: Vec<String>,
    /// Timestamp of the newest local change pushed by the poller.
    pub last_sync_timestamp_ms: i64,
}

impl NodeState {
    /// View of a node that has not probed anyone yet: alone, hence primary.
    pub fn alone(last_sync_timestamp_ms: i64) -> Self {
        Self {
            is_primary: true,
            active_nodes: Vec::new(),
            last_sync_timestamp_ms,
        }
    }
}
