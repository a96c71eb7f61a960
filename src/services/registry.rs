//! Peer discovery, liveness probing and primary election.

use std::{collections::HashMap, path::PathBuf};

use futures::future::join_all;
use indexmap::IndexSet;
use tokio::{
    sync::mpsc,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

use crate::{
    config::write_known_nodes,
    services::{change_feed::FeedFollowers, election, replication_service},
    state::{SharedState, node::NodeState},
};

/// Owner of the cluster view. The registry is the only writer of [`NodeState`].
pub struct NodeRegistry {
    state: SharedState,
    /// Every address worth probing: seeds plus everything learned through gossip.
    known: IndexSet<String>,
    /// Peers that answered the last probe round.
    active: IndexSet<String>,
    known_nodes_path: Option<PathBuf>,
    followers: FeedFollowers,
    /// Results of the startup network scan, when one runs.
    scanned: Option<mpsc::Receiver<Vec<String>>>,
}

impl NodeRegistry {
    pub fn new(
        state: SharedState,
        seeds: IndexSet<String>,
        known_nodes_path: Option<PathBuf>,
    ) -> Self {
        let known = seeds
            .into_iter()
            .filter(|seed| seed != state.address())
            .collect();
        Self {
            state,
            known,
            active: IndexSet::new(),
            known_nodes_path,
            followers: FeedFollowers::new(),
            scanned: None,
        }
    }

    /// Also probe the addresses arriving on `scanned`.
    pub fn with_scan_results(mut self, scanned: mpsc::Receiver<Vec<String>>) -> Self {
        self.scanned = Some(scanned);
        self
    }

    /// Start probing `addresses` and remember them across restarts.
    pub fn learn(&mut self, addresses: Vec<String>) {
        let before = self.known.len();
        for address in addresses {
            if address != self.state.address() && self.known.insert(address.clone()) {
                info!(peer = %address, "discovered peer through network scan");
            }
        }
        if self.known.len() > before {
            self.persist_known();
        }
    }

    /// Addresses currently probed.
    pub fn known(&self) -> &IndexSet<String> {
        &self.known
    }

    /// Probe every known address, merge gossip, elect, and publish the new cluster view.
    pub async fn tick(&mut self) -> NodeState {
        let state = &self.state;
        let limit = state.timings().probe_timeout;
        let api = state.peers();
        let probes = join_all(self.known.iter().map(|peer| async move {
            let result = api.ping(peer, limit).await;
            (peer.clone(), result)
        }))
        .await;

        let mut active = IndexSet::new();
        let mut discovered = Vec::new();
        let mut peer_ids = HashMap::new();
        for (peer, result) in probes {
            match result {
                Ok(ping) if ping.node_id == state.node_id() => {
                    info!(peer = %peer, "address answers as this node; no longer probing it");
                    self.known.shift_remove(&peer);
                }
                Ok(ping) => {
                    discovered.extend(ping.active_nodes);
                    peer_ids.insert(peer.clone(), ping.node_id);
                    active.insert(peer);
                }
                Err(err) if self.active.contains(&peer) => {
                    warn!(peer = %peer, error = %err, "peer left the active set");
                }
                Err(err) => debug!(peer = %peer, error = %err, "peer still unreachable"),
            }
        }

        let before = self.known.len();
        for address in discovered {
            if address != state.address() && self.known.insert(address.clone()) {
                info!(peer = %address, "discovered peer through gossip");
            }
        }
        if self.known.len() > before {
            self.persist_known();
        }

        for peer in active.iter().filter(|peer| !self.active.contains(*peer)) {
            let origin = peer_ids.get(peer).cloned().unwrap_or_default();
            info!(peer = %peer, "peer joined the active set; reconciling");
            tokio::spawn(reconcile(state.clone(), peer.clone(), origin));
        }
        self.active = active;

        let active_nodes: Vec<String> = self.active.iter().cloned().collect();
        let next = NodeState {
            is_primary: election::is_primary(
                state.address(),
                active_nodes.iter().map(String::as_str),
            ),
            active_nodes,
            last_sync_timestamp_ms: state.poll_watermark(),
        };
        if next.is_primary != state.node_state().is_primary {
            info!(is_primary = next.is_primary, "primary role changed");
        }
        state.publish_node_state(next.clone());
        self.followers.sync(state, &next.active_nodes);
        next
    }

    fn persist_known(&self) {
        let Some(path) = self.known_nodes_path.as_deref() else {
            return;
        };
        if let Err(err) = write_known_nodes(path, &self.known) {
            warn!(path = %path.display(), error = %err, "failed to persist known nodes");
        }
    }

    /// Health-check loop.
    pub async fn run(mut self) {
        let mut ticker = interval(self.state.timings().health_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut scanned = self.scanned.take();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                found = next_scan(&mut scanned) => match found {
                    Some(addresses) => self.learn(addresses),
                    None => scanned = None,
                },
            }
        }
    }
}

async fn next_scan(scanned: &mut Option<mpsc::Receiver<Vec<String>>>) -> Option<Vec<String>> {
    match scanned {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn reconcile(state: SharedState, peer: String, origin_node_id: String) {
    match replication_service::reconcile_from_peer(&state, &peer, &origin_node_id).await {
        Ok(0) => debug!(peer = %peer, "peer had nothing new"),
        Ok(applied) => info!(peer = %peer, applied, "reconciled rows from peer"),
        Err(err) => warn!(peer = %peer, error = %err, "reconciliation failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::memory_state;

    #[tokio::test]
    async fn unreachable_peers_leave_the_node_alone_and_primary() {
        let (state, _store) = memory_state().await;
        let seeds: IndexSet<String> = [state.address().to_string(), "127.0.0.1:9".to_string()]
            .into_iter()
            .collect();
        let mut registry = NodeRegistry::new(state.clone(), seeds, None);
        assert_eq!(registry.known().len(), 1);

        let view = registry.tick().await;
        assert!(view.active_nodes.is_empty());
        assert!(view.is_primary);
        assert_eq!(state.node_state(), view);
    }

    #[tokio::test]
    async fn scanned_addresses_are_probed_and_remembered() {
        let (state, _store) = memory_state().await;
        let path = std::env::temp_dir().join(format!(
            "score-mesh-scan-{}.json",
            uuid::Uuid::new_v4()
        ));
        let mut registry = NodeRegistry::new(state.clone(), IndexSet::new(), Some(path.clone()));

        registry.learn(vec![
            "127.0.0.1:9".to_string(),
            state.address().to_string(),
            "127.0.0.1:9".to_string(),
        ]);
        assert_eq!(
            registry.known().iter().collect::<Vec<_>>(),
            vec!["127.0.0.1:9"]
        );
        assert_eq!(crate::config::read_known_nodes(&path), vec!["127.0.0.1:9"]);
        let _ = std::fs::remove_file(&path);
    }
}
