#![allow(dead_code)]

use std::{future::Future, net::SocketAddr, time::Duration};

use score_mesh::{
    client::NodeApi,
    config::{ClusterTimings, NodeConfig},
    dao::models::GameMode,
    dto::scores::{SaveScoreRequest, ScoreRow},
    node::Node,
};
use tokio::{net::TcpListener, time::sleep};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

pub fn fast_timings() -> ClusterTimings {
    ClusterTimings {
        health_interval: Duration::from_millis(200),
        probe_timeout: Duration::from_millis(300),
        outbox_interval: Duration::from_millis(400),
        replication_timeout: Duration::from_millis(500),
        poll_interval: Duration::from_millis(200),
        push_timeout: Duration::from_millis(300),
        feed_keep_alive: Duration::from_millis(500),
        merge_timeout: Duration::from_secs(1),
    }
}

pub async fn reserve() -> (TcpListener, String) {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let address = listener.local_addr().unwrap().to_string();
    (listener, address)
}

pub async fn start_node(listener: TcpListener, peers: Vec<String>) -> Node {
    let config = NodeConfig {
        bind_addr: listener.local_addr().unwrap(),
        peers,
        timings: fast_timings(),
        ..NodeConfig::default()
    };
    Node::start(config, listener).await.unwrap()
}

/// Start `count` nodes that all know each other.
pub async fn start_cluster(count: usize) -> Vec<Node> {
    let mut reserved = Vec::new();
    for _ in 0..count {
        reserved.push(reserve().await);
    }
    let addresses: Vec<String> = reserved.iter().map(|(_, address)| address.clone()).collect();

    let mut nodes = Vec::new();
    for (listener, address) in reserved {
        let peers = addresses.iter().filter(|peer| **peer != address).cloned().collect();
        nodes.push(start_node(listener, peers).await);
    }
    nodes
}

/// Poll `check` until it holds or `deadline` elapses.
pub async fn eventually<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let step = Duration::from_millis(50);
    let mut waited = Duration::ZERO;
    while waited < deadline {
        if check().await {
            return true;
        }
        sleep(step).await;
        waited += step;
    }
    check().await
}

pub async fn wait_for_mesh(nodes: &[Node]) {
    let expected = nodes.len() - 1;
    let meshed = eventually(Duration::from_secs(10), || async {
        nodes
            .iter()
            .all(|node| node.state().node_state().active_nodes.len() == expected)
    })
    .await;
    assert!(meshed, "nodes never saw each other");
}

pub fn request(level: i64, score: i64, time: f64) -> SaveScoreRequest {
    SaveScoreRequest {
        level,
        score,
        time,
        mode: GameMode::Single,
    }
}

pub async fn rows(api: &NodeApi, address: &str) -> Vec<ScoreRow> {
    api.best_scores(address, GameMode::Single, Some(100), REQUEST_TIMEOUT)
        .await
        .unwrap_or_default()
}
