mod common;

use std::time::Duration;

use common::*;
use futures::StreamExt;
use score_mesh::{
    client::{ClientError, NodeApi},
    dto::{feed::FeedMessage, replication::ChangeEvent, scores::ScoreRow},
    services::change_feed,
};
use serde_json::json;
use tokio::time::timeout;

#[tokio::test]
async fn saved_score_reaches_the_peer_exactly_once() {
    let nodes = start_cluster(2).await;
    wait_for_mesh(&nodes).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let api = NodeApi::new().unwrap();

    let message = api
        .save_score(a.address(), &request(1, 1500, 120.5), REQUEST_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(message, "Score saved");

    let arrived = eventually(Duration::from_secs(5), || async {
        rows(&api, b.address()).await.len() == 1
    })
    .await;
    assert!(arrived, "score never reached the peer");

    // Outbox redelivery, the feed follower and the poller must not duplicate it.
    tokio::time::sleep(fast_timings().outbox_interval * 3).await;
    let on_b = rows(&api, b.address()).await;
    assert_eq!(
        on_b,
        vec![ScoreRow {
            level: 1,
            score: 1500,
            time: 120.5
        }]
    );
    assert_eq!(rows(&api, a.address()).await.len(), 1);

    for node in nodes {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn applying_the_same_event_twice_stores_one_row() {
    let (listener, _) = reserve().await;
    let node = start_node(listener, Vec::new()).await;
    let api = NodeApi::new().unwrap();
    let event = ChangeEvent {
        table: "scores_single".to_owned(),
        action: "INSERT".to_owned(),
        data: json!({ "level": 3, "score": 900, "time": 61.25 }),
        timestamp_ms: 1_700_000_000_000,
        origin_node_id: "remote-node".to_owned(),
        replay: false,
    };

    api.apply_change(node.address(), &event, REQUEST_TIMEOUT)
        .await
        .unwrap();
    api.apply_change(node.address(), &event, REQUEST_TIMEOUT)
        .await
        .unwrap();
    let replayed = ChangeEvent {
        replay: true,
        ..event.clone()
    };
    api.apply_change(node.address(), &replayed, REQUEST_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(rows(&api, node.address()).await.len(), 1);
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn malformed_event_is_rejected() {
    let (listener, _) = reserve().await;
    let node = start_node(listener, Vec::new()).await;
    let api = NodeApi::new().unwrap();
    let event = ChangeEvent {
        table: "players".to_owned(),
        action: "INSERT".to_owned(),
        data: json!({ "level": 3, "score": 900, "time": 61.25 }),
        timestamp_ms: 1,
        origin_node_id: "remote-node".to_owned(),
        replay: false,
    };

    let err = api
        .apply_change(node.address(), &event, REQUEST_TIMEOUT)
        .await
        .unwrap_err();
    assert!(
        matches!(err, ClientError::Rejected { status: 400, .. }),
        "unexpected error: {err}"
    );
    assert!(rows(&api, node.address()).await.is_empty());
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn three_nodes_converge_on_the_union_of_their_writes() {
    let nodes = start_cluster(3).await;
    wait_for_mesh(&nodes).await;
    let api = NodeApi::new().unwrap();

    for (index, node) in nodes.iter().enumerate() {
        let score = 100 * (index as i64 + 1);
        api.save_score(node.address(), &request(1, score, 30.0), REQUEST_TIMEOUT)
            .await
            .unwrap();
    }

    let converged = eventually(Duration::from_secs(8), || async {
        for node in &nodes {
            if rows(&api, node.address()).await.len() != 3 {
                return false;
            }
        }
        true
    })
    .await;
    assert!(converged, "nodes did not converge");

    let first = rows(&api, nodes[0].address()).await;
    for node in &nodes[1..] {
        assert_eq!(rows(&api, node.address()).await, first);
    }
    assert_eq!(first[0].score, 300);

    for node in nodes {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn concurrent_identical_writes_collapse_to_one_row() {
    let nodes = start_cluster(2).await;
    wait_for_mesh(&nodes).await;
    let api = NodeApi::new().unwrap();
    let score = request(4, 2500, 99.5);

    let (on_a, on_b) = tokio::join!(
        api.save_score(nodes[0].address(), &score, REQUEST_TIMEOUT),
        api.save_score(nodes[1].address(), &score, REQUEST_TIMEOUT),
    );
    on_a.unwrap();
    on_b.unwrap();

    tokio::time::sleep(fast_timings().outbox_interval * 3).await;
    for node in &nodes {
        assert_eq!(rows(&api, node.address()).await.len(), 1);
    }

    for node in nodes {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn rejoining_node_catches_up_through_reconciliation() {
    let (listener_a, address_a) = reserve().await;
    let (listener_b, address_b) = reserve().await;
    let a = start_node(listener_a, vec![address_b.clone()]).await;
    let api = NodeApi::new().unwrap();

    // Written while B is not running.
    api.save_score(a.address(), &request(2, 700, 40.0), REQUEST_TIMEOUT)
        .await
        .unwrap();

    let b = start_node(listener_b, vec![address_a]).await;
    let caught_up = eventually(Duration::from_secs(8), || async {
        rows(&api, b.address()).await.len() == 1
    })
    .await;
    assert!(caught_up, "late node never received the earlier write");

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn subscriber_sees_hello_then_changes_and_the_stream_ends_on_shutdown() {
    let (listener, _) = reserve().await;
    let node = start_node(listener, Vec::new()).await;
    let api = NodeApi::new().unwrap();
    let mut feed = Box::pin(api.subscribe(node.address()).await.unwrap());

    let hello = timeout(REQUEST_TIMEOUT, feed.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match hello {
        FeedMessage::Connected { node_id, .. } => assert_eq!(node_id, node.state().node_id()),
        other => panic!("expected connected first, got {other:?}"),
    }

    api.save_score(node.address(), &request(6, 1234, 12.5), REQUEST_TIMEOUT)
        .await
        .unwrap();
    let change = loop {
        match timeout(REQUEST_TIMEOUT, feed.next()).await.unwrap() {
            Some(Ok(FeedMessage::DataChange(change))) => break change,
            Some(Ok(_)) => continue,
            other => panic!("feed ended before the change: {other:?}"),
        }
    };
    assert_eq!(change.origin_node_id, node.state().node_id());
    assert_eq!(change.table, "scores_single");
    assert_eq!(change.data["score"], 1234);
    assert!(!change.replay);

    node.shutdown().await.unwrap();
    let ended = timeout(REQUEST_TIMEOUT, async {
        while let Some(Ok(_)) = feed.next().await {}
    })
    .await;
    assert!(ended.is_ok(), "feed stayed open after shutdown");
}

#[tokio::test]
async fn follower_applies_a_change_seen_only_on_the_feed() {
    let nodes = start_cluster(2).await;
    wait_for_mesh(&nodes).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let api = NodeApi::new().unwrap();
    // Only on A's feed: A never stores it and no push or outbox carries it.
    let event = ChangeEvent {
        table: "scores_single".to_owned(),
        action: "INSERT".to_owned(),
        data: json!({ "level": 8, "score": 4321, "time": 70.0 }),
        timestamp_ms: 1_700_000_000_000,
        origin_node_id: "feed-only-node".to_owned(),
        replay: false,
    };

    let applied = eventually(Duration::from_secs(5), || async {
        change_feed::publish_change(a.state(), event.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        rows(&api, b.address()).await.len() == 1
    })
    .await;
    assert!(applied, "follower never applied the feed event");

    let on_b = rows(&api, b.address()).await;
    assert_eq!((on_b[0].level, on_b[0].score, on_b[0].time), (8, 4321, 70.0));
    assert!(rows(&api, a.address()).await.is_empty());

    for node in nodes {
        node.shutdown().await.unwrap();
    }
}
