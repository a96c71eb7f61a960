//! Low-latency propagation of local writes: immediate push, the polling fallback, the
//! `/subscribe-changes` stream and the followers tailing the streams of active peers.

use std::{collections::HashMap, convert::Infallible, time::Duration};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt, future::join_all};
use tokio::{
    sync::{
        broadcast::error::RecvError,
        mpsc,
    },
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval, interval_at, timeout},
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::{
    client::ClientError,
    dto::{
        feed::{FeedMessage, ServerEvent},
        replication::ChangeEvent,
    },
    error::ServiceError,
    services::replication_service,
    state::{SharedState, watermark::now_ms},
};

/// Send a message to every local feed subscriber.
pub fn publish(state: &SharedState, message: &FeedMessage) {
    match message.to_server_event() {
        Ok(event) => state.feed().broadcast(event),
        Err(err) => warn!(error = %err, "failed to encode feed message"),
    }
}

pub fn publish_change(state: &SharedState, event: ChangeEvent) {
    publish(state, &FeedMessage::DataChange(event));
}

/// Deliver `event` to each of `peers` in parallel; returns how many accepted it.
pub async fn push_to_peers(
    state: &SharedState,
    event: &ChangeEvent,
    peers: &[String],
    limit: Duration,
) -> usize {
    let api = state.peers();
    let calls = peers.iter().map(|peer| async move {
        match api.apply_change(peer, event, limit).await {
            Ok(()) => true,
            Err(err) => {
                debug!(peer = %peer, error = %err, "change delivery failed");
                false
            }
        }
    });

    join_all(calls)
        .await
        .into_iter()
        .filter(|delivered| *delivered)
        .count()
}

/// Immediate push of a freshly committed write to the current active set.
pub async fn push_to_active_peers(state: &SharedState, event: &ChangeEvent) -> usize {
    let active = state.node_state().active_nodes;
    if active.is_empty() {
        return 0;
    }
    push_to_peers(state, event, &active, state.timings().push_timeout).await
}

/// One polling pass: push local changes newer than the poll watermark, then advance it.
///
/// Returns the number of changes found.
pub async fn poll_once(state: &SharedState) -> Result<usize, ServiceError> {
    let store = state.require_store().await?;
    let changes = {
        let _ordered = state.local_write_guard().await;
        store
            .changes_since(state.node_id().to_owned(), state.poll_watermark())
            .await?
    };
    let Some(newest) = changes.iter().map(|change| change.timestamp_ms).max() else {
        return Ok(0);
    };

    let active = state.node_state().active_nodes;
    if !active.is_empty() {
        let limit = state.timings().push_timeout;
        for change in &changes {
            push_to_peers(state, &ChangeEvent::from_change(change), &active, limit).await;
        }
    }

    state.advance_poll_watermark(newest);
    Ok(changes.len())
}

/// Polling fallback loop recovering pushes lost to transient peer failures.
pub async fn run_poller(state: SharedState) {
    let mut ticker = interval(state.timings().poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        match poll_once(&state).await {
            Ok(0) | Err(ServiceError::StoreUnavailable) => {}
            Ok(count) => debug!(count, "polling pass pushed local changes"),
            Err(err) => warn!(error = %err, "polling pass failed"),
        }
    }
}

fn to_sse_event(payload: ServerEvent) -> Event {
    let mut event = Event::default().data(payload.data);
    if let Some(name) = payload.event {
        event = event.event(name);
    }
    event
}

/// Turn a new subscription into an SSE response: a `connected` message, then every change
/// published locally, with a `ping` message each keep-alive period.
pub fn subscribe(
    state: &SharedState,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + use<>> {
    let mut receiver = state.feed().subscribe();
    let mut closing = state.closing_watcher();
    let keep_alive = state.timings().feed_keep_alive;
    let hello = FeedMessage::Connected {
        node_id: state.node_id().to_owned(),
        timestamp_ms: now_ms(),
    };

    // small bounded channel between forwarder and response
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(8);

    tokio::spawn(async move {
        if let Ok(event) = hello.to_server_event() {
            if tx.send(Ok(to_sse_event(event))).await.is_err() {
                return;
            }
        }

        let mut heartbeat = interval_at(Instant::now() + keep_alive, keep_alive);
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                _ = async { closing.wait_for(|closing| *closing).await.map(|_| ()) } => break,
                _ = heartbeat.tick() => {
                    let ping = FeedMessage::Ping { timestamp_ms: now_ms() };
                    let Ok(event) = ping.to_server_event() else { continue };
                    if tx.send(Ok(to_sse_event(event))).await.is_err() {
                        break;
                    }
                }
                recv_result = receiver.recv() => {
                    match recv_result {
                        Ok(payload) => {
                            if tx.send(Ok(to_sse_event(payload))).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(skipped)) => {
                            // No replay: the poller and the outbox cover what was skipped.
                            debug!(skipped, "change feed subscriber lagged");
                            continue;
                        }
                    }
                }
            }
        }

        info!("change feed subscriber disconnected");
    });

    // response stream reads from mpsc; when client disconnects axum drops this stream
    let stream = ReceiverStream::new(rx);
    Sse::new(stream).keep_alive(KeepAlive::new().interval(keep_alive).text("keep-alive"))
}

/// Feed subscriptions this node holds on its active peers, one task per peer.
#[derive(Default)]
pub struct FeedFollowers {
    tasks: HashMap<String, JoinHandle<()>>,
}

impl FeedFollowers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow exactly the peers in `active`: stop followers of departed peers and (re)start
    /// followers whose stream ended.
    pub fn sync(&mut self, state: &SharedState, active: &[String]) {
        self.tasks.retain(|peer, handle| {
            let keep = active.contains(peer) && !handle.is_finished();
            if !keep {
                handle.abort();
            }
            keep
        });

        for peer in active {
            if !self.tasks.contains_key(peer) {
                let handle = tokio::spawn(follow_peer(state.clone(), peer.clone()));
                self.tasks.insert(peer.clone(), handle);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Drop for FeedFollowers {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }
}

async fn follow_peer(state: SharedState, peer: String) {
    let connect = state.peers().subscribe(&peer);
    let stream = match timeout(state.timings().probe_timeout, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            debug!(peer = %peer, error = %err, "change feed subscription failed");
            return;
        }
        Err(_) => {
            debug!(peer = %peer, "change feed subscription timed out");
            return;
        }
    };
    let mut stream = std::pin::pin!(stream);
    let idle = state.timings().feed_idle_timeout();
    debug!(peer = %peer, "following change feed");

    loop {
        match timeout(idle, stream.next()).await {
            Err(_) => {
                debug!(peer = %peer, "change feed idle; dropping subscription");
                break;
            }
            Ok(None) => break,
            Ok(Some(Ok(FeedMessage::DataChange(event)))) => {
                if let Err(err) = replication_service::apply_change(&state, event).await {
                    warn!(peer = %peer, error = %err, "dropping change event from feed");
                }
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(err @ ClientError::MalformedFrame { .. }))) => {
                warn!(peer = %peer, error = %err, "ignoring malformed feed frame");
            }
            Ok(Some(Err(err))) => {
                debug!(peer = %peer, error = %err, "change feed connection lost");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{score_service, test_support::memory_state};
    use crate::{
        dao::{
            models::{ChangeAction, ChangeLogEntity, GameMode, ScorePayload},
            score_store::ScoreStore,
        },
        dto::scores::SaveScoreRequest,
    };

    #[tokio::test]
    async fn local_saves_are_published_on_the_feed() {
        let (state, _store) = memory_state().await;
        let mut receiver = state.feed().subscribe();

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

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.event.as_deref(), Some("dataChange"));
        let message: FeedMessage = serde_json::from_str(&event.data).unwrap();
        match message {
            FeedMessage::DataChange(change) => {
                assert_eq!(change.origin_node_id, state.node_id());
                assert_eq!(change.table, "scores_single");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn poll_advances_watermark_past_local_changes() {
        let (state, _store) = memory_state().await;
        assert_eq!(poll_once(&state).await.unwrap(), 0);

        for score in [10, 20] {
            score_service::save_score(
                &state,
                SaveScoreRequest {
                    level: 1,
                    score,
                    time: 1.0,
                    mode: GameMode::Coop,
                },
            )
            .await
            .unwrap();
        }

        assert_eq!(poll_once(&state).await.unwrap(), 2);
        assert_eq!(poll_once(&state).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn poll_waits_for_a_write_that_already_has_its_timestamp() {
        let (state, store) = memory_state().await;
        let in_flight = state.local_write_guard().await;
        let timestamp_ms = state.clock().next();

        let poller = tokio::spawn({
            let state = state.clone();
            async move { poll_once(&state).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!poller.is_finished());

        store
            .append_change(ChangeLogEntity {
                id: uuid::Uuid::new_v4(),
                table_name: GameMode::Single.table_name().to_owned(),
                record_id: uuid::Uuid::new_v4(),
                action: ChangeAction::Insert,
                new_data: ScorePayload {
                    level: 1,
                    score: 5,
                    time: 1.0,
                },
                timestamp_ms,
                origin_node_id: state.node_id().to_owned(),
            })
            .await
            .unwrap();
        drop(in_flight);

        assert_eq!(poller.await.unwrap().unwrap(), 1);
        assert_eq!(state.poll_watermark(), timestamp_ms);
    }

    #[tokio::test]
    async fn concurrent_saves_are_all_seen_by_the_poller() {
        let (state, _store) = memory_state().await;
        let mut writers = tokio::task::JoinSet::new();
        for score in 0..40 {
            let state = state.clone();
            writers.spawn(async move {
                score_service::save_score(
                    &state,
                    SaveScoreRequest {
                        level: 3,
                        score,
                        time: 2.0,
                        mode: GameMode::Single,
                    },
                )
                .await
                .unwrap();
            });
        }

        let mut seen = 0;
        while !writers.is_empty() {
            seen += poll_once(&state).await.unwrap();
            writers.join_next().await;
        }
        seen += poll_once(&state).await.unwrap();
        assert_eq!(seen, 40);
    }
}
