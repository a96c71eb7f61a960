mod feed;
pub mod node;
pub mod watermark;

use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use tokio::sync::{Mutex, MutexGuard, RwLock, watch};

use crate::{
    client::NodeApi, config::ClusterTimings, dao::score_store::ScoreStore, error::ServiceError,
};

pub use self::feed::FeedHub;
use self::{
    node::{NodeIdentity, NodeState},
    watermark::{ChangeClock, OriginWatermarks, now_ms},
};

pub type SharedState = Arc<AppState>;

const FEED_CAPACITY: usize = 64;

/// Central node state shared by request handlers and background tasks.
pub struct AppState {
    identity: NodeIdentity,
    timings: ClusterTimings,
    store: RwLock<Option<Arc<dyn ScoreStore>>>,
    degraded: watch::Sender<bool>,
    node: watch::Sender<NodeState>,
    feed: FeedHub,
    peers: NodeApi,
    clock: ChangeClock,
    watermarks: OriginWatermarks,
    poll_watermark: AtomicI64,
    // Held from issuing a local change timestamp until its change log entry is stored.
    local_writes: Mutex<()>,
    closing: watch::Sender<bool>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The node starts in degraded mode until a store is installed, and alone (hence primary)
    /// until the registry completes its first probe round.
    pub fn new(identity: NodeIdentity, timings: ClusterTimings, peers: NodeApi) -> SharedState {
        let started_at = now_ms();
        let (degraded_tx, _rx) = watch::channel(true);
        let (node_tx, _rx) = watch::channel(NodeState::alone(started_at));
        let (closing_tx, _rx) = watch::channel(false);
        Arc::new(Self {
            identity,
            timings,
            store: RwLock::new(None),
            degraded: degraded_tx,
            node: node_tx,
            feed: FeedHub::new(FEED_CAPACITY),
            peers,
            clock: ChangeClock::new(),
            watermarks: OriginWatermarks::new(),
            poll_watermark: AtomicI64::new(started_at - 1),
            local_writes: Mutex::new(()),
            closing: closing_tx,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.identity.node_id
    }

    /// Address this node advertises to peers.
    pub fn address(&self) -> &str {
        &self.identity.address
    }

    pub fn timings(&self) -> &ClusterTimings {
        &self.timings
    }

    /// Obtain a handle to the current store, if one is installed.
    pub async fn store(&self) -> Option<Arc<dyn ScoreStore>> {
        let guard = self.store.read().await;
        guard.as_ref().cloned()
    }

    /// Current store, or [`ServiceError::StoreUnavailable`] while degraded.
    pub async fn require_store(&self) -> Result<Arc<dyn ScoreStore>, ServiceError> {
        if self.is_degraded() {
            return Err(ServiceError::StoreUnavailable);
        }
        self.store().await.ok_or(ServiceError::StoreUnavailable)
    }

    /// Install a new store implementation and leave degraded mode.
    pub async fn set_store(&self, store: Arc<dyn ScoreStore>) {
        {
            let mut guard = self.store.write().await;
            *guard = Some(store);
        }
        self.update_degraded(false);
    }

    /// Current degraded flag.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Update and broadcast the degraded flag when the value changes.
    pub fn update_degraded(&self, value: bool) {
        self.degraded.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
    }

    /// Latest cluster view published by the registry.
    pub fn node_state(&self) -> NodeState {
        self.node.borrow().clone()
    }

    pub fn node_watcher(&self) -> watch::Receiver<NodeState> {
        self.node.subscribe()
    }

    /// Replace the cluster view. Only the registry task calls this.
    pub(crate) fn publish_node_state(&self, next: NodeState) {
        self.node.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Broadcast hub used for the change feed.
    pub fn feed(&self) -> &FeedHub {
        &self.feed
    }

    /// HTTP client used to reach peers.
    pub fn peers(&self) -> &NodeApi {
        &self.peers
    }

    pub fn clock(&self) -> &ChangeClock {
        &self.clock
    }

    pub fn watermarks(&self) -> &OriginWatermarks {
        &self.watermarks
    }

    /// Newest local change timestamp already handled by the poller.
    pub fn poll_watermark(&self) -> i64 {
        self.poll_watermark.load(Ordering::Acquire)
    }

    /// Order local change log appends against the poller. While the guard is held no other
    /// local write can issue a timestamp and the poller cannot read the change log, so the
    /// poll watermark never passes a timestamp whose entry is not stored yet.
    pub(crate) async fn local_write_guard(&self) -> MutexGuard<'_, ()> {
        self.local_writes.lock().await
    }

    pub(crate) fn advance_poll_watermark(&self, timestamp_ms: i64) {
        self.poll_watermark.fetch_max(timestamp_ms, Ordering::AcqRel);
    }

    /// Ask long-lived responses (feed subscriptions) to end so the server can drain.
    pub fn begin_shutdown(&self) {
        self.closing.send_replace(true);
    }

    /// Resolves to `true` once [`AppState::begin_shutdown`] was called.
    pub fn closing_watcher(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }
}
