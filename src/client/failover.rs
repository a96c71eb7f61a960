//! Game-facing client that follows the healthy part of the cluster and keeps the game playable
//! through a local fallback host when no node answers.

use std::{future::Future, sync::Arc};

use futures::future::join_all;
use indexmap::IndexSet;
use tokio::{
    sync::{Mutex, RwLock, watch},
    task::JoinHandle,
    time::{MissedTickBehavior, interval, sleep},
};
use tracing::{debug, info, warn};

use super::{
    FallbackHost, NodeApi,
    error::{ClientError, ClientResult},
};
use crate::{
    config::FailoverConfig,
    dao::models::GameMode,
    dto::{
        replication::TableRows,
        scores::{SaveScoreRequest, ScoreRow},
    },
    services::replication_service,
};

/// Where the client currently sends its requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial state, before any health pass.
    Disconnected,
    /// First health pass in progress.
    Probing,
    /// Requests go to this cluster node.
    Connected(String),
    /// No node answered; requests go to the local fallback host at this address.
    FallbackActive(String),
    /// Fallback rows are being merged into a recovered node.
    SyncingOut,
}

#[derive(Clone)]
pub struct FailoverClient {
    inner: Arc<Inner>,
}

struct Inner {
    api: NodeApi,
    config: FailoverConfig,
    candidates: RwLock<IndexSet<String>>,
    current: RwLock<Option<String>>,
    connection: watch::Sender<ConnectionState>,
    fallback: Mutex<Option<FallbackHost>>,
    // Serialises health passes so two of them never start two fallback hosts.
    refresh_gate: Mutex<()>,
}

impl FailoverClient {
    pub fn new(config: FailoverConfig) -> ClientResult<Self> {
        let api = NodeApi::new()?;
        let candidates = config.candidates.iter().cloned().collect();
        let (connection, _rx) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            inner: Arc::new(Inner {
                api,
                config,
                candidates: RwLock::new(candidates),
                current: RwLock::new(None),
                connection,
                fallback: Mutex::new(None),
                refresh_gate: Mutex::new(()),
            }),
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.borrow().clone()
    }

    pub fn connection_watcher(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }

    /// Known candidate addresses, configured ones first.
    pub async fn candidates(&self) -> Vec<String> {
        self.inner.candidates.read().await.iter().cloned().collect()
    }

    pub async fn current(&self) -> Option<String> {
        self.inner.current.read().await.clone()
    }

    /// Address of the running fallback host, if any.
    pub async fn fallback_address(&self) -> Option<String> {
        self.inner
            .fallback
            .lock()
            .await
            .as_ref()
            .map(FallbackHost::address)
    }

    fn set_connection(&self, next: ConnectionState) {
        self.inner.connection.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = ?current, to = ?next, "connection state changed");
            *current = next;
            true
        });
    }

    /// One health pass: probe every candidate, learn new ones, pick the node to talk to, and
    /// start or retire the fallback host accordingly.
    pub async fn refresh(&self) -> ClientResult<ConnectionState> {
        let _gate = self.inner.refresh_gate.lock().await;
        if self.connection_state() == ConnectionState::Disconnected {
            self.set_connection(ConnectionState::Probing);
        }

        let candidates = self.candidates().await;
        let limit = self.inner.config.probe_timeout;
        let api = &self.inner.api;
        let probes = join_all(candidates.iter().map(|candidate| async move {
            (candidate, api.ping(candidate, limit).await)
        }))
        .await;

        let fallback_address = self.fallback_address().await;
        let mut healthy = Vec::new();
        let mut discovered = Vec::new();
        for (candidate, result) in probes {
            match result {
                Ok(ping) => {
                    discovered.extend(ping.active_nodes);
                    healthy.push((candidate.clone(), ping.is_primary));
                }
                Err(err) => debug!(candidate = %candidate, error = %err, "candidate unhealthy"),
            }
        }
        self.learn_candidates(discovered, fallback_address.as_deref())
            .await;

        let chosen = healthy
            .iter()
            .find(|(_, is_primary)| *is_primary)
            .or_else(|| healthy.first())
            .map(|(candidate, _)| candidate.clone());

        match chosen {
            Some(node) => {
                *self.inner.current.write().await = Some(node.clone());
                let retired = self.inner.fallback.lock().await.take();
                if let Some(host) = retired {
                    self.set_connection(ConnectionState::SyncingOut);
                    let rows = self.retire_fallback(host).await?;
                    let limit = self.inner.config.request_timeout;
                    match self.inner.api.merge(&node, rows.clone(), limit).await {
                        Ok(count) => info!(node = %node, count, "fallback rows merged into cluster"),
                        Err(err) => {
                            warn!(node = %node, error = %err, "fallback merge failed; staying offline");
                            *self.inner.current.write().await = None;
                            let address = self.restore_fallback(rows).await?;
                            let state = ConnectionState::FallbackActive(address);
                            self.set_connection(state.clone());
                            return Ok(state);
                        }
                    }
                }
                let state = ConnectionState::Connected(node);
                self.set_connection(state.clone());
                Ok(state)
            }
            None => {
                *self.inner.current.write().await = None;
                let address = self.ensure_fallback().await?;
                let state = ConnectionState::FallbackActive(address);
                self.set_connection(state.clone());
                Ok(state)
            }
        }
    }

    async fn learn_candidates(&self, discovered: Vec<String>, fallback: Option<&str>) {
        let mut candidates = self.inner.candidates.write().await;
        for address in discovered {
            if Some(address.as_str()) != fallback && candidates.insert(address.clone()) {
                info!(candidate = %address, "discovered candidate");
            }
        }
    }

    async fn ensure_fallback(&self) -> ClientResult<String> {
        let mut fallback = self.inner.fallback.lock().await;
        if let Some(host) = fallback.as_ref() {
            return Ok(host.address());
        }
        warn!("no healthy candidate; starting fallback host");
        let host = FallbackHost::start(self.inner.config.fallback_bind).await?;
        let address = host.address();
        *fallback = Some(host);
        Ok(address)
    }

    /// Stop a host already removed from routing and return every row it holds. The host drains
    /// in-flight requests before its store is read, so every save it acknowledged is exported.
    async fn retire_fallback(&self, host: FallbackHost) -> ClientResult<TableRows> {
        let state = host.state().clone();
        host.stop().await;
        replication_service::export_all(&state)
            .await
            .map_err(ClientError::FallbackStore)
    }

    /// Start a new fallback host holding `rows` and route to it again.
    async fn restore_fallback(&self, rows: TableRows) -> ClientResult<String> {
        let mut fallback = self.inner.fallback.lock().await;
        let host = FallbackHost::start(self.inner.config.fallback_bind).await?;
        replication_service::merge_from_remote(host.state(), rows)
            .await
            .map_err(ClientError::FallbackStore)?;
        let address = host.address();
        *fallback = Some(host);
        Ok(address)
    }

    /// Node the next request goes to: the fallback host while offline, else the current node,
    /// else the first candidate.
    async fn target(&self) -> Option<String> {
        if let Some(address) = self.fallback_address().await {
            return Some(address);
        }
        if let Some(current) = self.current().await {
            return Some(current);
        }
        self.inner.candidates.read().await.first().cloned()
    }

    /// Scan the candidates cyclically after `failed` and return the first one answering a
    /// short ping.
    async fn next_healthy_after(&self, failed: &str) -> Option<String> {
        let candidates = self.candidates().await;
        let start = candidates
            .iter()
            .position(|candidate| candidate == failed)
            .map_or(0, |index| index + 1);
        let limit = self.inner.config.ping_timeout;

        for offset in 0..candidates.len() {
            let candidate = &candidates[(start + offset) % candidates.len()];
            if candidate == failed && candidates.len() > 1 {
                continue;
            }
            if self.inner.api.ping(candidate, limit).await.is_ok() {
                return Some(candidate.clone());
            }
        }
        None
    }

    /// Run `operation` against the current node, moving on to the next healthy candidate after
    /// each failure. At most `max_retries` attempts are made.
    pub async fn execute_with_failover<F, Fut, T>(
        &self,
        operation: F,
        max_retries: u32,
    ) -> ClientResult<T>
    where
        F: Fn(NodeApi, String) -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let mut target = self.target().await.ok_or(ClientError::NoCandidates)?;
        let max_attempts = max_retries.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let err = match operation(self.inner.api.clone(), target.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            warn!(target = %target, attempt = attempts, error = %err, "request failed");
            if attempts >= max_attempts {
                return Err(ClientError::RetriesExhausted {
                    attempts,
                    last: Box::new(err),
                });
            }

            sleep(self.inner.config.retry_delay).await;
            if let Some(next) = self.next_healthy_after(&target).await {
                if self.fallback_address().await.is_none() {
                    *self.inner.current.write().await = Some(next.clone());
                    self.set_connection(ConnectionState::Connected(next.clone()));
                }
                target = next;
            } else if let Some(fallback) = self.fallback_address().await {
                target = fallback;
            }
        }
    }

    /// Save a score through the cluster, or the fallback host while offline.
    pub async fn save_score(&self, request: SaveScoreRequest) -> ClientResult<String> {
        let limit = self.inner.config.request_timeout;
        self.execute_with_failover(
            |api, address| {
                let request = request.clone();
                async move { api.save_score(&address, &request, limit).await }
            },
            self.inner.config.max_retries,
        )
        .await
    }

    /// Leaderboard of `mode`.
    pub async fn best_scores(
        &self,
        mode: GameMode,
        limit: Option<usize>,
    ) -> ClientResult<Vec<ScoreRow>> {
        let timeout = self.inner.config.request_timeout;
        self.execute_with_failover(
            |api, address| async move { api.best_scores(&address, mode, limit, timeout).await },
            self.inner.config.max_retries,
        )
        .await
    }

    /// Run a health pass now and then every health interval.
    pub fn spawn_health_loop(&self) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(client.inner.config.health_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = client.refresh().await {
                    warn!(error = %err, "health pass failed");
                }
            }
        })
    }

    /// Stop the fallback host if it is running. Rows it still holds are lost.
    pub async fn shutdown(&self) {
        if let Some(host) = self.inner.fallback.lock().await.take() {
            host.stop().await;
        }
        *self.inner.current.write().await = None;
        self.set_connection(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn offline_config() -> FailoverConfig {
        FailoverConfig {
            probe_timeout: Duration::from_millis(300),
            ping_timeout: Duration::from_millis(300),
            retry_delay: Duration::from_millis(10),
            ..FailoverConfig::with_candidates(["127.0.0.1:9"])
        }
    }

    #[tokio::test]
    async fn starts_disconnected_and_falls_back_when_nothing_answers() {
        let client = FailoverClient::new(offline_config()).unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);

        let state = client.refresh().await.unwrap();
        let ConnectionState::FallbackActive(address) = state else {
            panic!("expected fallback, got {state:?}");
        };
        assert_eq!(client.fallback_address().await, Some(address));

        // A second pass reuses the running host.
        assert_eq!(client.refresh().await.unwrap(), client.connection_state());
        client.shutdown().await;
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let client = FailoverClient::new(offline_config()).unwrap();
        let err = client
            .execute_with_failover(
                |api, address| async move {
                    api.ping(&address, Duration::from_millis(100)).await.map(|_| ())
                },
                2,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::RetriesExhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn no_candidates_is_reported() {
        let client = FailoverClient::new(FailoverConfig::default()).unwrap();
        let err = client
            .execute_with_failover(|_, _| async { Ok(()) }, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NoCandidates));
    }
}
