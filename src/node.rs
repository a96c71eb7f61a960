//! Spawning a full cluster node: HTTP listener, store and background tasks.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use axum::Router;
use rand::Rng;
use thiserror::Error;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    task::{JoinHandle, JoinSet},
    time::sleep,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    client::{ClientError, NodeApi},
    config::{NodeConfig, StorageConfig},
    dao::score_store::MemoryScoreStore,
    routes,
    services::{change_feed, discovery, outbox, registry::NodeRegistry},
    state::{AppState, SharedState, node::NodeIdentity},
};

/// Upper bound of the random delay before each periodic task starts, so nodes started together
/// do not probe each other in lockstep.
const MAX_START_JITTER_MS: u64 = 250;

/// Failures while starting a node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to bind `{addr}`")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to read the bound address")]
    LocalAddr(#[source] io::Error),
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// A running node. Dropping it without [`Node::shutdown`] leaves the tasks running until the
/// runtime stops.
pub struct Node {
    state: SharedState,
    local_addr: SocketAddr,
    tasks: JoinSet<()>,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<io::Result<()>>,
}

impl Node {
    /// Bind the configured address and start the node.
    pub async fn bind(config: NodeConfig) -> Result<Self, NodeError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| NodeError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        Self::start(config, listener).await
    }

    /// Start the node on an already bound listener.
    pub async fn start(mut config: NodeConfig, listener: TcpListener) -> Result<Self, NodeError> {
        let local_addr = listener.local_addr().map_err(NodeError::LocalAddr)?;
        config.bind_addr.set_port(local_addr.port());
        let address = config.advertised_address();

        let identity = NodeIdentity::new(address);
        let state = AppState::new(identity, config.timings.clone(), NodeApi::new()?);
        info!(
            node_id = %state.node_id(),
            address = %state.address(),
            "starting node"
        );

        let mut tasks = JoinSet::new();
        install_store(&state, &config.storage, &mut tasks).await;

        let seeds = config.seed_peers(state.address());
        let mut registry =
            NodeRegistry::new(state.clone(), seeds, config.known_nodes_path.clone());
        if let Some(scan_config) = config.auto_discovery.clone() {
            let (found_tx, found_rx) = mpsc::channel(1);
            registry = registry.with_scan_results(found_rx);
            let scan_state = state.clone();
            tasks.spawn(async move {
                let found = discovery::scan(&scan_state, &scan_config).await;
                let _ = found_tx.send(found).await;
            });
        }
        tasks.spawn(jittered(registry.run()));
        tasks.spawn(jittered(outbox::run(state.clone())));
        tasks.spawn(jittered(change_feed::run_poller(state.clone())));

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = build_router(state.clone());
        let server = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });
        info!(%local_addr, "node listening");

        Ok(Self {
            state,
            local_addr,
            tasks,
            shutdown: Some(shutdown_tx),
            server,
        })
    }

    /// Shared state of the running node.
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Socket the HTTP API is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address advertised to peers.
    pub fn address(&self) -> &str {
        self.state.address()
    }

    /// Stop background tasks, then stop serving once in-flight requests are done.
    pub async fn shutdown(mut self) -> io::Result<()> {
        self.tasks.shutdown().await;
        self.state.begin_shutdown();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match (&mut self.server).await {
            Ok(result) => result,
            Err(err) => Err(io::Error::other(err)),
        }
    }

    /// Wait until the HTTP server stops on its own.
    pub async fn wait(mut self) -> io::Result<()> {
        let result = match (&mut self.server).await {
            Ok(result) => result,
            Err(err) => Err(io::Error::other(err)),
        };
        self.tasks.shutdown().await;
        result
    }
}

/// Build the top-level router and attach cross-cutting middleware layers.
pub fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn jittered<F>(task: F)
where
    F: std::future::Future<Output = ()>,
{
    let delay = rand::rng().random_range(0..=MAX_START_JITTER_MS);
    sleep(Duration::from_millis(delay)).await;
    task.await;
}

#[cfg_attr(not(feature = "mongo-store"), allow(unused_variables))]
async fn install_store(state: &SharedState, storage: &StorageConfig, tasks: &mut JoinSet<()>) {
    match storage {
        StorageConfig::Memory => {
            info!("using in-memory store");
            state.set_store(Arc::new(MemoryScoreStore::new())).await;
        }
        #[cfg(feature = "mongo-store")]
        StorageConfig::Mongo { uri, database } => {
            use crate::dao::{
                score_store::{
                    ScoreStore,
                    mongodb::{MongoConfig, MongoScoreStore},
                },
                storage::StorageError,
            };
            use crate::services::storage_supervisor;

            let uri = uri.clone();
            let database = database.clone();
            tasks.spawn(storage_supervisor::run(state.clone(), move || {
                let uri = uri.clone();
                let database = database.clone();
                async move {
                    let config = MongoConfig::from_uri(&uri, database.as_deref())
                        .await
                        .map_err(StorageError::from)?;
                    let store = MongoScoreStore::connect(config)
                        .await
                        .map_err(StorageError::from)?;
                    Ok(Arc::new(store) as Arc<dyn ScoreStore>)
                }
            }));
        }
        #[cfg(not(feature = "mongo-store"))]
        StorageConfig::Mongo { .. } => {
            tracing::warn!("built without MongoDB support; using in-memory store");
            state.set_store(Arc::new(MemoryScoreStore::new())).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterTimings;

    #[tokio::test]
    async fn node_answers_ping_on_an_ephemeral_port() {
        let config = NodeConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            timings: ClusterTimings::default(),
            ..NodeConfig::default()
        };
        let node = Node::bind(config).await.unwrap();
        assert_ne!(node.local_addr().port(), 0);
        assert_eq!(node.address(), node.local_addr().to_string());

        let api = NodeApi::new().unwrap();
        let ping = api
            .ping(node.address(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(ping.node_id, node.state().node_id());
        assert!(ping.is_primary);

        node.shutdown().await.unwrap();
    }
}
