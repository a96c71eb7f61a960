use std::{net::SocketAddr, sync::Arc};

use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tracing::{info, warn};

use super::{
    NodeApi,
    error::{ClientError, ClientResult},
};
use crate::{
    config::ClusterTimings,
    dao::score_store::MemoryScoreStore,
    routes,
    state::{AppState, SharedState, node::NodeIdentity},
};

/// In-process stand-in for a cluster node: the regular node API over an in-memory store,
/// without peers or background replication.
pub struct FallbackHost {
    address: SocketAddr,
    state: SharedState,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<std::io::Result<()>>,
}

impl FallbackHost {
    /// Bind `bind` (port 0 picks a free port) and start serving.
    pub async fn start(bind: SocketAddr) -> ClientResult<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(ClientError::Fallback)?;
        let address = listener.local_addr().map_err(ClientError::Fallback)?;

        let state = AppState::new(
            NodeIdentity::new(address.to_string()),
            ClusterTimings::default(),
            NodeApi::new()?,
        );
        state.set_store(Arc::new(MemoryScoreStore::new())).await;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = routes::router(state.clone());
        let server = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        info!(%address, "fallback host started");
        Ok(Self {
            address,
            state,
            shutdown: Some(shutdown_tx),
            server,
        })
    }

    /// `host:port` of the local API.
    pub fn address(&self) -> String {
        self.address.to_string()
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Stop serving and wait for in-flight requests to finish.
    pub async fn stop(mut self) {
        self.state.begin_shutdown();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match (&mut self.server).await {
            Ok(Ok(())) => info!(address = %self.address, "fallback host stopped"),
            Ok(Err(err)) => warn!(address = %self.address, error = %err, "fallback host failed"),
            Err(err) => warn!(address = %self.address, error = %err, "fallback host task aborted"),
        }
    }
}

impl Drop for FallbackHost {
    fn drop(&mut self) {
        self.state.begin_shutdown();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{dao::models::GameMode, dto::scores::SaveScoreRequest};

    #[tokio::test]
    async fn fallback_serves_the_score_api() {
        let host = FallbackHost::start(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let api = NodeApi::new().unwrap();
        let limit = Duration::from_secs(5);
        let request = SaveScoreRequest {
            level: 2,
            score: 300,
            time: 45.0,
            mode: GameMode::Single,
        };

        api.save_score(&host.address(), &request, limit).await.unwrap();
        let rows = api
            .best_scores(&host.address(), GameMode::Single, None, limit)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].score, 300);

        let address = host.address();
        host.stop().await;
        assert!(api.ping(&address, limit).await.is_err());
    }
}
