use axum::{Json, Router, extract::State, routing::get};

use crate::{
    dto::cluster::{ClusterStatusResponse, PingResponse, StoreStatusResponse},
    services::status_service,
    state::SharedState,
};

#[utoipa::path(
    get,
    path = "/ping",
    tag = "cluster",
    responses((status = 200, description = "Node is alive", body = PingResponse))
)]
/// Liveness probe used by peers and clients; carries the node's active set.
pub async fn ping(State(state): State<SharedState>) -> Json<PingResponse> {
    Json(status_service::ping(&state))
}

#[utoipa::path(
    get,
    path = "/cluster-status",
    tag = "cluster",
    responses((status = 200, description = "Cluster view of the node", body = ClusterStatusResponse))
)]
/// Return the node's view of the cluster.
pub async fn cluster_status(State(state): State<SharedState>) -> Json<ClusterStatusResponse> {
    Json(status_service::cluster_status(&state))
}

#[utoipa::path(
    get,
    path = "/store-status",
    tag = "cluster",
    responses((status = 200, description = "Storage view of the node", body = StoreStatusResponse))
)]
/// Return whether the node's store is connected, and ping it.
pub async fn store_status(State(state): State<SharedState>) -> Json<StoreStatusResponse> {
    Json(status_service::store_status(&state).await)
}

/// Configure the cluster status routes subtree.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new()
        .route("/ping", get(ping))
        .route("/cluster-status", get(cluster_status))
        .route("/store-status", get(store_status))
}
