use axum::Router;

use crate::state::SharedState;

pub mod cluster;
pub mod docs;
pub mod feed;
pub mod replication;
pub mod scores;

/// Compose all route trees, wiring in shared state and documentation routes.
pub fn router(state: SharedState) -> Router<()> {
    let api_router = cluster::router()
        .merge(scores::router())
        .merge(replication::router())
        .merge(feed::router());

    let docs_router = docs::router(state.clone());

    api_router.merge(docs_router).with_state(state)
}
