use std::convert::Infallible;

use axum::{
    Router,
    extract::State,
    response::sse::{Event, Sse},
    routing::get,
};
use futures::Stream;
use tracing::info;

use crate::{services::change_feed, state::SharedState};

#[utoipa::path(
    get,
    path = "/subscribe-changes",
    tag = "feed",
    responses((status = 200, description = "Change feed of this node", content_type = "text/event-stream", body = String))
)]
/// Stream `connected`, `dataChange` and `ping` messages to a subscriber.
pub async fn subscribe_changes(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(
        subscribers = state.feed().subscriber_count() + 1,
        "new change feed subscriber"
    );
    change_feed::subscribe(&state)
}

/// Configure the change feed endpoint.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/subscribe-changes", get(subscribe_changes))
}
