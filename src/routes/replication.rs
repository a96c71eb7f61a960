use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use tracing::warn;

use crate::{
    dto::replication::{
        ApplyChangeResponse, ChangeEvent, ExportResponse, MergeRequest, MergeResponse,
    },
    error::{ApiJson, AppError, ServiceError},
    services::replication_service,
    state::SharedState,
};

/// Cluster-internal replication endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/apply-change", post(apply_change))
        .route("/merge-from-remote", post(merge_from_remote))
        .route("/export-all", get(export_all))
}

#[utoipa::path(
    post,
    path = "/apply-change",
    tag = "replication",
    request_body = ChangeEvent,
    responses(
        (status = 200, description = "Event applied, ignored or already present", body = ApplyChangeResponse),
        (status = 400, description = "Malformed event")
    )
)]
/// Apply a change event pushed by a peer.
pub async fn apply_change(
    State(state): State<SharedState>,
    ApiJson(event): ApiJson<ChangeEvent>,
) -> Result<Json<ApplyChangeResponse>, AppError> {
    let origin = event.origin_node_id.clone();
    match replication_service::apply_change(&state, event).await {
        Ok(_) => Ok(Json(ApplyChangeResponse { success: true })),
        Err(err @ ServiceError::InvalidPayload(_)) => {
            warn!(origin = %origin, error = %err, "dropping invalid change event");
            Err(err.into())
        }
        Err(err) => Err(err.into()),
    }
}

#[utoipa::path(
    post,
    path = "/merge-from-remote",
    tag = "replication",
    request_body = MergeRequest,
    responses(
        (status = 200, description = "Rows merged", body = MergeResponse),
        (status = 400, description = "Unknown table or invalid row")
    )
)]
/// Merge rows accumulated elsewhere, skipping the ones already stored.
pub async fn merge_from_remote(
    State(state): State<SharedState>,
    ApiJson(request): ApiJson<MergeRequest>,
) -> Result<Json<MergeResponse>, AppError> {
    let count = replication_service::merge_from_remote(&state, request.data).await?;
    Ok(Json(MergeResponse {
        success: true,
        count,
    }))
}

#[utoipa::path(
    get,
    path = "/export-all",
    tag = "replication",
    responses((status = 200, description = "Every stored row by table", body = ExportResponse))
)]
/// Dump every score table.
pub async fn export_all(
    State(state): State<SharedState>,
) -> Result<Json<ExportResponse>, AppError> {
    let data = replication_service::export_all(&state).await?;
    Ok(Json(ExportResponse {
        success: true,
        data,
    }))
}
