use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use validator::Validate;

use crate::{
    dao::score_store::DEFAULT_TOP_N,
    dto::scores::{BestScoresQuery, BestScoresResponse, SaveScoreRequest, SaveScoreResponse},
    error::{ApiJson, ApiQuery, AppError},
    services::score_service,
    state::SharedState,
};

/// Game-facing score endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/save-score", post(save_score))
        .route("/best-scores", get(best_scores))
}

#[utoipa::path(
    post,
    path = "/save-score",
    tag = "scores",
    request_body = SaveScoreRequest,
    responses(
        (status = 200, description = "Score stored or already present", body = SaveScoreResponse),
        (status = 400, description = "Invalid score"),
        (status = 503, description = "Storage unavailable")
    )
)]
/// Store a score and replicate it to the cluster.
pub async fn save_score(
    State(state): State<SharedState>,
    ApiJson(payload): ApiJson<SaveScoreRequest>,
) -> Result<Json<SaveScoreResponse>, AppError> {
    payload.validate()?;
    let response = score_service::save_score(&state, payload).await?;
    Ok(Json(response))
}

#[utoipa::path(
    get,
    path = "/best-scores",
    tag = "scores",
    params(BestScoresQuery),
    responses(
        (status = 200, description = "Leaderboard of the mode", body = BestScoresResponse),
        (status = 503, description = "Storage unavailable")
    )
)]
/// Return the best scores of a mode, highest first.
pub async fn best_scores(
    State(state): State<SharedState>,
    ApiQuery(query): ApiQuery<BestScoresQuery>,
) -> Result<Json<BestScoresResponse>, AppError> {
    query.validate()?;
    let mode = query.mode.unwrap_or_default();
    let limit = query.limit.unwrap_or(DEFAULT_TOP_N);
    let data = score_service::best_scores(&state, mode, limit).await?;
    Ok(Json(BestScoresResponse {
        success: true,
        data,
    }))
}
