//! Wire types of the game-facing score endpoints.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use crate::{
    dao::models::{GameMode, ScoreEntity, ScorePayload},
    dto::validation::validate_run_time,
};

/// Largest `limit` accepted by `/best-scores`.
pub const MAX_BEST_SCORES_LIMIT: usize = 100;

/// Score submitted by the game at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Validate)]
pub struct SaveScoreRequest {
    #[validate(range(min = 1))]
    pub level: i64,
    #[validate(range(min = 0))]
    pub score: i64,
    /// Run duration in seconds.
    #[validate(custom(function = validate_run_time))]
    pub time: f64,
    /// Defaults to `single` when omitted.
    #[serde(default)]
    pub mode: GameMode,
}

impl SaveScoreRequest {
    pub fn payload(&self) -> ScorePayload {
        ScorePayload {
            level: self.level,
            score: self.score,
            time: self.time,
        }
    }
}

/// Generic acknowledgement returned by write endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SaveScoreResponse {
    pub success: bool,
    pub message: String,
}

/// Query string of `/best-scores`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, IntoParams, Validate)]
#[into_params(parameter_in = Query)]
pub struct BestScoresQuery {
    /// Game mode to rank; `single` when omitted.
    #[serde(default)]
    #[param(value_type = Option<GameMode>)]
    pub mode: Option<GameMode>,
    /// Number of rows to return, 10 when omitted.
    #[validate(range(min = 1, max = 100))]
    pub limit: Option<usize>,
}

/// Leaderboard rows of one mode.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BestScoresResponse {
    pub success: bool,
    pub data: Vec<ScoreRow>,
}

/// A score row as exchanged with clients and peers. Surrogate ids never leave a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema, Validate)]
pub struct ScoreRow {
    #[validate(range(min = 1))]
    pub level: i64,
    #[validate(range(min = 0))]
    pub score: i64,
    #[validate(custom(function = validate_run_time))]
    pub time: f64,
}

impl From<&ScoreEntity> for ScoreRow {
    fn from(entity: &ScoreEntity) -> Self {
        Self {
            level: entity.level,
            score: entity.score,
            time: entity.time,
        }
    }
}

impl From<ScorePayload> for ScoreRow {
    fn from(payload: ScorePayload) -> Self {
        Self {
            level: payload.level,
            score: payload.score,
            time: payload.time,
        }
    }
}

impl From<ScoreRow> for ScorePayload {
    fn from(row: ScoreRow) -> Self {
        Self {
            level: row.level,
            score: row.score,
            time: row.time,
        }
    }
}
