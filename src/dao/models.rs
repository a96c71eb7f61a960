use std::{fmt, str::FromStr, time::SystemTime};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

const SINGLE_TABLE: &str = "scores_single";
const COOP_TABLE: &str = "scores_coop";

/// Game mode a score was recorded under. Every mode is stored in its own table.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum GameMode {
    /// One player.
    #[default]
    Single,
    /// Two players sharing a run.
    Coop,
}

impl GameMode {
    /// Every mode, in table order.
    pub const ALL: [GameMode; 2] = [GameMode::Single, GameMode::Coop];

    /// Name of the table (collection) holding the scores of this mode.
    pub fn table_name(self) -> &'static str {
        match self {
            GameMode::Single => SINGLE_TABLE,
            GameMode::Coop => COOP_TABLE,
        }
    }

    /// Resolve a mode from its table name.
    pub fn from_table(name: &str) -> Option<Self> {
        match name {
            SINGLE_TABLE => Some(GameMode::Single),
            COOP_TABLE => Some(GameMode::Coop),
            _ => None,
        }
    }

    /// Lowercase identifier used on the wire (`single` / `coop`).
    pub fn as_str(self) -> &'static str {
        match self {
            GameMode::Single => "single",
            GameMode::Coop => "coop",
        }
    }
}

impl fmt::Display for GameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a mode string is neither `single` nor `coop`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown game mode `{0}`")]
pub struct UnknownMode(pub String);

impl FromStr for GameMode {
    type Err = UnknownMode;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "single" => Ok(GameMode::Single),
            "coop" => Ok(GameMode::Coop),
            other => Err(UnknownMode(other.to_owned())),
        }
    }
}

/// Mutation kinds carried by replication and change log entries. Scores are append-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeAction {
    /// A new score row.
    #[serde(rename = "INSERT")]
    Insert,
}

impl ChangeAction {
    /// Wire representation of the action.
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeAction::Insert => "INSERT",
        }
    }
}

impl FromStr for ChangeAction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "INSERT" => Ok(ChangeAction::Insert),
            other => Err(format!("unsupported change action `{other}`")),
        }
    }
}

/// Column values of a score row, without its surrogate identifier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScorePayload {
    pub level: i64,
    pub score: i64,
    pub time: f64,
}

impl ScorePayload {
    /// Natural key used for duplicate detection.
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::new(self.level, self.score, self.time)
    }
}

/// Non-surrogate identity of a score row within its mode table.
///
/// `time` is compared bitwise after folding `-0.0` into `0.0`, which matches
/// the equality a database index applies to the stored double.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NaturalKey {
    level: i64,
    score: i64,
    time_bits: u64,
}

impl NaturalKey {
    /// Build the key from raw column values.
    pub fn new(level: i64, score: i64, time: f64) -> Self {
        let time = if time == 0.0 { 0.0 } else { time };
        Self {
            level,
            score,
            time_bits: time.to_bits(),
        }
    }
}

/// A persisted score record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntity {
    /// Surrogate identifier, local to the node that stored the row.
    pub id: Uuid,
    pub mode: GameMode,
    pub level: i64,
    pub score: i64,
    /// Run duration in seconds.
    pub time: f64,
    pub created_at: SystemTime,
}

impl ScoreEntity {
    /// Create a fresh record with a new identifier.
    pub fn new(mode: GameMode, payload: ScorePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
            level: payload.level,
            score: payload.score,
            time: payload.time,
            created_at: SystemTime::now(),
        }
    }

    pub fn payload(&self) -> ScorePayload {
        ScorePayload {
            level: self.level,
            score: self.score,
            time: self.time,
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::new(self.level, self.score, self.time)
    }
}

/// Outbox entry describing a locally originated write that still has to reach peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationLogEntity {
    pub id: Uuid,
    pub table_name: String,
    pub record_id: Uuid,
    pub action: ChangeAction,
    pub payload: ScorePayload,
    pub origin_node_id: String,
    /// Flipped once a delivery pass over the active peers completed. Never reverts.
    pub synced: bool,
    /// Change timestamp shared with the matching change log entry.
    pub created_at_ms: i64,
}

/// Audit entry for every mutation applied to the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntity {
    pub id: Uuid,
    pub table_name: String,
    pub record_id: Uuid,
    pub action: ChangeAction,
    pub new_data: ScorePayload,
    pub timestamp_ms: i64,
    pub origin_node_id: String,
}

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The row was new and has been stored.
    Saved,
    /// A row with the same natural key already exists; nothing was written.
    DuplicateIgnored,
}
