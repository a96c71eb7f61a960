use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::MongoDaoError;
use crate::dao::models::{
    ChangeAction, ChangeLogEntity, GameMode, ReplicationLogEntity, ScoreEntity, ScorePayload,
};

pub const OUTBOX_COLLECTION_NAME: &str = "replication_log";
pub const CHANGE_COLLECTION_NAME: &str = "change_log";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoScoreDocument {
    #[serde(rename = "_id")]
    id: String,
    level: i64,
    score: i64,
    time: f64,
    created_at: DateTime,
}

impl From<ScoreEntity> for MongoScoreDocument {
    fn from(value: ScoreEntity) -> Self {
        Self {
            id: value.id.to_string(),
            level: value.level,
            score: value.score,
            time: value.time,
            created_at: DateTime::from_system_time(value.created_at),
        }
    }
}

impl MongoScoreDocument {
    /// Rebuild the entity; the mode is implied by the collection the document came from.
    pub fn into_entity(self, mode: GameMode) -> Result<ScoreEntity, MongoDaoError> {
        Ok(ScoreEntity {
            id: parse_id(&self.id, mode.table_name())?,
            mode,
            level: self.level,
            score: self.score,
            time: self.time,
            created_at: self.created_at.to_system_time(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoOutboxDocument {
    #[serde(rename = "_id")]
    id: String,
    table_name: String,
    record_id: String,
    action: ChangeAction,
    payload: ScorePayload,
    origin_node_id: String,
    synced: bool,
    created_at_ms: i64,
}

impl From<ReplicationLogEntity> for MongoOutboxDocument {
    fn from(value: ReplicationLogEntity) -> Self {
        Self {
            id: value.id.to_string(),
            table_name: value.table_name,
            record_id: value.record_id.to_string(),
            action: value.action,
            payload: value.payload,
            origin_node_id: value.origin_node_id,
            synced: value.synced,
            created_at_ms: value.created_at_ms,
        }
    }
}

impl TryFrom<MongoOutboxDocument> for ReplicationLogEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoOutboxDocument) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_id(&value.id, OUTBOX_COLLECTION_NAME)?,
            record_id: parse_id(&value.record_id, OUTBOX_COLLECTION_NAME)?,
            table_name: value.table_name,
            action: value.action,
            payload: value.payload,
            origin_node_id: value.origin_node_id,
            synced: value.synced,
            created_at_ms: value.created_at_ms,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoChangeDocument {
    #[serde(rename = "_id")]
    id: String,
    table_name: String,
    record_id: String,
    action: ChangeAction,
    new_data: ScorePayload,
    timestamp_ms: i64,
    origin_node_id: String,
}

impl From<ChangeLogEntity> for MongoChangeDocument {
    fn from(value: ChangeLogEntity) -> Self {
        Self {
            id: value.id.to_string(),
            table_name: value.table_name,
            record_id: value.record_id.to_string(),
            action: value.action,
            new_data: value.new_data,
            timestamp_ms: value.timestamp_ms,
            origin_node_id: value.origin_node_id,
        }
    }
}

impl TryFrom<MongoChangeDocument> for ChangeLogEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoChangeDocument) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_id(&value.id, CHANGE_COLLECTION_NAME)?,
            record_id: parse_id(&value.record_id, CHANGE_COLLECTION_NAME)?,
            table_name: value.table_name,
            action: value.action,
            new_data: value.new_data,
            timestamp_ms: value.timestamp_ms,
            origin_node_id: value.origin_node_id,
        })
    }
}

fn parse_id(raw: &str, collection: &'static str) -> Result<Uuid, MongoDaoError> {
    Uuid::parse_str(raw).map_err(|err| MongoDaoError::CorruptDocument {
        collection,
        message: format!("invalid identifier `{raw}`: {err}"),
    })
}
