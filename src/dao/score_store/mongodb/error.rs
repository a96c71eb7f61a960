use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use thiserror::Error;
use uuid::Uuid;

pub type MongoResult<T> = std::result::Result<T, MongoDaoError>;

const DUPLICATE_KEY_CODE: i32 = 11000;

#[derive(Debug, Error)]
pub enum MongoDaoError {
    #[error("failed to parse MongoDB connection URI `{uri}`")]
    InvalidUri {
        uri: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to build MongoDB client from options")]
    ClientConstruction {
        #[source]
        source: MongoError,
    },
    #[error("MongoDB ping failed during initial connection after {attempts} attempt(s)")]
    InitialPing {
        attempts: u32,
        #[source]
        source: MongoError,
    },
    #[error("MongoDB ping health check failed")]
    HealthPing {
        #[source]
        source: MongoError,
    },
    #[error("failed to ensure index `{index}` on collection `{collection}`")]
    EnsureIndex {
        collection: &'static str,
        index: &'static str,
        #[source]
        source: MongoError,
    },
    #[error("failed to save score into `{collection}`")]
    SaveScore {
        collection: &'static str,
        #[source]
        source: MongoError,
    },
    #[error("failed to append replication outbox entry")]
    AppendOutbox {
        #[source]
        source: MongoError,
    },
    #[error("failed to append change log entry")]
    AppendChange {
        #[source]
        source: MongoError,
    },
    #[error("failed to query `{collection}`")]
    Query {
        collection: &'static str,
        #[source]
        source: MongoError,
    },
    #[error("failed to mark outbox entry `{id}` as synced")]
    MarkSynced {
        id: Uuid,
        #[source]
        source: MongoError,
    },
    #[error("corrupt document in `{collection}`: {message}")]
    CorruptDocument {
        collection: &'static str,
        message: String,
    },
}

/// True when the server rejected an insert because of a unique index.
pub fn is_duplicate_key(err: &MongoError) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY_CODE
    )
}
