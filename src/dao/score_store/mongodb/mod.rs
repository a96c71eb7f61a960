mod config;
mod error;
mod models;
pub mod store;

pub use config::MongoConfig;
pub use error::MongoDaoError;
pub use store::MongoScoreStore;

use crate::dao::storage::StorageError;

impl From<MongoDaoError> for StorageError {
    fn from(err: MongoDaoError) -> Self {
        match err {
            MongoDaoError::CorruptDocument { collection, message } => StorageError::Corrupt {
                table: collection.to_owned(),
                message,
            },
            other => StorageError::unavailable(other.to_string(), other),
        }
    }
}
