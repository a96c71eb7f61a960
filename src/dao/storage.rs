use std::error::Error;
use thiserror::Error;

/// Result alias for score store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error raised by score store backends regardless of the underlying database.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not serve the request; durability must not be assumed.
    #[error("storage unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// A stored document could not be mapped back into a model.
    #[error("corrupt record in `{table}`: {message}")]
    Corrupt { table: String, message: String },
}

impl StorageError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }
}
