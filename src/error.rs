use axum::{
    Json,
    extract::{
        FromRequest, FromRequestParts,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::IntoResponse,
};
use serde::Serialize;
use thiserror::Error;
use validator::ValidationErrors;

use crate::dao::storage::StorageError;

/// Errors that can occur in service layer operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No store is installed; the node runs in degraded mode and rejects writes.
    #[error("storage unavailable (degraded mode)")]
    StoreUnavailable,
    /// The installed store failed to serve the request.
    #[error("storage failure: {0}")]
    Storage(#[source] StorageError),
    /// A replicated change event that cannot be applied.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// A peer did not answer or answered with an error.
    #[error("peer `{address}` unreachable: {message}")]
    PeerUnreachable { address: String, message: String },
    /// Invalid input provided by the client.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        ServiceError::Storage(err)
    }
}

impl From<ValidationErrors> for AppError {
    fn from(err: ValidationErrors) -> Self {
        AppError::BadRequest(format!("validation failed: {}", err))
    }
}

/// Application-level errors that are converted to HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad request with invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// A peer needed to serve the request failed.
    #[error("bad gateway: {0}")]
    BadGateway(String),
    /// Service unavailable or degraded.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::StoreUnavailable => AppError::ServiceUnavailable("degraded mode".into()),
            ServiceError::Storage(StorageError::Corrupt { table, message }) => {
                AppError::Internal(format!("corrupt record in `{table}`: {message}"))
            }
            ServiceError::Storage(source) => AppError::ServiceUnavailable(source.to_string()),
            ServiceError::InvalidPayload(message) => AppError::BadRequest(message),
            err @ ServiceError::PeerUnreachable { .. } => AppError::BadGateway(err.to_string()),
            ServiceError::InvalidInput(message) => AppError::BadRequest(message),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let payload = Json(ErrorBody {
            success: false,
            message: self.to_string(),
        });

        (status, payload).into_response()
    }
}

/// JSON body extractor whose rejections render as [`AppError`].
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

/// Query string extractor whose rejections render as [`AppError`].
#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(AppError))]
pub struct ApiQuery<T>(pub T);
