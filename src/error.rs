//! 统一的 API 错误类型与转换。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::storage::StorageError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    PayloadTooLarge(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::PayloadTooLarge(msg) => {
                (StatusCode::PAYLOAD_TOO_LARGE, msg).into_response()
            }
            ApiError::Internal(msg) => {
                error!(error = msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::PathTraversal => ApiError::Forbidden("Access denied".into()),
            StorageError::NotFound => ApiError::NotFound("File not found".into()),
            StorageError::Io(err) => ApiError::Internal(err.to_string()),
        }
    }
}
