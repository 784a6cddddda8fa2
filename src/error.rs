use axum::{Json,
    http::StatusCode,
    response::IntoResponse
};
use serde_json::json;
use thiserror::Error;

use crate::storage::StorageError;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Retention window elapsed: {0}")]
    Expired(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal server error: {0}")]
    InternalServerError(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Unsupported media type: {0}")]
    UnSupportedMediaType(String),

    #[error(transparent)]
    DatabaseError(#[from] sqlx::Error),
}

impl AppError {
    pub fn file_not_found(id: impl std::fmt::Display) -> Self {
        AppError::NotFound(format!("file {id}"))
    }

    pub fn folder_not_found(id: impl std::fmt::Display) -> Self {
        AppError::NotFound(format!("folder {id}"))
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => AppError::NotFound(format!("stored object {key}")),
            other => AppError::StorageUnavailable(other.to_string()),
        }
    }
}

/// Convert `AppError` into an HTTP response.
impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Expired(msg) => (StatusCode::GONE, msg),
            AppError::StorageUnavailable(msg) => {
                tracing::error!("Storage Error: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "Storage backend unavailable".to_string())
            }
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::InvalidState(msg) => (StatusCode::CONFLICT, msg),
            AppError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            AppError::UnSupportedMediaType(msg) => (StatusCode::UNSUPPORTED_MEDIA_TYPE, msg),
            AppError::DatabaseError(err) => {
                tracing::error!("Database Error: {:}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            }
        };

        // Return standardized JSON error response
        let body = Json(json!({"error": error_message}));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_not_found_stays_not_found() {
        let err: AppError = StorageError::NotFound("a.txt".into()).into();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn storage_io_failure_becomes_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: AppError = StorageError::IoError(io).into();
        assert!(matches!(err, AppError::StorageUnavailable(_)));
    }

    #[test]
    fn expired_maps_to_gone() {
        let response = AppError::Expired("file".into()).into_response();
        assert_eq!(response.status(), StatusCode::GONE);
    }
}
