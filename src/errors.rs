use crate::{
    backend::{BackendError, presign::PresignError},
    services::StoreError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<BackendError> for AppError {
    fn from(err: BackendError) -> Self {
        let status = match &err {
            BackendError::NotFound { .. } => StatusCode::NOT_FOUND,
            BackendError::InvalidBucketName { .. }
            | BackendError::InvalidObjectKey(_)
            | BackendError::SizeMismatch { .. } => StatusCode::BAD_REQUEST,
            BackendError::NoAvailableNodes => StatusCode::SERVICE_UNAVAILABLE,
            BackendError::InvalidEndpoint(_)
            | BackendError::InvalidSecret(_)
            | BackendError::Io(_) => {
                tracing::error!(error = %err, "blob backend failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError::new(status, err.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => AppError::not_found(err.to_string()),
            StoreError::Conflict(_) => AppError::new(StatusCode::CONFLICT, err.to_string()),
            StoreError::Forbidden(_) => AppError::new(StatusCode::FORBIDDEN, err.to_string()),
            StoreError::Invalid(_) => AppError::new(StatusCode::BAD_REQUEST, err.to_string()),
            StoreError::Backend(inner) => inner.into(),
            StoreError::Sqlx(inner) => {
                tracing::error!(error = %inner, "database failure");
                AppError::internal("database error")
            }
        }
    }
}

impl From<PresignError> for AppError {
    fn from(err: PresignError) -> Self {
        let status = match err {
            PresignError::Missing(_) | PresignError::MalformedExpiry => StatusCode::BAD_REQUEST,
            PresignError::Expired | PresignError::BadSignature => StatusCode::FORBIDDEN,
        };
        AppError::new(status, err.to_string())
    }
}
