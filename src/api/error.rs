//! Mapping from domain errors onto HTTP responses.

use crate::{
    conversation::EngineError, queue::QueueError, storage::StorageError, store::StoreError,
};
use axum::{
    Json,
    extract::{
        multipart::MultipartError,
        rejection::{JsonRejection, PathRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Error returned by handlers and the auth middleware; renders `{"message": ...}`.
#[derive(Debug)]
pub enum ApiError {
    /// Malformed request (400).
    BadRequest(String),
    /// Missing or rejected credential (401). The reason is logged, never returned.
    Unauthorized,
    /// Resource belongs to another tenant (403).
    Forbidden(String),
    /// Resource does not exist (404).
    NotFound(String),
    /// Upstream or internal failure (500). The cause is logged where the error is converted.
    Internal(String),
}

impl ApiError {
    fn internal(context: &str, err: &dyn std::fmt::Display) -> Self {
        tracing::error!(error = %err, "{context}");
        Self::Internal(context.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            Self::Forbidden(message) => (StatusCode::FORBIDDEN, message),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(json!({ "message": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(message) => Self::BadRequest(message),
            StoreError::NotFound { entity, id } => Self::NotFound(format!("{entity} {id} not found")),
            other => Self::internal("Database request failed", &other),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        Self::internal("Failed to store file", &err)
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        Self::internal("Failed to enqueue document", &err)
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return Self::BadRequest("File too large".to_string());
        }
        Self::BadRequest(err.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        tracing::debug!(reason = %rejection.body_text(), "Rejected path parameter");
        Self::BadRequest("Invalid path parameter".to_string())
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound(_) => Self::NotFound("Conversation not found".to_string()),
            EngineError::Forbidden(_) => {
                Self::Forbidden("Conversation does not belong to user".to_string())
            }
            EngineError::Conflict(message) => Self::BadRequest(message),
            EngineError::Store(err) => err.into(),
            other => Self::internal("Failed to handle chat", &other),
        }
    }
}
