use crate::services::{object_store::ObjectStoreError, upload_service::UploadError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value, json};
use std::fmt;

/// A lightweight wrapper for errors returned to HTTP callers.
///
/// Carries a stable machine-readable `code` next to the human message, plus optional
/// structured `details` (missing part indices, whether a retry may help).
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            code: status.canonical_reason().unwrap_or("Error"),
            message: msg.into(),
            details: None,
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

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = code;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
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
        let mut body = json!({
            "error": self.message,
            "code": self.code,
            "status": self.status.as_u16()
        });
        if let Some(details) = self.details {
            body["details"] = details;
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = match &err {
            UploadError::InvalidType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            UploadError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::EmptyFile
            | UploadError::InvalidFilename(_)
            | UploadError::TooManyParts { .. }
            | UploadError::InvalidPartIndex { .. }
            | UploadError::InvalidPartSize { .. }
            | UploadError::InvalidPartList(_)
            | UploadError::StrategyMismatch(_)
            | UploadError::MissingParts(_) => StatusCode::BAD_REQUEST,
            UploadError::NotFound(_) => StatusCode::NOT_FOUND,
            UploadError::AlreadyTerminal { .. } | UploadError::CompletionInProgress(_) => {
                StatusCode::CONFLICT
            }
            UploadError::BufferFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            UploadError::StorageUnavailable(_) | UploadError::StorageFinalizeFailed(_) => {
                StatusCode::BAD_GATEWAY
            }
            UploadError::MetadataWriteFailed { .. } | UploadError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!(code = err.code(), error = %err, "Upload request failed");
        }

        let mut details = Map::new();
        match &err {
            UploadError::MissingParts(missing) => {
                details.insert("missingParts".into(), json!(missing));
            }
            UploadError::AlreadyTerminal { status, .. }
            | UploadError::MetadataWriteFailed { status, .. } => {
                details.insert("status".into(), json!(status));
            }
            UploadError::InvalidPartIndex { total_parts, .. } => {
                details.insert("totalParts".into(), json!(total_parts));
            }
            _ => {}
        }
        if err.is_retryable() {
            details.insert("retryable".into(), Value::Bool(true));
        }

        let app = AppError::new(status, err.to_string()).with_code(err.code());
        if details.is_empty() {
            app
        } else {
            app.with_details(Value::Object(details))
        }
    }
}

impl From<ObjectStoreError> for AppError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::InvalidObjectKey => {
                AppError::new(StatusCode::BAD_REQUEST, err.to_string()).with_code("InvalidObjectKey")
            }
            ObjectStoreError::ObjectNotFound(_) => {
                AppError::not_found(err.to_string()).with_code("NoSuchKey")
            }
            ObjectStoreError::NoSuchUpload(_) => {
                AppError::not_found(err.to_string()).with_code("NoSuchUpload")
            }
            ObjectStoreError::InvalidPart { .. } | ObjectStoreError::InvalidPartOrder => {
                AppError::new(StatusCode::BAD_REQUEST, err.to_string()).with_code("InvalidPart")
            }
            ObjectStoreError::Unavailable(_) | ObjectStoreError::Io(_) => {
                tracing::error!(error = %err, "Storage request failed");
                AppError::internal(err.to_string()).with_code("StorageError")
            }
        }
    }
}
