/// Unified error types for the family portal
use crate::store::codec::CodecError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the portal
#[derive(Error, Debug)]
pub enum AppError {
    /// Caller-supplied input fails a stated constraint
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing or invalid session
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Caller lacks authority for the operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Entity missing or owned by another family
    #[error("Not found: {0}")]
    NotFound(String),

    /// Upload body over the configured limit
    #[error("Payload too large: {0}")]
    TooLarge(String),

    /// Upload MIME type not accepted
    #[error("Invalid content type: {0}")]
    InvalidType(String),

    /// A bounded job queue rejected a submission
    #[error("Queue full: {0}")]
    QueueFull(&'static str),

    /// Optional component is not configured
    #[error("Not enabled: {0}")]
    NotEnabled(&'static str),

    /// Media input could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// A media variant could not be encoded
    #[error("Encode error: {0}")]
    Encode(String),

    /// Push provider reported the device token as invalid
    #[error("Device token rejected: {0}")]
    TokenRejected(String),

    /// Any other provider or network failure
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// KV store errors
    #[error("Database error: {0}")]
    Database(#[from] redb::Error),

    /// Packed record errors
    #[error("Record codec error: {0}")]
    Codec(#[from] CodecError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<redb::DatabaseError> for AppError {
    fn from(e: redb::DatabaseError) -> Self {
        AppError::Database(e.into())
    }
}

impl From<redb::TransactionError> for AppError {
    fn from(e: redb::TransactionError) -> Self {
        AppError::Database(e.into())
    }
}

impl From<redb::TableError> for AppError {
    fn from(e: redb::TableError) -> Self {
        AppError::Database(e.into())
    }
}

impl From<redb::StorageError> for AppError {
    fn from(e: redb::StorageError) -> Self {
        AppError::Database(e.into())
    }
}

impl From<redb::CommitError> for AppError {
    fn from(e: redb::CommitError) -> Self {
        AppError::Database(e.into())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(e: tokio::task::JoinError) -> Self {
        AppError::Internal(format!("Task join error: {}", e))
    }
}

impl AppError {
    /// Stable code string used in the JSON envelope
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::Authentication(_) => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::TooLarge(_) => "too_large",
            AppError::InvalidType(_) => "invalid_type",
            AppError::QueueFull(_) => "queue_full",
            AppError::NotEnabled(_) => "not_enabled",
            AppError::TokenRejected(_) | AppError::TransientNetwork(_) => "upstream_error",
            AppError::Decode(_)
            | AppError::Encode(_)
            | AppError::Database(_)
            | AppError::Codec(_)
            | AppError::Io(_)
            | AppError::Internal(_) => "internal_error",
        }
    }

    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::TooLarge(_) | AppError::InvalidType(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Authentication(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::QueueFull(_) | AppError::NotEnabled(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::TokenRejected(_) | AppError::TransientNetwork(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub message: String,
}

/// Convert AppError to HTTP response
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
            "Internal server error".to_string() // Don't leak details
        } else {
            self.to_string()
        };

        let body = Json(ErrorEnvelope {
            error: self.code().to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for portal operations
pub type AppResult<T> = Result<T, AppError>;
