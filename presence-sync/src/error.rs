use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use presence_store::StoreError;
use serde::Serialize;
use thiserror::Error;

use crate::validation::ValidationError;

/// Engine error type.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The retry wrapper gave up after the second connection failure.
    #[error("store unavailable after retry: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(
        "possible impostor instance: proxy '{proxy_id}' sent a heartbeat {age_ms}ms ago; \
         create the crash marker file if this instance is restarting from a crash"
    )]
    Impostor { proxy_id: String, age_ms: i64 },

    #[error("proxy '{0}' is not an active proxy")]
    UnknownProxy(String),

    #[error("channel '{0}' is reserved and cannot be unsubscribed")]
    ReservedChannel(String),

    #[error("event bus listener already started")]
    ListenerStarted,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// API error response structure
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            SyncError::StoreUnavailable(_) | SyncError::Store(_) => {
                // Don't expose store internals
                tracing::error!(error = ?self, "store error while serving status request");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorResponse::new("The presence store is currently unavailable."),
                )
            }
            SyncError::Validation(err) => {
                tracing::warn!(validation_error = %err, "validation failed");
                (StatusCode::BAD_REQUEST, ErrorResponse::new(err.to_string()))
            }
            SyncError::UnknownProxy(_) => (StatusCode::NOT_FOUND, ErrorResponse::new(self.to_string())),
            SyncError::ReservedChannel(_) => (StatusCode::CONFLICT, ErrorResponse::new(self.to_string())),
            SyncError::Impostor { .. } | SyncError::ListenerStarted | SyncError::Io(_) => {
                tracing::error!(error = ?self, "internal error while serving status request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_details("An internal error occurred.", "see server logs"),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
