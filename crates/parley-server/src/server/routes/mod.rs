// Route modules for Parley Server API
pub mod messages; // Message persistence
pub mod users; // Account CRUD
pub mod websocket; // Live relay connections

use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{error, warn};

use crate::accounts::AccountError;

/// Standard error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

/// Errors surfaced by HTTP handlers
#[derive(Debug)]
pub enum ApiError {
    InvalidInput(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<AccountError> for ApiError {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::InvalidInput(msg) => ApiError::InvalidInput(msg),
            AccountError::Conflict(msg) => ApiError::Conflict(msg),
            AccountError::NotFound(_) => ApiError::NotFound(err.to_string()),
            AccountError::Hashing(_) | AccountError::Store(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidInput(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::InvalidInput(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, "invalid_input", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            ApiError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
            }
        };

        if status.is_server_error() {
            error!(error = %message, "Request failed");
        } else {
            warn!(status = %status, error = %message, "Request rejected");
        }

        (status, Json(ErrorResponse::new(code, &message))).into_response()
    }
}
