//! Unified API error handling with structured responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::error::CoreError;

/// API error type with structured responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource is gone: {0}")]
    Gone(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Gone(_) => StatusCode::GONE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Gone(_) => "GONE",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Map the core taxonomy onto HTTP statuses.
impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match &err {
            CoreError::NotFound(_) => ApiError::NotFound(err.to_string()),
            CoreError::Gone(_) => ApiError::Gone(err.to_string()),
            CoreError::BadState(_) => ApiError::BadRequest(err.to_string()),
            CoreError::CapacityFull | CoreError::NoRunners => {
                ApiError::ServiceUnavailable(err.to_string())
            }
            CoreError::BridgeStartup { .. }
            | CoreError::BridgeCrash { .. }
            | CoreError::ClientTimeout
            | CoreError::Io(_)
            | CoreError::Database(_)
            | CoreError::Internal(_) => ApiError::Internal(err.to_string()),
        }
    }
}

/// Structured error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        match &self {
            ApiError::Internal(msg) => {
                error!(error_code = code, message = %msg, "API error");
            }
            ApiError::ServiceUnavailable(msg) => {
                warn!(error_code = code, message = %msg, "Service unavailable");
            }
            _ => {
                tracing::debug!(error_code = code, message = %message, "Client error");
            }
        }

        let body = ErrorResponse {
            error: message,
            code,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_mapping() {
        let cases = [
            (CoreError::not_found("x"), StatusCode::NOT_FOUND),
            (CoreError::Gone("x".to_string()), StatusCode::GONE),
            (CoreError::bad_state("x"), StatusCode::BAD_REQUEST),
            (CoreError::CapacityFull, StatusCode::SERVICE_UNAVAILABLE),
            (CoreError::NoRunners, StatusCode::SERVICE_UNAVAILABLE),
            (
                CoreError::BridgeStartup {
                    exit: Some(1),
                    stderr: "boom".to_string(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (core, status) in cases {
            assert_eq!(ApiError::from(core).status_code(), status);
        }
    }

    #[test]
    fn test_startup_diagnostics_survive_mapping() {
        let core = CoreError::BridgeStartup {
            exit: Some(3),
            stderr: "missing credential".to_string(),
        };
        let api = ApiError::from(core);
        assert!(api.to_string().contains("missing credential"));
    }
}
