//! HTTP error mapping for the gateway.
//!
//! Handlers return `Result<T, ApiError>`. Authorization failures carry their
//! message to the caller; storage and other internal failures are logged in
//! full and replaced by a generic body.

use std::any::Any;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::auth::AuthError;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing, malformed, unknown or inactive key.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Body missing, not JSON, or not a chat completion request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Valid key, but the requested model is not granted.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("credential store error: {0}")]
    Auth(#[from] AuthError),

    /// Key issuance failed.
    #[error("key issuance failed: {0}")]
    KeyIssuance(AuthError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Auth(_) | ApiError::KeyIssuance(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Unauthorized(m) | ApiError::Forbidden(m) => json!({ "error": m }),
            ApiError::InvalidRequest(m) => {
                json!({ "error": { "message": m, "type": "invalid_request_error" } })
            }
            ApiError::KeyIssuance(e) => {
                error!(error = %e, "failed to create API key");
                json!({ "error": "Failed to create API key" })
            }
            ApiError::Auth(e) => {
                error!(error = %e, "credential store error");
                server_error_body()
            }
            ApiError::Internal(m) => {
                error!(message = %m, "internal server error");
                server_error_body()
            }
        };
        (status, Json(body)).into_response()
    }
}

fn server_error_body() -> serde_json::Value {
    json!({ "error": { "message": "An unexpected error occurred", "type": "server_error" } })
}

/// Fallback for unknown routes.
pub async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": { "message": "Not found", "type": "not_found" } })),
    )
        .into_response()
}

/// Response for a panic caught while serving a request.
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = detail, "handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": { "message": "Internal server error", "type": "internal_error" } })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_forbidden_body() {
        let response =
            ApiError::Forbidden("You do not have access to the model: x".into()).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            body_json(response).await,
            json!({"error": "You do not have access to the model: x"})
        );
    }

    #[tokio::test]
    async fn test_invalid_request_body() {
        let response = ApiError::InvalidRequest("missing field `type`".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            json!({"error": {"message": "missing field `type`", "type": "invalid_request_error"}})
        );
    }

    #[tokio::test]
    async fn test_internal_detail_is_hidden() {
        let response = ApiError::Internal("db at /var/secret exploded".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "server_error");
        assert!(!body.to_string().contains("secret"));
    }

    #[tokio::test]
    async fn test_panic_response() {
        let response = panic_response(Box::new("boom"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"]["type"], "internal_error");
    }
}
