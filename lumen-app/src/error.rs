//! HTTP error mapping for the gateway routes.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use lumen_llm::LlmError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// A required secret is absent at the point of use.
    #[error("{0}")]
    ConfigMissing(&'static str),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    ModelInvocation(#[from] LlmError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::ConfigMissing(msg) => (
                StatusCode::BAD_REQUEST,
                json!({ "status": "error", "error": "config_missing", "message": msg }),
            ),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                json!({ "status": "error", "error": "bad_request", "message": msg }),
            ),
            ApiError::ModelInvocation(e) => {
                let message = if e.context().trim().is_empty() {
                    e.to_string()
                } else {
                    e.context().to_string()
                };
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "status": "error", "message": message }),
                )
            }
        };

        if status.is_server_error() {
            tracing::warn!(error = %self, status = status.as_u16(), "request failed");
        } else {
            tracing::info!(error = %self, status = status.as_u16(), "request rejected");
        }
        (status, Json(body)).into_response()
    }
}
