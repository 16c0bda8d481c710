use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::wire;

/// Result alias for request handling.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Errors that reach the transport layer.
///
/// Backend failures never appear here: the orchestrator converts them
/// into synthesized completions so OpenAI-style callers always receive a
/// completion-shaped body.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed body, missing messages, invalid temperature.
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Anything unexpected. The message is logged, never sent.
    #[error("Internal error")]
    Internal(String),
}

/// Error body compatible with OpenAI clients.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetails,
}

#[derive(Debug, Serialize)]
struct ErrorDetails {
    message: String,
    r#type: String,
    code: u16,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => {
                let body = ErrorResponse {
                    error: ErrorDetails {
                        message,
                        r#type: "invalid_request_error".to_string(),
                        code: 400,
                    },
                };

                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
            Self::Internal(detail) => {
                log::error!("Unhandled gateway error: {detail}");

                // A synthesized completion, not an opaque 5xx body, and
                // never the raw error text.
                let completion = wire::ChatCompletionResponse::new(
                    "toolgate".to_string(),
                    "The gateway hit an internal error while handling this request.".to_string(),
                );

                (StatusCode::INTERNAL_SERVER_ERROR, Json(completion)).into_response()
            }
        }
    }
}
