//! Gateway error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Error kinds a handler can surface to the client.
///
/// Bodies are short plain-text reasons; upstream detail is logged where the
/// failure happened, not echoed to the caller.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("rate limit exceeded")]
    RateLimited,

    /// Registry or signer degraded; the message is the public reason, the
    /// cause was logged at the call site. Clients retry, the middleware
    /// does not.
    #[error("{0}")]
    Upstream(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            AppError::Unauthorized(message) => (StatusCode::UNAUTHORIZED, message),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded".to_string(),
            ),
            AppError::Upstream(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, format!("{message}\n")).into_response()
    }
}
