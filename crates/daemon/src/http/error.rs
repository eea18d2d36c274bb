//! API error types and their HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use webterm_protocol::{ErrorBody, ProtocolError};

use crate::session::SessionError;

/// Errors returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("invalid request: {0}")]
    BadRequest(String),
}

/// Result type alias for handlers.
pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    /// Returns the HTTP status and stable error kind.
    pub fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Session(err) => match err {
                SessionError::NotFound(_) => (StatusCode::NOT_FOUND, "session_not_found"),
                SessionError::ProcessTerminated(_) => (StatusCode::NOT_FOUND, "session_exited"),
                SessionError::InvalidId(_) => (StatusCode::BAD_REQUEST, "invalid_session_id"),
                SessionError::InvalidPayload(_) => (StatusCode::BAD_REQUEST, "invalid_payload"),
                SessionError::WriteFailed(_) => (StatusCode::GONE, "write_failed"),
                SessionError::LimitReached(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "session_limit_reached")
                }
                SessionError::SpawnFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "spawn_failed"),
                SessionError::ResizeFailed(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "resize_failed")
                }
                SessionError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "io_error"),
            },
            ApiError::Protocol(ProtocolError::InvalidSessionId { .. }) => {
                (StatusCode::BAD_REQUEST, "invalid_session_id")
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), kind, error = %self, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), kind, error = %self, "Request rejected");
        }

        (status, Json(ErrorBody::new(kind, self.to_string()))).into_response()
    }
}
