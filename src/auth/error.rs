use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Failures surfaced by the session and authorization layers.
///
/// Token problems and wrong passwords both map to `InvalidCredential` so the
/// caller cannot tell which check failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("no credential presented")]
    NoCredential,
    #[error("invalid credentials")]
    InvalidCredential,
    #[error("csrf token mismatch")]
    CsrfMismatch,
    #[error("permission denied")]
    PermissionDenied,
    #[error("internal error")]
    Internal,
}

impl AuthError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::NoCredential | Self::InvalidCredential => StatusCode::UNAUTHORIZED,
            Self::CsrfMismatch | Self::PermissionDenied => StatusCode::FORBIDDEN,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            Self::NoCredential => "unauthorized".to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
