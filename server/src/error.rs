//! Error types for the UniLink hub.
//!
//! Each concern keeps its own error enum next to the code that produces it
//! ([`AuthError`], [`DirectoryError`],
//! [`ConversationError`](crate::types::ConversationError)). This module
//! defines [`ServerError`], the top-level type that HTTP handlers return and
//! that knows how to render itself as a JSON error response.
//!
//! # Example
//!
//! ```rust
//! use unilink_hub::directory::DirectoryError;
//! use unilink_hub::error::ServerError;
//!
//! let err = ServerError::from(DirectoryError::NotFound("user 42".into()));
//! assert_eq!(err.status_code(), 404);
//! assert_eq!(err.code(), "not_found");
//! ```

use std::error::Error;
use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::auth::AuthError;
use crate::directory::DirectoryError;
use crate::routes::ErrorResponse;

/// Top-level error type for the hub's HTTP surface.
///
/// Errors that happen after a session is live (transport failures, dropped
/// events) never surface here; they are contained and logged where they
/// occur.
#[derive(Debug)]
pub enum ServerError {
    /// Missing, malformed or expired credentials.
    Auth(AuthError),

    /// Request body or parameters failed validation.
    Validation(String),

    /// A referenced entity does not exist.
    NotFound(String),

    /// A collaborator the request depends on could not be reached.
    Unavailable(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth(err) => write!(f, "authentication failed: {err}"),
            Self::Validation(msg) => write!(f, "validation error: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Unavailable(msg) => write!(f, "service unavailable: {msg}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Auth(err) => Some(err),
            _ => None,
        }
    }
}

impl From<AuthError> for ServerError {
    fn from(err: AuthError) -> Self {
        Self::Auth(err)
    }
}

impl From<DirectoryError> for ServerError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::NotFound(what) => Self::NotFound(what),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

impl ServerError {
    /// Creates a new validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// HTTP status used when this error ends a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable machine-readable code included in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(err) => err.code(),
            Self::Validation(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::Unavailable(_) => "unavailable",
        }
    }

    /// Message shown to the client.
    ///
    /// Outages are reported generically so internal details do not leak into
    /// responses.
    fn public_message(&self) -> String {
        match self {
            Self::Auth(err) => err.to_string(),
            Self::Validation(msg) | Self::NotFound(msg) => msg.clone(),
            Self::Unavailable(_) => "service temporarily unavailable".to_string(),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse::new(self.public_message()).with_code(self.code());
        (status, Json(body)).into_response()
    }
}
