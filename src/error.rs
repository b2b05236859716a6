//! Error types for Catalog Gate

use std::io;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for Catalog Gate
pub type Result<T> = std::result::Result<T, Error>;

/// The one message every credential failure carries, whatever went wrong.
pub const AUTHENTICATION_FAILED: &str = "missing or invalid username or password";

/// Catalog Gate errors
#[derive(Error, Debug)]
pub enum Error {
    /// Bad credentials. Always rendered with [`AUTHENTICATION_FAILED`].
    #[error("missing or invalid username or password")]
    Authentication,

    /// Unknown, expired or otherwise unusable refresh token
    #[error("Invalid grant: {0}")]
    InvalidGrant(String),

    /// Unrecognised `grant_type`
    #[error("Unsupported grant type: {0}")]
    UnsupportedGrant(String),

    /// Token request body could not be read
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Revocation target or library not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request denied by the authorization gate
    #[error("{0}")]
    Forbidden(String),

    /// A token value collided with an existing one
    #[error("Token value already exists: {0}")]
    NotUnique(String),

    /// Too many password attempts for one username
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error: store failure or a violated invariant
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error maps to at the boundary.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication
            | Self::InvalidGrant(_)
            | Self::UnsupportedGrant(_)
            | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::NotUnique(_) | Self::Config(_) | Self::Io(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable error code (RFC 6749 §5.2 codes for grant failures).
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Authentication | Self::InvalidGrant(_) => "invalid_grant",
            Self::UnsupportedGrant(_) => "unsupported_grant_type",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::RateLimited(_) => "rate_limited",
            Self::NotUnique(_) | Self::Config(_) | Self::Io(_) | Self::Internal(_) => {
                "server_error"
            }
        }
    }

    /// Returns `true` for a token collision, the one error worth retrying.
    #[must_use]
    pub fn is_not_unique(&self) -> bool {
        matches!(self, Self::NotUnique(_))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Server-side detail stays in the logs.
        let message = if status.is_server_error() {
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let mut response = (
            status,
            Json(json!({"error": self.code(), "message": message})),
        )
            .into_response();

        if matches!(self, Self::RateLimited(_)) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("60"));
        }
        response
    }
}
