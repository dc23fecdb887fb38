//! Error types and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the gateway error
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Main error type for the gateway
///
/// Every variant corresponds to one wire-visible error code; the HTTP
/// status and the TMF envelope are derived from the variant alone so that
/// handlers never hand-build responses.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing proxy headers, malformed URI, bad query or payload
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Authorization header present but unverifiable, expired, or lacking claims
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Write verb attempted without a bearer token
    #[error("not authenticated: {0}")]
    NotAuthenticated(String),

    /// Policy returned false, owner check failed, or rule evaluation errored
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Object absent when required
    #[error("not found: {0}")]
    NotFound(String),

    /// CREATE whose payload id already exists
    #[error("conflict: {0}")]
    Conflict(String),

    /// Non-2xx or transport failure against the upstream
    #[error("upstream returned {status}: {snippet}")]
    Upstream { status: u16, snippet: String },

    /// Cache corruption, compilation failure, pool exhaustion
    #[error("internal error: {0}")]
    Internal(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(Box<figment::Error>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Wire-level error code used in the TMF envelope
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad-request",
            Self::InvalidToken(_) => "invalid-token",
            Self::NotAuthenticated(_) => "not-authenticated",
            Self::NotAuthorized(_) => "not-authorized",
            Self::NotFound(_) => "not-found",
            Self::Conflict(_) => "conflict",
            Self::Upstream { .. } => "upstream",
            Self::Internal(_) | Self::Config(_) | Self::Io(_) => "internal",
        }
    }

    /// HTTP status the envelope travels with
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::InvalidToken(_) | Self::NotAuthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::NotAuthorized(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::Internal(_) | Self::Config(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Shorthand for upstream failures, truncating the body to a snippet
    pub fn upstream(status: u16, body: &str) -> Self {
        let snippet: String = body.chars().take(256).collect();
        Self::Upstream { status, snippet }
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".into()),
            sqlx::Error::PoolTimedOut => Self::Internal("database pool exhausted".into()),
            other => Self::Internal(format!("database error: {other}")),
        }
    }
}

impl From<figment::Error> for GatewayError {
    fn from(e: figment::Error) -> Self {
        Self::Config(Box::new(e))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        let status = e.status().map(|s| s.as_u16()).unwrap_or(502);
        Self::Upstream {
            status,
            snippet: e.to_string(),
        }
    }
}

/// TMF error envelope carried by every non-2xx JSON response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Machine-readable error code
    pub code: String,

    /// Human-readable reason
    pub reason: String,
}

impl ErrorEnvelope {
    /// Create a new envelope
    pub fn new(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            reason: reason.into(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();

        match &self {
            GatewayError::Internal(msg) => {
                tracing::error!(code = self.code(), "internal error: {msg}");
            }
            GatewayError::Upstream { status, snippet } => {
                tracing::warn!(upstream_status = status, "upstream failure: {snippet}");
            }
            other => {
                tracing::debug!(code = other.code(), "request rejected: {other}");
            }
        }

        let envelope = ErrorEnvelope::new(self.code(), self.to_string());
        (status, Json(envelope)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_match_contract() {
        assert_eq!(GatewayError::BadRequest("x".into()).code(), "bad-request");
        assert_eq!(GatewayError::InvalidToken("x".into()).code(), "invalid-token");
        assert_eq!(
            GatewayError::NotAuthenticated("x".into()).code(),
            "not-authenticated"
        );
        assert_eq!(GatewayError::NotAuthorized("x".into()).code(), "not-authorized");
        assert_eq!(GatewayError::NotFound("x".into()).code(), "not-found");
        assert_eq!(GatewayError::Conflict("x".into()).code(), "conflict");
        assert_eq!(GatewayError::upstream(500, "boom").code(), "upstream");
        assert_eq!(GatewayError::Internal("x".into()).code(), "internal");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::InvalidToken("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::NotAuthorized("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::Conflict("x".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            GatewayError::upstream(503, "x").status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_upstream_snippet_is_truncated() {
        let body = "z".repeat(1000);
        if let GatewayError::Upstream { snippet, .. } = GatewayError::upstream(500, &body) {
            assert_eq!(snippet.len(), 256);
        } else {
            panic!("expected upstream variant");
        }
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: GatewayError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.code(), "not-found");
    }
}
