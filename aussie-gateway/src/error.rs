//! Gateway infrastructure errors
//!
//! [`Error`] covers fallible infrastructure: configuration, token
//! backends, Redis, upstream I/O. Per-request policy refusals are not
//! errors; they are [`GatewayOutcome`](crate::gateway::GatewayOutcome)
//! variants. Both render to the wire through [`GatewayErrorBody`], one
//! JSON shape with a dotted machine code, so clients branch on `code`
//! without parsing messages.

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the gateway error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for gateway infrastructure
///
/// Large error variants are boxed to reduce stack size.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Redis error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(Box<redis::RedisError>),

    /// Redis pool error
    #[cfg(feature = "redis")]
    #[error("Redis pool error: {0}")]
    RedisPool(String),

    /// JWT error
    #[error("JWT error: {0}")]
    Jwt(Box<jsonwebtoken::errors::Error>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// Authorization error
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Resource conflict (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// External service error (502)
    #[error("External service error: {0}")]
    External(String),

    /// Upstream deadline exceeded (504)
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl Error {
    /// Status and dotted wire code for the HTTP adapter
    pub fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            Error::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "gateway.config"),

            #[cfg(feature = "redis")]
            Error::Redis(_) | Error::RedisPool(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "gateway.backend")
            }

            Error::Jwt(_) => (StatusCode::UNAUTHORIZED, "auth.token"),
            Error::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "gateway.io"),
            Error::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "auth.required"),
            Error::Forbidden(_) => (StatusCode::FORBIDDEN, "auth.denied"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "gateway.not_found"),
            Error::BadRequest(_) => (StatusCode::BAD_REQUEST, "gateway.bad_request"),
            Error::Conflict(_) => (StatusCode::CONFLICT, "gateway.conflict"),
            Error::External(_) => (StatusCode::BAD_GATEWAY, "upstream.unreachable"),
            Error::UpstreamTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "upstream.timeout"),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "gateway.internal"),
        }
    }

    /// The detail a client may see
    ///
    /// Client-caused conditions carry their reason verbatim; anything
    /// server-side is redacted to a fixed phrase and kept for the logs.
    fn client_detail(&self) -> String {
        match self {
            Error::Unauthorized(reason)
            | Error::Forbidden(reason)
            | Error::NotFound(reason)
            | Error::BadRequest(reason)
            | Error::Conflict(reason) => reason.clone(),
            Error::Jwt(e) => e.to_string(),
            Error::External(_) => "upstream service unavailable".to_string(),
            Error::UpstreamTimeout(_) => "upstream request timed out".to_string(),
            _ => "internal gateway error".to_string(),
        }
    }
}

/// Wire body for anything the gateway refuses or fails on its own
///
/// `code` is a stable dotted identifier (`auth.required`,
/// `rate.limited`, `upstream.timeout`); `message` is advisory text.
/// Rate-limit rejections also carry `retry_after_secs`, which doubles
/// as the `Retry-After` header when the body is rendered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayErrorBody {
    pub code: String,
    pub message: String,
    pub status: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl GatewayErrorBody {
    /// Body for a status, code, and message
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status: status.as_u16(),
            retry_after_secs: None,
        }
    }

    /// Attach a retry hint
    pub fn retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }
}

impl IntoResponse for GatewayErrorBody {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let retry_after = self.retry_after_secs;

        let mut response = (status, Json(self)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = http::HeaderValue::from_str(&secs.to_string()) {
                response
                    .headers_mut()
                    .insert(http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, code) = self.classify();
        if status.is_server_error() {
            tracing::error!(code, "{}", self);
        }
        GatewayErrorBody::new(status, code, self.client_detail()).into_response()
    }
}

// Manual From implementations for boxed errors
impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Error::Jwt(Box::new(err))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Redis(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let (status, code) = Error::Conflict("expected version 2".to_string()).classify();
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(code, "gateway.conflict");

        let (status, code) = Error::UpstreamTimeout("orders".to_string()).classify();
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(code, "upstream.timeout");
    }

    #[test]
    fn test_server_side_detail_is_redacted() {
        let err = Error::Internal("pool handle dropped mid-request".to_string());
        assert_eq!(err.client_detail(), "internal gateway error");

        // Client-caused conditions keep their reason
        let err = Error::Unauthorized("token expired".to_string());
        assert_eq!(err.client_detail(), "token expired");
    }

    #[test]
    fn test_body_serde_omits_absent_retry_hint() {
        let body = GatewayErrorBody::new(StatusCode::FORBIDDEN, "auth.denied", "no");
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("retry_after_secs"));

        let body = body.retry_after(30);
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains(r#""retry_after_secs":30"#));
    }

    #[test]
    fn test_retry_hint_becomes_header() {
        let response = GatewayErrorBody::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate.limited",
            "too many requests",
        )
        .retry_after(42)
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[http::header::RETRY_AFTER], "42");
    }

    #[test]
    fn test_error_display() {
        let err = Error::Conflict("expected version 2".to_string());
        assert_eq!(err.to_string(), "Conflict: expected version 2");

        let err = Error::Unauthorized("token expired".to_string());
        assert_eq!(err.to_string(), "Authentication failed: token expired");
    }
}
