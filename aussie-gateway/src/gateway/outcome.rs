//! Terminal pipeline outcomes
//!
//! The pipeline never errors across its boundary; every request ends in
//! exactly one of these variants, each carrying what the HTTP adapter
//! needs to render a response. Refusals share the gateway's common
//! error body; an upstream success passes through untouched.

use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use crate::error::GatewayErrorBody;
use crate::ratelimit::RateLimitDecision;

/// The result of one pass through the gateway pipeline
#[derive(Debug, Clone)]
pub enum GatewayOutcome {
    /// The upstream answered; status, filtered headers, and body pass
    /// through
    Success {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },

    /// No registered endpoint matches the request
    RouteNotFound { path: String },

    /// Pass-through dispatch named an unknown service
    ServiceNotFound { service_id: String },

    /// Pass-through dispatch named a reserved service ID
    ReservedPath { path: String },

    /// A private endpoint refused the source
    AccessDenied { reason: String },

    /// The request is malformed or exceeds a size limit
    Invalid { reason: String, suggested_status: u16 },

    /// Authentication failed
    Unauthorized { reason: String },

    /// The identity is valid but not allowed
    Forbidden { reason: String },

    /// The rate limit rejected the request
    RateLimited { decision: RateLimitDecision },

    /// The upstream could not be reached
    Error { message: String },

    /// The upstream exceeded its deadline
    GatewayTimeout,
}

impl GatewayOutcome {
    /// The status the adapter should render
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayOutcome::Success { status, .. } => *status,
            GatewayOutcome::RouteNotFound { .. }
            | GatewayOutcome::ServiceNotFound { .. }
            | GatewayOutcome::ReservedPath { .. } => StatusCode::NOT_FOUND,
            GatewayOutcome::AccessDenied { .. } | GatewayOutcome::Forbidden { .. } => {
                StatusCode::FORBIDDEN
            }
            GatewayOutcome::Invalid { suggested_status, .. } => {
                StatusCode::from_u16(*suggested_status).unwrap_or(StatusCode::BAD_REQUEST)
            }
            GatewayOutcome::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            GatewayOutcome::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayOutcome::Error { .. } => StatusCode::BAD_GATEWAY,
            GatewayOutcome::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Whether the outcome is an upstream success pass-through
    pub fn is_success(&self) -> bool {
        matches!(self, GatewayOutcome::Success { .. })
    }
}

impl IntoResponse for GatewayOutcome {
    fn into_response(self) -> Response {
        let status = self.status();

        // Every refusal reduces to (code, message, retry hint); only a
        // pass-through success escapes the common body
        let (code, message, retry_after) = match self {
            GatewayOutcome::Success {
                status,
                headers,
                body,
            } => {
                let mut response = Response::new(axum::body::Body::from(body));
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                return response;
            }

            GatewayOutcome::RouteNotFound { path } => (
                "route.not_found",
                format!("no route matches '{}'", path),
                None,
            ),
            GatewayOutcome::ServiceNotFound { service_id } => (
                "route.unknown_service",
                format!("no service '{}' is registered", service_id),
                None,
            ),
            GatewayOutcome::ReservedPath { path } => (
                "route.reserved",
                format!("'{}' addresses a reserved service id", path),
                None,
            ),
            GatewayOutcome::AccessDenied { reason } => ("access.denied", reason, None),
            GatewayOutcome::Invalid { reason, .. } => ("request.invalid", reason, None),
            GatewayOutcome::Unauthorized { reason } => ("auth.unauthorized", reason, None),
            GatewayOutcome::Forbidden { reason } => ("auth.forbidden", reason, None),
            GatewayOutcome::RateLimited { decision } => (
                "rate.limited",
                "too many requests".to_string(),
                decision.retry_after_secs,
            ),
            GatewayOutcome::Error { message } => ("upstream.error", message, None),
            GatewayOutcome::GatewayTimeout => (
                "upstream.timeout",
                "upstream request timed out".to_string(),
                None,
            ),
        };

        let mut body = GatewayErrorBody::new(status, code, message);
        if let Some(secs) = retry_after {
            body = body.retry_after(secs);
        }
        body.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::EffectiveRateLimit;
    use chrono::Utc;
    use http::HeaderValue;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayOutcome::RouteNotFound { path: "/x".into() }.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayOutcome::ReservedPath { path: "/admin".into() }.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayOutcome::AccessDenied { reason: "ip".into() }.status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayOutcome::Invalid {
                reason: "body".into(),
                suggested_status: 413
            }
            .status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            GatewayOutcome::Error { message: "down".into() }.status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(GatewayOutcome::GatewayTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_rate_limited_carries_retry_after() {
        let decision = RateLimitDecision {
            allowed: false,
            remaining: 0,
            reset_at: Utc::now(),
            retry_after_secs: Some(42),
            current_usage: 4,
            limit: EffectiveRateLimit {
                requests_per_window: 3,
                window_secs: 60,
                burst_capacity: 3,
            },
        };
        let response = GatewayOutcome::RateLimited { decision }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[http::header::RETRY_AFTER], "42");
    }

    #[test]
    fn test_success_passes_through() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        let response = GatewayOutcome::Success {
            status: StatusCode::CREATED,
            headers,
            body: Bytes::from_static(b"created"),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["content-type"], "text/plain");
    }
}
