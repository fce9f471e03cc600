//! Route authentication
//!
//! Validates the incoming bearer token for routes that require one,
//! runs it through the revocation pipeline, and re-issues a short-lived
//! identity token for the upstream hop.

pub mod authorization;
pub mod claims;
pub mod token;

pub use authorization::{operations, ServiceAuthorizer, WILDCARD_PERMISSION};
pub use claims::{AussieToken, Claims};
pub use token::{DisabledTokenBackend, JwtIssuer, JwtValidator, TokenIssuer, TokenValidator};

use chrono::Utc;
use http::HeaderMap;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::config::AuthConfig;
use crate::error::Result;
use crate::registry::RouteMatch;
use crate::revocation::RevocationPipeline;

/// The outcome of route authentication
#[derive(Debug, Clone)]
pub enum RouteAuthResult {
    /// The route does not require an identity
    NotRequired,

    /// A validated identity, re-issued for forwarding
    Authenticated(AussieToken),

    /// Token missing, invalid, expired, or revoked
    Unauthorized(String),

    /// Token valid but access denied
    Forbidden(String),
}

/// Extract the bearer token from an `Authorization` header
pub fn extract_bearer(headers: &HeaderMap) -> std::result::Result<&str, String> {
    let value = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing Authorization header".to_string())?;

    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| "Authorization header is not a bearer token".to_string())
}

/// Authenticates requests against matched routes
pub struct RouteAuthenticator {
    validator: Arc<dyn TokenValidator>,
    issuer: Arc<dyn TokenIssuer>,
    revocation: Arc<RevocationPipeline>,
    config: AuthConfig,
}

impl RouteAuthenticator {
    pub fn new(
        validator: Arc<dyn TokenValidator>,
        issuer: Arc<dyn TokenIssuer>,
        revocation: Arc<RevocationPipeline>,
        config: AuthConfig,
    ) -> Self {
        Self {
            validator,
            issuer,
            revocation,
            config,
        }
    }

    /// Authenticate a request against its matched route
    pub async fn authenticate(&self, headers: &HeaderMap, route: &RouteMatch) -> RouteAuthResult {
        if !route.auth_required() {
            return RouteAuthResult::NotRequired;
        }
        self.authenticate_required(headers, route.audience()).await
    }

    /// Authenticate when the requirement was already decided
    ///
    /// Used by pass-through dispatch and WebSocket upgrades where the
    /// requirement may come from the service default rather than a
    /// matched endpoint.
    pub async fn authenticate_required(
        &self,
        headers: &HeaderMap,
        audience: &str,
    ) -> RouteAuthResult {
        let token = match extract_bearer(headers) {
            Ok(token) => token,
            Err(reason) => return RouteAuthResult::Unauthorized(reason),
        };

        let claims = match self.validator.validate(token) {
            Ok(claims) => claims,
            Err(e) => return RouteAuthResult::Unauthorized(e.to_string()),
        };

        match self.revocation.is_revoked(&claims).await {
            Ok(false) => {}
            Ok(true) => return RouteAuthResult::Unauthorized("revoked".to_string()),
            Err(e) => {
                tracing::warn!("revocation check failed closed: {}", e);
                return RouteAuthResult::Unauthorized("revocation check unavailable".to_string());
            }
        }

        match self.reissue(&claims, audience) {
            Ok(token) => RouteAuthResult::Authenticated(token),
            Err(e) => {
                tracing::error!("identity token issuance failed: {}", e);
                RouteAuthResult::Unauthorized("identity token issuance failed".to_string())
            }
        }
    }

    /// Mint the forwarded identity token
    fn reissue(&self, claims: &Claims, audience: &str) -> Result<AussieToken> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(self.config.token_ttl.as_secs() as i64);

        let mut forwarded = Map::new();
        for name in &self.config.forwarded_claims {
            if let Some(value) = claims.extra.get(name) {
                forwarded.insert(name.clone(), value.clone());
            }
        }

        forwarded.insert("iss".to_string(), Value::from(self.config.issuer.clone()));
        forwarded.insert("sub".to_string(), Value::from(claims.sub.clone()));
        if let Some(original_iss) = &claims.iss {
            forwarded.insert("original_iss".to_string(), Value::from(original_iss.clone()));
        }
        forwarded.insert("iat".to_string(), Value::from(now.timestamp()));
        forwarded.insert("exp".to_string(), Value::from(expires_at.timestamp()));
        forwarded.insert("aud".to_string(), Value::from(audience));
        forwarded.insert(
            "jti".to_string(),
            Value::from(uuid::Uuid::new_v4().to_string()),
        );

        let jws = self.issuer.issue(&forwarded)?;
        Ok(AussieToken {
            jws,
            subject: claims.sub.clone(),
            expires_at,
            claims: forwarded,
        })
    }
}
