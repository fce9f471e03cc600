//! Token validation and issuance ports
//!
//! The gateway consumes identity tokens through these two traits and
//! ships JWT-backed implementations. Key management, JWKS rotation, and
//! identity-provider integration live with the embedding application.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::{Map, Value};
use std::sync::Arc;

use super::claims::Claims;
use crate::error::{Error, Result};

/// Validates incoming bearer tokens
pub trait TokenValidator: Send + Sync {
    /// Verify signature, issuer, audience, and time claims
    fn validate(&self, token: &str) -> Result<Claims>;
}

/// Signs the short-lived identity tokens forwarded to backends
pub trait TokenIssuer: Send + Sync {
    /// Sign a claim set, returning the compact JWS
    fn issue(&self, claims: &Map<String, Value>) -> Result<String>;
}

/// JWT validator backed by a static key
#[derive(Clone)]
pub struct JwtValidator {
    decoding_key: Arc<DecodingKey>,
    validation: Validation,
}

impl JwtValidator {
    /// HMAC validator from a shared secret
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            decoding_key: Arc::new(DecodingKey::from_secret(secret)),
            validation: base_validation(Algorithm::HS256),
        }
    }

    /// RSA validator from a PEM-encoded public key
    pub fn from_rsa_pem(pem: &[u8]) -> Result<Self> {
        Ok(Self {
            decoding_key: Arc::new(DecodingKey::from_rsa_pem(pem)?),
            validation: base_validation(Algorithm::RS256),
        })
    }

    /// Require a specific issuer claim
    pub fn with_issuer(mut self, issuer: impl AsRef<str>) -> Self {
        self.validation.set_issuer(&[issuer.as_ref()]);
        self
    }

    /// Require a specific audience claim
    pub fn with_audience(mut self, audience: impl AsRef<str>) -> Self {
        self.validation.set_audience(&[audience.as_ref()]);
        self.validation.validate_aud = true;
        self
    }
}

fn base_validation(algorithm: Algorithm) -> Validation {
    let mut validation = Validation::new(algorithm);
    validation.validate_nbf = true;
    // Audience is only enforced when configured
    validation.validate_aud = false;
    validation
}

impl TokenValidator for JwtValidator {
    fn validate(&self, token: &str) -> Result<Claims> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        Ok(data.claims)
    }
}

/// JWT issuer backed by a static signing key
#[derive(Clone)]
pub struct JwtIssuer {
    encoding_key: Arc<EncodingKey>,
    algorithm: Algorithm,
}

impl JwtIssuer {
    /// HMAC issuer from a shared secret
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            encoding_key: Arc::new(EncodingKey::from_secret(secret)),
            algorithm: Algorithm::HS256,
        }
    }

    /// RSA issuer from a PEM-encoded private key
    pub fn from_rsa_pem(pem: &[u8]) -> Result<Self> {
        Ok(Self {
            encoding_key: Arc::new(EncodingKey::from_rsa_pem(pem)?),
            algorithm: Algorithm::RS256,
        })
    }
}

impl TokenIssuer for JwtIssuer {
    fn issue(&self, claims: &Map<String, Value>) -> Result<String> {
        let header = Header::new(self.algorithm);
        encode(&header, claims, &self.encoding_key).map_err(Error::from)
    }
}

/// Placeholder backend for deployments with no identity provider wired
///
/// Every route that requires authentication fails until a real backend
/// is installed; routes without authentication are unaffected.
pub struct DisabledTokenBackend;

impl TokenValidator for DisabledTokenBackend {
    fn validate(&self, _token: &str) -> Result<Claims> {
        Err(Error::Unauthorized(
            "no token validator is configured".to_string(),
        ))
    }
}

impl TokenIssuer for DisabledTokenBackend {
    fn issue(&self, _claims: &Map<String, Value>) -> Result<String> {
        Err(Error::Internal(
            "no token issuer is configured".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const SECRET: &[u8] = b"unit-test-secret";

    fn signed(claims: serde_json::Value) -> String {
        let map = claims.as_object().unwrap().clone();
        JwtIssuer::from_secret(SECRET).issue(&map).unwrap()
    }

    #[test]
    fn test_issue_then_validate() {
        let token = signed(serde_json::json!({
            "sub": "user:7",
            "exp": Utc::now().timestamp() + 300,
            "jti": "jti-1",
            "email": "user@example.com"
        }));

        let claims = JwtValidator::from_secret(SECRET).validate(&token).unwrap();
        assert_eq!(claims.sub, "user:7");
        assert_eq!(claims.jti.as_deref(), Some("jti-1"));
        assert_eq!(
            claims.extra_claim("email").and_then(Value::as_str),
            Some("user@example.com")
        );
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = signed(serde_json::json!({
            "sub": "user:7",
            "exp": Utc::now().timestamp() - 3600
        }));
        assert!(JwtValidator::from_secret(SECRET).validate(&token).is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = signed(serde_json::json!({
            "sub": "user:7",
            "exp": Utc::now().timestamp() + 300
        }));
        assert!(JwtValidator::from_secret(b"other-secret")
            .validate(&token)
            .is_err());
    }

    #[test]
    fn test_issuer_enforced_when_configured() {
        let token = signed(serde_json::json!({
            "sub": "user:7",
            "exp": Utc::now().timestamp() + 300,
            "iss": "https://idp.example"
        }));

        let validator = JwtValidator::from_secret(SECRET).with_issuer("https://idp.example");
        assert!(validator.validate(&token).is_ok());

        let validator = JwtValidator::from_secret(SECRET).with_issuer("https://other.example");
        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn test_audience_enforced_when_configured() {
        let token = signed(serde_json::json!({
            "sub": "user:7",
            "exp": Utc::now().timestamp() + 300,
            "aud": "orders-api"
        }));

        let validator = JwtValidator::from_secret(SECRET).with_audience("orders-api");
        assert!(validator.validate(&token).is_ok());

        let validator = JwtValidator::from_secret(SECRET).with_audience("billing-api");
        assert!(validator.validate(&token).is_err());
    }
}
