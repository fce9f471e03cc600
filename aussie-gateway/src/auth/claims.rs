//! Token claims and the forwarded identity token

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Claims carried by a validated incoming token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user or client identifier)
    pub sub: String,

    /// Expiration time (Unix timestamp)
    pub exp: i64,

    /// Issuer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// Audience
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,

    /// Issued at (Unix timestamp)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    /// Not before (Unix timestamp)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,

    /// Token identifier, the revocation key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,

    /// Permissions granted to the subject
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub perms: Vec<String>,

    /// Any remaining claims, preserved for forwarding
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Claims {
    /// The expiry as a timestamp
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Time until expiry, zero when already expired
    pub fn time_to_expiry(&self) -> Duration {
        let remaining = self.exp - Utc::now().timestamp();
        if remaining <= 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(remaining as u64)
        }
    }

    /// A claim from the non-standard set
    pub fn extra_claim(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }
}

/// The short-lived signed identity forwarded to backends
///
/// Minted by the route authenticator after the incoming token passes
/// validation and the revocation check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AussieToken {
    /// The compact JWS to place in the upstream `Authorization` header
    pub jws: String,

    /// The authenticated subject
    pub subject: String,

    /// Expiry of the re-issued token
    pub expires_at: DateTime<Utc>,

    /// The full claim set that was signed
    pub claims: Map<String, Value>,
}

impl AussieToken {
    /// The `Authorization` header value for upstream requests
    pub fn bearer_header(&self) -> String {
        format!("Bearer {}", self.jws)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(exp_offset: i64) -> Claims {
        Claims {
            sub: "user:7".to_string(),
            exp: Utc::now().timestamp() + exp_offset,
            iss: Some("https://idp.example".to_string()),
            aud: None,
            iat: Some(Utc::now().timestamp()),
            nbf: None,
            jti: Some("jti-1".to_string()),
            perms: vec![],
            extra: Map::new(),
        }
    }

    #[test]
    fn test_time_to_expiry() {
        assert!(claims(300).time_to_expiry() > Duration::from_secs(290));
        assert_eq!(claims(-10).time_to_expiry(), Duration::ZERO);
    }

    #[test]
    fn test_extra_claims_preserved_through_serde() {
        let json = r#"{
            "sub": "user:7",
            "exp": 4102444800,
            "email": "user@example.com",
            "groups": ["eng", "oncall"]
        }"#;
        let claims: Claims = serde_json::from_str(json).unwrap();
        assert_eq!(
            claims.extra_claim("email").and_then(Value::as_str),
            Some("user@example.com")
        );
        assert!(claims.extra_claim("groups").is_some());

        let back = serde_json::to_value(&claims).unwrap();
        assert_eq!(back["email"], "user@example.com");
    }

    #[test]
    fn test_bearer_header() {
        let token = AussieToken {
            jws: "abc.def.ghi".to_string(),
            subject: "user:7".to_string(),
            expires_at: Utc::now(),
            claims: Map::new(),
        };
        assert_eq!(token.bearer_header(), "Bearer abc.def.ghi");
    }
}
