//! Forwarding-header builders
//!
//! The upstream hop learns the original client either through RFC 7239
//! `Forwarded` or through the legacy `X-Forwarded-*` triple; the format
//! is selected process-wide by configuration.

use http::header::{HeaderName, HeaderValue};
use std::sync::Arc;

use crate::config::ForwardedHeaderFormat;
use crate::source::SourceIdentifier;

/// Builds the forwarding headers injected toward the backend
pub trait ForwardedHeaderBuilder: Send + Sync {
    /// Headers describing the original client and hop
    fn build(
        &self,
        source: &SourceIdentifier,
        proto: &str,
        host: Option<&str>,
    ) -> Vec<(HeaderName, HeaderValue)>;
}

/// The builder for the configured format
pub fn builder_for(format: ForwardedHeaderFormat) -> Arc<dyn ForwardedHeaderBuilder> {
    match format {
        ForwardedHeaderFormat::Rfc7239 => Arc::new(Rfc7239Builder),
        ForwardedHeaderFormat::Legacy => Arc::new(LegacyForwardedBuilder),
    }
}

/// RFC 7239 `Forwarded: for=...;proto=...;host=...`
pub struct Rfc7239Builder;

impl Rfc7239Builder {
    /// Node-quote the client identifier; IPv6 literals get brackets
    fn format_node(ip: &str) -> String {
        if ip.contains(':') && !ip.starts_with('[') {
            format!("\"[{}]\"", ip)
        } else {
            ip.to_string()
        }
    }
}

impl ForwardedHeaderBuilder for Rfc7239Builder {
    fn build(
        &self,
        source: &SourceIdentifier,
        proto: &str,
        host: Option<&str>,
    ) -> Vec<(HeaderName, HeaderValue)> {
        let mut value = format!("for={};proto={}", Self::format_node(&source.ip), proto);
        if let Some(host) = host {
            value.push_str(";host=");
            value.push_str(host);
        }

        match HeaderValue::from_str(&value) {
            Ok(value) => vec![(HeaderName::from_static("forwarded"), value)],
            Err(_) => Vec::new(),
        }
    }
}

/// Legacy `X-Forwarded-For` / `X-Forwarded-Proto` / `X-Forwarded-Host`
pub struct LegacyForwardedBuilder;

impl ForwardedHeaderBuilder for LegacyForwardedBuilder {
    fn build(
        &self,
        source: &SourceIdentifier,
        proto: &str,
        host: Option<&str>,
    ) -> Vec<(HeaderName, HeaderValue)> {
        let mut headers = Vec::new();

        // Preserve the upstream chain when one was trusted
        let chain = source
            .forwarded_chain
            .clone()
            .unwrap_or_else(|| source.ip.clone());
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.push((HeaderName::from_static("x-forwarded-for"), value));
        }
        if let Ok(value) = HeaderValue::from_str(proto) {
            headers.push((HeaderName::from_static("x-forwarded-proto"), value));
        }
        if let Some(host) = host {
            if let Ok(value) = HeaderValue::from_str(host) {
                headers.push((HeaderName::from_static("x-forwarded-host"), value));
            }
        }

        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(ip: &str, chain: Option<&str>, host: Option<&str>) -> SourceIdentifier {
        SourceIdentifier {
            ip: ip.to_string(),
            host: host.map(str::to_string),
            forwarded_chain: chain.map(str::to_string),
        }
    }

    #[test]
    fn test_rfc7239_shape() {
        let headers = Rfc7239Builder.build(
            &source("203.0.113.7", None, None),
            "https",
            Some("api.example"),
        );
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0.as_str(), "forwarded");
        assert_eq!(
            headers[0].1.to_str().unwrap(),
            "for=203.0.113.7;proto=https;host=api.example"
        );
    }

    #[test]
    fn test_rfc7239_ipv6_bracketed() {
        let headers = Rfc7239Builder.build(&source("2001:db8::1", None, None), "http", None);
        assert_eq!(
            headers[0].1.to_str().unwrap(),
            "for=\"[2001:db8::1]\";proto=http"
        );
    }

    #[test]
    fn test_legacy_headers() {
        let headers = LegacyForwardedBuilder.build(
            &source("203.0.113.7", None, Some("api.example")),
            "http",
            Some("api.example"),
        );
        let names: Vec<&str> = headers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["x-forwarded-for", "x-forwarded-proto", "x-forwarded-host"]
        );
        assert_eq!(headers[0].1.to_str().unwrap(), "203.0.113.7");
    }

    #[test]
    fn test_legacy_preserves_chain() {
        let headers = LegacyForwardedBuilder.build(
            &source("203.0.113.7", Some("203.0.113.7, 10.0.0.1"), None),
            "http",
            None,
        );
        assert_eq!(headers[0].1.to_str().unwrap(), "203.0.113.7, 10.0.0.1");
    }
}
