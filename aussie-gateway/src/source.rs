//! Client source identification
//!
//! Resolves the logical client IP and host for a request from the
//! forwarding headers, the request URI, and the socket peer. Forwarding
//! headers are only consulted when the peer passed the trusted-proxy
//! check; an untrusted hop falls back to the socket address.

use http::{HeaderMap, Uri};
use std::net::IpAddr;

/// The resolved client identity for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceIdentifier {
    /// Logical client IP, or `"unknown"` when nothing could be derived
    pub ip: String,

    /// Logical client host, when one was present
    pub host: Option<String>,

    /// The raw `X-Forwarded-For` chain, when present and trusted
    pub forwarded_chain: Option<String>,
}

impl SourceIdentifier {
    /// The placeholder identity used when no source can be derived
    pub const UNKNOWN: &'static str = "unknown";

    /// Resolve the source identity for a request
    ///
    /// `trusted` is the trusted-proxy decision for the socket peer;
    /// untrusted peers have every forwarding-derived field ignored.
    pub fn resolve(
        headers: &HeaderMap,
        request_uri: &Uri,
        peer: Option<IpAddr>,
        trusted: bool,
    ) -> Self {
        let ip = if trusted {
            first_forwarded_for(headers)
                .or_else(|| rfc7239_for(headers))
                .or_else(|| header_str(headers, "x-real-ip").map(|v| v.trim().to_string()))
                .filter(|v| !v.is_empty())
                .or_else(|| request_uri.host().map(str::to_string))
                .or_else(|| peer.map(|p| p.to_string()))
        } else {
            peer.map(|p| p.to_string())
                .or_else(|| request_uri.host().map(str::to_string))
        }
        .unwrap_or_else(|| Self::UNKNOWN.to_string());

        let host = if trusted {
            header_str(headers, "x-forwarded-host")
                .and_then(|v| v.split(',').next().map(|h| h.trim().to_string()))
                .filter(|h| !h.is_empty())
                .or_else(|| rfc7239_host(headers))
                .or_else(|| host_header(headers))
        } else {
            host_header(headers)
        };

        let forwarded_chain = if trusted {
            header_str(headers, "x-forwarded-for").map(str::to_string)
        } else {
            None
        };

        Self {
            ip,
            host,
            forwarded_chain,
        }
    }

    /// Parse the resolved IP as an address, when it is one
    pub fn ip_addr(&self) -> Option<IpAddr> {
        self.ip.parse().ok()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// First entry of `X-Forwarded-For`, trimmed
fn first_forwarded_for(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// `for=` of the first RFC 7239 `Forwarded` element
fn rfc7239_for(headers: &HeaderMap) -> Option<String> {
    let value = header_str(headers, "forwarded")?;
    let first = value.split(',').next()?;
    first
        .split(';')
        .map(str::trim)
        .find_map(|pair| {
            let (key, val) = pair.split_once('=')?;
            key.eq_ignore_ascii_case("for").then(|| val.trim())
        })
        .map(strip_node_port)
        .filter(|v| !v.is_empty())
}

/// `host=` of the first RFC 7239 `Forwarded` element
fn rfc7239_host(headers: &HeaderMap) -> Option<String> {
    let value = header_str(headers, "forwarded")?;
    let first = value.split(',').next()?;
    first
        .split(';')
        .map(str::trim)
        .find_map(|pair| {
            let (key, val) = pair.split_once('=')?;
            key.eq_ignore_ascii_case("host")
                .then(|| val.trim().trim_matches('"').to_string())
        })
        .filter(|v| !v.is_empty())
}

/// Strip RFC 7239 node quoting: `"[2001:db8::1]:443"` becomes the bare
/// address, `192.0.2.60:8080` loses its port
fn strip_node_port(value: &str) -> String {
    let unquoted = value.trim_matches('"');
    if let Some(rest) = unquoted.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
    }
    // IPv4 (or obfuscated node) with optional :port; a bare IPv6 literal
    // has more than one colon and is left untouched
    match unquoted.split_once(':') {
        Some((host, port))
            if !port.contains(':') && port.chars().all(|c| c.is_ascii_digit()) =>
        {
            host.to_string()
        }
        _ => unquoted.to_string(),
    }
}

/// `Host` header with any port removed
fn host_header(headers: &HeaderMap) -> Option<String> {
    let raw = header_str(headers, "host")?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some(rest) = raw.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return Some(format!("[{}]", &rest[..end]));
        }
    }
    Some(match raw.split_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => raw.to_string(),
    })
}
