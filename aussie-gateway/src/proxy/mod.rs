//! Proxy request preparation
//!
//! Turns a matched gateway request into the exact request sent
//! upstream: hop-by-hop headers stripped, `Host` rewritten to the
//! target, forwarding headers injected, and the re-issued identity
//! token attached.

pub mod client;
pub mod forwarded;

pub use client::{HttpProxyClient, ProxyClient, ProxyError, ProxyResponse};
pub use forwarded::{builder_for, ForwardedHeaderBuilder, LegacyForwardedBuilder, Rfc7239Builder};

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Uri};
use std::sync::Arc;

use crate::auth::AussieToken;
use crate::config::ForwardedHeaderFormat;
use crate::error::{Error, Result};
use crate::gateway::GatewayRequest;
use crate::source::SourceIdentifier;

/// Headers that never cross the proxy boundary
pub const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "content-length",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Headers preserved on WebSocket upgrades despite being hop-by-hop
fn keep_for_websocket(name: &HeaderName) -> bool {
    matches!(name.as_str(), "connection" | "upgrade") || name.as_str().starts_with("sec-websocket-")
}

/// The exact request issued upstream
#[derive(Debug, Clone)]
pub struct PreparedProxyRequest {
    pub method: Method,
    pub target_uri: Uri,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// Builds prepared requests from matched routes
pub struct ProxyRequestPreparer {
    forwarded: Arc<dyn ForwardedHeaderBuilder>,
}

impl ProxyRequestPreparer {
    /// Create a preparer emitting the configured forwarding format
    pub fn new(format: ForwardedHeaderFormat) -> Self {
        Self {
            forwarded: builder_for(format),
        }
    }

    /// Prepare the upstream request
    ///
    /// `target_path` is the rewritten route path; the original query
    /// string is preserved. With `websocket` set, the upgrade headers
    /// survive the hop-by-hop strip.
    pub fn prepare(
        &self,
        request: &GatewayRequest,
        source: &SourceIdentifier,
        base_url: &str,
        target_path: &str,
        token: Option<&AussieToken>,
        websocket: bool,
    ) -> Result<PreparedProxyRequest> {
        let base: Uri = base_url
            .parse()
            .map_err(|_| Error::Internal(format!("service base URL '{}' is invalid", base_url)))?;
        let target_uri = join_target(&base, target_path, request.uri.query())?;

        let mut headers = HeaderMap::with_capacity(request.headers.len() + 4);
        for (name, value) in request.headers.iter() {
            if name == http::header::HOST {
                continue;
            }
            if is_forwarding_header(name) {
                continue;
            }
            if is_hop_by_hop(name) && !(websocket && keep_for_websocket(name)) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        if let Some(host) = host_header_value(&base) {
            headers.insert(
                http::header::HOST,
                HeaderValue::from_str(&host)
                    .map_err(|_| Error::Internal(format!("invalid target host '{}'", host)))?,
            );
        }

        let proto = request.uri.scheme_str().unwrap_or("http");
        for (name, value) in self.forwarded.build(source, proto, source.host.as_deref()) {
            headers.insert(name, value);
        }

        if let Some(token) = token {
            headers.insert(
                http::header::AUTHORIZATION,
                HeaderValue::from_str(&token.bearer_header())
                    .map_err(|_| Error::Internal("identity token is not header-safe".to_string()))?,
            );
        }

        Ok(PreparedProxyRequest {
            method: request.method.clone(),
            target_uri,
            headers,
            body: request.body.clone(),
        })
    }
}

/// Incoming forwarding headers are replaced, never propagated verbatim
fn is_forwarding_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "forwarded" | "x-forwarded-for" | "x-forwarded-host" | "x-forwarded-proto" | "x-real-ip"
    )
}

/// Strip hop-by-hop headers from an upstream response
///
/// `Content-Length` is preserved so the adapter can reuse the framing.
pub fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if name == http::header::CONTENT_LENGTH || !is_hop_by_hop(name) {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

/// Join the service base path with the route target path plus query
fn join_target(base: &Uri, target_path: &str, query: Option<&str>) -> Result<Uri> {
    let scheme = base.scheme_str().unwrap_or("http");
    let authority = base
        .authority()
        .ok_or_else(|| Error::Internal(format!("service base URL '{}' has no authority", base)))?;

    let base_path = base.path().trim_end_matches('/');
    let mut path = String::with_capacity(base_path.len() + target_path.len() + 1);
    path.push_str(base_path);
    if !target_path.starts_with('/') {
        path.push('/');
    }
    path.push_str(target_path);
    if path.is_empty() {
        path.push('/');
    }

    let mut uri = format!("{}://{}{}", scheme, authority, path);
    if let Some(query) = query {
        uri.push('?');
        uri.push_str(query);
    }

    uri.parse()
        .map_err(|_| Error::Internal(format!("computed target URI '{}' is invalid", uri)))
}

/// The `Host` value for a target, omitting default ports
fn host_header_value(base: &Uri) -> Option<String> {
    let host = base.host()?;
    let default_port = match base.scheme_str() {
        Some("https") => 443,
        _ => 80,
    };
    match base.port_u16() {
        Some(port) if port != default_port => Some(format!("{}:{}", host, port)),
        _ => Some(host.to_string()),
    }
}
