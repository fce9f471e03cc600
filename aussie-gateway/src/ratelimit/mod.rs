//! Rate limiting
//!
//! Limits resolve hierarchically: platform defaults, then service
//! overrides, then endpoint overrides, each field independently. The
//! resolved triple is clamped to the platform ceiling. Accounting is
//! keyed by `(kind, client, service, endpoint)` and delegated to a
//! pluggable limiter backend.

pub mod limiter;
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

pub use limiter::{RateLimitDecision, RateLimiter};
pub use memory::InMemoryRateLimiter;

#[cfg(feature = "redis")]
pub use self::redis::RedisRateLimiter;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::{RateLimitSettings, WindowSettings};
use crate::registry::{RateLimitOverride, ServiceRateLimitConfig};

/// The traffic class a bucket accounts for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKind {
    Http,
    WsConnection,
    WsMessage,
}

impl RateLimitKind {
    fn as_str(&self) -> &'static str {
        match self {
            RateLimitKind::Http => "http",
            RateLimitKind::WsConnection => "ws_conn",
            RateLimitKind::WsMessage => "ws_msg",
        }
    }
}

impl fmt::Display for RateLimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one accounting bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub kind: RateLimitKind,
    pub client_id: String,
    pub service_id: String,
    pub endpoint_id: Option<String>,
}

impl RateLimitKey {
    /// HTTP bucket for a client and service endpoint
    pub fn http(client_id: impl Into<String>, service_id: impl Into<String>, endpoint_id: Option<String>) -> Self {
        Self {
            kind: RateLimitKind::Http,
            client_id: client_id.into(),
            service_id: service_id.into(),
            endpoint_id,
        }
    }

    /// WebSocket connection-establishment bucket
    pub fn ws_connection(client_id: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            kind: RateLimitKind::WsConnection,
            client_id: client_id.into(),
            service_id: service_id.into(),
            endpoint_id: None,
        }
    }

    /// Per-connection WebSocket message bucket
    ///
    /// The connection ID rides in `client_id` so the whole bucket can
    /// be dropped with [`RateLimiter::remove_keys_matching`] when the
    /// session ends.
    pub fn ws_message(client_id: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            kind: RateLimitKind::WsMessage,
            client_id: client_id.into(),
            service_id: service_id.into(),
            endpoint_id: None,
        }
    }

    /// The backing storage key
    pub fn storage_key(&self) -> String {
        let mut key = format!(
            "aussie:rl:{}:{}:{}",
            self.kind, self.client_id, self.service_id
        );
        if let Some(endpoint) = &self.endpoint_id {
            key.push(':');
            key.push_str(endpoint);
        }
        key
    }

    /// The pattern matching every bucket of one client
    pub fn client_pattern(kind: RateLimitKind, client_id: &str) -> String {
        format!("aussie:rl:{}:{}:*", kind, client_id)
    }
}

/// The limit actually enforced for a request after resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveRateLimit {
    /// Requests allowed per window
    pub requests_per_window: u32,

    /// Window length in seconds
    pub window_secs: u64,

    /// Bucket capacity; at least `requests_per_window`
    pub burst_capacity: u32,
}

impl EffectiveRateLimit {
    /// The window as a Duration
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Steady refill rate in tokens per second
    pub fn refill_rate(&self) -> f64 {
        if self.window_secs == 0 {
            return 0.0;
        }
        self.requests_per_window as f64 / self.window_secs as f64
    }
}

/// Resolves effective limits through the configuration hierarchy
#[derive(Debug, Clone)]
pub struct RateLimitResolver {
    settings: RateLimitSettings,
}

impl RateLimitResolver {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self { settings }
    }

    /// The platform settings backing this resolver
    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    /// Resolve the limit for one traffic class
    ///
    /// Each absent override field inherits from the level below it;
    /// the final triple is clamped to the platform ceiling and the
    /// burst floor (`burst >= requests`) is restored afterwards.
    pub fn resolve(
        &self,
        kind: RateLimitKind,
        service: Option<&ServiceRateLimitConfig>,
        endpoint: Option<&RateLimitOverride>,
    ) -> EffectiveRateLimit {
        let platform = self.platform_window(kind);
        let service_override = service.and_then(|cfg| match kind {
            RateLimitKind::Http => cfg.http.as_ref(),
            RateLimitKind::WsConnection => cfg.websocket_connection.as_ref(),
            RateLimitKind::WsMessage => cfg.websocket_message.as_ref(),
        });

        let mut requests = platform.requests_per_window;
        let mut window_secs = platform.window.as_secs();
        let mut burst = platform.burst_capacity;

        for layer in [service_override, endpoint].into_iter().flatten() {
            if let Some(value) = layer.requests_per_window {
                requests = value;
            }
            if let Some(value) = layer.window {
                window_secs = value.as_secs();
            }
            if let Some(value) = layer.burst_capacity {
                burst = value;
            }
        }

        let ceiling = self.settings.max_requests_per_window;
        burst = burst.max(requests);
        EffectiveRateLimit {
            requests_per_window: requests.min(ceiling),
            window_secs,
            burst_capacity: burst.min(ceiling),
        }
    }

    fn platform_window(&self, kind: RateLimitKind) -> WindowSettings {
        match kind {
            RateLimitKind::Http => self.settings.http,
            RateLimitKind::WsConnection => self.settings.websocket_connection,
            RateLimitKind::WsMessage => self.settings.websocket_message,
        }
    }
}
