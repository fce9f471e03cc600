//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following
//! precedence (highest to lowest):
//! 1. Environment variables (prefix: AUSSIE_)
//! 2. TOML configuration file
//! 3. Default values
//!
//! Duration fields accept ISO-8601 strings (`PT30S`, `PT5M`, `PT24H`)
//! or bare integer seconds.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::duration::ConfigDuration;
use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    /// Service identity
    #[serde(default)]
    pub service: ServiceConfig,

    /// Registry snapshot cache tuning
    #[serde(default)]
    pub registry: RegistryCacheConfig,

    /// Platform rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Token revocation pipeline
    #[serde(default)]
    pub revocation: RevocationConfig,

    /// Global access-control allow lists
    #[serde(default)]
    pub access_control: AccessControlConfig,

    /// Trusted proxy hops
    #[serde(default)]
    pub trusted_proxies: TrustedProxyConfig,

    /// Request size limits
    #[serde(default)]
    pub size_limits: SizeLimitConfig,

    /// Upstream forwarding
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Route authentication and token issuance
    #[serde(default)]
    pub auth: AuthConfig,

    /// WebSocket sessions
    #[serde(default)]
    pub websocket: WebSocketConfig,

    /// Redis backends (optional; in-memory backends apply when absent)
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Instance name used in logs
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Environment (dev, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            environment: default_environment(),
        }
    }
}

/// Registry snapshot cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryCacheConfig {
    /// Freshness window for the route snapshot
    #[serde(default = "default_routes_ttl")]
    pub service_routes_ttl: ConfigDuration,

    /// Freshness window for the per-service rate-limit view
    #[serde(default = "default_config_ttl")]
    pub rate_limit_config_ttl: ConfigDuration,

    /// Freshness window for the per-service sampling view
    #[serde(default = "default_config_ttl")]
    pub sampling_config_ttl: ConfigDuration,

    /// Maximum number of services held in the snapshot
    #[serde(default = "default_registry_max_entries")]
    pub max_entries: usize,

    /// Fraction of the TTL added as per-instance random jitter
    ///
    /// Staggers refresh across instances so a shared store does not see
    /// a thundering herd when a TTL expires fleet-wide.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RegistryCacheConfig {
    fn default() -> Self {
        Self {
            service_routes_ttl: default_routes_ttl(),
            rate_limit_config_ttl: default_config_ttl(),
            sampling_config_ttl: default_config_ttl(),
            max_entries: default_registry_max_entries(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

/// Rate limiting algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Refilling token bucket with burst capacity
    #[default]
    TokenBucket,
    /// Integer counter per fixed window
    FixedWindow,
    /// Weighted blend of the current and previous windows
    SlidingWindow,
}

/// One `requests / window / burst` triple
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindowSettings {
    /// Requests allowed per window
    pub requests_per_window: u32,

    /// Window length
    pub window: ConfigDuration,

    /// Maximum burst above the steady rate
    pub burst_capacity: u32,
}

/// Platform rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Master switch; a disabled limiter allows everything
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Window accounting algorithm, selected process-wide
    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,

    /// Platform default for HTTP requests
    #[serde(default = "default_http_window")]
    pub http: WindowSettings,

    /// Platform default for WebSocket connection establishment
    #[serde(default = "default_ws_connection_window")]
    pub websocket_connection: WindowSettings,

    /// Platform default for WebSocket messages
    #[serde(default = "default_ws_message_window")]
    pub websocket_message: WindowSettings,

    /// Ceiling applied to every resolved limit, service and endpoint
    /// overrides included
    #[serde(default = "default_platform_max")]
    pub max_requests_per_window: u32,

    /// Allow traffic when the remote limiter backend is unreachable
    #[serde(default = "default_true")]
    pub fail_open: bool,

    /// Bucket retention after last touch, as a multiple of the window
    #[serde(default = "default_bucket_retention_factor")]
    pub bucket_retention_factor: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: RateLimitAlgorithm::default(),
            http: default_http_window(),
            websocket_connection: default_ws_connection_window(),
            websocket_message: default_ws_message_window(),
            max_requests_per_window: default_platform_max(),
            fail_open: true,
            bucket_retention_factor: default_bucket_retention_factor(),
        }
    }
}

/// Token revocation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevocationConfig {
    /// Master switch for revocation checks
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Tokens expiring sooner than this skip the revocation check
    #[serde(default = "default_check_threshold")]
    pub check_threshold: ConfigDuration,

    /// Entries held in the per-instance verdict cache
    #[serde(default = "default_revocation_cache_capacity")]
    pub cache_capacity: usize,

    /// How long a cached verdict remains valid
    #[serde(default = "default_revocation_cache_ttl")]
    pub cache_ttl: ConfigDuration,

    /// Expected revoked-entry population used to size the bloom filter
    #[serde(default = "default_bloom_expected_items")]
    pub bloom_expected_items: usize,

    /// Bloom filter false-positive probability
    #[serde(default = "default_bloom_fp_rate")]
    pub bloom_false_positive_rate: f64,

    /// Interval between full bloom filter rebuilds from the store
    #[serde(default = "default_rebuild_interval")]
    pub rebuild_interval: ConfigDuration,

    /// Also honor whole-user revocations (`issued_before` records)
    #[serde(default = "default_true")]
    pub user_revocation_enabled: bool,

    /// Treat a store outage as "not revoked" instead of failing auth
    #[serde(default = "default_true")]
    pub fail_open: bool,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_threshold: default_check_threshold(),
            cache_capacity: default_revocation_cache_capacity(),
            cache_ttl: default_revocation_cache_ttl(),
            bloom_expected_items: default_bloom_expected_items(),
            bloom_false_positive_rate: default_bloom_fp_rate(),
            rebuild_interval: default_rebuild_interval(),
            user_revocation_enabled: true,
            fail_open: true,
        }
    }
}

/// Global access-control allow lists
///
/// A service-level `ServiceAccessConfig` replaces these per list
/// category when present.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccessControlConfig {
    /// Exact IPs or CIDR blocks allowed to reach private endpoints
    #[serde(default)]
    pub allowed_ips: Vec<String>,

    /// Exact host names (case-insensitive)
    #[serde(default)]
    pub allowed_domains: Vec<String>,

    /// `*.base.example` patterns matching strict subdomains
    #[serde(default)]
    pub allowed_subdomains: Vec<String>,

    /// Apply the allow lists to every request before route lookup, not
    /// only to endpoints resolved as private
    #[serde(default)]
    pub private_by_default: bool,
}

/// Trusted proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrustedProxyConfig {
    /// When disabled, forwarding headers are trusted from any peer
    #[serde(default)]
    pub enabled: bool,

    /// Exact IPs or CIDR blocks of trusted hops
    #[serde(default)]
    pub proxies: Vec<String>,
}

/// Request size limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeLimitConfig {
    /// Maximum request body size in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Maximum size of a single header entry (`name: value`) in bytes
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,

    /// Maximum combined size of all header entries in bytes
    #[serde(default = "default_max_total_headers_bytes")]
    pub max_total_headers_bytes: usize,
}

impl Default for SizeLimitConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
            max_header_bytes: default_max_header_bytes(),
            max_total_headers_bytes: default_max_total_headers_bytes(),
        }
    }
}

/// Forwarding-header format emitted toward backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ForwardedHeaderFormat {
    /// RFC 7239 `Forwarded: for=...;proto=...;host=...`
    #[default]
    Rfc7239,
    /// `X-Forwarded-For` / `X-Forwarded-Proto` / `X-Forwarded-Host`
    Legacy,
}

/// Upstream forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Deadline for a single upstream request
    #[serde(default = "default_request_timeout")]
    pub request_timeout: ConfigDuration,

    /// Which forwarding headers to inject
    #[serde(default)]
    pub forwarded_header_format: ForwardedHeaderFormat,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            forwarded_header_format: ForwardedHeaderFormat::default(),
        }
    }
}

/// Route authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Issuer claim stamped on re-issued identity tokens
    #[serde(default = "default_token_issuer")]
    pub issuer: String,

    /// Lifetime of re-issued identity tokens
    #[serde(default = "default_token_ttl")]
    pub token_ttl: ConfigDuration,

    /// Claims copied from the validated token onto the forwarded one
    #[serde(default = "default_forwarded_claims")]
    pub forwarded_claims: Vec<String>,

    /// Permission granting platform-admin authority
    #[serde(default = "default_admin_permission")]
    pub admin_permission: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: default_token_issuer(),
            token_ttl: default_token_ttl(),
            forwarded_claims: default_forwarded_claims(),
            admin_permission: default_admin_permission(),
        }
    }
}

/// WebSocket session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Close the session when neither side sends for this long
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: ConfigDuration,

    /// Hard session lifetime cap, activity notwithstanding
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime: ConfigDuration,

    /// Send a ping on this cadence; zero disables pings
    #[serde(default = "default_ping_interval")]
    pub ping_interval: ConfigDuration,

    /// Close when a ping goes unanswered for this long
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: ConfigDuration,

    /// Concurrent sessions allowed per instance
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl WebSocketConfig {
    /// Whether keepalive pings are enabled
    #[must_use]
    pub fn ping_enabled(&self) -> bool {
        self.ping_interval.as_secs() > 0
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            max_lifetime: default_max_lifetime(),
            ping_interval: default_ping_interval(),
            ping_timeout: default_ping_timeout(),
            max_connections: default_max_connections(),
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL (redis://host:port)
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_redis_max_connections")]
    pub max_connections: usize,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing the first connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

impl RedisConfig {
    /// Connection timeout as a Duration
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

impl GatewayConfig {
    /// Load configuration from `aussie.toml` plus the environment
    pub fn load() -> Result<Self> {
        Self::load_from("aussie.toml")
    }

    /// Load configuration from an explicit TOML file
    ///
    /// A missing file is not an error; the defaults stand. Environment
    /// variables prefixed `AUSSIE_` override the file, with `__`
    /// separating nesting levels (`AUSSIE_RATE_LIMIT__FAIL_OPEN`).
    pub fn load_from(path: &str) -> Result<Self> {
        let defaults = Serialized::defaults(GatewayConfig::default());
        let env = Env::prefixed("AUSSIE_").split("__");

        Ok(Figment::from(defaults)
            .merge(Toml::file(path))
            .merge(env)
            .extract()?)
    }
}

// Default value functions

fn default_service_name() -> String {
    "aussie-gateway".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

const fn default_routes_ttl() -> ConfigDuration {
    ConfigDuration::from_secs(30)
}

const fn default_config_ttl() -> ConfigDuration {
    ConfigDuration::from_secs(60)
}

const fn default_registry_max_entries() -> usize {
    10_000
}

const fn default_jitter_factor() -> f64 {
    0.1
}

const fn default_true() -> bool {
    true
}

const fn default_http_window() -> WindowSettings {
    WindowSettings {
        requests_per_window: 100,
        window: ConfigDuration::from_secs(60),
        burst_capacity: 150,
    }
}

const fn default_ws_connection_window() -> WindowSettings {
    WindowSettings {
        requests_per_window: 10,
        window: ConfigDuration::from_secs(60),
        burst_capacity: 10,
    }
}

const fn default_ws_message_window() -> WindowSettings {
    WindowSettings {
        requests_per_window: 120,
        window: ConfigDuration::from_secs(60),
        burst_capacity: 200,
    }
}

const fn default_platform_max() -> u32 {
    10_000
}

const fn default_bucket_retention_factor() -> u32 {
    2
}

const fn default_check_threshold() -> ConfigDuration {
    ConfigDuration::from_secs(30)
}

const fn default_revocation_cache_capacity() -> usize {
    10_000
}

const fn default_revocation_cache_ttl() -> ConfigDuration {
    ConfigDuration::from_secs(60)
}

const fn default_bloom_expected_items() -> usize {
    100_000
}

const fn default_bloom_fp_rate() -> f64 {
    0.01
}

const fn default_rebuild_interval() -> ConfigDuration {
    ConfigDuration::from_secs(900)
}

const fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

const fn default_max_header_bytes() -> usize {
    8 * 1024
}

const fn default_max_total_headers_bytes() -> usize {
    64 * 1024
}

const fn default_request_timeout() -> ConfigDuration {
    ConfigDuration::from_secs(30)
}

fn default_token_issuer() -> String {
    "aussie-gateway".to_string()
}

const fn default_token_ttl() -> ConfigDuration {
    ConfigDuration::from_secs(120)
}

fn default_forwarded_claims() -> Vec<String> {
    vec![
        "email".to_string(),
        "name".to_string(),
        "groups".to_string(),
    ]
}

fn default_admin_permission() -> String {
    "gateway:admin".to_string()
}

const fn default_idle_timeout() -> ConfigDuration {
    ConfigDuration::from_secs(300)
}

const fn default_max_lifetime() -> ConfigDuration {
    ConfigDuration::from_secs(4 * 3600)
}

const fn default_ping_interval() -> ConfigDuration {
    ConfigDuration::from_secs(30)
}

const fn default_ping_timeout() -> ConfigDuration {
    ConfigDuration::from_secs(10)
}

const fn default_max_connections() -> usize {
    10_000
}

const fn default_redis_max_connections() -> usize {
    16
}

const fn default_connection_timeout() -> u64 {
    10
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_retry_delay() -> u64 {
    2
}
