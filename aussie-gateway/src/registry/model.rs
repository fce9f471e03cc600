//! Service registration records
//!
//! A [`ServiceRegistration`] is the value record identifying one backend:
//! its base URL, ordered endpoints, visibility and authentication
//! defaults, and the optional per-service policy overrides. Registrations
//! are versioned; every update must carry `current version + 1`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::duration::ConfigDuration;
use crate::pattern::{MethodSet, PathPattern, RewriteTemplate};

/// Service IDs refused in pass-through dispatch, compared
/// case-insensitively against the first path segment
pub const RESERVED_SERVICE_IDS: [&str; 3] = ["admin", "gateway", "q"];

/// Whether a service ID collides with the reserved set
pub fn is_reserved_service_id(id: &str) -> bool {
    RESERVED_SERVICE_IDS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(id))
}

/// Endpoint visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Visibility {
    /// Reachable by anyone
    Public,
    /// Subject to the access-control allow lists
    #[default]
    Private,
}

/// Protocol served by an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndpointType {
    #[default]
    Http,
    Websocket,
}

/// Partial `requests / window / burst` override
///
/// Absent fields inherit from the next level down in the resolution
/// hierarchy (endpoint inherits from service, service from platform).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RateLimitOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_window: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<ConfigDuration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_capacity: Option<u32>,
}

impl RateLimitOverride {
    /// Whether no field is set
    pub fn is_empty(&self) -> bool {
        self.requests_per_window.is_none() && self.window.is_none() && self.burst_capacity.is_none()
    }
}

/// Per-service rate-limit overrides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceRateLimitConfig {
    /// Override for HTTP requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<RateLimitOverride>,

    /// Override for WebSocket connection establishment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket_connection: Option<RateLimitOverride>,

    /// Override for WebSocket messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket_message: Option<RateLimitOverride>,
}

/// Per-service sampling hints, consumed by the telemetry collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Fraction of requests to sample, `0.0..=1.0`
    pub sample_rate: f64,

    /// Sample every errored request regardless of rate
    #[serde(default)]
    pub always_sample_errors: bool,
}

/// Per-service access-control overrides
///
/// Each list that is present fully replaces the global list for its
/// category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceAccessConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_ips: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_domains: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_subdomains: Option<Vec<String>>,
}

/// Permissions accepted for one operation; any single match suffices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OperationPermission {
    pub any_of: BTreeSet<String>,
}

impl OperationPermission {
    /// Build from permission names
    pub fn any_of<I, S>(permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            any_of: permissions.into_iter().map(Into::into).collect(),
        }
    }
}

/// Mapping from operation name to the permissions that allow it
///
/// An empty mapping is normalized away at registration time, making it
/// indistinguishable from an absent policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ServicePermissionPolicy {
    pub operations: BTreeMap<String, OperationPermission>,
}

impl ServicePermissionPolicy {
    /// Whether the policy grants nothing
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// The permissions accepted for an operation, when listed
    pub fn permissions_for(&self, operation: &str) -> Option<&OperationPermission> {
        self.operations.get(operation)
    }
}

/// A visibility rule layered over the endpoint sequence
///
/// The first rule whose pattern and method match overrides the matched
/// endpoint's visibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibilityRule {
    pub path_pattern: PathPattern,
    pub methods: MethodSet,
    pub visibility: Visibility,
}

/// One routable endpoint within a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Pattern matched against the request path
    pub path_pattern: PathPattern,

    /// Accepted methods; `*` matches any
    pub methods: MethodSet,

    /// Endpoint visibility; absent inherits the service default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,

    /// Rewrite applied to produce the upstream path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_rewrite_template: Option<RewriteTemplate>,

    /// Whether a validated identity is required; absent inherits the
    /// service default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_required: Option<bool>,

    /// HTTP or WebSocket
    #[serde(default)]
    pub endpoint_type: EndpointType,

    /// Endpoint-level rate-limit override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_override: Option<RateLimitOverride>,

    /// Audience stamped on re-issued identity tokens; absent uses the
    /// service ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
}

impl EndpointConfig {
    /// Minimal endpoint accepting the given methods on a pattern
    pub fn new(path_pattern: PathPattern, methods: MethodSet) -> Self {
        Self {
            path_pattern,
            methods,
            visibility: None,
            path_rewrite_template: None,
            auth_required: None,
            endpoint_type: EndpointType::default(),
            rate_limit_override: None,
            audience: None,
        }
    }

    /// Stable identifier for rate-limit accounting
    pub fn endpoint_id(&self) -> String {
        format!(
            "{}|{}",
            self.methods.names().join(","),
            self.path_pattern.as_str()
        )
    }
}

/// A registered backend service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    /// Unique, case-sensitive identifier
    pub service_id: String,

    /// Absolute `http` or `https` base URL
    pub base_url: String,

    /// Monotonic version; first registration is 1
    pub version: u64,

    /// Ordered endpoint sequence; first match wins
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    /// Visibility for endpoints that do not declare their own
    #[serde(default)]
    pub default_visibility: Visibility,

    /// Authentication default for endpoints that do not declare their own
    #[serde(default)]
    pub default_auth_required: bool,

    /// Visibility overrides applied on top of the endpoint sequence
    #[serde(default)]
    pub visibility_rules: Vec<VisibilityRule>,

    /// Operation permissions; absent falls back to the platform default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_policy: Option<ServicePermissionPolicy>,

    /// Per-service rate-limit overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<ServiceRateLimitConfig>,

    /// Per-service sampling hints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<SamplingConfig>,

    /// Per-service access-control overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<ServiceAccessConfig>,

    /// First-registration timestamp; fixed across updates and used for
    /// stable iteration order
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
}

impl ServiceRegistration {
    /// Start building a registration at version 1
    pub fn builder(service_id: impl Into<String>, base_url: impl Into<String>) -> ServiceRegistrationBuilder {
        ServiceRegistrationBuilder::new(service_id, base_url)
    }

    /// The effective permission policy, with empty normalized to absent
    pub fn effective_permission_policy(&self) -> Option<&ServicePermissionPolicy> {
        self.permission_policy.as_ref().filter(|p| !p.is_empty())
    }
}

/// Staged constructor for [`ServiceRegistration`]
#[derive(Debug, Clone)]
pub struct ServiceRegistrationBuilder {
    registration: ServiceRegistration,
}

impl ServiceRegistrationBuilder {
    fn new(service_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            registration: ServiceRegistration {
                service_id: service_id.into(),
                base_url: base_url.into(),
                version: 1,
                endpoints: Vec::new(),
                default_visibility: Visibility::default(),
                default_auth_required: false,
                visibility_rules: Vec::new(),
                permission_policy: None,
                rate_limit: None,
                sampling: None,
                access: None,
                registered_at: Utc::now(),
            },
        }
    }

    /// Set the registration version (defaults to 1)
    pub fn version(mut self, version: u64) -> Self {
        self.registration.version = version;
        self
    }

    /// Append an endpoint; declaration order is match order
    pub fn endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.registration.endpoints.push(endpoint);
        self
    }

    /// Set the default visibility
    pub fn default_visibility(mut self, visibility: Visibility) -> Self {
        self.registration.default_visibility = visibility;
        self
    }

    /// Set the default authentication requirement
    pub fn default_auth_required(mut self, required: bool) -> Self {
        self.registration.default_auth_required = required;
        self
    }

    /// Append a visibility rule
    pub fn visibility_rule(mut self, rule: VisibilityRule) -> Self {
        self.registration.visibility_rules.push(rule);
        self
    }

    /// Set the permission policy
    pub fn permission_policy(mut self, policy: ServicePermissionPolicy) -> Self {
        self.registration.permission_policy = Some(policy);
        self
    }

    /// Set the per-service rate-limit overrides
    pub fn rate_limit(mut self, config: ServiceRateLimitConfig) -> Self {
        self.registration.rate_limit = Some(config);
        self
    }

    /// Set the sampling hints
    pub fn sampling(mut self, config: SamplingConfig) -> Self {
        self.registration.sampling = Some(config);
        self
    }

    /// Set the per-service access-control overrides
    pub fn access(mut self, config: ServiceAccessConfig) -> Self {
        self.registration.access = Some(config);
        self
    }

    /// Finish building
    pub fn build(self) -> ServiceRegistration {
        self.registration
    }
}
