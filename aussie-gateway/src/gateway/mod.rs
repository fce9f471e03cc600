//! The gateway core
//!
//! [`GatewayCore`] composes every policy component behind two entry
//! points: [`GatewayCore::handle`] drives the HTTP pipeline and
//! [`GatewayCore::upgrade`] the WebSocket one. It is built once at
//! startup, holds all process-wide state, and is passed by reference
//! into each request task.

pub mod http;
pub mod outcome;
pub mod websocket;

pub use outcome::GatewayOutcome;
pub use websocket::{MessagePeer, SessionClose, WebSocketSession, WebSocketUpgradeResult, WsMessage};

use bytes::Bytes;
use http_types::{HeaderMap, Method, Uri};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::access::AccessEvaluator;
use crate::auth::{
    DisabledTokenBackend, RouteAuthenticator, ServiceAuthorizer, TokenIssuer, TokenValidator,
};
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::limits::SizeValidator;
use crate::proxy::{HttpProxyClient, ProxyClient, ProxyRequestPreparer};
use crate::ratelimit::{InMemoryRateLimiter, RateLimitResolver, RateLimiter};
use crate::registry::{InMemoryServiceRepository, ServiceRegistrationRepository, ServiceRegistry};
use crate::revocation::{
    InMemoryRevocationRepository, InProcessEventBus, RevocationEventBus, RevocationPipeline,
    TokenRevocationRepository,
};
use crate::source::SourceIdentifier;
use crate::trusted_proxy::TrustedProxies;

// The http crate is shadowed by this module's name inside `gateway::`
use ::http as http_types;

/// One incoming request as the core sees it
///
/// The wire server adapts its own request type into this record; the
/// body is fully buffered by the time the pipeline runs so the size
/// gate can see it.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub peer_addr: Option<IpAddr>,
}

impl GatewayRequest {
    /// A request with no headers, body, or peer
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: None,
            peer_addr: None,
        }
    }

    /// The request path
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Buffered body length in bytes
    pub fn body_len(&self) -> usize {
        self.body.as_ref().map(Bytes::len).unwrap_or(0)
    }
}

/// Point-in-time operational snapshot
#[derive(Debug, Clone, Serialize)]
pub struct GatewayHealth {
    /// Services in the local registry snapshot
    pub services: usize,

    /// Seconds since the registry snapshot last refreshed
    pub registry_snapshot_age_secs: u64,

    /// Approximate revocation filter population
    pub revocation_filter_population: usize,

    /// Whether the rate limiter is enforcing
    pub rate_limiter_enabled: bool,

    /// Live WebSocket sessions on this instance
    pub active_websocket_sessions: usize,
}

/// The assembled gateway core
pub struct GatewayCore {
    pub(crate) config: GatewayConfig,
    pub(crate) registry: Arc<ServiceRegistry>,
    pub(crate) trusted_proxies: TrustedProxies,
    pub(crate) access: AccessEvaluator,
    pub(crate) sizes: SizeValidator,
    pub(crate) authenticator: RouteAuthenticator,
    pub(crate) resolver: RateLimitResolver,
    pub(crate) limiter: Arc<dyn RateLimiter>,
    pub(crate) revocation: Arc<RevocationPipeline>,
    pub(crate) preparer: ProxyRequestPreparer,
    pub(crate) client: Arc<dyn ProxyClient>,
    pub(crate) ws_active: Arc<AtomicUsize>,
}

impl GatewayCore {
    /// Start building a core from configuration
    pub fn builder(config: GatewayConfig) -> GatewayCoreBuilder {
        GatewayCoreBuilder::new(config)
    }

    /// The service registry, for the admin surface
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// The revocation pipeline, for the admin surface
    pub fn revocation(&self) -> &Arc<RevocationPipeline> {
        &self.revocation
    }

    /// The rate limiter, for status inspection
    pub fn rate_limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.limiter
    }

    /// Start background work (revocation events and filter rebuilds)
    pub fn start(&self, cancel: CancellationToken) {
        self.revocation.start(cancel);
    }

    /// The operational health snapshot
    pub async fn health(&self) -> GatewayHealth {
        GatewayHealth {
            services: self.registry.snapshot().len(),
            registry_snapshot_age_secs: self.registry.snapshot_age().await.as_secs(),
            revocation_filter_population: self.revocation.filter_population(),
            rate_limiter_enabled: self.limiter.is_enabled(),
            active_websocket_sessions: self.ws_active.load(Ordering::Relaxed),
        }
    }

    /// Resolve the client identity for a request
    pub(crate) fn resolve_source(&self, request: &GatewayRequest) -> SourceIdentifier {
        let trusted = self.trusted_proxies.is_trusted_peer(request.peer_addr);
        SourceIdentifier::resolve(&request.headers, &request.uri, request.peer_addr, trusted)
    }
}

/// Staged construction for [`GatewayCore`]
///
/// Every port has an in-memory default so tests and single-instance
/// deployments assemble with nothing but configuration; production
/// installs its shared backends explicitly. With the `redis` feature
/// and a `[redis]` config section, the rate limiter, revocation store,
/// and event bus default to Redis-backed implementations instead.
pub struct GatewayCoreBuilder {
    config: GatewayConfig,
    service_repository: Option<Arc<dyn ServiceRegistrationRepository>>,
    revocation_repository: Option<Arc<dyn TokenRevocationRepository>>,
    event_bus: Option<Arc<dyn RevocationEventBus>>,
    token_validator: Option<Arc<dyn TokenValidator>>,
    token_issuer: Option<Arc<dyn TokenIssuer>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    proxy_client: Option<Arc<dyn ProxyClient>>,
}

impl GatewayCoreBuilder {
    fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            service_repository: None,
            revocation_repository: None,
            event_bus: None,
            token_validator: None,
            token_issuer: None,
            rate_limiter: None,
            proxy_client: None,
        }
    }

    /// Install the authoritative service store
    pub fn service_repository(mut self, repository: Arc<dyn ServiceRegistrationRepository>) -> Self {
        self.service_repository = Some(repository);
        self
    }

    /// Install the authoritative revocation store
    pub fn revocation_repository(mut self, repository: Arc<dyn TokenRevocationRepository>) -> Self {
        self.revocation_repository = Some(repository);
        self
    }

    /// Install the cross-instance revocation event bus
    pub fn event_bus(mut self, bus: Arc<dyn RevocationEventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Install the incoming-token validator
    pub fn token_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.token_validator = Some(validator);
        self
    }

    /// Install the identity-token signer
    pub fn token_issuer(mut self, issuer: Arc<dyn TokenIssuer>) -> Self {
        self.token_issuer = Some(issuer);
        self
    }

    /// Install the limiter backend
    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Install the upstream client
    pub fn proxy_client(mut self, client: Arc<dyn ProxyClient>) -> Self {
        self.proxy_client = Some(client);
        self
    }

    /// Assemble the core
    pub async fn build(self) -> Result<Arc<GatewayCore>> {
        let config = self.config;

        #[cfg(feature = "redis")]
        let redis_pool = match &config.redis {
            Some(redis_config) => Some(crate::cache::create_pool(redis_config).await?),
            None => None,
        };

        let service_repository = self
            .service_repository
            .unwrap_or_else(|| Arc::new(InMemoryServiceRepository::new()));

        let revocation_repository = self.revocation_repository.unwrap_or_else(|| {
            #[cfg(feature = "redis")]
            if let Some(pool) = &redis_pool {
                return Arc::new(crate::revocation::RedisRevocationRepository::new(pool.clone()))
                    as Arc<dyn TokenRevocationRepository>;
            }
            Arc::new(InMemoryRevocationRepository::new())
        });

        let event_bus = match self.event_bus {
            Some(bus) => bus,
            None => {
                #[cfg(feature = "redis")]
                let bus: Arc<dyn RevocationEventBus> = match (&redis_pool, &config.redis) {
                    (Some(pool), Some(redis_config)) => Arc::new(
                        crate::revocation::RedisEventBus::new(pool.clone(), &redis_config.url)?,
                    ),
                    _ => Arc::new(InProcessEventBus::new()),
                };
                #[cfg(not(feature = "redis"))]
                let bus: Arc<dyn RevocationEventBus> = Arc::new(InProcessEventBus::new());
                bus
            }
        };

        let limiter = match self.rate_limiter {
            Some(limiter) => limiter,
            None => {
                #[cfg(feature = "redis")]
                let limiter: Arc<dyn RateLimiter> = match &redis_pool {
                    Some(pool) => Arc::new(crate::ratelimit::RedisRateLimiter::new(
                        pool.clone(),
                        &config.rate_limit,
                    )),
                    None => Arc::new(InMemoryRateLimiter::new(&config.rate_limit)),
                };
                #[cfg(not(feature = "redis"))]
                let limiter: Arc<dyn RateLimiter> =
                    Arc::new(InMemoryRateLimiter::new(&config.rate_limit));
                limiter
            }
        };

        let client = match self.proxy_client {
            Some(client) => client,
            None => Arc::new(HttpProxyClient::new(&config.proxy)?),
        };

        let validator = self
            .token_validator
            .unwrap_or_else(|| Arc::new(DisabledTokenBackend));
        let issuer = self
            .token_issuer
            .unwrap_or_else(|| Arc::new(DisabledTokenBackend));

        let registry = Arc::new(ServiceRegistry::new(
            service_repository,
            ServiceAuthorizer::new(&config.auth),
            &config.registry,
        ));

        let revocation = Arc::new(RevocationPipeline::new(
            revocation_repository,
            event_bus,
            config.revocation.clone(),
        ));

        let authenticator = RouteAuthenticator::new(
            validator,
            issuer,
            Arc::clone(&revocation),
            config.auth.clone(),
        );

        Ok(Arc::new(GatewayCore {
            trusted_proxies: TrustedProxies::new(&config.trusted_proxies),
            access: AccessEvaluator::new(&config.access_control),
            sizes: SizeValidator::new(config.size_limits.clone()),
            resolver: RateLimitResolver::new(config.rate_limit.clone()),
            preparer: ProxyRequestPreparer::new(config.proxy.forwarded_header_format),
            registry,
            authenticator,
            limiter,
            revocation,
            client,
            ws_active: Arc::new(AtomicUsize::new(0)),
            config,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builder_defaults_assemble() {
        let core = GatewayCore::builder(GatewayConfig::default()).build().await.unwrap();
        let health = core.health().await;
        assert_eq!(health.services, 0);
        assert!(health.rate_limiter_enabled);
        assert_eq!(health.active_websocket_sessions, 0);
    }

    #[test]
    fn test_gateway_request_helpers() {
        let mut request = GatewayRequest::new(Method::GET, "/api/items?x=1".parse().unwrap());
        assert_eq!(request.path(), "/api/items");
        assert_eq!(request.body_len(), 0);

        request.body = Some(Bytes::from_static(b"hello"));
        assert_eq!(request.body_len(), 5);
    }
}
