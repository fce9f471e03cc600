//! # aussie-gateway
//!
//! Routing and policy-enforcement core for the Aussie API gateway. The
//! crate owns everything between an accepted request and the upstream
//! hop: the versioned service registry with TTL-cached snapshots, the
//! ordered policy gates (access control, size limits, authentication,
//! authorization, rate limiting, token revocation), proxy request
//! preparation, and the WebSocket upgrade path.
//!
//! The wire server, admin surface, identity providers, and persistent
//! stores stay outside; the core consumes them through the port traits
//! in each module and ships in-memory and Redis-backed implementations.
//!
//! ## Example
//!
//! ```rust,no_run
//! use aussie_gateway::prelude::*;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = GatewayConfig::load()?;
//!     init_tracing(&config)?;
//!
//!     let core = GatewayCore::builder(config)
//!         .token_validator(Arc::new(JwtValidator::from_secret(b"secret")))
//!         .token_issuer(Arc::new(JwtIssuer::from_secret(b"secret")))
//!         .build()
//!         .await?;
//!
//!     let shutdown = CancellationToken::new();
//!     core.start(shutdown.clone());
//!
//!     // The HTTP adapter turns wire requests into GatewayRequest
//!     // records and renders the returned GatewayOutcome.
//!     # let _ = (core, shutdown);
//!     Ok(())
//! }
//! ```

pub mod access;
pub mod auth;
pub mod cache;
pub mod config;
pub mod duration;
pub mod error;
pub mod gateway;
pub mod limits;
pub mod observability;
pub mod pattern;
pub mod proxy;
pub mod ratelimit;
pub mod registry;
pub mod revocation;
pub mod source;
pub mod trusted_proxy;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::access::{AccessDecision, AccessEvaluator};
    pub use crate::auth::{
        AussieToken, Claims, JwtIssuer, JwtValidator, RouteAuthResult, RouteAuthenticator,
        ServiceAuthorizer, TokenIssuer, TokenValidator,
    };
    pub use crate::config::{
        ForwardedHeaderFormat, GatewayConfig, RateLimitAlgorithm, RateLimitSettings,
        RegistryCacheConfig, RevocationConfig, WebSocketConfig,
    };
    pub use crate::duration::ConfigDuration;
    pub use crate::error::{Error, GatewayErrorBody, Result};
    pub use crate::gateway::{
        GatewayCore, GatewayHealth, GatewayOutcome, GatewayRequest, MessagePeer, SessionClose,
        WebSocketSession, WebSocketUpgradeResult, WsMessage,
    };
    pub use crate::limits::SizeValidator;
    pub use crate::observability::init_tracing;
    pub use crate::pattern::{MethodSet, PathPattern, RewriteTemplate};
    pub use crate::proxy::{
        ForwardedHeaderBuilder, HttpProxyClient, PreparedProxyRequest, ProxyClient, ProxyError,
        ProxyResponse,
    };
    pub use crate::ratelimit::{
        EffectiveRateLimit, InMemoryRateLimiter, RateLimitDecision, RateLimitKey, RateLimitKind,
        RateLimitResolver, RateLimiter,
    };
    pub use crate::registry::{
        EndpointConfig, EndpointType, RegistrationError, RouteLookup, RouteMatch,
        ServiceRegistration, ServiceRegistrationRepository, ServiceRegistry, Visibility,
        VisibilityRule,
    };
    pub use crate::revocation::{
        RevocationEvent, RevocationEventBus, RevocationPipeline, TokenRevocationRepository,
    };
    pub use crate::source::SourceIdentifier;
    pub use crate::trusted_proxy::TrustedProxies;

    #[cfg(feature = "redis")]
    pub use crate::ratelimit::RedisRateLimiter;
    #[cfg(feature = "redis")]
    pub use crate::revocation::{RedisEventBus, RedisRevocationRepository};
}
