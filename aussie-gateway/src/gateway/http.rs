//! The HTTP pipeline driver
//!
//! One pass per request, gates in fixed order: source resolution,
//! gateway-wide access, size limits, route lookup, visibility access,
//! authentication, rate limiting, preparation, forward. Each gate
//! short-circuits into a typed outcome.
//!
//! Gateway mode dispatches on endpoint patterns across the whole
//! registered set; pass-through mode dispatches on an explicit
//! `/{serviceId}/...` prefix with the reserved-ID check first.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::outcome::GatewayOutcome;
use super::{GatewayCore, GatewayRequest};
use crate::access::AccessDecision;
use crate::auth::RouteAuthResult;
use crate::proxy::{filter_response_headers, PreparedProxyRequest, ProxyError};
use crate::ratelimit::{EffectiveRateLimit, RateLimitKey, RateLimitKind};
use crate::registry::{
    is_reserved_service_id, normalize_path, RouteLookup, RouteMatch, RouteTable,
    ServiceRegistration, Visibility,
};
use crate::source::SourceIdentifier;

impl GatewayCore {
    /// Drive one HTTP request through the gateway pipeline
    pub async fn handle(
        &self,
        request: &GatewayRequest,
        cancel: &CancellationToken,
    ) -> GatewayOutcome {
        let source = match self.preflight(request) {
            Ok(source) => source,
            Err(outcome) => return outcome,
        };

        let path = normalize_path(request.path());
        let route = match self
            .registry
            .find_route_async(&path, request.method.as_str())
            .await
        {
            RouteLookup::Matched(route) => route,
            RouteLookup::ServiceOnly(service) => {
                // Known service, unknown endpoint: gateway mode rejects
                tracing::debug!(
                    service_id = %service.service_id,
                    %path,
                    "path claimed by service but no endpoint matched"
                );
                return GatewayOutcome::RouteNotFound { path };
            }
            RouteLookup::NotFound => {
                return GatewayOutcome::RouteNotFound { path };
            }
        };

        self.run_route(request, cancel, &source, &route).await
    }

    /// Drive one pass-through request (`/{serviceId}/...`)
    pub async fn handle_pass_through(
        &self,
        request: &GatewayRequest,
        cancel: &CancellationToken,
    ) -> GatewayOutcome {
        let source = match self.preflight(request) {
            Ok(source) => source,
            Err(outcome) => return outcome,
        };

        let path = normalize_path(request.path());
        let mut segments = path.trim_start_matches('/').splitn(2, '/');
        let Some(service_id) = segments.next().filter(|s| !s.is_empty()) else {
            return GatewayOutcome::RouteNotFound { path };
        };
        let remainder = format!("/{}", segments.next().unwrap_or(""));

        if is_reserved_service_id(service_id) {
            return GatewayOutcome::ReservedPath { path };
        }

        let table = self.registry.snapshot_fresh().await;
        let Some(service) = table.get(service_id) else {
            return GatewayOutcome::ServiceNotFound {
                service_id: service_id.to_string(),
            };
        };

        // Endpoint patterns still apply within the addressed service;
        // anything else falls back to the service defaults
        let scoped = RouteTable::from_arcs(vec![Arc::clone(service)]);
        match scoped.find_route(&remainder, request.method.as_str()) {
            RouteLookup::Matched(route) => self.run_route(request, cancel, &source, &route).await,
            _ => {
                self.run_service_fallback(request, cancel, &source, service, &remainder)
                    .await
            }
        }
    }

    /// Source resolution, gateway-wide access, and size limits
    pub(crate) fn preflight(
        &self,
        request: &GatewayRequest,
    ) -> Result<SourceIdentifier, GatewayOutcome> {
        let source = self.resolve_source(request);

        if let AccessDecision::Denied(reason) = self.access.evaluate_global(&source) {
            return Err(GatewayOutcome::AccessDenied { reason });
        }

        if let Err(violation) = self.sizes.validate(&request.headers, request.body_len()) {
            return Err(GatewayOutcome::Invalid {
                reason: violation.reason,
                suggested_status: violation.suggested_status,
            });
        }

        Ok(source)
    }

    /// The matched-route tail of the pipeline
    async fn run_route(
        &self,
        request: &GatewayRequest,
        cancel: &CancellationToken,
        source: &SourceIdentifier,
        route: &RouteMatch,
    ) -> GatewayOutcome {
        let visibility = route.resolved_visibility();
        if let AccessDecision::Denied(reason) =
            self.access
                .evaluate(source, visibility, route.service.access.as_ref())
        {
            return GatewayOutcome::AccessDenied { reason };
        }

        let token = match self.authenticator.authenticate(&request.headers, route).await {
            RouteAuthResult::NotRequired => None,
            RouteAuthResult::Authenticated(token) => Some(token),
            RouteAuthResult::Unauthorized(reason) => {
                return GatewayOutcome::Unauthorized { reason }
            }
            RouteAuthResult::Forbidden(reason) => return GatewayOutcome::Forbidden { reason },
        };

        let client_id = token
            .as_ref()
            .map(|t| t.subject.clone())
            .unwrap_or_else(|| source.ip.clone());
        let key = RateLimitKey::http(
            client_id,
            route.service.service_id.clone(),
            Some(route.endpoint().endpoint_id()),
        );
        let limit = self.resolver.resolve(
            RateLimitKind::Http,
            route.service.rate_limit.as_ref(),
            route.endpoint().rate_limit_override.as_ref(),
        );
        if let Some(outcome) = self.enforce_limit(&key, &limit).await {
            return outcome;
        }

        let prepared = match self.preparer.prepare(
            request,
            source,
            &route.service.base_url,
            &route.target_path,
            token.as_ref(),
            false,
        ) {
            Ok(prepared) => prepared,
            Err(e) => {
                return GatewayOutcome::Error {
                    message: e.to_string(),
                }
            }
        };

        self.forward(&prepared, cancel).await
    }

    /// Pass-through tail for a known service with no matching endpoint
    async fn run_service_fallback(
        &self,
        request: &GatewayRequest,
        cancel: &CancellationToken,
        source: &SourceIdentifier,
        service: &Arc<ServiceRegistration>,
        target_path: &str,
    ) -> GatewayOutcome {
        if let AccessDecision::Denied(reason) =
            self.access
                .evaluate(source, service.default_visibility, service.access.as_ref())
        {
            return GatewayOutcome::AccessDenied { reason };
        }

        let token = if service.default_auth_required {
            match self
                .authenticator
                .authenticate_required(&request.headers, &service.service_id)
                .await
            {
                RouteAuthResult::Authenticated(token) => Some(token),
                RouteAuthResult::NotRequired => None,
                RouteAuthResult::Unauthorized(reason) => {
                    return GatewayOutcome::Unauthorized { reason }
                }
                RouteAuthResult::Forbidden(reason) => return GatewayOutcome::Forbidden { reason },
            }
        } else {
            None
        };

        let client_id = token
            .as_ref()
            .map(|t| t.subject.clone())
            .unwrap_or_else(|| source.ip.clone());
        let key = RateLimitKey::http(client_id, service.service_id.clone(), None);
        let limit =
            self.resolver
                .resolve(RateLimitKind::Http, service.rate_limit.as_ref(), None);
        if let Some(outcome) = self.enforce_limit(&key, &limit).await {
            return outcome;
        }

        let prepared = match self.preparer.prepare(
            request,
            source,
            &service.base_url,
            target_path,
            token.as_ref(),
            false,
        ) {
            Ok(prepared) => prepared,
            Err(e) => {
                return GatewayOutcome::Error {
                    message: e.to_string(),
                }
            }
        };

        self.forward(&prepared, cancel).await
    }

    /// Consume one token from a bucket, turning rejection into an outcome
    pub(crate) async fn enforce_limit(
        &self,
        key: &RateLimitKey,
        limit: &EffectiveRateLimit,
    ) -> Option<GatewayOutcome> {
        if !self.limiter.is_enabled() {
            return None;
        }

        match self.limiter.check_and_consume(key, limit).await {
            Ok(decision) if decision.allowed => None,
            Ok(decision) => {
                tracing::debug!(
                    key = %key.storage_key(),
                    usage = decision.current_usage,
                    "rate limit exceeded"
                );
                Some(GatewayOutcome::RateLimited { decision })
            }
            Err(e) if self.config.rate_limit.fail_open => {
                tracing::warn!("rate limiter unavailable, failing open: {}", e);
                None
            }
            Err(e) => Some(GatewayOutcome::Error {
                message: format!("rate limiter unavailable: {}", e),
            }),
        }
    }

    /// Forward the prepared request and classify the result
    pub(crate) async fn forward(
        &self,
        prepared: &PreparedProxyRequest,
        cancel: &CancellationToken,
    ) -> GatewayOutcome {
        match self.client.forward(prepared, cancel).await {
            Ok(response) => GatewayOutcome::Success {
                status: response.status,
                headers: filter_response_headers(&response.headers),
                body: response.body,
            },
            Err(ProxyError::Timeout) => GatewayOutcome::GatewayTimeout,
            Err(ProxyError::Cancelled) => GatewayOutcome::Error {
                message: "request cancelled by client".to_string(),
            },
            Err(e) => GatewayOutcome::Error {
                message: e.to_string(),
            },
        }
    }

    /// Resolved visibility helper shared with the WebSocket pipeline
    pub(crate) fn check_route_access(
        &self,
        source: &SourceIdentifier,
        route: &RouteMatch,
    ) -> Result<Visibility, GatewayOutcome> {
        let visibility = route.resolved_visibility();
        match self
            .access
            .evaluate(source, visibility, route.service.access.as_ref())
        {
            AccessDecision::Allowed => Ok(visibility),
            AccessDecision::Denied(reason) => Err(GatewayOutcome::AccessDenied { reason }),
        }
    }
}
