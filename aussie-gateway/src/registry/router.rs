//! Route lookup over a registry snapshot
//!
//! A [`RouteTable`] is an immutable view of the registered services,
//! ordered by registration time. Lookup walks services in that order
//! and each service's endpoints in declared order; the first endpoint
//! whose method set and pattern both match wins.

use std::sync::Arc;

use super::model::{EndpointConfig, ServiceRegistration, Visibility};
use crate::pattern::PathVariables;

/// Normalize a request path for matching
///
/// Empty input becomes `/`; a missing leading slash is prepended.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// The result of a route lookup
#[derive(Debug, Clone)]
pub enum RouteLookup {
    /// A service and one of its endpoints matched
    Matched(RouteMatch),

    /// A service claimed the path prefix but no endpoint matched
    ///
    /// Surfaced so downstream logic can attribute a 404 to the service,
    /// or apply service-level policy in pass-through mode.
    ServiceOnly(Arc<ServiceRegistration>),

    /// No service claims any prefix of the path
    NotFound,
}

impl RouteLookup {
    /// The matched route, when there is one
    pub fn as_match(&self) -> Option<&RouteMatch> {
        match self {
            RouteLookup::Matched(m) => Some(m),
            _ => None,
        }
    }
}

/// A fully resolved route
#[derive(Debug, Clone)]
pub struct RouteMatch {
    /// The owning service
    pub service: Arc<ServiceRegistration>,

    /// Index of the matched endpoint within the service
    endpoint_index: usize,

    /// Upstream path after rewrite (the matched path when no template)
    pub target_path: String,

    /// Variables captured by the pattern
    pub path_variables: PathVariables,

    /// The normalized request path that matched
    pub matched_path: String,

    /// The request method
    pub method: String,
}

impl RouteMatch {
    /// The matched endpoint
    pub fn endpoint(&self) -> &EndpointConfig {
        &self.service.endpoints[self.endpoint_index]
    }

    /// Endpoint visibility after applying the service's visibility rules
    ///
    /// The endpoint's own visibility (or the service default) applies
    /// unless a visibility rule's pattern and method match the request,
    /// in which case the first such rule wins.
    pub fn resolved_visibility(&self) -> Visibility {
        for rule in &self.service.visibility_rules {
            if rule.methods.matches(&self.method)
                && rule.path_pattern.matches(&self.matched_path).is_some()
            {
                return rule.visibility;
            }
        }
        self.endpoint()
            .visibility
            .unwrap_or(self.service.default_visibility)
    }

    /// Whether the route requires an authenticated identity
    pub fn auth_required(&self) -> bool {
        self.endpoint()
            .auth_required
            .unwrap_or(self.service.default_auth_required)
    }

    /// Audience for re-issued identity tokens
    pub fn audience(&self) -> &str {
        self.endpoint()
            .audience
            .as_deref()
            .unwrap_or(&self.service.service_id)
    }
}

/// An immutable, ordered view of the registered services
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    services: Vec<Arc<ServiceRegistration>>,
}

impl RouteTable {
    /// Build a table, ordering services by registration time
    pub fn new(mut services: Vec<ServiceRegistration>) -> Self {
        services.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.service_id.cmp(&b.service_id))
        });
        Self {
            services: services.into_iter().map(Arc::new).collect(),
        }
    }

    /// The empty table
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a table over already-shared registrations, keeping order
    ///
    /// Used for scoped lookups (pass-through dispatch matches within a
    /// single service).
    pub(crate) fn from_arcs(services: Vec<Arc<ServiceRegistration>>) -> Self {
        Self { services }
    }

    /// Number of services in the table
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the table holds no services
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// The services in iteration order
    pub fn services(&self) -> &[Arc<ServiceRegistration>] {
        &self.services
    }

    /// Look up a service by ID (case-sensitive)
    pub fn get(&self, service_id: &str) -> Option<&Arc<ServiceRegistration>> {
        self.services.iter().find(|s| s.service_id == service_id)
    }

    /// Copy-on-write insert or replace
    pub fn with_upsert(&self, registration: ServiceRegistration) -> Self {
        let mut services: Vec<ServiceRegistration> = self
            .services
            .iter()
            .filter(|s| s.service_id != registration.service_id)
            .map(|s| (**s).clone())
            .collect();
        services.push(registration);
        Self::new(services)
    }

    /// Copy-on-write removal
    pub fn with_removed(&self, service_id: &str) -> Self {
        Self {
            services: self
                .services
                .iter()
                .filter(|s| s.service_id != service_id)
                .cloned()
                .collect(),
        }
    }

    /// First-match route lookup
    pub fn find_route(&self, path: &str, method: &str) -> RouteLookup {
        let path = normalize_path(path);

        for service in &self.services {
            for (index, endpoint) in service.endpoints.iter().enumerate() {
                if !endpoint.methods.matches(method) {
                    continue;
                }
                let Some(vars) = endpoint.path_pattern.matches(&path) else {
                    continue;
                };

                let target_path = match &endpoint.path_rewrite_template {
                    Some(template) => template.apply(&vars).unwrap_or_else(|e| {
                        tracing::debug!("rewrite failed for '{}': {}", path, e);
                        path.clone()
                    }),
                    None => path.clone(),
                };

                return RouteLookup::Matched(RouteMatch {
                    service: Arc::clone(service),
                    endpoint_index: index,
                    target_path,
                    path_variables: vars,
                    matched_path: path,
                    method: method.to_ascii_uppercase(),
                });
            }
        }

        // No endpoint matched; attribute the path to a service when
        // exactly one claims its prefix
        let mut claimants = self
            .services
            .iter()
            .filter(|service| service_claims_path(service, &path));
        match (claimants.next(), claimants.next()) {
            (Some(service), None) => RouteLookup::ServiceOnly(Arc::clone(service)),
            _ => RouteLookup::NotFound,
        }
    }
}

/// Whether any of the service's endpoint patterns shares a non-root
/// literal prefix with the path, at a segment boundary
fn service_claims_path(service: &ServiceRegistration, path: &str) -> bool {
    service.endpoints.iter().any(|endpoint| {
        let prefix = endpoint.path_pattern.literal_prefix();
        prefix != "/" && (path == prefix || path.starts_with(&format!("{}/", prefix)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{MethodSet, PathPattern, RewriteTemplate};
    use crate::registry::model::VisibilityRule;

    fn endpoint(pattern: &str, methods: &[&str]) -> EndpointConfig {
        EndpointConfig::new(
            PathPattern::parse(pattern).unwrap(),
            MethodSet::new(methods.iter().copied()),
        )
    }

    fn service(id: &str, endpoints: Vec<EndpointConfig>) -> ServiceRegistration {
        let mut builder = ServiceRegistration::builder(id, "http://backend:9090");
        for e in endpoints {
            builder = builder.endpoint(e);
        }
        builder.build()
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("  "), "/");
        assert_eq!(normalize_path("api/x"), "/api/x");
        assert_eq!(normalize_path("/api/x"), "/api/x");
    }

    #[test]
    fn test_first_declared_endpoint_wins() {
        let table = RouteTable::new(vec![service(
            "svc",
            vec![endpoint("/api/**", &["GET"]), endpoint("/api/items", &["GET"])],
        )]);

        let RouteLookup::Matched(m) = table.find_route("/api/items", "GET") else {
            panic!("expected a match");
        };
        assert_eq!(m.endpoint().path_pattern.as_str(), "/api/**");
    }

    #[test]
    fn test_first_registered_service_wins() {
        let mut first = service("first", vec![endpoint("/api/x", &["GET"])]);
        let mut second = service("second", vec![endpoint("/api/x", &["GET"])]);
        first.registered_at = chrono::Utc::now() - chrono::Duration::hours(1);
        second.registered_at = chrono::Utc::now();

        // Construction order must not matter, only registration time
        let table = RouteTable::new(vec![second, first]);
        let m = table.find_route("/api/x", "GET");
        assert_eq!(m.as_match().unwrap().service.service_id, "first");
    }

    #[test]
    fn test_method_mismatch_yields_service_only() {
        let table = RouteTable::new(vec![service("svc", vec![endpoint("/api/x", &["GET"])])]);
        match table.find_route("/api/x", "POST") {
            RouteLookup::ServiceOnly(s) => assert_eq!(s.service_id, "svc"),
            other => panic!("expected ServiceOnly, got {:?}", other),
        }
    }

    #[test]
    fn test_unclaimed_path_not_found() {
        let table = RouteTable::new(vec![service("svc", vec![endpoint("/api/x", &["GET"])])]);
        assert!(matches!(
            table.find_route("/other/path", "GET"),
            RouteLookup::NotFound
        ));
    }

    #[test]
    fn test_ambiguous_claim_not_found() {
        // Both services claim the "/api/shared" prefix; with no endpoint
        // match the path cannot be attributed to either one
        let a = service("a", vec![endpoint("/api/shared/{x}", &["GET"])]);
        let b = service("b", vec![endpoint("/api/shared/{y}", &["POST"])]);
        let table = RouteTable::new(vec![a, b]);

        assert!(matches!(
            table.find_route("/api/shared/zzz", "DELETE"),
            RouteLookup::NotFound
        ));
    }

    #[test]
    fn test_prefix_claim_respects_segment_boundary() {
        let table = RouteTable::new(vec![service("svc", vec![endpoint("/api/items/{id}", &["GET"])])]);
        match table.find_route("/api/items", "DELETE") {
            RouteLookup::ServiceOnly(s) => assert_eq!(s.service_id, "svc"),
            other => panic!("expected ServiceOnly, got {:?}", other),
        }
        assert!(matches!(
            table.find_route("/api/itemsextra", "GET"),
            RouteLookup::NotFound
        ));
    }

    #[test]
    fn test_rewrite_applied() {
        let mut e = endpoint("/api/v1/users/{userId}", &["GET"]);
        e.path_rewrite_template = Some(RewriteTemplate::parse("/users/{userId}").unwrap());
        let table = RouteTable::new(vec![service("users", vec![e])]);

        let m = table.find_route("/api/v1/users/123", "GET");
        let m = m.as_match().unwrap();
        assert_eq!(m.target_path, "/users/123");
        assert_eq!(
            m.path_variables.get("userId").map(String::as_str),
            Some("123")
        );
    }

    #[test]
    fn test_no_rewrite_keeps_matched_path() {
        let table = RouteTable::new(vec![service("svc", vec![endpoint("/api/items", &["GET"])])]);
        let m = table.find_route("/api/items", "GET");
        assert_eq!(m.as_match().unwrap().target_path, "/api/items");
    }

    #[test]
    fn test_visibility_rule_overrides_endpoint() {
        let mut e = endpoint("/api/items/{id}", &["GET", "DELETE"]);
        e.visibility = Some(Visibility::Public);
        let mut svc = service("svc", vec![e]);
        svc.visibility_rules.push(VisibilityRule {
            path_pattern: PathPattern::parse("/api/items/*").unwrap(),
            methods: MethodSet::new(["DELETE"]),
            visibility: Visibility::Private,
        });
        let table = RouteTable::new(vec![svc]);

        let m = table.find_route("/api/items/7", "GET");
        assert_eq!(m.as_match().unwrap().resolved_visibility(), Visibility::Public);

        let m = table.find_route("/api/items/7", "DELETE");
        assert_eq!(m.as_match().unwrap().resolved_visibility(), Visibility::Private);
    }

    #[test]
    fn test_auth_and_audience_fallbacks() {
        let mut e = endpoint("/api/a", &["GET"]);
        e.auth_required = Some(true);
        e.audience = Some("custom-aud".to_string());
        let svc = service("svc", vec![e, endpoint("/api/b", &["GET"])]);
        let table = RouteTable::new(vec![svc]);

        let m = table.find_route("/api/a", "GET");
        let m = m.as_match().unwrap();
        assert!(m.auth_required());
        assert_eq!(m.audience(), "custom-aud");

        let m = table.find_route("/api/b", "GET");
        let m = m.as_match().unwrap();
        assert!(!m.auth_required());
        assert_eq!(m.audience(), "svc");
    }

    #[test]
    fn test_upsert_and_remove() {
        let table = RouteTable::new(vec![service("svc", vec![endpoint("/api/x", &["GET"])])]);

        let updated = table.with_upsert(service("other", vec![endpoint("/other/y", &["GET"])]));
        assert_eq!(updated.len(), 2);
        assert!(updated.find_route("/other/y", "GET").as_match().is_some());

        let removed = updated.with_removed("svc");
        assert_eq!(removed.len(), 1);
        assert!(matches!(
            removed.find_route("/api/x", "GET"),
            RouteLookup::NotFound
        ));
    }
}
