//! Service registry
//!
//! Owns the service set. Reads are served from a local snapshot that
//! refreshes from the authoritative repository once its TTL (plus a
//! per-instance jitter) elapses; concurrent stale readers coalesce onto
//! a single in-flight refresh. Writes validate, enforce optimistic
//! version concurrency, persist, and update the local snapshot
//! immediately so the writing instance reads its own writes.

pub mod model;
pub mod repository;
pub mod router;
pub mod validate;

pub use model::{
    is_reserved_service_id, EndpointConfig, EndpointType, OperationPermission, RateLimitOverride,
    SamplingConfig, ServiceAccessConfig, ServicePermissionPolicy, ServiceRateLimitConfig,
    ServiceRegistration, ServiceRegistrationBuilder, Visibility, VisibilityRule,
    RESERVED_SERVICE_IDS,
};
pub use repository::{InMemoryServiceRepository, ServiceRegistrationRepository};
pub use router::{normalize_path, RouteLookup, RouteMatch, RouteTable};
pub use validate::validate_registration;

use arc_swap::ArcSwap;
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};

use crate::auth::{operations, ServiceAuthorizer};
use crate::config::RegistryCacheConfig;
use crate::error::Result;

/// A failed registry mutation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// The record itself is malformed (400)
    #[error("invalid registration: {0}")]
    Validation(String),

    /// Version or uniqueness conflict (409)
    #[error("registration conflict: {0}")]
    Conflict(String),

    /// The actor lacks authority for the mutation (403)
    #[error("registration forbidden: {0}")]
    Forbidden(String),

    /// The authoritative store failed (500)
    #[error("registration storage failure: {0}")]
    Storage(String),
}

impl RegistrationError {
    /// The HTTP status the admin surface should render
    pub fn status(&self) -> u16 {
        match self {
            RegistrationError::Validation(_) => 400,
            RegistrationError::Conflict(_) => 409,
            RegistrationError::Forbidden(_) => 403,
            RegistrationError::Storage(_) => 500,
        }
    }

    /// The failure reason
    pub fn reason(&self) -> &str {
        match self {
            RegistrationError::Validation(reason)
            | RegistrationError::Conflict(reason)
            | RegistrationError::Forbidden(reason)
            | RegistrationError::Storage(reason) => reason,
        }
    }
}

struct SnapshotState {
    fresh_until: Option<Instant>,
    refreshed_at: Instant,
    inflight: Option<watch::Receiver<()>>,
}

/// A TTL-bounded snapshot with coalesced refresh
///
/// Readers load lock-free; a stale read elects one refresher and every
/// concurrent stale reader awaits the same refresh. A failed refresh
/// keeps the previous snapshot and clears the in-flight handle so the
/// next reader retries.
struct CachedSnapshot<T> {
    current: ArcSwap<T>,
    state: Mutex<SnapshotState>,
    ttl: Duration,
    jitter_factor: f64,
}

enum RefreshRole {
    Fresh,
    Waiter(watch::Receiver<()>),
    Refresher(watch::Sender<()>),
}

impl<T: Send + Sync + 'static> CachedSnapshot<T> {
    fn new(initial: T, ttl: Duration, jitter_factor: f64) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            state: Mutex::new(SnapshotState {
                fresh_until: None,
                refreshed_at: Instant::now(),
                inflight: None,
            }),
            ttl,
            jitter_factor: jitter_factor.max(0.0),
        }
    }

    fn load(&self) -> Arc<T> {
        self.current.load_full()
    }

    /// Replace the snapshot after a local write, leaving freshness as-is
    fn store(&self, value: T) {
        self.current.store(Arc::new(value));
    }

    async fn age(&self) -> Duration {
        self.state.lock().await.refreshed_at.elapsed()
    }

    /// Mark the snapshot stale so the next read refreshes
    async fn invalidate(&self) {
        self.state.lock().await.fresh_until = None;
    }

    fn jittered_ttl(&self) -> Duration {
        let jitter = self.ttl.as_secs_f64() * self.jitter_factor * rand::random::<f64>();
        self.ttl + Duration::from_secs_f64(jitter)
    }

    async fn get_fresh<F, Fut>(&self, refresh: F) -> Arc<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let role = {
            let mut state = self.state.lock().await;
            match state.fresh_until {
                Some(fresh_until) if Instant::now() < fresh_until => RefreshRole::Fresh,
                _ => match &state.inflight {
                    Some(receiver) => RefreshRole::Waiter(receiver.clone()),
                    None => {
                        let (sender, receiver) = watch::channel(());
                        state.inflight = Some(receiver);
                        RefreshRole::Refresher(sender)
                    }
                },
            }
        };

        match role {
            RefreshRole::Fresh => self.load(),
            RefreshRole::Waiter(mut receiver) => {
                // A closed channel means the refresher finished (or failed);
                // either way the current snapshot is the answer
                let _ = receiver.changed().await;
                self.load()
            }
            RefreshRole::Refresher(sender) => {
                let outcome = refresh().await;
                {
                    let mut state = self.state.lock().await;
                    match outcome {
                        Ok(value) => {
                            self.current.store(Arc::new(value));
                            state.fresh_until = Some(Instant::now() + self.jittered_ttl());
                            state.refreshed_at = Instant::now();
                        }
                        Err(e) => {
                            tracing::warn!("snapshot refresh failed, serving previous: {}", e);
                        }
                    }
                    state.inflight = None;
                }
                drop(sender);
                self.load()
            }
        }
    }
}

/// The versioned, multi-instance-coherent service registry
pub struct ServiceRegistry {
    repository: Arc<dyn ServiceRegistrationRepository>,
    authorizer: ServiceAuthorizer,
    routes: CachedSnapshot<RouteTable>,
    rate_limits: CachedSnapshot<HashMap<String, ServiceRateLimitConfig>>,
    sampling: CachedSnapshot<HashMap<String, SamplingConfig>>,
    write_lock: Mutex<()>,
    max_entries: usize,
}

impl ServiceRegistry {
    pub fn new(
        repository: Arc<dyn ServiceRegistrationRepository>,
        authorizer: ServiceAuthorizer,
        config: &RegistryCacheConfig,
    ) -> Self {
        Self {
            repository,
            authorizer,
            routes: CachedSnapshot::new(
                RouteTable::empty(),
                config.service_routes_ttl.duration(),
                config.jitter_factor,
            ),
            rate_limits: CachedSnapshot::new(
                HashMap::new(),
                config.rate_limit_config_ttl.duration(),
                config.jitter_factor,
            ),
            sampling: CachedSnapshot::new(
                HashMap::new(),
                config.sampling_config_ttl.duration(),
                config.jitter_factor,
            ),
            write_lock: Mutex::new(()),
            max_entries: config.max_entries,
        }
    }

    /// Register a new service or a versioned update
    ///
    /// A new service requires create authority and version 1. An update
    /// requires the next version, update authority under the existing
    /// service's policy, and additionally permission-policy write
    /// authority when the policy changes. The local snapshot reflects
    /// the write immediately.
    pub async fn register(
        &self,
        mut registration: ServiceRegistration,
        actor_permissions: &[String],
    ) -> std::result::Result<(), RegistrationError> {
        validate_registration(&registration)?;

        let _guard = self.write_lock.lock().await;
        let existing = self
            .repository
            .find_by_id(&registration.service_id)
            .await
            .map_err(|e| RegistrationError::Storage(e.to_string()))?;

        match &existing {
            None => {
                if !self.authorizer.can_create_service(actor_permissions) {
                    return Err(RegistrationError::Forbidden(
                        "not authorized to create services".to_string(),
                    ));
                }
                if registration.version != 1 {
                    return Err(RegistrationError::Conflict(format!(
                        "expected version 1, got {}",
                        registration.version
                    )));
                }
                registration.registered_at = Utc::now();
            }
            Some(current) => {
                if registration.version != current.version + 1 {
                    return Err(RegistrationError::Conflict(format!(
                        "expected version {}, got {}",
                        current.version + 1,
                        registration.version
                    )));
                }
                if !self.authorizer.is_authorized_for_service(
                    current,
                    operations::UPDATE,
                    actor_permissions,
                ) {
                    return Err(RegistrationError::Forbidden(format!(
                        "not authorized to update service '{}'",
                        current.service_id
                    )));
                }

                let policy_changed = registration.effective_permission_policy()
                    != current.effective_permission_policy();
                if policy_changed
                    && !self.authorizer.is_authorized_for_service(
                        current,
                        operations::PERMISSIONS_WRITE,
                        actor_permissions,
                    )
                {
                    return Err(RegistrationError::Forbidden(
                        "changing the permission policy requires permissions.write authority"
                            .to_string(),
                    ));
                }
                registration.registered_at = current.registered_at;
            }
        }

        self.repository
            .save(registration.clone())
            .await
            .map_err(|e| RegistrationError::Storage(e.to_string()))?;

        self.apply_local_upsert(&registration);
        tracing::info!(
            service_id = %registration.service_id,
            version = registration.version,
            "service registered"
        );
        Ok(())
    }

    /// Remove a service; `Ok(false)` when it was already absent
    pub async fn unregister(
        &self,
        service_id: &str,
        actor_permissions: &[String],
    ) -> std::result::Result<bool, RegistrationError> {
        let _guard = self.write_lock.lock().await;
        let existing = self
            .repository
            .find_by_id(service_id)
            .await
            .map_err(|e| RegistrationError::Storage(e.to_string()))?;

        let Some(current) = existing else {
            return Ok(false);
        };

        if !self.authorizer.is_authorized_for_service(
            &current,
            operations::UNREGISTER,
            actor_permissions,
        ) {
            return Err(RegistrationError::Forbidden(format!(
                "not authorized to unregister service '{}'",
                service_id
            )));
        }

        self.repository
            .delete(service_id)
            .await
            .map_err(|e| RegistrationError::Storage(e.to_string()))?;

        self.apply_local_removal(service_id);
        tracing::info!(service_id, "service unregistered");
        Ok(true)
    }

    fn apply_local_upsert(&self, registration: &ServiceRegistration) {
        self.routes
            .store(self.routes.load().with_upsert(registration.clone()));

        let mut rate_limits = (*self.rate_limits.load()).clone();
        match &registration.rate_limit {
            Some(config) => {
                rate_limits.insert(registration.service_id.clone(), config.clone());
            }
            None => {
                rate_limits.remove(&registration.service_id);
            }
        }
        self.rate_limits.store(rate_limits);

        let mut sampling = (*self.sampling.load()).clone();
        match &registration.sampling {
            Some(config) => {
                sampling.insert(registration.service_id.clone(), config.clone());
            }
            None => {
                sampling.remove(&registration.service_id);
            }
        }
        self.sampling.store(sampling);
    }

    fn apply_local_removal(&self, service_id: &str) {
        self.routes.store(self.routes.load().with_removed(service_id));

        let mut rate_limits = (*self.rate_limits.load()).clone();
        rate_limits.remove(service_id);
        self.rate_limits.store(rate_limits);

        let mut sampling = (*self.sampling.load()).clone();
        sampling.remove(service_id);
        self.sampling.store(sampling);
    }

    /// Synchronous route lookup against the local snapshot
    pub fn find_route(&self, path: &str, method: &str) -> RouteLookup {
        self.routes.load().find_route(path, method)
    }

    /// Route lookup that refreshes a stale snapshot first
    pub async fn find_route_async(&self, path: &str, method: &str) -> RouteLookup {
        let table = self.routes.get_fresh(|| self.load_route_table()).await;
        table.find_route(path, method)
    }

    /// The current snapshot, for pass-through dispatch and health
    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.routes.load()
    }

    /// The current snapshot, refreshed when stale
    pub async fn snapshot_fresh(&self) -> Arc<RouteTable> {
        self.routes.get_fresh(|| self.load_route_table()).await
    }

    /// Per-service rate-limit overrides through their own TTL view
    pub async fn rate_limit_config(&self, service_id: &str) -> Option<ServiceRateLimitConfig> {
        let view = self
            .rate_limits
            .get_fresh(|| self.load_rate_limit_view())
            .await;
        view.get(service_id).cloned()
    }

    /// Per-service sampling hints through their own TTL view
    pub async fn sampling_config(&self, service_id: &str) -> Option<SamplingConfig> {
        let view = self.sampling.get_fresh(|| self.load_sampling_view()).await;
        view.get(service_id).cloned()
    }

    /// Force the next lookup to refresh
    pub async fn invalidate(&self) {
        self.routes.invalidate().await;
        self.rate_limits.invalidate().await;
        self.sampling.invalidate().await;
    }

    /// Age of the route snapshot, for the health report
    pub async fn snapshot_age(&self) -> Duration {
        self.routes.age().await
    }

    async fn load_all(&self) -> Result<Vec<ServiceRegistration>> {
        let started = Instant::now();
        let mut services = self.repository.find_all().await?;
        if services.len() > self.max_entries {
            tracing::warn!(
                total = services.len(),
                max_entries = self.max_entries,
                "registry holds more services than the snapshot cap; truncating by registration age"
            );
            services.sort_by(|a, b| {
                a.registered_at
                    .cmp(&b.registered_at)
                    .then_with(|| a.service_id.cmp(&b.service_id))
            });
            services.truncate(self.max_entries);
        }
        tracing::debug!(
            services = services.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "registry snapshot loaded"
        );
        Ok(services)
    }

    async fn load_route_table(&self) -> Result<RouteTable> {
        Ok(RouteTable::new(self.load_all().await?))
    }

    async fn load_rate_limit_view(&self) -> Result<HashMap<String, ServiceRateLimitConfig>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter_map(|s| s.rate_limit.clone().map(|cfg| (s.service_id, cfg)))
            .collect())
    }

    async fn load_sampling_view(&self) -> Result<HashMap<String, SamplingConfig>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter_map(|s| s.sampling.clone().map(|cfg| (s.service_id, cfg)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::duration::ConfigDuration;
    use crate::pattern::{MethodSet, PathPattern};

    fn admin() -> Vec<String> {
        vec!["gateway:admin".to_string()]
    }

    fn registry_with(config: RegistryCacheConfig) -> (ServiceRegistry, Arc<InMemoryServiceRepository>) {
        let repository = Arc::new(InMemoryServiceRepository::new());
        let registry = ServiceRegistry::new(
            Arc::clone(&repository) as Arc<dyn ServiceRegistrationRepository>,
            ServiceAuthorizer::new(&AuthConfig::default()),
            &config,
        );
        (registry, repository)
    }

    fn registry() -> (ServiceRegistry, Arc<InMemoryServiceRepository>) {
        registry_with(RegistryCacheConfig::default())
    }

    fn registration(id: &str, version: u64) -> ServiceRegistration {
        ServiceRegistration::builder(id, "http://backend:9090")
            .version(version)
            .endpoint(EndpointConfig::new(
                PathPattern::parse("/api/items").unwrap(),
                MethodSet::new(["GET"]),
            ))
            .build()
    }

    #[tokio::test]
    async fn test_register_and_local_lookup() {
        let (registry, _) = registry();
        registry.register(registration("svc-a", 1), &admin()).await.unwrap();

        // Read-your-writes on the same instance, synchronously
        assert!(registry.find_route("/api/items", "GET").as_match().is_some());
    }

    #[tokio::test]
    async fn test_version_monotonicity() {
        let (registry, _) = registry();
        registry.register(registration("svc-b", 1), &admin()).await.unwrap();

        // Same version again
        let err = registry.register(registration("svc-b", 1), &admin()).await.unwrap_err();
        assert_eq!(err.status(), 409);
        assert!(err.reason().contains("expected version 2"));

        // Version skip
        let err = registry.register(registration("svc-b", 3), &admin()).await.unwrap_err();
        assert_eq!(err.status(), 409);

        // The successor succeeds and the stored version follows
        registry.register(registration("svc-b", 2), &admin()).await.unwrap();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.get("svc-b").unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_new_service_must_start_at_version_one() {
        let (registry, _) = registry();
        let err = registry.register(registration("svc-c", 5), &admin()).await.unwrap_err();
        assert_eq!(err.status(), 409);
        assert!(err.reason().contains("expected version 1"));
    }

    #[tokio::test]
    async fn test_create_requires_authority() {
        let (registry, _) = registry();
        let err = registry
            .register(registration("svc-d", 1), &["orders:write".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.status(), 403);
    }

    #[tokio::test]
    async fn test_update_authority_under_service_policy() {
        let (registry, _) = registry();

        let mut policy = ServicePermissionPolicy::default();
        policy.operations.insert(
            operations::UPDATE.to_string(),
            OperationPermission::any_of(["team:orders"]),
        );
        let mut first = registration("svc-e", 1);
        first.permission_policy = Some(policy.clone());
        registry.register(first, &admin()).await.unwrap();

        // The policy-listed team may update without being platform admin
        let mut second = registration("svc-e", 2);
        second.permission_policy = Some(policy.clone());
        registry
            .register(second, &["team:orders".to_string()])
            .await
            .unwrap();

        // Changing the policy itself additionally needs permissions.write
        let mut third = registration("svc-e", 3);
        let mut changed = policy.clone();
        changed.operations.insert(
            operations::UNREGISTER.to_string(),
            OperationPermission::any_of(["team:orders"]),
        );
        third.permission_policy = Some(changed);
        let err = registry
            .register(third, &["team:orders".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.status(), 403);
        assert!(err.reason().contains("permission policy"));
    }

    #[tokio::test]
    async fn test_validation_failure_is_400() {
        let (registry, _) = registry();
        let err = registry.register(registration("admin", 1), &admin()).await.unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn test_unregister_idempotent() {
        let (registry, repository) = registry();
        registry.register(registration("svc-f", 1), &admin()).await.unwrap();

        assert!(registry.unregister("svc-f", &admin()).await.unwrap());
        assert!(!registry.unregister("svc-f", &admin()).await.unwrap());
        assert_eq!(repository.count().await.unwrap(), 0);
        assert!(matches!(
            registry.find_route("/api/items", "GET"),
            RouteLookup::ServiceOnly(_) | RouteLookup::NotFound
        ));
    }

    #[tokio::test]
    async fn test_async_lookup_sees_remote_writes_after_ttl() {
        // Two registry instances sharing one repository
        let repository = Arc::new(InMemoryServiceRepository::new());
        let config = RegistryCacheConfig {
            service_routes_ttl: ConfigDuration::from_secs(3600),
            jitter_factor: 0.0,
            ..RegistryCacheConfig::default()
        };
        let instance_a = ServiceRegistry::new(
            Arc::clone(&repository) as Arc<dyn ServiceRegistrationRepository>,
            ServiceAuthorizer::new(&AuthConfig::default()),
            &config,
        );
        let instance_b = ServiceRegistry::new(
            Arc::clone(&repository) as Arc<dyn ServiceRegistrationRepository>,
            ServiceAuthorizer::new(&AuthConfig::default()),
            &config,
        );

        // Prime instance B's snapshot so it is fresh and empty
        assert!(matches!(
            instance_b.find_route_async("/api/items", "GET").await,
            RouteLookup::NotFound
        ));

        instance_a.register(registration("svc-g", 1), &admin()).await.unwrap();

        // Before the TTL elapses B still serves its stale snapshot
        assert!(matches!(
            instance_b.find_route_async("/api/items", "GET").await,
            RouteLookup::NotFound
        ));

        // After expiry the refresh picks the write up
        instance_b.invalidate().await;
        assert!(instance_b
            .find_route_async("/api/items", "GET")
            .await
            .as_match()
            .is_some());
    }

    #[tokio::test]
    async fn test_concurrent_stale_reads_coalesce() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingRepository {
            inner: InMemoryServiceRepository,
            find_all_calls: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl ServiceRegistrationRepository for CountingRepository {
            async fn find_all(&self) -> Result<Vec<ServiceRegistration>> {
                self.find_all_calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.inner.find_all().await
            }
            async fn find_by_id(&self, id: &str) -> Result<Option<ServiceRegistration>> {
                self.inner.find_by_id(id).await
            }
            async fn save(&self, reg: ServiceRegistration) -> Result<()> {
                self.inner.save(reg).await
            }
            async fn delete(&self, id: &str) -> Result<bool> {
                self.inner.delete(id).await
            }
            async fn exists(&self, id: &str) -> Result<bool> {
                self.inner.exists(id).await
            }
            async fn count(&self) -> Result<usize> {
                self.inner.count().await
            }
        }

        let repository = Arc::new(CountingRepository {
            inner: InMemoryServiceRepository::new(),
            find_all_calls: AtomicUsize::new(0),
        });
        repository.inner.save(registration("svc-h", 1)).await.unwrap();

        let registry = Arc::new(ServiceRegistry::new(
            Arc::clone(&repository) as Arc<dyn ServiceRegistrationRepository>,
            ServiceAuthorizer::new(&AuthConfig::default()),
            &RegistryCacheConfig::default(),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.find_route_async("/api/items", "GET").await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().as_match().is_some());
        }

        // All eight stale readers shared one refresh
        assert_eq!(repository.find_all_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_and_sampling_views() {
        let (registry, _) = registry();
        let mut reg = registration("svc-i", 1);
        reg.rate_limit = Some(ServiceRateLimitConfig {
            http: Some(RateLimitOverride {
                requests_per_window: Some(5),
                window: None,
                burst_capacity: None,
            }),
            ..ServiceRateLimitConfig::default()
        });
        reg.sampling = Some(SamplingConfig {
            sample_rate: 0.25,
            always_sample_errors: true,
        });
        registry.register(reg, &admin()).await.unwrap();

        let limits = registry.rate_limit_config("svc-i").await.unwrap();
        assert_eq!(limits.http.unwrap().requests_per_window, Some(5));
        let sampling = registry.sampling_config("svc-i").await.unwrap();
        assert_eq!(sampling.sample_rate, 0.25);
        assert!(registry.rate_limit_config("absent").await.is_none());
    }
}
