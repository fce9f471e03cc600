//! Service registration storage port
//!
//! The registry owns an authoritative remote repository behind this
//! trait. Implementations must make `save` atomic and keyed uniquely by
//! `service_id`. The in-memory implementation backs single-instance
//! deployments and tests.

use async_trait::async_trait;
use dashmap::DashMap;

use super::model::ServiceRegistration;
use crate::error::Result;

/// Authoritative storage for service registrations
#[async_trait]
pub trait ServiceRegistrationRepository: Send + Sync {
    /// Every stored registration, in unspecified order
    async fn find_all(&self) -> Result<Vec<ServiceRegistration>>;

    /// Look up a registration by service ID
    async fn find_by_id(&self, service_id: &str) -> Result<Option<ServiceRegistration>>;

    /// Store a registration, replacing any existing one with the same ID
    async fn save(&self, registration: ServiceRegistration) -> Result<()>;

    /// Remove a registration; `true` when something was removed
    async fn delete(&self, service_id: &str) -> Result<bool>;

    /// Whether a registration with the ID exists
    async fn exists(&self, service_id: &str) -> Result<bool>;

    /// Number of stored registrations
    async fn count(&self) -> Result<usize>;
}

/// In-memory repository for single-instance mode and tests
#[derive(Debug, Default)]
pub struct InMemoryServiceRepository {
    services: DashMap<String, ServiceRegistration>,
}

impl InMemoryServiceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceRegistrationRepository for InMemoryServiceRepository {
    async fn find_all(&self) -> Result<Vec<ServiceRegistration>> {
        Ok(self
            .services
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn find_by_id(&self, service_id: &str) -> Result<Option<ServiceRegistration>> {
        Ok(self.services.get(service_id).map(|entry| entry.value().clone()))
    }

    async fn save(&self, registration: ServiceRegistration) -> Result<()> {
        self.services
            .insert(registration.service_id.clone(), registration);
        Ok(())
    }

    async fn delete(&self, service_id: &str) -> Result<bool> {
        Ok(self.services.remove(service_id).is_some())
    }

    async fn exists(&self, service_id: &str) -> Result<bool> {
        Ok(self.services.contains_key(service_id))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.services.len())
    }
}
