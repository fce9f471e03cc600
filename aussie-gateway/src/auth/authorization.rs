//! Service operation authorization
//!
//! Permission checks against a service's own policy, falling back to
//! the platform default (admin claim required) when the service has
//! none. The wildcard permission bypasses every check.

use crate::config::AuthConfig;
use crate::registry::ServiceRegistration;

/// The permission that bypasses every policy check
pub const WILDCARD_PERMISSION: &str = "*";

/// Operation names checked against service permission policies
pub mod operations {
    /// Re-registering a service at the next version
    pub const UPDATE: &str = "service.update";

    /// Removing a service from the registry
    pub const UNREGISTER: &str = "service.unregister";

    /// Changing a service's permission policy
    pub const PERMISSIONS_WRITE: &str = "permissions.write";
}

/// Evaluates operation permissions for registry mutations
#[derive(Debug, Clone)]
pub struct ServiceAuthorizer {
    admin_permission: String,
}

impl ServiceAuthorizer {
    /// Create an authorizer from the auth configuration
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            admin_permission: config.admin_permission.clone(),
        }
    }

    /// Whether `permissions` authorize `operation` on `service`
    ///
    /// Empty permissions never authorize. The wildcard authorizes
    /// everything. A present, non-empty service policy is consulted for
    /// the operation; otherwise the platform default applies, which
    /// requires the admin permission.
    pub fn is_authorized_for_service(
        &self,
        service: &ServiceRegistration,
        operation: &str,
        permissions: &[String],
    ) -> bool {
        if permissions.is_empty() {
            return false;
        }
        if permissions.iter().any(|p| p == WILDCARD_PERMISSION) {
            return true;
        }

        match service.effective_permission_policy() {
            Some(policy) => policy
                .permissions_for(operation)
                .map(|op| permissions.iter().any(|p| op.any_of.contains(p)))
                .unwrap_or(false),
            None => self.has_admin(permissions),
        }
    }

    /// Whether `permissions` may create a new service
    pub fn can_create_service(&self, permissions: &[String]) -> bool {
        permissions
            .iter()
            .any(|p| p == WILDCARD_PERMISSION || p == &self.admin_permission)
    }

    fn has_admin(&self, permissions: &[String]) -> bool {
        permissions.iter().any(|p| p == &self.admin_permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{OperationPermission, ServicePermissionPolicy};

    fn authorizer() -> ServiceAuthorizer {
        ServiceAuthorizer::new(&AuthConfig::default())
    }

    fn perms(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn service_with_policy(policy: Option<ServicePermissionPolicy>) -> ServiceRegistration {
        let mut builder = ServiceRegistration::builder("orders", "http://orders:8080");
        if let Some(p) = policy {
            builder = builder.permission_policy(p);
        }
        builder.build()
    }

    fn update_policy(allowed: &[&str]) -> ServicePermissionPolicy {
        let mut policy = ServicePermissionPolicy::default();
        policy.operations.insert(
            operations::UPDATE.to_string(),
            OperationPermission::any_of(allowed.iter().copied()),
        );
        policy
    }

    #[test]
    fn test_empty_permissions_denied() {
        let svc = service_with_policy(Some(update_policy(&["orders:write"])));
        assert!(!authorizer().is_authorized_for_service(&svc, operations::UPDATE, &[]));
    }

    #[test]
    fn test_wildcard_bypasses() {
        let svc = service_with_policy(Some(update_policy(&["orders:write"])));
        assert!(authorizer().is_authorized_for_service(&svc, operations::UPDATE, &perms(&["*"])));
        assert!(authorizer().is_authorized_for_service(&svc, "anything.else", &perms(&["*"])));
    }

    #[test]
    fn test_policy_intersection() {
        let svc = service_with_policy(Some(update_policy(&["orders:write", "team:platform"])));
        let auth = authorizer();

        assert!(auth.is_authorized_for_service(&svc, operations::UPDATE, &perms(&["orders:write"])));
        assert!(auth.is_authorized_for_service(
            &svc,
            operations::UPDATE,
            &perms(&["unrelated", "team:platform"])
        ));
        assert!(!auth.is_authorized_for_service(&svc, operations::UPDATE, &perms(&["orders:read"])));
        // Operation absent from the policy
        assert!(!auth.is_authorized_for_service(&svc, operations::UNREGISTER, &perms(&["orders:write"])));
    }

    #[test]
    fn test_default_policy_requires_admin() {
        let svc = service_with_policy(None);
        let auth = authorizer();

        assert!(auth.is_authorized_for_service(&svc, operations::UPDATE, &perms(&["gateway:admin"])));
        assert!(!auth.is_authorized_for_service(&svc, operations::UPDATE, &perms(&["orders:write"])));
    }

    #[test]
    fn test_empty_policy_falls_back_to_default() {
        let svc = service_with_policy(Some(ServicePermissionPolicy::default()));
        let auth = authorizer();
        assert!(auth.is_authorized_for_service(&svc, operations::UPDATE, &perms(&["gateway:admin"])));
    }

    #[test]
    fn test_can_create_service() {
        let auth = authorizer();
        assert!(auth.can_create_service(&perms(&["*"])));
        assert!(auth.can_create_service(&perms(&["gateway:admin"])));
        assert!(!auth.can_create_service(&perms(&["orders:write"])));
        assert!(!auth.can_create_service(&[]));
    }
}
