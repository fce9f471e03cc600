//! Registration validation
//!
//! Every rule here produces a 400-class failure with a reason precise
//! enough for the admin surface to display verbatim.

use http::Uri;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

use super::model::{is_reserved_service_id, ServiceRegistration};
use super::RegistrationError;

/// Accepted service-ID syntax
static SERVICE_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("service id regex is valid"));

/// Validate a registration record
///
/// Authorization and version checks happen separately in the registry;
/// this covers only the shape of the record itself.
pub fn validate_registration(reg: &ServiceRegistration) -> Result<(), RegistrationError> {
    let invalid = |reason: String| Err(RegistrationError::Validation(reason));

    if reg.service_id.is_empty() {
        return invalid("service_id must not be blank".to_string());
    }
    if !SERVICE_ID_REGEX.is_match(&reg.service_id) {
        return invalid(format!(
            "service_id '{}' must match {}",
            reg.service_id,
            SERVICE_ID_REGEX.as_str()
        ));
    }
    if is_reserved_service_id(&reg.service_id) {
        return invalid(format!("service_id '{}' is reserved", reg.service_id));
    }

    validate_base_url(&reg.base_url)?;

    if reg.version == 0 {
        return invalid("version must be at least 1".to_string());
    }

    let mut seen_endpoints: HashSet<String> = HashSet::new();
    for endpoint in &reg.endpoints {
        if endpoint.methods.is_empty() {
            return invalid(format!(
                "endpoint '{}' declares no methods",
                endpoint.path_pattern
            ));
        }

        if let Some(template) = &endpoint.path_rewrite_template {
            let pattern_vars = endpoint.path_pattern.variable_names();
            for name in template.variable_names() {
                if !pattern_vars.contains(&name.as_str()) {
                    return invalid(format!(
                        "rewrite template '{}' references '{{{}}}' which pattern '{}' does not capture",
                        template.as_str(),
                        name,
                        endpoint.path_pattern
                    ));
                }
            }
        }

        if !seen_endpoints.insert(endpoint.endpoint_id()) {
            return invalid(format!(
                "duplicate endpoint '{}' for methods {:?}",
                endpoint.path_pattern,
                endpoint.methods.names()
            ));
        }
    }

    for rule in &reg.visibility_rules {
        if rule.methods.is_empty() {
            return invalid(format!(
                "visibility rule '{}' declares no methods",
                rule.path_pattern
            ));
        }
    }

    if let Some(policy) = &reg.permission_policy {
        for (operation, permission) in &policy.operations {
            if operation.trim().is_empty() {
                return invalid("permission policy contains a blank operation name".to_string());
            }
            if permission.any_of.is_empty() {
                return invalid(format!(
                    "permission policy operation '{}' accepts no permissions",
                    operation
                ));
            }
            if permission.any_of.iter().any(|p| p.trim().is_empty()) {
                return invalid(format!(
                    "permission policy operation '{}' contains a blank permission",
                    operation
                ));
            }
        }
    }

    Ok(())
}

fn validate_base_url(base_url: &str) -> Result<(), RegistrationError> {
    let uri: Uri = base_url.parse().map_err(|_| {
        RegistrationError::Validation(format!("base_url '{}' is not a valid URI", base_url))
    })?;

    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        Some(other) => {
            return Err(RegistrationError::Validation(format!(
                "base_url scheme '{}' must be http or https",
                other
            )))
        }
        None => {
            return Err(RegistrationError::Validation(format!(
                "base_url '{}' must be absolute",
                base_url
            )))
        }
    }

    if uri.host().is_none() {
        return Err(RegistrationError::Validation(format!(
            "base_url '{}' has no host",
            base_url
        )));
    }

    if uri.query().is_some() {
        return Err(RegistrationError::Validation(format!(
            "base_url '{}' must not carry a query string",
            base_url
        )));
    }

    Ok(())
}
