//! Access control for private endpoints
//!
//! Private endpoints are reachable only from sources matching at least
//! one allow list: IP/CIDR, exact domain, or `*.base` subdomain. A
//! service-level list, when present, fully replaces the global list for
//! that category. Malformed patterns are skipped without disqualifying
//! the rest.

use ipnet::IpNet;
use std::net::IpAddr;
use std::str::FromStr;

use crate::config::AccessControlConfig;
use crate::registry::{ServiceAccessConfig, Visibility};
use crate::source::SourceIdentifier;

/// The outcome of an access-control evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    /// Request may proceed
    Allowed,
    /// Request is refused with a reason
    Denied(String),
}

impl AccessDecision {
    /// Whether the decision allows the request
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allowed)
    }
}

/// One compiled IP allow entry
#[derive(Debug, Clone)]
enum IpPattern {
    Single(IpAddr),
    Cidr(IpNet),
}

impl IpPattern {
    fn matches(&self, ip: IpAddr) -> bool {
        match self {
            IpPattern::Single(allowed) => allowed == &ip,
            IpPattern::Cidr(network) => network.contains(&ip),
        }
    }
}

impl FromStr for IpPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(network) = IpNet::from_str(s) {
            return Ok(IpPattern::Cidr(network));
        }
        if let Ok(ip) = IpAddr::from_str(s) {
            return Ok(IpPattern::Single(ip));
        }
        Err(format!("invalid IP or CIDR pattern: {}", s))
    }
}

/// A compiled set of allow lists
#[derive(Debug, Clone, Default)]
struct AllowLists {
    ips: Vec<IpPattern>,
    domains: Vec<String>,
    subdomains: Vec<String>,
}

impl AllowLists {
    fn compile(ips: &[String], domains: &[String], subdomains: &[String]) -> Self {
        let mut compiled = Self::default();

        for entry in ips {
            match IpPattern::from_str(entry.trim()) {
                Ok(pattern) => compiled.ips.push(pattern),
                Err(reason) => tracing::warn!("Ignoring access-control IP pattern: {}", reason),
            }
        }

        for entry in domains {
            let domain = entry.trim().to_ascii_lowercase();
            if domain.is_empty() {
                tracing::warn!("Ignoring blank access-control domain pattern");
                continue;
            }
            compiled.domains.push(domain);
        }

        for entry in subdomains {
            match entry.trim().strip_prefix("*.") {
                Some(base) if !base.is_empty() => {
                    compiled.subdomains.push(base.to_ascii_lowercase());
                }
                _ => tracing::warn!(
                    "Ignoring access-control subdomain pattern '{}': must be '*.base'",
                    entry
                ),
            }
        }

        compiled
    }

    fn matches(&self, source: &SourceIdentifier) -> bool {
        if let Some(ip) = source.ip_addr() {
            if self.ips.iter().any(|p| p.matches(ip)) {
                return true;
            }
        }

        if let Some(host) = source.host.as_deref() {
            let host = host.to_ascii_lowercase();
            if self.domains.iter().any(|d| d == &host) {
                return true;
            }
            // `*.base` matches strict subdomains only, never `base` itself
            if self
                .subdomains
                .iter()
                .any(|base| host.len() > base.len() + 1 && host.ends_with(base)
                    && host.as_bytes()[host.len() - base.len() - 1] == b'.')
            {
                return true;
            }
        }

        false
    }
}

/// Evaluates visibility policy against a request source
#[derive(Debug, Clone)]
pub struct AccessEvaluator {
    global: AllowLists,
    global_ips_raw: usize,
    global_domains_raw: usize,
    global_subdomains_raw: usize,
    private_by_default: bool,
}

impl AccessEvaluator {
    /// Compile the global allow lists
    pub fn new(config: &AccessControlConfig) -> Self {
        Self {
            global: AllowLists::compile(
                &config.allowed_ips,
                &config.allowed_domains,
                &config.allowed_subdomains,
            ),
            global_ips_raw: config.allowed_ips.len(),
            global_domains_raw: config.allowed_domains.len(),
            global_subdomains_raw: config.allowed_subdomains.len(),
            private_by_default: config.private_by_default,
        }
    }

    /// Whether the gateway applies access control before route lookup
    pub fn private_by_default(&self) -> bool {
        self.private_by_default
    }

    /// Evaluate an endpoint's resolved visibility for a source
    ///
    /// `service_config` is the per-service override set; each list that
    /// is present replaces the global list for its category.
    pub fn evaluate(
        &self,
        source: &SourceIdentifier,
        visibility: Visibility,
        service_config: Option<&ServiceAccessConfig>,
    ) -> AccessDecision {
        if visibility == Visibility::Public {
            return AccessDecision::Allowed;
        }

        let lists = match service_config {
            Some(cfg) => self.merged(cfg),
            None => self.global.clone(),
        };

        if lists.matches(source) {
            AccessDecision::Allowed
        } else {
            tracing::debug!(ip = %source.ip, host = ?source.host, "private endpoint refused");
            AccessDecision::Denied(format!(
                "source {} is not allowed to reach this endpoint",
                source.ip
            ))
        }
    }

    /// Evaluate the gateway-wide lists with no route context
    pub fn evaluate_global(&self, source: &SourceIdentifier) -> AccessDecision {
        if !self.private_by_default {
            return AccessDecision::Allowed;
        }
        self.evaluate(source, Visibility::Private, None)
    }

    fn merged(&self, cfg: &ServiceAccessConfig) -> AllowLists {
        let empty: Vec<String> = Vec::new();
        let service = AllowLists::compile(
            cfg.allowed_ips.as_deref().unwrap_or(&empty),
            cfg.allowed_domains.as_deref().unwrap_or(&empty),
            cfg.allowed_subdomains.as_deref().unwrap_or(&empty),
        );

        AllowLists {
            ips: if cfg.allowed_ips.is_some() {
                service.ips
            } else {
                self.global.ips.clone()
            },
            domains: if cfg.allowed_domains.is_some() {
                service.domains
            } else {
                self.global.domains.clone()
            },
            subdomains: if cfg.allowed_subdomains.is_some() {
                service.subdomains
            } else {
                self.global.subdomains.clone()
            },
        }
    }

    /// Summary used by the health snapshot
    pub fn pattern_counts(&self) -> (usize, usize, usize) {
        (
            self.global_ips_raw,
            self.global_domains_raw,
            self.global_subdomains_raw,
        )
    }
}
