//! Tracing initialization

use tracing_subscriber::EnvFilter;

use crate::{config::GatewayConfig, error::Result};

/// Initialize structured JSON tracing
///
/// Call once from the embedding binary before building the core. The
/// configured log level acts as the default filter; `RUST_LOG` still
/// overrides per-target levels.
pub fn init_tracing(config: &GatewayConfig) -> Result<()> {
    let log_level = config.service.log_level.clone();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("Tracing initialized for service: {}", config.service.name);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_does_not_panic() {
        let config = GatewayConfig::default();
        // A second init in the same process fails quietly inside
        // tracing-subscriber; either way this must not panic
        let _ = std::panic::catch_unwind(|| init_tracing(&config));
    }
}
