//! Redis connection pool management

#[cfg(feature = "redis")]
use deadpool_redis::{Config as DeadpoolConfig, Pool, Runtime};
#[cfg(feature = "redis")]
use std::time::Duration;

#[cfg(feature = "redis")]
use crate::{
    config::RedisConfig,
    error::{Error, Result},
};

/// Build the shared Redis pool and verify it answers
///
/// The pool itself is constructed once; what gets retried is the
/// connectivity probe, since deadpool only dials lazily. Each failed
/// probe doubles the wait, and the probe error is surfaced once the
/// attempt budget (`max_retries` beyond the first try) runs out.
#[cfg(feature = "redis")]
pub async fn create_pool(config: &RedisConfig) -> Result<Pool> {
    let pool = DeadpoolConfig::from_url(&config.url)
        .builder()
        .map_err(|e| Error::RedisPool(format!("pool configuration rejected: {}", e)))?
        .max_size(config.max_connections)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| Error::RedisPool(format!("pool construction failed: {}", e)))?;

    let mut wait = Duration::from_secs(config.retry_delay_secs.max(1));
    let mut tries: u32 = 0;
    loop {
        tries += 1;
        match probe(&pool, config.connection_timeout()).await {
            Ok(()) => {
                tracing::info!(
                    tries,
                    max_size = config.max_connections,
                    "redis pool ready"
                );
                return Ok(pool);
            }
            Err(e) if tries > config.max_retries => {
                tracing::error!(tries, "redis unreachable, giving up: {}", e);
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(tries, wait_secs = wait.as_secs(), "redis not ready: {}", e);
                tokio::time::sleep(wait).await;
                wait = wait.saturating_mul(2);
            }
        }
    }
}

/// One bounded connectivity check against the pool
#[cfg(feature = "redis")]
async fn probe(pool: &Pool, deadline: Duration) -> Result<()> {
    let conn = tokio::time::timeout(deadline, pool.get())
        .await
        .map_err(|_| Error::RedisPool("connectivity probe timed out".to_string()))?
        .map_err(|e| Error::RedisPool(e.to_string()))?;
    drop(conn);
    Ok(())
}
