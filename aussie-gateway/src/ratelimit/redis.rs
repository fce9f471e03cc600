//! Redis limiter backend
//!
//! Every decision is a single server-side Lua script that reads the
//! bucket, mutates it, and answers atomically, which keeps accounting
//! linearizable per key across gateway instances. Keys expire after a
//! retention multiple of their window so idle buckets clean themselves
//! up.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use deadpool_redis::Pool as RedisPool;
use redis::Script;

use super::limiter::{RateLimitDecision, RateLimiter};
use super::{EffectiveRateLimit, RateLimitKey};
use crate::config::{RateLimitAlgorithm, RateLimitSettings};
use crate::error::{Error, Result};

/// Refill-on-read token bucket
///
/// Returns `{allowed, tokens, retry_after}`; `tokens` rides back as a
/// string because Lua would truncate the fraction to an integer.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local retention = tonumber(ARGV[4])
local consume = tonumber(ARGV[5])

local data = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(data[1])
local ts = tonumber(data[2])
if tokens == nil then
  tokens = capacity
  ts = now_ms
end

local elapsed = math.max(0, now_ms - ts) / 1000.0
tokens = math.min(capacity, tokens + elapsed * rate)

local allowed = 0
if tokens >= 1 then
  allowed = 1
  if consume == 1 then
    tokens = tokens - 1
  end
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', now_ms)
redis.call('EXPIRE', KEYS[1], retention)

local retry = 0
if allowed == 0 and rate > 0 then
  retry = math.ceil((1 - tokens) / rate)
end
return {allowed, tostring(tokens), retry}
"#;

/// Counter per `(key, window index)`; consume increments first, then
/// the caller compares against the limit
const FIXED_WINDOW_SCRIPT: &str = r#"
local window = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local retention = tonumber(ARGV[3])
local consume = tonumber(ARGV[4])

local idx = math.floor(now / window)
local key = KEYS[1] .. ':' .. idx

local count
if consume == 1 then
  count = redis.call('INCR', key)
  if count == 1 then
    redis.call('EXPIRE', key, retention)
  end
else
  count = tonumber(redis.call('GET', key) or '0')
end
return {count, (idx + 1) * window}
"#;

/// Weighted blend of the current and previous fixed windows
const SLIDING_WINDOW_SCRIPT: &str = r#"
local window = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local retention = tonumber(ARGV[4])
local consume = tonumber(ARGV[5])

local idx = math.floor(now / window)
local cur_key = KEYS[1] .. ':' .. idx
local prev_key = KEYS[1] .. ':' .. (idx - 1)

local cur = tonumber(redis.call('GET', cur_key) or '0')
local prev = tonumber(redis.call('GET', prev_key) or '0')
local elapsed = (now % window) / window
local usage = prev * (1 - elapsed) + cur

local allowed = 0
if usage + 1 <= limit then
  allowed = 1
  if consume == 1 then
    local after = redis.call('INCR', cur_key)
    if after == 1 then
      redis.call('EXPIRE', cur_key, retention)
    end
    cur = after
  end
end
return {allowed, tostring(usage), (idx + 1) * window, cur}
"#;

/// Shared-store rate limiter
pub struct RedisRateLimiter {
    pool: RedisPool,
    algorithm: RateLimitAlgorithm,
    enabled: bool,
    fail_open: bool,
    retention_factor: u32,
    token_bucket: Script,
    fixed_window: Script,
    sliding_window: Script,
}

impl RedisRateLimiter {
    /// Create a limiter over a shared pool
    pub fn new(pool: RedisPool, settings: &RateLimitSettings) -> Self {
        Self {
            pool,
            algorithm: settings.algorithm,
            enabled: settings.enabled,
            fail_open: settings.fail_open,
            retention_factor: settings.bucket_retention_factor.max(2),
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
            fixed_window: Script::new(FIXED_WINDOW_SCRIPT),
            sliding_window: Script::new(SLIDING_WINDOW_SCRIPT),
        }
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::RedisPool(e.to_string()))
    }

    async fn check(
        &self,
        key: &RateLimitKey,
        limit: &EffectiveRateLimit,
        consume: bool,
    ) -> Result<RateLimitDecision> {
        if !self.enabled {
            return Ok(RateLimitDecision::unlimited(*limit));
        }

        let result = self.run_script(key, limit, consume).await;
        match result {
            Ok(decision) => Ok(decision),
            Err(e) if self.fail_open => {
                tracing::warn!("rate limiter backend unavailable, failing open: {}", e);
                Ok(RateLimitDecision::unlimited(*limit))
            }
            Err(e) => Err(e),
        }
    }

    async fn run_script(
        &self,
        key: &RateLimitKey,
        limit: &EffectiveRateLimit,
        consume: bool,
    ) -> Result<RateLimitDecision> {
        let mut conn = self.connection().await?;
        let storage_key = key.storage_key();
        let window_secs = limit.window_secs.max(1);
        let retention = window_secs * self.retention_factor as u64;
        let now = Utc::now();

        match self.algorithm {
            RateLimitAlgorithm::TokenBucket => {
                let (allowed, tokens, retry): (u8, String, u64) = self
                    .token_bucket
                    .key(&storage_key)
                    .arg(limit.burst_capacity)
                    .arg(limit.refill_rate())
                    .arg(now.timestamp_millis())
                    .arg(retention)
                    .arg(consume as u8)
                    .invoke_async(&mut conn)
                    .await?;

                let tokens: f64 = tokens.parse().unwrap_or(0.0);
                let capacity = limit.burst_capacity as f64;
                let rate = limit.refill_rate();
                let to_full_secs = if rate > 0.0 {
                    ((capacity - tokens) / rate).ceil() as i64
                } else {
                    window_secs as i64
                };

                Ok(RateLimitDecision {
                    allowed: allowed == 1,
                    remaining: tokens.floor().max(0.0) as u32,
                    reset_at: now + chrono::Duration::seconds(to_full_secs),
                    retry_after_secs: (allowed == 0).then_some(retry.max(1)),
                    current_usage: (capacity - tokens).ceil().max(0.0) as u32,
                    limit: *limit,
                })
            }

            RateLimitAlgorithm::FixedWindow => {
                let (count, reset_epoch): (u32, u64) = self
                    .fixed_window
                    .key(&storage_key)
                    .arg(window_secs)
                    .arg(now.timestamp())
                    .arg(retention)
                    .arg(consume as u8)
                    .invoke_async(&mut conn)
                    .await?;

                let allowed = if consume {
                    count <= limit.requests_per_window
                } else {
                    count < limit.requests_per_window
                };
                let reset_at = epoch_to_datetime(reset_epoch);

                Ok(RateLimitDecision {
                    allowed,
                    remaining: limit.requests_per_window.saturating_sub(count),
                    reset_at,
                    retry_after_secs: (!allowed).then(|| {
                        (reset_at.timestamp() - now.timestamp()).clamp(1, window_secs as i64) as u64
                    }),
                    current_usage: count,
                    limit: *limit,
                })
            }

            RateLimitAlgorithm::SlidingWindow => {
                let (allowed, usage, reset_epoch, current): (u8, String, u64, u32) = self
                    .sliding_window
                    .key(&storage_key)
                    .arg(window_secs)
                    .arg(now.timestamp())
                    .arg(limit.requests_per_window)
                    .arg(retention)
                    .arg(consume as u8)
                    .invoke_async(&mut conn)
                    .await?;

                let usage: f64 = usage.parse().unwrap_or(0.0);
                let counted = usage + if allowed == 1 && consume { 1.0 } else { 0.0 };
                let reset_at = epoch_to_datetime(reset_epoch);
                let _ = current;

                Ok(RateLimitDecision {
                    allowed: allowed == 1,
                    remaining: (limit.requests_per_window as f64 - counted).floor().max(0.0) as u32,
                    reset_at,
                    retry_after_secs: (allowed == 0).then(|| {
                        (reset_at.timestamp() - now.timestamp()).clamp(1, window_secs as i64) as u64
                    }),
                    current_usage: counted.ceil() as u32,
                    limit: *limit,
                })
            }
        }
    }

    async fn scan_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}

fn epoch_to_datetime(epoch: u64) -> DateTime<Utc> {
    Utc.timestamp_opt(epoch as i64, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check_and_consume(
        &self,
        key: &RateLimitKey,
        limit: &EffectiveRateLimit,
    ) -> Result<RateLimitDecision> {
        self.check(key, limit, true).await
    }

    async fn get_status(
        &self,
        key: &RateLimitKey,
        limit: &EffectiveRateLimit,
    ) -> Result<RateLimitDecision> {
        self.check(key, limit, false).await
    }

    async fn reset(&self, key: &RateLimitKey) -> Result<()> {
        // Window-suffixed keys included
        let removed = self
            .remove_keys_matching(&format!("{}*", key.storage_key()))
            .await?;
        tracing::debug!(buckets = removed, "rate limit bucket reset");
        Ok(())
    }

    async fn remove_keys_matching(&self, pattern: &str) -> Result<usize> {
        let keys = self.scan_matching(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let removed: usize = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
        Ok(removed)
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}
