//! In-memory limiter backend
//!
//! Single-instance accounting over a concurrent map. Each decision
//! mutates its bucket under the map's per-shard lock, which gives the
//! per-key mutual exclusion the port requires. Stale buckets are pruned
//! opportunistically.

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;

use super::limiter::{RateLimitDecision, RateLimiter};
use super::{EffectiveRateLimit, RateLimitKey};
use crate::config::{RateLimitAlgorithm, RateLimitSettings};
use crate::error::Result;

/// How many operations pass between opportunistic prune sweeps
const PRUNE_EVERY: u64 = 4096;

#[derive(Debug, Clone)]
enum BucketState {
    TokenBucket { tokens: f64, refilled_at: Instant },
    FixedWindow { window_index: u64, count: u32 },
    SlidingWindow { window_index: u64, current: u32, previous: u32 },
}

#[derive(Debug, Clone)]
struct Bucket {
    state: BucketState,
    expires_at: Instant,
}

/// In-memory rate limiter for single-instance mode and tests
pub struct InMemoryRateLimiter {
    algorithm: RateLimitAlgorithm,
    enabled: bool,
    retention_factor: u32,
    buckets: DashMap<String, Bucket>,
    operations: AtomicU64,
}

impl InMemoryRateLimiter {
    /// Create a limiter from the platform settings
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            algorithm: settings.algorithm,
            enabled: settings.enabled,
            retention_factor: settings.bucket_retention_factor.max(2),
            buckets: DashMap::new(),
            operations: AtomicU64::new(0),
        }
    }

    fn check(
        &self,
        key: &RateLimitKey,
        limit: &EffectiveRateLimit,
        consume: bool,
    ) -> RateLimitDecision {
        if !self.enabled {
            return RateLimitDecision::unlimited(*limit);
        }

        self.maybe_prune();

        let storage_key = key.storage_key();
        let retention = limit.window() * self.retention_factor;
        let mut entry = self
            .buckets
            .entry(storage_key)
            .or_insert_with(|| Bucket {
                state: self.initial_state(limit),
                expires_at: Instant::now() + retention,
            });
        entry.expires_at = Instant::now() + retention;

        match self.algorithm {
            RateLimitAlgorithm::TokenBucket => token_bucket(&mut entry.state, limit, consume),
            RateLimitAlgorithm::FixedWindow => fixed_window(&mut entry.state, limit, consume),
            RateLimitAlgorithm::SlidingWindow => sliding_window(&mut entry.state, limit, consume),
        }
    }

    fn initial_state(&self, limit: &EffectiveRateLimit) -> BucketState {
        match self.algorithm {
            RateLimitAlgorithm::TokenBucket => BucketState::TokenBucket {
                tokens: limit.burst_capacity as f64,
                refilled_at: Instant::now(),
            },
            RateLimitAlgorithm::FixedWindow => BucketState::FixedWindow {
                window_index: current_window(limit),
                count: 0,
            },
            RateLimitAlgorithm::SlidingWindow => BucketState::SlidingWindow {
                window_index: current_window(limit),
                current: 0,
                previous: 0,
            },
        }
    }

    fn maybe_prune(&self) {
        if self.operations.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY != PRUNE_EVERY - 1 {
            return;
        }
        let now = Instant::now();
        self.buckets.retain(|_, bucket| bucket.expires_at > now);
    }
}

fn epoch_secs() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

fn current_window(limit: &EffectiveRateLimit) -> u64 {
    epoch_secs() / limit.window_secs.max(1)
}

fn reset_at_epoch(window_index: u64, limit: &EffectiveRateLimit) -> DateTime<Utc> {
    let epoch = (window_index + 1) * limit.window_secs.max(1);
    Utc.timestamp_opt(epoch as i64, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn token_bucket(
    state: &mut BucketState,
    limit: &EffectiveRateLimit,
    consume: bool,
) -> RateLimitDecision {
    let BucketState::TokenBucket { tokens, refilled_at } = state else {
        unreachable!("bucket state matches the configured algorithm");
    };

    let capacity = limit.burst_capacity as f64;
    let rate = limit.refill_rate();
    let elapsed = refilled_at.elapsed().as_secs_f64();
    *tokens = (*tokens + elapsed * rate).min(capacity);
    *refilled_at = Instant::now();

    let allowed = *tokens >= 1.0;
    if consume && allowed {
        *tokens -= 1.0;
    }

    let retry_after_secs = if allowed {
        None
    } else if rate > 0.0 {
        Some(((1.0 - *tokens) / rate).ceil().max(1.0) as u64)
    } else {
        Some(limit.window_secs.max(1))
    };

    let to_full_secs = if rate > 0.0 {
        ((capacity - *tokens) / rate).ceil() as i64
    } else {
        limit.window_secs.max(1) as i64
    };

    RateLimitDecision {
        allowed,
        remaining: tokens.floor().max(0.0) as u32,
        reset_at: Utc::now() + chrono::Duration::seconds(to_full_secs),
        retry_after_secs,
        current_usage: (capacity - *tokens).ceil().max(0.0) as u32,
        limit: *limit,
    }
}

fn fixed_window(
    state: &mut BucketState,
    limit: &EffectiveRateLimit,
    consume: bool,
) -> RateLimitDecision {
    let BucketState::FixedWindow { window_index, count } = state else {
        unreachable!("bucket state matches the configured algorithm");
    };

    let now_window = current_window(limit);
    if *window_index != now_window {
        *window_index = now_window;
        *count = 0;
    }

    let allowed;
    if consume {
        *count += 1;
        allowed = *count <= limit.requests_per_window;
    } else {
        allowed = *count < limit.requests_per_window;
    }

    let reset_at = reset_at_epoch(*window_index, limit);
    let retry_after_secs = (!allowed).then(|| {
        (reset_at.timestamp() - Utc::now().timestamp()).clamp(1, limit.window_secs.max(1) as i64)
            as u64
    });

    RateLimitDecision {
        allowed,
        remaining: limit.requests_per_window.saturating_sub(*count),
        reset_at,
        retry_after_secs,
        current_usage: *count,
        limit: *limit,
    }
}

fn sliding_window(
    state: &mut BucketState,
    limit: &EffectiveRateLimit,
    consume: bool,
) -> RateLimitDecision {
    let BucketState::SlidingWindow { window_index, current, previous } = state else {
        unreachable!("bucket state matches the configured algorithm");
    };

    let now_window = current_window(limit);
    if *window_index != now_window {
        *previous = if now_window == *window_index + 1 {
            *current
        } else {
            0
        };
        *current = 0;
        *window_index = now_window;
    }

    let window_secs = limit.window_secs.max(1);
    let elapsed_fraction = (epoch_secs() % window_secs) as f64 / window_secs as f64;
    let usage = *previous as f64 * (1.0 - elapsed_fraction) + *current as f64;

    let allowed = usage + 1.0 <= limit.requests_per_window as f64;
    if consume && allowed {
        *current += 1;
    }

    let counted = usage + if consume && allowed { 1.0 } else { 0.0 };
    let reset_at = reset_at_epoch(*window_index, limit);
    let retry_after_secs = (!allowed).then(|| {
        (reset_at.timestamp() - Utc::now().timestamp()).clamp(1, window_secs as i64) as u64
    });

    RateLimitDecision {
        allowed,
        remaining: (limit.requests_per_window as f64 - counted).floor().max(0.0) as u32,
        reset_at,
        retry_after_secs,
        current_usage: counted.ceil() as u32,
        limit: *limit,
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn check_and_consume(
        &self,
        key: &RateLimitKey,
        limit: &EffectiveRateLimit,
    ) -> Result<RateLimitDecision> {
        Ok(self.check(key, limit, true))
    }

    async fn get_status(
        &self,
        key: &RateLimitKey,
        limit: &EffectiveRateLimit,
    ) -> Result<RateLimitDecision> {
        Ok(self.check(key, limit, false))
    }

    async fn reset(&self, key: &RateLimitKey) -> Result<()> {
        self.buckets.remove(&key.storage_key());
        Ok(())
    }

    async fn remove_keys_matching(&self, pattern: &str) -> Result<usize> {
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        let before = self.buckets.len();
        self.buckets.retain(|key, _| !key.starts_with(prefix));
        Ok(before.saturating_sub(self.buckets.len()))
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duration::ConfigDuration;

    fn limiter(algorithm: RateLimitAlgorithm) -> InMemoryRateLimiter {
        InMemoryRateLimiter::new(&RateLimitSettings {
            algorithm,
            ..RateLimitSettings::default()
        })
    }

    fn limit(requests: u32, window_secs: u64, burst: u32) -> EffectiveRateLimit {
        EffectiveRateLimit {
            requests_per_window: requests,
            window_secs,
            burst_capacity: burst,
        }
    }

    fn key(client: &str) -> RateLimitKey {
        RateLimitKey::http(client, "orders", None)
    }

    #[tokio::test]
    async fn test_token_bucket_burst_exhaustion() {
        let limiter = limiter(RateLimitAlgorithm::TokenBucket);
        // A long window makes refill negligible during the test
        let limit = limit(3, 3600, 3);

        let mut outcomes = Vec::new();
        for _ in 0..5 {
            let decision = limiter.check_and_consume(&key("c1"), &limit).await.unwrap();
            outcomes.push(decision.allowed);
        }
        assert_eq!(outcomes, vec![true, true, true, false, false]);

        let denied = limiter.check_and_consume(&key("c1"), &limit).await.unwrap();
        assert!(denied.retry_after_secs.is_some());
        assert_eq!(denied.remaining, 0);
    }

    #[tokio::test]
    async fn test_fixed_window_counts_and_retry_after() {
        let limiter = limiter(RateLimitAlgorithm::FixedWindow);
        let limit = limit(3, 3600, 3);

        for i in 1..=3 {
            let decision = limiter.check_and_consume(&key("c1"), &limit).await.unwrap();
            assert!(decision.allowed, "request {} should pass", i);
            assert_eq!(decision.current_usage, i);
        }

        let denied = limiter.check_and_consume(&key("c1"), &limit).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after_secs.unwrap() <= 3600);
        assert!(denied.reset_at >= Utc::now());
    }

    #[tokio::test]
    async fn test_sliding_window_within_single_window() {
        let limiter = limiter(RateLimitAlgorithm::SlidingWindow);
        let limit = limit(3, 3600, 3);

        for _ in 0..3 {
            assert!(limiter.check_and_consume(&key("c1"), &limit).await.unwrap().allowed);
        }
        assert!(!limiter.check_and_consume(&key("c1"), &limit).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_keys_account_independently() {
        let limiter = limiter(RateLimitAlgorithm::FixedWindow);
        let limit = limit(1, 3600, 1);

        assert!(limiter.check_and_consume(&key("c1"), &limit).await.unwrap().allowed);
        assert!(!limiter.check_and_consume(&key("c1"), &limit).await.unwrap().allowed);
        // A different client has its own bucket
        assert!(limiter.check_and_consume(&key("c2"), &limit).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_get_status_does_not_consume() {
        let limiter = limiter(RateLimitAlgorithm::FixedWindow);
        let limit = limit(2, 3600, 2);

        for _ in 0..5 {
            assert!(limiter.get_status(&key("c1"), &limit).await.unwrap().allowed);
        }
        assert!(limiter.check_and_consume(&key("c1"), &limit).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_reset_forgets_bucket() {
        let limiter = limiter(RateLimitAlgorithm::FixedWindow);
        let limit = limit(1, 3600, 1);

        assert!(limiter.check_and_consume(&key("c1"), &limit).await.unwrap().allowed);
        assert!(!limiter.check_and_consume(&key("c1"), &limit).await.unwrap().allowed);

        limiter.reset(&key("c1")).await.unwrap();
        assert!(limiter.check_and_consume(&key("c1"), &limit).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_remove_keys_matching_prefix() {
        let limiter = limiter(RateLimitAlgorithm::FixedWindow);
        let limit = limit(10, 3600, 10);

        let conn_key = RateLimitKey::ws_message("10.0.0.1#conn-1", "orders");
        let other_key = RateLimitKey::ws_message("10.0.0.1#conn-2", "orders");
        limiter.check_and_consume(&conn_key, &limit).await.unwrap();
        limiter.check_and_consume(&other_key, &limit).await.unwrap();

        let removed = limiter
            .remove_keys_matching(&RateLimitKey::client_pattern(
                super::super::RateLimitKind::WsMessage,
                "10.0.0.1#conn-1",
            ))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(limiter.buckets.len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_limiter_allows_everything() {
        let limiter = InMemoryRateLimiter::new(&RateLimitSettings {
            enabled: false,
            ..RateLimitSettings::default()
        });
        let limit = limit(0, 60, 0);
        for _ in 0..10 {
            assert!(limiter.check_and_consume(&key("c1"), &limit).await.unwrap().allowed);
        }
        assert!(!limiter.is_enabled());
    }

    #[tokio::test]
    async fn test_decision_invariants() {
        // remaining >= 0 by type; reset_at never in the past
        let limiter = limiter(RateLimitAlgorithm::TokenBucket);
        let limit = EffectiveRateLimit {
            requests_per_window: 2,
            window_secs: ConfigDuration::from_secs(60).as_secs(),
            burst_capacity: 2,
        };
        for _ in 0..4 {
            let d = limiter.check_and_consume(&key("c1"), &limit).await.unwrap();
            assert!(d.reset_at >= Utc::now() - chrono::Duration::seconds(1));
            assert!(d.current_usage <= limit.burst_capacity + 1);
        }
    }
}
