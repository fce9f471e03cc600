//! The limiter backend port

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{EffectiveRateLimit, RateLimitKey};
use crate::error::Result;

/// The outcome of one accounting step
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,

    /// Requests left in the window after this one
    pub remaining: u32,

    /// When the bucket replenishes
    pub reset_at: DateTime<Utc>,

    /// Seconds to wait before retrying; set on rejections
    pub retry_after_secs: Option<u64>,

    /// Requests counted against the window so far
    pub current_usage: u32,

    /// The limit that was enforced
    pub limit: EffectiveRateLimit,
}

impl RateLimitDecision {
    /// An always-allow decision, used when limiting is disabled
    pub fn unlimited(limit: EffectiveRateLimit) -> Self {
        Self {
            allowed: true,
            remaining: limit.requests_per_window,
            reset_at: Utc::now(),
            retry_after_secs: None,
            current_usage: 0,
            limit,
        }
    }
}

/// Window accounting backend
///
/// Implementations must make `check_and_consume` atomic per key: a
/// remote backend runs a single server-side script per decision, the
/// in-memory backend holds a per-key critical section.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Account one request against the bucket and decide
    async fn check_and_consume(
        &self,
        key: &RateLimitKey,
        limit: &EffectiveRateLimit,
    ) -> Result<RateLimitDecision>;

    /// Inspect the bucket without consuming
    async fn get_status(
        &self,
        key: &RateLimitKey,
        limit: &EffectiveRateLimit,
    ) -> Result<RateLimitDecision>;

    /// Forget one bucket
    async fn reset(&self, key: &RateLimitKey) -> Result<()>;

    /// Drop every bucket whose storage key matches `pattern`
    ///
    /// The pattern is a literal prefix terminated by `*`. Returns the
    /// number of buckets removed.
    async fn remove_keys_matching(&self, pattern: &str) -> Result<usize>;

    /// Whether limiting is active; a disabled limiter allows everything
    fn is_enabled(&self) -> bool;
}
