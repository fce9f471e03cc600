//! Token revocation pipeline
//!
//! Each authentication runs the token through tiers ordered from
//! cheapest to most authoritative:
//!
//! 1. **TTL shortcut** -- tokens about to expire skip the check; the
//!    risk window is bounded by the configured threshold.
//! 2. **Bloom filter** -- a definitive negative proves not-revoked.
//! 3. **Local verdict cache** -- recent store answers, per instance.
//! 4. **Revocation store** -- authoritative; the answer is cached.
//!
//! Revocations write through to the store, the filter, and the cache,
//! then publish an event so other instances converge before the next
//! periodic rebuild. On first boot the filter starts empty and a full
//! rebuild runs asynchronously; until it completes, revocations that
//! predate this instance are only caught by the store tier.

pub mod bloom;
pub mod events;
pub mod repository;

pub use bloom::{user_filter_key, RevocationFilter};
pub use events::{InProcessEventBus, RevocationEvent, RevocationEventBus};
pub use repository::{InMemoryRevocationRepository, RevokedUser, TokenRevocationRepository};

#[cfg(feature = "redis")]
pub use events::RedisEventBus;
#[cfg(feature = "redis")]
pub use repository::RedisRevocationRepository;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::Claims;
use crate::config::RevocationConfig;
use crate::error::Result;

/// A cached store verdict
#[derive(Debug, Clone, Copy)]
struct CachedVerdict {
    revoked: bool,
    cached_until: Instant,
}

/// The tiered revocation checker
pub struct RevocationPipeline {
    repository: Arc<dyn TokenRevocationRepository>,
    events: Arc<dyn RevocationEventBus>,
    filter: RevocationFilter,
    cache: Mutex<LruCache<String, CachedVerdict>>,
    config: RevocationConfig,
}

impl RevocationPipeline {
    /// Assemble the pipeline; the filter starts empty until the first
    /// rebuild completes
    pub fn new(
        repository: Arc<dyn TokenRevocationRepository>,
        events: Arc<dyn RevocationEventBus>,
        config: RevocationConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            filter: RevocationFilter::new(
                config.bloom_expected_items,
                config.bloom_false_positive_rate,
            ),
            cache: Mutex::new(LruCache::new(capacity)),
            repository,
            events,
            config,
        }
    }

    /// Whether the token carried by `claims` is revoked
    ///
    /// Store failures follow the configured policy: fail-open answers
    /// "not revoked", fail-closed surfaces the error to the caller.
    pub async fn is_revoked(&self, claims: &Claims) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }

        // Tier 1: a token this close to expiry is cheaper to let die
        if claims.time_to_expiry() < self.config.check_threshold.duration() {
            return Ok(false);
        }

        let jti = claims.jti.as_deref();
        let user_key = self
            .config
            .user_revocation_enabled
            .then(|| user_filter_key(&claims.sub));

        // Tier 2: a clean filter read is definitive
        let jti_maybe = jti.map(|j| self.filter.contains(j)).unwrap_or(false);
        let user_maybe = user_key
            .as_deref()
            .map(|k| self.filter.contains(k))
            .unwrap_or(false);
        if !jti_maybe && !user_maybe {
            return Ok(false);
        }

        // Tier 3: recent store verdicts, keyed by JTI
        if let Some(jti) = jti {
            if let Some(verdict) = self.cached_verdict(jti) {
                return Ok(verdict);
            }
        }

        // Tier 4: the store decides; remember the answer
        match self.check_store(claims, jti).await {
            Ok(revoked) => {
                if let Some(jti) = jti {
                    self.cache_verdict(jti, revoked);
                }
                Ok(revoked)
            }
            Err(e) if self.config.fail_open => {
                tracing::warn!("revocation store unavailable, failing open: {}", e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn check_store(&self, claims: &Claims, jti: Option<&str>) -> Result<bool> {
        if let Some(jti) = jti {
            if self.repository.is_revoked(jti).await? {
                return Ok(true);
            }
        }
        if self.config.user_revocation_enabled {
            if let Some(iat) = claims.iat {
                let issued_at = DateTime::from_timestamp(iat, 0).unwrap_or_else(Utc::now);
                return self.repository.is_user_revoked(&claims.sub, issued_at).await;
            }
        }
        Ok(false)
    }

    fn cached_verdict(&self, jti: &str) -> Option<bool> {
        let mut cache = self.cache.lock().expect("revocation cache lock poisoned");
        match cache.get(jti) {
            Some(verdict) if verdict.cached_until > Instant::now() => Some(verdict.revoked),
            Some(_) => {
                cache.pop(jti);
                None
            }
            None => None,
        }
    }

    fn cache_verdict(&self, jti: &str, revoked: bool) {
        let mut cache = self.cache.lock().expect("revocation cache lock poisoned");
        cache.put(
            jti.to_string(),
            CachedVerdict {
                revoked,
                cached_until: Instant::now() + self.config.cache_ttl.duration(),
            },
        );
    }

    /// Revoke a single token
    ///
    /// Writes through to the store, the local filter and cache, then
    /// publishes the event for other instances.
    pub async fn revoke_token(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<()> {
        self.repository.revoke(jti, expires_at).await?;
        self.filter.insert(jti);
        self.cache_verdict(jti, true);
        self.events
            .publish(RevocationEvent::Token {
                jti: jti.to_string(),
                expires_at,
            })
            .await?;
        tracing::info!(jti, "token revoked");
        Ok(())
    }

    /// Revoke every token of a user issued before `issued_before`
    pub async fn revoke_all_for_user(
        &self,
        user_id: &str,
        issued_before: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.repository
            .revoke_all_for_user(user_id, issued_before, expires_at)
            .await?;
        self.filter.insert(&user_filter_key(user_id));
        // Cached not-revoked verdicts for this user's tokens are now
        // stale; drop everything rather than track ownership
        self.cache
            .lock()
            .expect("revocation cache lock poisoned")
            .clear();
        self.events
            .publish(RevocationEvent::User {
                user_id: user_id.to_string(),
                issued_before,
                expires_at,
            })
            .await?;
        tracing::info!(user_id, "all user tokens revoked");
        Ok(())
    }

    /// Apply an event received from another instance
    fn apply_event(&self, event: RevocationEvent) {
        match event {
            RevocationEvent::Token { jti, .. } => {
                self.filter.insert(&jti);
                self.cache_verdict(&jti, true);
            }
            RevocationEvent::User { user_id, .. } => {
                self.filter.insert(&user_filter_key(&user_id));
                self.cache
                    .lock()
                    .expect("revocation cache lock poisoned")
                    .clear();
            }
        }
    }

    /// Rebuild the filter from the store and swap it in
    ///
    /// Returns the rebuilt population. On store failure the existing
    /// filter keeps serving.
    pub async fn rebuild_filter(&self) -> Result<usize> {
        let started = Instant::now();

        let mut jtis = self.repository.stream_all_revoked_jtis().await?;
        let mut entries: Vec<String> = Vec::new();
        while let Some(jti) = jtis.next().await {
            entries.push(jti?);
        }

        let mut users = self.repository.stream_all_revoked_users().await?;
        while let Some(user) = users.next().await {
            entries.push(user_filter_key(&user?.user_id));
        }

        let mut rebuilt = self.filter.fresh(entries.len());
        for entry in &entries {
            rebuilt.insert(entry.as_str());
        }
        let population = entries.len();
        self.filter.replace(rebuilt, population);

        tracing::info!(
            population,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "revocation filter rebuilt"
        );
        Ok(population)
    }

    /// Approximate filter population, for the health snapshot
    pub fn filter_population(&self) -> usize {
        self.filter.approximate_len()
    }

    /// Start the subscriber and periodic-rebuild tasks
    ///
    /// The first rebuild runs immediately but asynchronously; until it
    /// completes the empty filter only catches revocations seen by this
    /// instance. Both tasks stop when `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        if !self.config.enabled {
            return;
        }

        let pipeline = Arc::clone(self);
        let subscriber_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut stream = match pipeline.events.subscribe().await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!("revocation event subscription failed: {}", e);
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = subscriber_cancel.cancelled() => break,
                    event = stream.next() => match event {
                        Some(event) => pipeline.apply_event(event),
                        None => {
                            tracing::warn!("revocation event stream ended");
                            break;
                        }
                    },
                }
            }
        });

        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let period = pipeline
                .config
                .rebuild_interval
                .duration()
                .max(std::time::Duration::from_secs(1));
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = pipeline.rebuild_filter().await {
                            tracing::warn!("revocation filter rebuild failed, keeping current filter: {}", e);
                        }
                    }
                }
            }
        });
    }
}
