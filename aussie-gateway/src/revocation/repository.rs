//! Token revocation storage port
//!
//! The authoritative record of revoked tokens and users. Entries carry
//! the original token expiry so storage can drop them once they would
//! have expired anyway; the Redis implementation uses native TTLs, the
//! in-memory one prunes lazily on read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A whole-user revocation record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokedUser {
    pub user_id: String,

    /// Tokens issued strictly before this instant are revoked
    pub issued_before: DateTime<Utc>,
}

/// Authoritative storage for revocations
#[async_trait]
pub trait TokenRevocationRepository: Send + Sync {
    /// Record a token revocation, retained until `expires_at`
    async fn revoke(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<()>;

    /// Whether a token is revoked
    async fn is_revoked(&self, jti: &str) -> Result<bool>;

    /// Revoke every token of a user issued before `issued_before`
    async fn revoke_all_for_user(
        &self,
        user_id: &str,
        issued_before: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Whether a user revocation covers a token issued at `issued_at`
    async fn is_user_revoked(&self, user_id: &str, issued_at: DateTime<Utc>) -> Result<bool>;

    /// Every currently revoked JTI, for filter rebuilds
    async fn stream_all_revoked_jtis(&self) -> Result<BoxStream<'static, Result<String>>>;

    /// Every currently revoked user, for filter rebuilds
    async fn stream_all_revoked_users(&self) -> Result<BoxStream<'static, Result<RevokedUser>>>;
}

/// In-memory revocation store for single-instance mode and tests
#[derive(Debug, Default)]
pub struct InMemoryRevocationRepository {
    jtis: DashMap<String, DateTime<Utc>>,
    users: DashMap<String, (DateTime<Utc>, DateTime<Utc>)>,
}

impl InMemoryRevocationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(&self) {
        let now = Utc::now();
        self.jtis.retain(|_, expires_at| *expires_at > now);
        self.users.retain(|_, (_, expires_at)| *expires_at > now);
    }
}

#[async_trait]
impl TokenRevocationRepository for InMemoryRevocationRepository {
    async fn revoke(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<()> {
        if expires_at > Utc::now() {
            self.jtis.insert(jti.to_string(), expires_at);
        }
        Ok(())
    }

    async fn is_revoked(&self, jti: &str) -> Result<bool> {
        Ok(self
            .jtis
            .get(jti)
            .map(|expires_at| *expires_at > Utc::now())
            .unwrap_or(false))
    }

    async fn revoke_all_for_user(
        &self,
        user_id: &str,
        issued_before: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        if expires_at > Utc::now() {
            self.users
                .insert(user_id.to_string(), (issued_before, expires_at));
        }
        Ok(())
    }

    async fn is_user_revoked(&self, user_id: &str, issued_at: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .users
            .get(user_id)
            .map(|entry| {
                let (issued_before, expires_at) = *entry;
                expires_at > Utc::now() && issued_at < issued_before
            })
            .unwrap_or(false))
    }

    async fn stream_all_revoked_jtis(&self) -> Result<BoxStream<'static, Result<String>>> {
        self.prune();
        let jtis: Vec<_> = self.jtis.iter().map(|e| Ok(e.key().clone())).collect();
        Ok(stream::iter(jtis).boxed())
    }

    async fn stream_all_revoked_users(&self) -> Result<BoxStream<'static, Result<RevokedUser>>> {
        self.prune();
        let users: Vec<_> = self
            .users
            .iter()
            .map(|e| {
                Ok(RevokedUser {
                    user_id: e.key().clone(),
                    issued_before: e.value().0,
                })
            })
            .collect();
        Ok(stream::iter(users).boxed())
    }
}

#[cfg(feature = "redis")]
pub use redis_impl::RedisRevocationRepository;

#[cfg(feature = "redis")]
mod redis_impl {
    use super::*;
    use deadpool_redis::redis::AsyncCommands;
    use deadpool_redis::Pool as RedisPool;

    use crate::error::Error;

    const JTI_PREFIX: &str = "aussie:revoked:jti:";
    const USER_PREFIX: &str = "aussie:revoked:user:";

    /// Redis-backed revocation store
    ///
    /// Token entries are markers with a TTL equal to the token's
    /// remaining lifetime; user entries store the `issued_before`
    /// cutoff as a Unix timestamp.
    #[derive(Clone)]
    pub struct RedisRevocationRepository {
        pool: RedisPool,
    }

    impl RedisRevocationRepository {
        pub fn new(pool: RedisPool) -> Self {
            Self { pool }
        }

        async fn connection(&self) -> Result<deadpool_redis::Connection> {
            self.pool
                .get()
                .await
                .map_err(|e| Error::RedisPool(e.to_string()))
        }

        fn ttl_secs(expires_at: DateTime<Utc>) -> Option<u64> {
            let remaining = expires_at.timestamp() - Utc::now().timestamp();
            (remaining > 0).then_some(remaining as u64)
        }

        async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
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

    #[async_trait]
    impl TokenRevocationRepository for RedisRevocationRepository {
        async fn revoke(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<()> {
            let Some(ttl) = Self::ttl_secs(expires_at) else {
                return Ok(());
            };
            let mut conn = self.connection().await?;
            conn.set_ex::<_, _, ()>(format!("{}{}", JTI_PREFIX, jti), 1, ttl)
                .await?;
            Ok(())
        }

        async fn is_revoked(&self, jti: &str) -> Result<bool> {
            let mut conn = self.connection().await?;
            let exists: bool = conn.exists(format!("{}{}", JTI_PREFIX, jti)).await?;
            Ok(exists)
        }

        async fn revoke_all_for_user(
            &self,
            user_id: &str,
            issued_before: DateTime<Utc>,
            expires_at: DateTime<Utc>,
        ) -> Result<()> {
            let Some(ttl) = Self::ttl_secs(expires_at) else {
                return Ok(());
            };
            let mut conn = self.connection().await?;
            conn.set_ex::<_, _, ()>(
                format!("{}{}", USER_PREFIX, user_id),
                issued_before.timestamp(),
                ttl,
            )
            .await?;
            Ok(())
        }

        async fn is_user_revoked(&self, user_id: &str, issued_at: DateTime<Utc>) -> Result<bool> {
            let mut conn = self.connection().await?;
            let cutoff: Option<i64> = conn.get(format!("{}{}", USER_PREFIX, user_id)).await?;
            Ok(cutoff
                .map(|issued_before| issued_at.timestamp() < issued_before)
                .unwrap_or(false))
        }

        async fn stream_all_revoked_jtis(&self) -> Result<BoxStream<'static, Result<String>>> {
            let keys = self.scan_keys(&format!("{}*", JTI_PREFIX)).await?;
            let jtis: Vec<Result<String>> = keys
                .into_iter()
                .filter_map(|key| key.strip_prefix(JTI_PREFIX).map(|s| Ok(s.to_string())))
                .collect();
            Ok(stream::iter(jtis).boxed())
        }

        async fn stream_all_revoked_users(&self) -> Result<BoxStream<'static, Result<RevokedUser>>> {
            let keys = self.scan_keys(&format!("{}*", USER_PREFIX)).await?;
            let mut conn = self.connection().await?;
            let mut users = Vec::new();
            for key in keys {
                let Some(user_id) = key.strip_prefix(USER_PREFIX) else {
                    continue;
                };
                let cutoff: Option<i64> = conn.get(&key).await?;
                if let Some(issued_before) = cutoff {
                    users.push(Ok(RevokedUser {
                        user_id: user_id.to_string(),
                        issued_before: DateTime::from_timestamp(issued_before, 0)
                            .unwrap_or_else(Utc::now),
                    }));
                }
            }
            Ok(stream::iter(users).boxed())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_revoke_and_check() {
        let repo = InMemoryRevocationRepository::new();
        let exp = Utc::now() + Duration::seconds(300);

        assert!(!repo.is_revoked("j1").await.unwrap());
        repo.revoke("j1", exp).await.unwrap();
        assert!(repo.is_revoked("j1").await.unwrap());
        assert!(!repo.is_revoked("j2").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_entry_is_not_revoked() {
        let repo = InMemoryRevocationRepository::new();
        repo.revoke("j1", Utc::now() - Duration::seconds(1))
            .await
            .unwrap();
        assert!(!repo.is_revoked("j1").await.unwrap());
    }

    #[tokio::test]
    async fn test_user_revocation_cutoff() {
        let repo = InMemoryRevocationRepository::new();
        let cutoff = Utc::now();
        repo.revoke_all_for_user("user:7", cutoff, cutoff + Duration::hours(1))
            .await
            .unwrap();

        assert!(repo
            .is_user_revoked("user:7", cutoff - Duration::minutes(5))
            .await
            .unwrap());
        assert!(!repo
            .is_user_revoked("user:7", cutoff + Duration::minutes(5))
            .await
            .unwrap());
        assert!(!repo
            .is_user_revoked("user:8", cutoff - Duration::minutes(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_stream_all() {
        let repo = InMemoryRevocationRepository::new();
        let exp = Utc::now() + Duration::seconds(300);
        repo.revoke("j1", exp).await.unwrap();
        repo.revoke("j2", exp).await.unwrap();
        repo.revoke("stale", Utc::now() - Duration::seconds(1))
            .await
            .unwrap();

        let mut jtis: Vec<String> = repo
            .stream_all_revoked_jtis()
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        jtis.sort();
        assert_eq!(jtis, vec!["j1".to_string(), "j2".to_string()]);
    }
}
