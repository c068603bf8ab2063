use crate::error::{Error, ErrorDetails};
use crate::usage_limit::{OperationKind, UserTier};
use dashmap::DashMap;
use redis::AsyncCommands;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;
use url::Url;

const USAGE_KEY_PREFIX: &str = "usage:";
const TIER_KEY_PREFIX: &str = "tier:";

/// Usage hashes expire two days after last touch. A superseded period is
/// never read again, so retention only needs to outlive the period itself.
const USAGE_RETENTION_SECS: i64 = 172_800;

/// Durable storage for usage counters and subscription records.
///
/// Selected at construction: Redis for deployments, the in-memory variant
/// for tests and single-instance dev where counters may die with the
/// process.
pub enum UsageBackend {
    Redis(RedisUsageStore),
    Memory(MemoryUsageStore),
}

impl UsageBackend {
    /// Current count for `(user, kind, period)`. Zero when no counter
    /// exists yet.
    pub async fn usage(
        &self,
        user_id: &str,
        kind: OperationKind,
        period_key: &str,
    ) -> Result<u64, Error> {
        match self {
            UsageBackend::Redis(store) => store.usage(user_id, kind, period_key).await,
            UsageBackend::Memory(store) => store.usage(user_id, kind, period_key),
        }
    }

    /// Add one to `(user, kind, period)`, creating the counter if absent.
    /// Returns the new count.
    pub async fn increment(
        &self,
        user_id: &str,
        kind: OperationKind,
        period_key: &str,
    ) -> Result<u64, Error> {
        match self {
            UsageBackend::Redis(store) => store.increment(user_id, kind, period_key).await,
            UsageBackend::Memory(store) => store.increment(user_id, kind, period_key),
        }
    }

    /// The user's subscription tier, or None when no record exists.
    pub async fn tier(&self, user_id: &str) -> Result<Option<UserTier>, Error> {
        match self {
            UsageBackend::Redis(store) => store.tier(user_id).await,
            UsageBackend::Memory(store) => store.tier(user_id),
        }
    }
}

/// Redis-backed usage store. One hash per user and period, one field per
/// operation kind; HINCRBY keeps concurrent increments exact.
pub struct RedisUsageStore {
    client: redis::Client,
    op_timeout: Duration,
}

impl RedisUsageStore {
    pub fn new(url: &Url, timeout_ms: u64) -> Result<Self, Error> {
        let client = redis::Client::open(url.as_str()).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create usage store client: {e}"),
            })
        })?;
        Ok(Self {
            client,
            op_timeout: Duration::from_millis(timeout_ms),
        })
    }

    fn usage_key(user_id: &str, period_key: &str) -> String {
        format!("{USAGE_KEY_PREFIX}{user_id}:{period_key}")
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, Error> {
        timeout(self.op_timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| {
                Error::new(ErrorDetails::StoreUnavailable {
                    message: "Usage store connection timed out".to_string(),
                })
            })?
            .map_err(|e| {
                Error::new(ErrorDetails::StoreUnavailable {
                    message: format!("Usage store connection failed: {e}"),
                })
            })
    }

    async fn usage(
        &self,
        user_id: &str,
        kind: OperationKind,
        period_key: &str,
    ) -> Result<u64, Error> {
        let mut conn = self.connection().await?;
        let key = Self::usage_key(user_id, period_key);

        let count: Option<i64> = timeout(self.op_timeout, conn.hget(&key, kind.to_string()))
            .await
            .map_err(|_| {
                Error::new(ErrorDetails::StoreUnavailable {
                    message: format!("Usage read timed out for key {key}"),
                })
            })?
            .map_err(|e| {
                Error::new(ErrorDetails::StoreUnavailable {
                    message: format!("Usage read failed for key {key}: {e}"),
                })
            })?;

        Ok(count.unwrap_or(0).max(0) as u64)
    }

    async fn increment(
        &self,
        user_id: &str,
        kind: OperationKind,
        period_key: &str,
    ) -> Result<u64, Error> {
        let mut conn = self.connection().await?;
        let key = Self::usage_key(user_id, period_key);

        let new_count: i64 = timeout(
            self.op_timeout,
            conn.hincr(&key, kind.to_string(), 1i64),
        )
        .await
        .map_err(|_| {
            Error::new(ErrorDetails::StoreUnavailable {
                message: format!("Usage increment timed out for key {key}"),
            })
        })?
        .map_err(|e| {
            Error::new(ErrorDetails::StoreUnavailable {
                message: format!("Usage increment failed for key {key}: {e}"),
            })
        })?;

        // Refresh retention; failure here only delays garbage collection.
        match timeout(self.op_timeout, conn.expire::<_, ()>(&key, USAGE_RETENTION_SECS)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Failed to refresh usage key retention for {key}: {e}"),
            Err(_) => debug!("Timed out refreshing usage key retention for {key}"),
        }

        Ok(new_count.max(0) as u64)
    }

    async fn tier(&self, user_id: &str) -> Result<Option<UserTier>, Error> {
        let mut conn = self.connection().await?;
        let key = format!("{TIER_KEY_PREFIX}{user_id}");

        let raw: Option<String> = timeout(self.op_timeout, conn.get(&key))
            .await
            .map_err(|_| {
                Error::new(ErrorDetails::StoreUnavailable {
                    message: format!("Tier read timed out for user {user_id}"),
                })
            })?
            .map_err(|e| {
                Error::new(ErrorDetails::StoreUnavailable {
                    message: format!("Tier read failed for user {user_id}: {e}"),
                })
            })?;

        match raw {
            Some(value) => match UserTier::from_str(value.trim()) {
                Ok(tier) => Ok(Some(tier)),
                Err(_) => {
                    // An unrecognized tier record gets the free allowance
                    // rather than an outage.
                    debug!("Unrecognized tier '{value}' for user {user_id}, treating as absent");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }
}

/// In-memory usage store for tests and single-instance dev deployments.
#[derive(Default)]
pub struct MemoryUsageStore {
    counters: DashMap<String, u64>,
    tiers: DashMap<String, UserTier>,
    unavailable: AtomicBool,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tier(&self, user_id: &str, tier: UserTier) {
        self.tiers.insert(user_id.to_string(), tier);
    }

    /// Simulate a store outage; every operation fails until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn counter_key(user_id: &str, kind: OperationKind, period_key: &str) -> String {
        format!("{user_id}:{kind}:{period_key}")
    }

    fn check_available(&self) -> Result<(), Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::new_without_logging(ErrorDetails::StoreUnavailable {
                message: "Usage store is unavailable".to_string(),
            }))
        } else {
            Ok(())
        }
    }

    fn usage(&self, user_id: &str, kind: OperationKind, period_key: &str) -> Result<u64, Error> {
        self.check_available()?;
        Ok(self
            .counters
            .get(&Self::counter_key(user_id, kind, period_key))
            .map(|count| *count)
            .unwrap_or(0))
    }

    fn increment(
        &self,
        user_id: &str,
        kind: OperationKind,
        period_key: &str,
    ) -> Result<u64, Error> {
        self.check_available()?;
        let mut entry = self
            .counters
            .entry(Self::counter_key(user_id, kind, period_key))
            .or_insert(0);
        *entry += 1;
        Ok(*entry)
    }

    fn tier(&self, user_id: &str) -> Result<Option<UserTier>, Error> {
        self.check_available()?;
        Ok(self.tiers.get(user_id).map(|tier| *tier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_counts_per_period() {
        let store = UsageBackend::Memory(MemoryUsageStore::new());

        assert_eq!(
            store
                .usage("u1", OperationKind::AiGeneration, "2024-03-01")
                .await
                .unwrap(),
            0
        );

        for expected in 1..=3 {
            let count = store
                .increment("u1", OperationKind::AiGeneration, "2024-03-01")
                .await
                .unwrap();
            assert_eq!(count, expected);
        }

        // Other kinds and periods are separate counters.
        assert_eq!(
            store
                .usage("u1", OperationKind::DmReply, "2024-03-01")
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            store
                .usage("u1", OperationKind::AiGeneration, "2024-03-02")
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_memory_store_tier_records() {
        let memory = MemoryUsageStore::new();
        memory.set_tier("u1", UserTier::Creator);
        let store = UsageBackend::Memory(memory);

        assert_eq!(store.tier("u1").await.unwrap(), Some(UserTier::Creator));
        assert_eq!(store.tier("nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_store_outage() {
        let memory = MemoryUsageStore::new();
        memory.set_unavailable(true);
        let store = UsageBackend::Memory(memory);

        assert!(store
            .usage("u1", OperationKind::AiGeneration, "2024-03-01")
            .await
            .is_err());
        assert!(store
            .increment("u1", OperationKind::AiGeneration, "2024-03-01")
            .await
            .is_err());
        assert!(store.tier("u1").await.is_err());
    }
}
