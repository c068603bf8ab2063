use crate::clock::{period_key_for, Clock};
use crate::error::Error;
use crate::usage_limit::store::UsageBackend;
use crate::usage_limit::tier_limits::TierLimitTable;
use crate::usage_limit::{OperationKind, QuotaLimit, UsageCheck, UserTier};
use arc_swap::ArcSwap;
use moka::future::Cache;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strum::IntoEnumIterator;
use tracing::{debug, warn};

/// Configuration for the usage meter
#[derive(Debug, Clone)]
pub struct UsageMeterConfig {
    /// TTL for cached tier lookups (in milliseconds)
    pub tier_cache_ttl_ms: u64,
    /// Maximum number of entries in the tier cache
    pub max_cache_size: u64,
    /// Whether to fail open (allow) or closed (deny) when the store is
    /// unreachable. Denying bounds financial exposure, so closed is the
    /// default.
    pub fail_open: bool,
}

impl Default for UsageMeterConfig {
    fn default() -> Self {
        Self {
            tier_cache_ttl_ms: 30_000,
            max_cache_size: 10_000,
            fail_open: false,
        }
    }
}

/// Metrics for the usage meter
#[derive(Debug, Default)]
pub struct UsageMeterMetrics {
    pub tier_cache_hits: AtomicU64,
    pub tier_cache_misses: AtomicU64,
    pub store_errors: AtomicU64,
    pub allowed_checks: AtomicU64,
    pub denied_checks: AtomicU64,
}

impl UsageMeterMetrics {
    pub fn record_tier_cache_hit(&self) {
        self.tier_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tier_cache_miss(&self) {
        self.tier_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_allowed(&self) {
        self.allowed_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denied(&self) {
        self.denied_checks.fetch_add(1, Ordering::Relaxed);
    }
}

/// Usage snapshot for the profile dashboard.
#[derive(Debug, Serialize)]
pub struct UsageStats {
    pub user_id: String,
    pub tier: UserTier,
    pub period_key: String,
    pub today: HashMap<OperationKind, u64>,
    pub limits: HashMap<OperationKind, QuotaLimit>,
}

/// Per-account, per-operation-kind daily quota enforcement.
///
/// This gates business value, not abuse: the rate limiter has already run by
/// the time a request reaches the meter. Checks never mutate; callers
/// increment only after the gated operation succeeds, so a failed upstream
/// call is never charged.
pub struct UsageMeter {
    store: UsageBackend,
    limits: ArcSwap<TierLimitTable>,
    tier_cache: Cache<String, UserTier>,
    clock: Arc<dyn Clock>,
    config: UsageMeterConfig,
    metrics: Arc<UsageMeterMetrics>,
}

impl UsageMeter {
    pub fn new(
        store: UsageBackend,
        limits: TierLimitTable,
        clock: Arc<dyn Clock>,
        config: UsageMeterConfig,
    ) -> Self {
        let tier_cache = Cache::builder()
            .max_capacity(config.max_cache_size)
            .time_to_live(Duration::from_millis(config.tier_cache_ttl_ms.max(1)))
            .build();

        Self {
            store,
            limits: ArcSwap::from_pointee(limits),
            tier_cache,
            clock,
            config,
            metrics: Arc::new(UsageMeterMetrics::default()),
        }
    }

    /// The current accounting period (UTC calendar day).
    pub fn period_key(&self) -> String {
        period_key_for(self.clock.now_ms())
    }

    /// Resolve the user's effective tier. Accounts with no subscription
    /// record are free-tier.
    pub async fn user_tier(&self, user_id: &str) -> Result<UserTier, Error> {
        if let Some(tier) = self.tier_cache.get(user_id).await {
            self.metrics.record_tier_cache_hit();
            return Ok(tier);
        }
        self.metrics.record_tier_cache_miss();

        let tier = self.store.tier(user_id).await?.unwrap_or_default();
        self.tier_cache.insert(user_id.to_string(), tier).await;
        Ok(tier)
    }

    /// Pure quota check: no mutation, no exception for "limit reached".
    ///
    /// Store failures degrade per `fail_open`; the default denies with a
    /// user-presentable reason rather than silently allowing unlimited
    /// usage.
    pub async fn can_perform_action(&self, user_id: &str, kind: OperationKind) -> UsageCheck {
        let tier = match self.user_tier(user_id).await {
            Ok(tier) => tier,
            Err(e) => return self.degraded_check(user_id, kind, &e),
        };

        let limit = self.limits.load().limit_for(tier, kind);

        if limit == QuotaLimit::Unlimited {
            self.metrics.record_allowed();
            return UsageCheck::allow(limit, 0);
        }

        let current = match self.store.usage(user_id, kind, &self.period_key()).await {
            Ok(current) => current,
            Err(e) => return self.degraded_check(user_id, kind, &e),
        };

        if limit.permits(current) {
            self.metrics.record_allowed();
            UsageCheck::allow(limit, current)
        } else {
            self.metrics.record_denied();
            debug!(user_id, %kind, %limit, current, "Usage quota exhausted");
            UsageCheck::deny(
                format!(
                    "Daily limit reached. You've used {current}/{limit} {kind} today. \
                     Upgrade your plan for more."
                ),
                limit,
                current,
            )
        }
    }

    /// Record one successful operation. Call only after the gated operation
    /// has succeeded; the meter does not observe outcomes itself. Store
    /// failures propagate for the caller to treat as deny-and-log.
    pub async fn increment_usage(&self, user_id: &str, kind: OperationKind) -> Result<u64, Error> {
        let period_key = self.period_key();
        let count = self.store.increment(user_id, kind, &period_key).await?;
        debug!(user_id, %kind, %period_key, count, "Recorded usage");
        Ok(count)
    }

    /// Today's per-kind counts plus the active tier and its limits.
    pub async fn usage_stats(&self, user_id: &str) -> Result<UsageStats, Error> {
        let tier = self.user_tier(user_id).await?;
        let period_key = self.period_key();
        let limits = self.limits.load().limits_for_tier(tier);

        let mut today = HashMap::new();
        for kind in OperationKind::iter() {
            today.insert(kind, self.store.usage(user_id, kind, &period_key).await?);
        }

        Ok(UsageStats {
            user_id: user_id.to_string(),
            tier,
            period_key,
            today,
            limits,
        })
    }

    /// Swap in a new tier limit table (pushed by the registry refresh).
    pub fn update_limits(&self, table: TierLimitTable) {
        self.limits.store(Arc::new(table));
    }

    /// Drop a user's cached tier, e.g. after a plan change.
    pub async fn invalidate_tier(&self, user_id: &str) {
        self.tier_cache.invalidate(user_id).await;
    }

    pub fn metrics(&self) -> Arc<UsageMeterMetrics> {
        Arc::clone(&self.metrics)
    }

    fn degraded_check(&self, user_id: &str, kind: OperationKind, error: &Error) -> UsageCheck {
        self.metrics.record_store_error();

        if self.config.fail_open {
            warn!(user_id, %kind, "Usage store unavailable, allowing (fail-open): {error}");
            self.metrics.record_allowed();
            UsageCheck::allow(QuotaLimit::Unlimited, 0)
        } else {
            warn!(user_id, %kind, "Usage store unavailable, denying: {error}");
            self.metrics.record_denied();
            UsageCheck::deny(
                "We couldn't verify your usage limits right now. Please try again shortly."
                    .to_string(),
                QuotaLimit::Limited(0),
                0,
            )
        }
    }
}
