use crate::auth::Auth;
use crate::clock::{Clock, SystemClock};
use crate::config_parser::Config;
use crate::error::Error;
use crate::rate_limit::middleware::RateLimitLayerState;
use crate::rate_limit::{RateLimitBackend, RateLimiterStore};
use crate::usage_limit::store::{MemoryUsageStore, RedisUsageStore, UsageBackend};
use crate::usage_limit::UsageMeter;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared state wired once at startup and cloned into every layer.
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub auth: Auth,
    pub rate_limiter: Arc<RateLimitBackend>,
    pub rate_limit_store: RateLimiterStore,
    pub usage_meter: Arc<UsageMeter>,
}

impl AppStateData {
    pub fn new(config: Arc<Config>) -> Result<Self, Error> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Construction with an explicit clock, so tests can drive window and
    /// period boundaries.
    pub fn with_clock(config: Arc<Config>, clock: Arc<dyn Clock>) -> Result<Self, Error> {
        let auth = Auth::new();
        for (key, record) in &config.api_keys {
            auth.seed_plaintext_key(key, record.clone());
        }
        if !config.api_keys.is_empty() {
            info!(count = config.api_keys.len(), "Seeded API keys from config");
        }

        let rate_limit_store = RateLimiterStore::new(config.rate_limits.global.clone());
        rate_limit_store.load_configs(config.rate_limits.routes.clone());

        let rate_limiter = Arc::new(RateLimitBackend::from_config(
            &config.rate_limits.global,
            Arc::clone(&clock),
        ));

        let usage_store = match &config.usage_limits.redis_url {
            Some(url) => UsageBackend::Redis(RedisUsageStore::new(
                url,
                config.usage_limits.store_timeout_ms,
            )?),
            None => {
                warn!(
                    "No usage store configured; usage counters are in-memory and reset on restart"
                );
                UsageBackend::Memory(MemoryUsageStore::new())
            }
        };

        let usage_meter = Arc::new(UsageMeter::new(
            usage_store,
            config.tier_limit_table(),
            clock,
            config.usage_limits.meter_config(),
        ));

        Ok(Self {
            config,
            auth,
            rate_limiter,
            rate_limit_store,
            usage_meter,
        })
    }

    pub fn rate_limit_layer_state(&self) -> RateLimitLayerState {
        RateLimitLayerState {
            backend: Arc::clone(&self.rate_limiter),
            store: self.rate_limit_store.clone(),
        }
    }

    /// Start the periodic sweep that bounds rate-limit table growth.
    pub async fn start_background_tasks(&self) {
        let interval_ms = self
            .config
            .rate_limits
            .global
            .cleanup_interval_ms_or_default();
        crate::rate_limit::FixedWindowLimiter::start_cleanup_task(
            self.rate_limiter.local_limiter(),
            interval_ms,
        )
        .await;
    }

    pub async fn shutdown(&self) {
        self.rate_limiter.local_limiter().stop_cleanup_task().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ApiKeyRecord;
    use crate::usage_limit::UserTier;

    #[tokio::test]
    async fn test_state_seeds_config_api_keys() {
        let mut config = Config::default();
        config.api_keys.insert(
            "lk-dev".to_string(),
            ApiKeyRecord {
                user_id: "u-dev".to_string(),
                tier: UserTier::Pro,
                label: None,
            },
        );

        let state = AppStateData::new(Arc::new(config)).unwrap();
        let record = state.auth.validate_api_key("lk-dev").unwrap();
        assert_eq!(record.user_id, "u-dev");
        assert_eq!(record.tier, UserTier::Pro);
    }

    #[tokio::test]
    async fn test_background_task_lifecycle() {
        let state = AppStateData::new(Arc::new(Config::default())).unwrap();
        state.start_background_tasks().await;
        state.shutdown().await;
    }
}
