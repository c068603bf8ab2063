use crate::rate_limit::config::{GlobalRateLimitConfig, RateLimitConfig};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::Arc;

/// Store for per-route rate limit profiles.
///
/// Routes without an explicit profile fall back to the global default, so
/// every gated endpoint has a limit even when the config file only sets the
/// defaults.
#[derive(Clone)]
pub struct RateLimiterStore {
    /// Map of route class to rate limit profile
    configs: Arc<DashMap<String, Arc<RateLimitConfig>>>,

    /// Global rate limit configuration
    global_config: Arc<ArcSwap<GlobalRateLimitConfig>>,

    /// Default profile for routes without a specific config
    default_config: Arc<RateLimitConfig>,
}

impl RateLimiterStore {
    pub fn new(global_config: GlobalRateLimitConfig) -> Self {
        let default_config = Arc::new(global_config.default_config.clone());

        Self {
            configs: Arc::new(DashMap::new()),
            global_config: Arc::new(ArcSwap::from_pointee(global_config)),
            default_config,
        }
    }

    /// Add or update the profile for a route
    pub fn update_route_config(&self, route: String, config: RateLimitConfig) {
        self.configs.insert(route, Arc::new(config));
    }

    /// Get the profile for a route
    pub fn get_route_config(&self, route: &str) -> Arc<RateLimitConfig> {
        self.configs
            .get(route)
            .map(|entry| Arc::clone(entry.value()))
            .unwrap_or_else(|| Arc::clone(&self.default_config))
    }

    /// Remove the profile for a route
    pub fn remove_route_config(&self, route: &str) {
        self.configs.remove(route);
    }

    /// Check if rate limiting is enabled globally
    pub fn is_enabled(&self) -> bool {
        self.global_config.load().enabled
    }

    /// Update global configuration
    pub fn update_global_config(&self, config: GlobalRateLimitConfig) {
        self.global_config.store(Arc::new(config));
    }

    /// Get all routes with an explicit profile
    pub fn list_routes(&self) -> Vec<String> {
        self.configs
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Load profiles from a map (useful for initialization)
    pub fn load_configs(&self, configs: impl IntoIterator<Item = (String, RateLimitConfig)>) {
        for (route, config) in configs {
            self.update_route_config(route, config);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_store() {
        let global_config = GlobalRateLimitConfig {
            enabled: true,
            default_config: RateLimitConfig {
                limit: 100,
                window_ms: 900_000,
                ..Default::default()
            },
            remote_store_url: None,
            cleanup_interval_ms: 300_000,
        };

        let store = RateLimiterStore::new(global_config);

        // Unknown routes use the default profile.
        let config = store.get_route_config("/v1/unknown");
        assert_eq!(config.limit, 100);
        assert_eq!(config.window_ms, 900_000);

        // Auth endpoints get a stricter profile.
        let auth_config = RateLimitConfig {
            limit: 5,
            window_ms: 900_000,
            ..Default::default()
        };
        store.update_route_config("/v1/auth".to_string(), auth_config);

        let retrieved = store.get_route_config("/v1/auth");
        assert_eq!(retrieved.limit, 5);

        let routes = store.list_routes();
        assert!(routes.contains(&"/v1/auth".to_string()));

        store.remove_route_config("/v1/auth");
        let config_after_remove = store.get_route_config("/v1/auth");
        assert_eq!(config_after_remove.limit, 100); // Back to default
    }

    #[test]
    fn test_global_toggle() {
        let store = RateLimiterStore::new(GlobalRateLimitConfig::default());
        assert!(store.is_enabled());

        store.update_global_config(GlobalRateLimitConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(!store.is_enabled());
    }
}
