use serde::{Deserialize, Serialize};
use url::Url;

/// Rate limit profile for a single route class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window
    #[serde(default = "default_limit")]
    pub limit: u32,

    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Whether rate limiting is enabled for this route
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Remote store operation timeout in milliseconds
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,
}

fn default_limit() -> u32 {
    20
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_enabled() -> bool {
    true
}

fn default_remote_timeout_ms() -> u64 {
    100
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_ms: default_window_ms(),
            enabled: default_enabled(),
            remote_timeout_ms: default_remote_timeout_ms(),
        }
    }
}

impl RateLimitConfig {
    /// A config with `limit == 0` or `window_ms == 0` can never admit a
    /// request; `check` treats it as always-deny rather than an error.
    pub fn is_satisfiable(&self) -> bool {
        self.limit > 0 && self.window_ms > 0
    }

    /// Merge with another config, with other taking precedence
    pub fn merge(self, other: Self) -> Self {
        Self {
            limit: if other.limit != default_limit() {
                other.limit
            } else {
                self.limit
            },
            window_ms: if other.window_ms != default_window_ms() {
                other.window_ms
            } else {
                self.window_ms
            },
            enabled: other.enabled,
            remote_timeout_ms: if other.remote_timeout_ms != default_remote_timeout_ms() {
                other.remote_timeout_ms
            } else {
                self.remote_timeout_ms
            },
        }
    }
}

/// Global rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalRateLimitConfig {
    /// Whether rate limiting is enabled globally
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Default profile for routes without a specific config
    #[serde(default)]
    pub default_config: RateLimitConfig,

    /// Shared store for cross-instance limits. Absent means each instance
    /// counts on its own.
    pub remote_store_url: Option<Url>,

    /// Interval between expired-entry sweeps in milliseconds
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_cleanup_interval_ms() -> u64 {
    300_000
}

impl Default for GlobalRateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            default_config: RateLimitConfig::default(),
            remote_store_url: None,
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

impl GlobalRateLimitConfig {
    pub fn cleanup_interval_ms_or_default(&self) -> u64 {
        if self.cleanup_interval_ms == 0 {
            default_cleanup_interval_ms()
        } else {
            self.cleanup_interval_ms
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_config_defaults() {
        let config = RateLimitConfig::default();
        assert!(config.enabled);
        assert_eq!(config.limit, 20);
        assert_eq!(config.window_ms, 60_000);
        assert_eq!(config.remote_timeout_ms, 100);
        assert!(config.is_satisfiable());
    }

    #[test]
    fn test_unsatisfiable_configs() {
        let config = RateLimitConfig {
            limit: 0,
            ..Default::default()
        };
        assert!(!config.is_satisfiable());

        let config = RateLimitConfig {
            window_ms: 0,
            ..Default::default()
        };
        assert!(!config.is_satisfiable());
    }

    #[test]
    fn test_config_merge() {
        let base = RateLimitConfig {
            limit: 100,
            window_ms: 900_000,
            ..Default::default()
        };

        let override_config = RateLimitConfig {
            limit: 5,
            ..Default::default()
        };

        let merged = base.merge(override_config);
        assert_eq!(merged.limit, 5);
        assert_eq!(merged.window_ms, 900_000);
    }

    #[test]
    fn test_global_config_parses_from_toml() {
        let doc = r#"
            enabled = true
            cleanup_interval_ms = 60000
            remote_store_url = "redis://127.0.0.1:6379"

            [default_config]
            limit = 100
            window_ms = 900000
        "#;

        let config: GlobalRateLimitConfig = toml::from_str(doc).unwrap();
        assert!(config.enabled);
        assert_eq!(config.cleanup_interval_ms, 60_000);
        assert_eq!(config.default_config.limit, 100);
        assert_eq!(
            config.remote_store_url.unwrap().as_str(),
            "redis://127.0.0.1:6379"
        );
    }
}
