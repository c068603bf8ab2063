use crate::auth::ApiKeyRecord;
use crate::error::{Error, ErrorDetails};
use crate::rate_limit::config::{GlobalRateLimitConfig, RateLimitConfig};
use crate::usage_limit::meter::UsageMeterConfig;
use crate::usage_limit::tier_limits::TierLimitTable;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use url::Url;

/// Top-level gateway configuration, loaded from a TOML file. Every knob has
/// a default so `--default-config` deployments work without a file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub rate_limits: RateLimitsSection,

    #[serde(default)]
    pub usage_limits: UsageLimitsSection,

    /// Plaintext API keys seeded at startup, for deployments without a
    /// registry store. Keys are hashed before entering the auth registry.
    #[serde(default)]
    pub api_keys: HashMap<String, ApiKeyRecord>,
}

impl Config {
    pub fn load_from_path(path: &Path) -> Result<Config, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file {}: {e}", path.display()),
            })
        })?;

        toml::from_str(&contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file {}: {e}", path.display()),
            })
        })
    }

    /// The effective tier limit table: config overrides on top of the
    /// built-in defaults.
    pub fn tier_limit_table(&self) -> TierLimitTable {
        match &self.usage_limits.tiers {
            Some(overrides) => overrides.clone().overlaid_on_defaults(),
            None => TierLimitTable::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    /// Address to serve on. Defaults to 0.0.0.0:3000 when unset.
    pub bind_address: Option<SocketAddr>,

    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RateLimitsSection {
    #[serde(flatten)]
    pub global: GlobalRateLimitConfig,

    /// Per-route profiles keyed by path, overriding the default profile.
    #[serde(default)]
    pub routes: HashMap<String, RateLimitConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLimitsSection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Durable store for usage counters and subscription records. Absent
    /// means the in-memory store (counters die with the process).
    pub redis_url: Option<Url>,

    #[serde(default = "default_tier_cache_ttl_ms")]
    pub tier_cache_ttl_ms: u64,

    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: u64,

    /// Allow (true) or deny (false) chargeable operations when the store is
    /// unreachable.
    #[serde(default)]
    pub fail_open: bool,

    /// Tier limit overrides layered onto the built-in table.
    pub tiers: Option<TierLimitTable>,
}

fn default_true() -> bool {
    true
}

fn default_tier_cache_ttl_ms() -> u64 {
    30_000
}

fn default_store_timeout_ms() -> u64 {
    100
}

fn default_max_cache_size() -> u64 {
    10_000
}

impl Default for UsageLimitsSection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            redis_url: None,
            tier_cache_ttl_ms: default_tier_cache_ttl_ms(),
            store_timeout_ms: default_store_timeout_ms(),
            max_cache_size: default_max_cache_size(),
            fail_open: false,
            tiers: None,
        }
    }
}

impl UsageLimitsSection {
    pub fn meter_config(&self) -> UsageMeterConfig {
        UsageMeterConfig {
            tier_cache_ttl_ms: self.tier_cache_ttl_ms,
            max_cache_size: self.max_cache_size,
            fail_open: self.fail_open,
        }
    }
}
