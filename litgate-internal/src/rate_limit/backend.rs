use crate::clock::Clock;
use crate::rate_limit::config::{GlobalRateLimitConfig, RateLimitConfig};
use crate::rate_limit::limiter::FixedWindowLimiter;
use crate::rate_limit::{RateLimitDecision, RateLimitHeaders};
use redis::Script;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

/// Atomic fixed-window consume: INCR the key, arm the window TTL on first
/// use, and report [allowed, remaining, pttl_ms] in one round trip.
const CONSUME_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    ttl = tonumber(ARGV[2])
end
local limit = tonumber(ARGV[1])
if current > limit then
    return {0, 0, ttl}
end
return {1, limit - current, ttl}
"#;

/// Where rate limit counters live.
///
/// Selected once at construction from configuration. The local variant
/// counts per process (true limit multiplies by instance count, an accepted
/// weakness); the remote variant makes the shared store the source of truth
/// and serializes concurrent consumes in the script.
pub enum RateLimitBackend {
    Local(Arc<FixedWindowLimiter>),
    Remote(RemoteStoreBackend),
}

impl RateLimitBackend {
    /// Build the backend for this deployment. A remote store that cannot
    /// even produce a client degrades to local counting at startup; nothing
    /// is consumed remotely on that path.
    pub fn from_config(global: &GlobalRateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let local = Arc::new(FixedWindowLimiter::new(Arc::clone(&clock)));

        match &global.remote_store_url {
            Some(url) => match redis::Client::open(url.as_str()) {
                Ok(client) => {
                    info!(url = %url, "Using shared store for rate limiting");
                    RateLimitBackend::Remote(RemoteStoreBackend::new(client, clock, local))
                }
                Err(e) => {
                    warn!(
                        "Failed to create shared-store client, rate limiting per instance: {e}"
                    );
                    RateLimitBackend::Local(local)
                }
            },
            None => RateLimitBackend::Local(local),
        }
    }

    /// Consume one request for `key` against `config`.
    pub async fn check(&self, key: &str, config: &RateLimitConfig) -> RateLimitDecision {
        match self {
            RateLimitBackend::Local(limiter) => {
                limiter.decide(key, config.limit, config.window_ms)
            }
            RateLimitBackend::Remote(remote) => remote.check(key, config).await,
        }
    }

    /// The in-memory limiter: the backend itself for the local variant, the
    /// fallback table for the remote one. The cleanup sweep runs against it
    /// either way.
    pub fn local_limiter(&self) -> &Arc<FixedWindowLimiter> {
        match self {
            RateLimitBackend::Local(limiter) => limiter,
            RateLimitBackend::Remote(remote) => &remote.fallback,
        }
    }
}

/// Shared-store rate limiting with local fallback.
pub struct RemoteStoreBackend {
    client: redis::Client,
    consume_script: Script,
    clock: Arc<dyn Clock>,
    fallback: Arc<FixedWindowLimiter>,
}

impl RemoteStoreBackend {
    fn new(client: redis::Client, clock: Arc<dyn Clock>, fallback: Arc<FixedWindowLimiter>) -> Self {
        Self {
            client,
            consume_script: Script::new(CONSUME_SCRIPT),
            clock,
            fallback,
        }
    }

    pub async fn check(&self, key: &str, config: &RateLimitConfig) -> RateLimitDecision {
        if !config.is_satisfiable() {
            // Never consult the store for a config that can't admit anything.
            let now = self.clock.now_ms();
            return RateLimitDecision::Deny(RateLimitHeaders {
                limit: config.limit,
                remaining: 0,
                reset: (now + config.window_ms) / 1000,
                retry_after: Some(config.window_ms.div_ceil(1000).max(1) as u32),
            });
        }

        let metrics = self.fallback.metrics();
        metrics.record_remote_check();

        let consume = timeout(
            Duration::from_millis(config.remote_timeout_ms),
            self.consume(key, config),
        )
        .await;

        match consume {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                warn!("Shared rate limit store error, counting locally: {e}");
                metrics.record_remote_error();
                metrics.record_local_fallback();
                self.fallback.decide(key, config.limit, config.window_ms)
            }
            Err(_) => {
                warn!(
                    timeout_ms = config.remote_timeout_ms,
                    "Shared rate limit store timeout, counting locally"
                );
                metrics.record_remote_error();
                metrics.record_local_fallback();
                self.fallback.decide(key, config.limit, config.window_ms)
            }
        }
    }

    async fn consume(
        &self,
        key: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitDecision, redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let reply: Vec<i64> = self
            .consume_script
            .key(format!("rl:{key}"))
            .arg(config.limit)
            .arg(config.window_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(self.parse_reply(&reply, config))
    }

    fn parse_reply(&self, reply: &[i64], config: &RateLimitConfig) -> RateLimitDecision {
        let allowed = reply.first().copied().unwrap_or(0) == 1;
        let remaining = reply.get(1).copied().unwrap_or(0).max(0) as u32;
        let ttl_ms = reply
            .get(2)
            .copied()
            .filter(|ttl| *ttl >= 0)
            .unwrap_or(config.window_ms as i64) as u64;

        let now = self.clock.now_ms();
        let headers = RateLimitHeaders {
            limit: config.limit,
            remaining,
            reset: (now + ttl_ms) / 1000,
            retry_after: if allowed {
                None
            } else {
                Some(ttl_ms.div_ceil(1000).max(1) as u32)
            },
        };

        if allowed {
            self.fallback.metrics().record_allowed();
            RateLimitDecision::Allow(headers)
        } else {
            self.fallback.metrics().record_denied();
            RateLimitDecision::Deny(headers)
        }
    }
}
