use crate::clock::Clock;
use crate::rate_limit::{RateLimitDecision, RateLimitHeaders, RateLimiterMetrics};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::debug;

/// One caller's counter for the current window.
#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    count: u32,
    window_reset_at: u64, // epoch ms
}

/// Fixed-window request counter keyed by caller identity.
///
/// Counts events in discrete, non-overlapping windows and resets at each
/// boundary. This admits bursts of up to `2 x limit` across a boundary; the
/// tradeoff is a single map write per check. Each limiter is an explicit
/// instance holding its own table and clock, so tests can run isolated
/// limiters against a manual clock.
///
/// The check-then-increment for a key happens under that key's entry lock,
/// so concurrent checks cannot admit more than `limit` requests per window.
pub struct FixedWindowLimiter {
    entries: DashMap<String, WindowEntry>,
    clock: Arc<dyn Clock>,
    metrics: Arc<RateLimiterMetrics>,
    sweep_handle: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl FixedWindowLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            metrics: Arc::new(RateLimiterMetrics::default()),
            sweep_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Record one request for `key` and report whether it is within
    /// `limit` per `window_ms`.
    ///
    /// A `limit` or `window_ms` of zero can never be satisfied and denies
    /// without touching the table.
    pub fn check(&self, key: &str, limit: u32, window_ms: u64) -> bool {
        if limit == 0 || window_ms == 0 {
            self.metrics.record_denied();
            return false;
        }

        let now = self.clock.now_ms();
        let allowed = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if now >= entry.window_reset_at {
                    // Window rolled over: fresh count.
                    *entry = WindowEntry {
                        count: 1,
                        window_reset_at: now + window_ms,
                    };
                    true
                } else if entry.count < limit {
                    entry.count += 1;
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(WindowEntry {
                    count: 1,
                    window_reset_at: now + window_ms,
                });
                true
            }
        };

        if allowed {
            self.metrics.record_allowed();
        } else {
            self.metrics.record_denied();
        }
        allowed
    }

    /// Requests left for `key` in the current window. Read-only.
    pub fn remaining(&self, key: &str, limit: u32) -> u32 {
        let now = self.clock.now_ms();
        match self.entries.get(key) {
            Some(entry) if entry.window_reset_at > now => limit.saturating_sub(entry.count),
            _ => limit,
        }
    }

    /// When `key`'s window expires (epoch ms), or None if no entry exists.
    pub fn reset_time(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.window_reset_at)
    }

    /// Delete all entries whose window has already expired. The table never
    /// shrinks otherwise.
    pub fn cleanup(&self) {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.window_reset_at >= now);
        let swept = before.saturating_sub(self.entries.len());
        if swept > 0 {
            self.metrics.record_swept(swept as u64);
            debug!(swept, remaining_entries = self.entries.len(), "Swept expired rate limit entries");
        }
    }

    /// `check` plus the header snapshot callers attach to responses.
    pub fn decide(&self, key: &str, limit: u32, window_ms: u64) -> RateLimitDecision {
        let allowed = self.check(key, limit, window_ms);
        let now = self.clock.now_ms();

        let (remaining, reset_ms) = match self.entries.get(key) {
            Some(entry) if entry.window_reset_at > now => {
                (limit.saturating_sub(entry.count), entry.window_reset_at)
            }
            _ => (limit, now + window_ms),
        };

        let headers = RateLimitHeaders {
            limit,
            remaining,
            reset: reset_ms / 1000,
            retry_after: if allowed {
                None
            } else {
                Some(reset_ms.saturating_sub(now).div_ceil(1000) as u32)
            },
        };

        if allowed {
            RateLimitDecision::Allow(headers)
        } else {
            RateLimitDecision::Deny(headers)
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn metrics(&self) -> Arc<RateLimiterMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Start the periodic expired-entry sweep.
    pub async fn start_cleanup_task(limiter: &Arc<Self>, interval_ms: u64) {
        let task_limiter = Arc::clone(limiter);
        let handle = tokio::spawn(async move {
            let mut sweep_interval = interval(Duration::from_millis(interval_ms.max(1)));
            loop {
                sweep_interval.tick().await;
                task_limiter.cleanup();
            }
        });

        if let Some(old) = limiter.sweep_handle.write().await.replace(handle) {
            old.abort();
        }
    }

    /// Stop the periodic sweep.
    pub async fn stop_cleanup_task(&self) {
        if let Some(handle) = self.sweep_handle.write().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter_at(start_ms: u64) -> (FixedWindowLimiter, ManualClock) {
        let clock = ManualClock::new(start_ms);
        let limiter = FixedWindowLimiter::new(Arc::new(clock.clone()));
        (limiter, clock)
    }

    #[test]
    fn test_limit_exhaustion_within_window() {
        let (limiter, _clock) = limiter_at(1_000_000);

        for i in 0..5 {
            assert!(limiter.check("ip:1.2.3.4", 5, 60_000), "call {i} should pass");
        }
        assert!(!limiter.check("ip:1.2.3.4", 5, 60_000));
        assert_eq!(limiter.remaining("ip:1.2.3.4", 5), 0);
    }

    #[test]
    fn test_window_rollover_resets_count() {
        let (limiter, clock) = limiter_at(1_000_000);

        for _ in 0..3 {
            assert!(limiter.check("api:k1", 3, 60_000));
        }
        assert!(!limiter.check("api:k1", 3, 60_000));

        clock.advance_ms(60_000);
        assert!(limiter.check("api:k1", 3, 60_000));
        assert_eq!(limiter.remaining("api:k1", 3), 2);
        assert_eq!(limiter.reset_time("api:k1"), Some(1_060_000 + 60_000));
    }

    #[test]
    fn test_keys_are_independent() {
        let (limiter, _clock) = limiter_at(0);

        for _ in 0..2 {
            assert!(limiter.check("ip:a", 2, 60_000));
        }
        assert!(!limiter.check("ip:a", 2, 60_000));

        assert!(limiter.check("ip:b", 2, 60_000));
        assert_eq!(limiter.remaining("ip:b", 2), 1);
        assert_eq!(limiter.remaining("ip:a", 2), 0);
    }

    #[test]
    fn test_remaining_decrements_per_allowed_check() {
        let (limiter, clock) = limiter_at(500);

        assert_eq!(limiter.remaining("user:abc", 4), 4);
        for expected in (0..4).rev() {
            assert!(limiter.check("user:abc", 4, 10_000));
            assert_eq!(limiter.remaining("user:abc", 4), expected);
        }

        // Denied checks do not mutate the count further.
        assert!(!limiter.check("user:abc", 4, 10_000));
        assert_eq!(limiter.remaining("user:abc", 4), 0);

        clock.advance_ms(10_000);
        assert_eq!(limiter.remaining("user:abc", 4), 4);
    }

    #[test]
    fn test_reset_time_unknown_key() {
        let (limiter, _clock) = limiter_at(0);
        assert_eq!(limiter.reset_time("ip:nobody"), None);
    }

    #[test]
    fn test_zero_limit_and_zero_window_deny() {
        let (limiter, _clock) = limiter_at(0);
        assert!(!limiter.check("ip:z", 0, 60_000));
        assert!(!limiter.check("ip:z", 5, 0));
        // Nothing was recorded for the key.
        assert_eq!(limiter.reset_time("ip:z"), None);
    }

    #[test]
    fn test_cleanup_removes_only_expired_entries() {
        let (limiter, clock) = limiter_at(0);

        assert!(limiter.check("ip:old", 5, 1_000));
        assert!(limiter.check("ip:fresh", 5, 120_000));
        assert_eq!(limiter.entry_count(), 2);

        clock.advance_ms(5_000);
        limiter.cleanup();

        assert_eq!(limiter.entry_count(), 1);
        assert_eq!(limiter.reset_time("ip:old"), None);
        assert!(limiter.reset_time("ip:fresh").is_some());
    }

    #[test]
    fn test_decide_reports_retry_after_on_deny() {
        let (limiter, _clock) = limiter_at(1_000);

        assert!(limiter.decide("ip:d", 1, 60_000).is_allowed());

        let decision = limiter.decide("ip:d", 1, 60_000);
        assert!(!decision.is_allowed());
        let headers = decision.headers();
        assert_eq!(headers.limit, 1);
        assert_eq!(headers.remaining, 0);
        assert_eq!(headers.retry_after, Some(60));
    }

    #[tokio::test]
    async fn test_cleanup_task_lifecycle() {
        let clock = ManualClock::new(0);
        let limiter = Arc::new(FixedWindowLimiter::new(Arc::new(clock.clone())));

        assert!(limiter.check("ip:t", 5, 10));
        clock.advance_ms(50);

        FixedWindowLimiter::start_cleanup_task(&limiter, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        limiter.stop_cleanup_task().await;

        assert_eq!(limiter.entry_count(), 0);
    }
}
