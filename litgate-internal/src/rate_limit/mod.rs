pub mod backend;
pub mod config;
pub mod limiter;
pub mod middleware;
pub mod store;

pub use backend::RateLimitBackend;
pub use config::{GlobalRateLimitConfig, RateLimitConfig};
pub use limiter::FixedWindowLimiter;
pub use middleware::{rate_limit_middleware, RateLimitError};
pub use store::RateLimiterStore;

use axum::http::{HeaderMap, HeaderValue};

/// Headers returned with rate limit information
#[derive(Debug, Clone)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset: u64,               // Unix timestamp (seconds)
    pub retry_after: Option<u32>, // Seconds
}

impl RateLimitHeaders {
    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        // These conversions are safe because we're converting numbers to
        // strings. Numbers always produce valid header values.
        if let Ok(value) = HeaderValue::from_str(&self.limit.to_string()) {
            headers.insert("X-RateLimit-Limit", value);
        }

        if let Ok(value) = HeaderValue::from_str(&self.remaining.to_string()) {
            headers.insert("X-RateLimit-Remaining", value);
        }

        if let Ok(value) = HeaderValue::from_str(&self.reset.to_string()) {
            headers.insert("X-RateLimit-Reset", value);
        }

        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                headers.insert("Retry-After", value);
            }
        }

        headers
    }
}

/// Result of a rate limit check
#[derive(Debug)]
pub enum RateLimitDecision {
    Allow(RateLimitHeaders),
    Deny(RateLimitHeaders),
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allow(_))
    }

    pub fn headers(&self) -> &RateLimitHeaders {
        match self {
            RateLimitDecision::Allow(h) | RateLimitDecision::Deny(h) => h,
        }
    }
}

/// Metrics for rate limiter performance monitoring
#[derive(Debug, Default)]
pub struct RateLimiterMetrics {
    pub allowed: std::sync::atomic::AtomicU64,
    pub denied: std::sync::atomic::AtomicU64,
    pub remote_checks: std::sync::atomic::AtomicU64,
    pub remote_errors: std::sync::atomic::AtomicU64,
    pub local_fallbacks: std::sync::atomic::AtomicU64,
    pub swept_entries: std::sync::atomic::AtomicU64,
}

impl RateLimiterMetrics {
    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_denied(&self) {
        self.denied.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_remote_check(&self) {
        self.remote_checks
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_remote_error(&self) {
        self.remote_errors
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_local_fallback(&self) {
        self.local_fallbacks
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_swept(&self, n: u64) {
        self.swept_entries
            .fetch_add(n, std::sync::atomic::Ordering::Relaxed);
    }
}
