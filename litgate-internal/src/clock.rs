use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Injectable time source.
///
/// The rate limiter and usage meter never call the system clock directly, so
/// window rollover and period boundaries can be driven deterministically in
/// tests.
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;

    /// Seconds since the Unix epoch.
    fn now_secs(&self) -> u64 {
        self.now_ms() / 1000
    }
}

/// Wall-clock time. Returns 0 if system time is before UNIX_EPOCH
/// (extremely rare).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to. Used by tests to cross window and
/// period boundaries without sleeping.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_ms: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance_ms(&self, delta: u64) {
        self.now_ms.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_ms(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// UTC calendar-day period key (`YYYY-MM-DD`) for a given instant.
///
/// Timestamps outside chrono's representable range collapse to the epoch day,
/// which keeps the meter fail-closed rather than panicking.
pub fn period_key_for(now_ms: u64) -> String {
    let date = DateTime::<Utc>::from_timestamp_millis(now_ms as i64)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance_ms(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set_ms(10_000);
        assert_eq!(clock.now_secs(), 10);
    }

    #[test]
    fn test_period_key_is_utc_date() {
        // 2024-03-01T00:00:00Z
        assert_eq!(period_key_for(1_709_251_200_000), "2024-03-01");
        // One millisecond before midnight is still the previous day.
        assert_eq!(period_key_for(1_709_251_199_999), "2024-02-29");
    }

    #[test]
    fn test_system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }
}
