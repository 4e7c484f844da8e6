//! Per-(dimension, identity) token bucket rate limiting.
//!
//! Used by the frontend for per-IP and per-sender limits, and independently
//! instantiated for the interop-validation sender limiter so the two never
//! share state. The refill rate equals the configured limit over the
//! configured interval; buckets are created lazily on first use and refilled
//! lazily on each check rather than by a background task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::trace;
use window::Clock;

/// Returned when a check fails. `retry_after` is how long the caller should
/// wait before the bucket will have at least one token again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimited {
    pub retry_after: Duration,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A single dimension's worth of buckets, e.g. "per-IP" or "per-sender".
/// Construct one per logical limiter (general frontend, sender, interop
/// sender) so they don't share capacity.
pub struct TokenBucketLimiter<K> {
    capacity: f64,
    refill_per_sec: f64,
    clock: Box<dyn Clock>,
    buckets: DashMap<K, Bucket>,
}

impl<K> std::fmt::Debug for TokenBucketLimiter<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("capacity", &self.capacity)
            .field("refill_per_sec", &self.refill_per_sec)
            .field("tracked_keys", &self.buckets.len())
            .finish()
    }
}

impl<K> TokenBucketLimiter<K>
where
    K: std::hash::Hash + Eq + Clone,
{
    /// `max_per_interval` tokens are allowed every `interval`; the bucket
    /// starts full so the first burst up to `max_per_interval` always
    /// succeeds.
    pub fn new(max_per_interval: u32, interval: Duration, clock: Box<dyn Clock>) -> Self {
        let refill_per_sec = max_per_interval as f64 / interval.as_secs_f64().max(f64::EPSILON);

        Self {
            capacity: max_per_interval as f64,
            refill_per_sec,
            clock,
            buckets: DashMap::new(),
        }
    }

    /// Attempt to take one token for `key`. Returns `Ok(())` on success, or
    /// `Err(RateLimited)` with the time until a token will be available.
    pub fn check(&self, key: K) -> Result<(), RateLimited> {
        let now = self.clock.now();

        let mut entry = self.buckets.entry(key).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(entry.last_refill);
        let refill = elapsed.as_secs_f64() * self.refill_per_sec;
        entry.tokens = (entry.tokens + refill).min(self.capacity);
        entry.last_refill = now;

        if entry.tokens >= 1.0 {
            entry.tokens -= 1.0;
            trace!(tokens_left = entry.tokens, "rate limit check passed");
            Ok(())
        } else {
            let deficit = 1.0 - entry.tokens;
            let retry_after = Duration::from_secs_f64(deficit / self.refill_per_sec);
            Err(RateLimited { retry_after })
        }
    }

    pub fn reset(&self, key: &K) {
        self.buckets.remove(key);
    }
}

/// Bypasses both the per-IP and per-sender dimensions. A sender or IP in
/// this set never consults a bucket.
#[derive(Debug, Default, Clone)]
pub struct Allowlist {
    entries: Arc<DashMap<String, ()>>,
}

impl Allowlist {
    pub fn new(entries: impl IntoIterator<Item = String>) -> Self {
        let map = DashMap::new();
        for e in entries {
            map.insert(e, ());
        }
        Self {
            entries: Arc::new(map),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use window::ManualClock;

    #[derive(Debug)]
    struct SharedManual(Arc<ManualClock>);
    impl Clock for SharedManual {
        fn now(&self) -> Instant {
            self.0.now()
        }
    }

    #[test]
    fn allows_burst_then_limits() {
        let clock = Arc::new(ManualClock::new());
        let limiter: TokenBucketLimiter<&str> =
            TokenBucketLimiter::new(1, Duration::from_secs(2), Box::new(SharedManual(clock.clone())));

        assert!(limiter.check("alice").is_ok());
        let err = limiter.check("alice").unwrap_err();
        assert!(err.retry_after <= Duration::from_secs(2));
    }

    #[test]
    fn refills_after_interval() {
        let clock = Arc::new(ManualClock::new());
        let limiter: TokenBucketLimiter<&str> =
            TokenBucketLimiter::new(1, Duration::from_secs(2), Box::new(SharedManual(clock.clone())));

        assert!(limiter.check("alice").is_ok());
        assert!(limiter.check("alice").is_err());

        clock.advance(Duration::from_millis(2100));
        assert!(limiter.check("alice").is_ok());
    }

    #[test]
    fn dimensions_are_independent() {
        let clock = Arc::new(ManualClock::new());
        let ip_limiter: TokenBucketLimiter<&str> =
            TokenBucketLimiter::new(1, Duration::from_secs(60), Box::new(SharedManual(clock.clone())));
        let sender_limiter: TokenBucketLimiter<&str> =
            TokenBucketLimiter::new(1, Duration::from_secs(60), Box::new(SharedManual(clock.clone())));

        assert!(ip_limiter.check("1.2.3.4").is_ok());
        // same identity string in a different dimension is unaffected
        assert!(sender_limiter.check("1.2.3.4").is_ok());
    }

    #[test]
    fn allowlist_bypasses() {
        let allow = Allowlist::new(["0xabc".to_string()]);
        assert!(allow.contains("0xabc"));
        assert!(!allow.contains("0xdef"));
    }
}
