//! Time-bucketed sliding window counters with an injectable clock.
//!
//! Backends use a [`SlidingWindow`] to track intermittent network errors and
//! a [`LatencyEma`] to track response latency. Both accept a [`Clock`] so
//! tests can advance time deterministically instead of sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use watermill::ewma::EWMA;

/// A source of "now". Production code uses [`SystemClock`]; tests use
/// [`ManualClock`] so bucket rollover can be exercised without sleeping.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;
}

/// Wall-clock time via [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only advances when told to. `Instant` itself can't be
/// constructed from an arbitrary offset, so we anchor to the instant the
/// clock was created and track an additional offset in nanoseconds.
#[derive(Debug)]
pub struct ManualClock {
    epoch: Instant,
    offset_nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset_nanos: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_nanos
            .fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.epoch + Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }
}

/// Also usable as a real-time clock for components (e.g. consensus ban
/// deadlines) that need a `SystemTime` rather than a monotonic `Instant`.
pub fn unix_now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

struct Bucket {
    /// number of whole `bucket_size`s since the window was created
    index: i64,
    count: u64,
}

/// Time-bucketed counter. `Count()` reflects only increments whose bucket
/// lies within `[now - window_length, now]`; older buckets are purged
/// lazily whenever the window is touched.
pub struct SlidingWindow {
    window_length: Duration,
    bucket_size: Duration,
    clock: Box<dyn Clock>,
    created_at: Instant,
    buckets: Mutex<Vec<Bucket>>,
}

impl std::fmt::Debug for SlidingWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindow")
            .field("window_length", &self.window_length)
            .field("bucket_size", &self.bucket_size)
            .field("count", &self.count())
            .finish()
    }
}

impl SlidingWindow {
    pub fn new(window_length: Duration, bucket_size: Duration, clock: Box<dyn Clock>) -> Self {
        assert!(bucket_size > Duration::ZERO, "bucket_size must be > 0");
        assert!(
            window_length >= bucket_size,
            "window_length must be >= bucket_size"
        );

        let created_at = clock.now();

        Self {
            window_length,
            bucket_size,
            clock,
            created_at,
            buckets: Mutex::new(Vec::new()),
        }
    }

    fn current_index(&self) -> i64 {
        let elapsed = self.clock.now().saturating_duration_since(self.created_at);
        (elapsed.as_nanos() / self.bucket_size.as_nanos().max(1)) as i64
    }

    fn num_buckets(&self) -> i64 {
        (self.window_length.as_nanos() / self.bucket_size.as_nanos().max(1)).max(1) as i64
    }

    /// Drop buckets older than the window, in place. Caller holds the lock.
    fn evict(buckets: &mut Vec<Bucket>, oldest_valid: i64) {
        buckets.retain(|b| b.index >= oldest_valid);
    }

    pub fn incr(&self) {
        let idx = self.current_index();
        let oldest_valid = idx - self.num_buckets() + 1;

        let mut buckets = self.buckets.lock();
        Self::evict(&mut buckets, oldest_valid);

        match buckets.iter_mut().find(|b| b.index == idx) {
            Some(b) => b.count += 1,
            None => buckets.push(Bucket { index: idx, count: 1 }),
        }
    }

    pub fn count(&self) -> u64 {
        let idx = self.current_index();
        let oldest_valid = idx - self.num_buckets() + 1;

        let mut buckets = self.buckets.lock();
        Self::evict(&mut buckets, oldest_valid);

        buckets.iter().map(|b| b.count).sum()
    }

    /// Average increments per bucket over the window, for components that
    /// want an error *rate* rather than a raw count.
    pub fn avg(&self) -> f64 {
        let total = self.count() as f64;
        total / self.num_buckets() as f64
    }

    pub fn reset(&self) {
        self.buckets.lock().clear();
    }
}

/// Exponentially-weighted moving average of latency, used by backends to
/// decide when they are "degraded". Wraps `watermill`'s streaming EWMA so
/// a single sample can be folded in without keeping history around.
pub struct LatencyEma {
    inner: Mutex<EWMA>,
}

impl std::fmt::Debug for LatencyEma {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyEma")
            .field("value_ms", &self.value_ms())
            .finish()
    }
}

impl LatencyEma {
    /// `alpha` is the smoothing factor (0, 1]; higher weights recent samples
    /// more heavily. 0.1 roughly matches a 10-sample moving average.
    pub fn new(alpha: f64) -> Self {
        Self {
            inner: Mutex::new(EWMA::new(alpha)),
        }
    }

    pub fn record(&self, latency: Duration) {
        let ms = latency.as_secs_f64() * 1000.0;
        self.inner.lock().add(ms);
    }

    pub fn value_ms(&self) -> f64 {
        self.inner.lock().get().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counts_only_within_window() {
        let clock = Arc::new(ManualClock::new());
        let window = SlidingWindow::new(
            Duration::from_secs(10),
            Duration::from_secs(1),
            Box::new(TestClock(clock.clone())),
        );

        window.incr();
        window.incr();
        assert_eq!(window.count(), 2);

        clock.advance(Duration::from_secs(15));
        assert_eq!(window.count(), 0, "old buckets must be evicted");
    }

    #[test]
    fn evicts_lazily_on_access() {
        let clock = Arc::new(ManualClock::new());
        let window = SlidingWindow::new(
            Duration::from_secs(5),
            Duration::from_secs(1),
            Box::new(TestClock(clock.clone())),
        );

        for _ in 0..5 {
            window.incr();
            clock.advance(Duration::from_secs(1));
        }

        // first increment should have rolled out of the window by now
        assert!(window.count() < 5);
    }

    #[test]
    fn latency_ema_smooths_samples() {
        let ema = LatencyEma::new(0.5);
        ema.record(Duration::from_millis(100));
        ema.record(Duration::from_millis(300));
        let v = ema.value_ms();
        assert!(v > 100.0 && v < 300.0);
    }

    /// Clock wrapper so ManualClock can be shared (Arc) while SlidingWindow
    /// still owns a boxed Clock.
    #[derive(Debug)]
    struct TestClock(Arc<ManualClock>);
    impl Clock for TestClock {
        fn now(&self) -> Instant {
            self.0.now()
        }
    }
}
