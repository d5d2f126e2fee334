//! Injectable time sources driving token refill and tweak rotation.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// A monotonic nanosecond clock.
///
/// Throttles and their buckets read time through this trait so that tests
/// and simulations can drive virtual time deterministically.
pub trait TimeSource: Send + Sync {
    /// Current time in nanoseconds. Must be monotonic non-decreasing.
    fn now_ns(&self) -> i64;
}

/// The default [`TimeSource`], backed by the system monotonic clock.
#[derive(Debug)]
pub struct SystemTimeSource {
    origin: Instant,
}

impl SystemTimeSource {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTimeSource {
    fn now_ns(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }
}

/// A [`TimeSource`] with a settable current time, for tests and simulations.
///
/// Starts at zero. Share one instance (via `Arc`) between the throttle under
/// test and the test driver, then move time forward with [`advance_ns`] or
/// [`set_ns`].
///
/// [`advance_ns`]: MockTimeSource::advance_ns
/// [`set_ns`]: MockTimeSource::set_ns
#[derive(Debug, Default)]
pub struct MockTimeSource {
    now_ns: AtomicI64,
}

impl MockTimeSource {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the current time to an absolute nanosecond value.
    pub fn set_ns(&self, now_ns: i64) {
        self.now_ns.store(now_ns, Ordering::Release);
    }

    /// Move the current time forward by `delta_ns` nanoseconds.
    pub fn advance_ns(&self, delta_ns: i64) {
        self.now_ns.fetch_add(delta_ns, Ordering::AcqRel);
    }

    /// Move the current time forward by a whole number of seconds.
    pub fn advance_secs(&self, secs: i64) {
        self.advance_ns(secs * 1_000_000_000);
    }
}

impl TimeSource for MockTimeSource {
    fn now_ns(&self) -> i64 {
        self.now_ns.load(Ordering::Acquire)
    }
}
