//! The fair throttle contract and its implementations.
//!
//! Use one throttle per remote endpoint (load balancer, fleet, etc.).
//! Sharing a throttle between endpoints makes it useless; one per thread
//! converges slowly and loses its fairness properties.

mod bloom;
mod stochastic;

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use crossbeam_utils::CachePadded;
use tracing::debug;

use crate::bucket::AimdTokenBucket;

pub use bloom::BloomFilterFairThrottle;
pub use stochastic::{Config, StochasticFairThrottle};

/// Most probes any throttle hashes a key to.
pub(crate) const MAX_PROBES: usize = 3;

/// A self-tuning throttle that is approximately fair across tenant keys.
///
/// Implementations are safe to call from many threads concurrently, and
/// every operation completes without blocking.
pub trait FairThrottle: Send + Sync {
    /// Decide whether a request for `key` may go downstream.
    ///
    /// `key` identifies the tenant the throttle should be fair to.
    fn should_accept(&self, key: &str) -> ThrottleResult<'_>;
}

/// The outcome of a throttling decision.
///
/// The caller should report back with [`on_success`] or [`on_failure`] when
/// the admitted call completes; without the report the throttle's accuracy
/// degrades. Both callbacks consume the result, so each decision reports at
/// most once. Neither may be called when [`is_allowed`] is false.
///
/// Results are plain stack values bound to the buckets that admitted them.
/// Nothing is allocated per decision.
///
/// [`is_allowed`]: ThrottleResult::is_allowed
/// [`on_success`]: ThrottleResult::on_success
/// [`on_failure`]: ThrottleResult::on_failure
#[derive(Debug)]
pub struct ThrottleResult<'t> {
    buckets: &'t [CachePadded<AimdTokenBucket>],
    probes: [u32; MAX_PROBES],
    probe_count: u8,
}

impl<'t> ThrottleResult<'t> {
    pub(crate) fn allowed(
        buckets: &'t [CachePadded<AimdTokenBucket>],
        probes: [u32; MAX_PROBES],
        probe_count: u8,
    ) -> Self {
        debug_assert!(probe_count as usize >= 1 && probe_count as usize <= MAX_PROBES);
        Self {
            buckets,
            probes,
            probe_count,
        }
    }

    pub(crate) fn denied() -> ThrottleResult<'static> {
        ThrottleResult {
            buckets: &[],
            probes: [0; MAX_PROBES],
            probe_count: 0,
        }
    }

    /// Whether the request was admitted.
    pub fn is_allowed(&self) -> bool {
        self.probe_count > 0
    }

    /// Report that the admitted call completed successfully.
    ///
    /// # Panics
    ///
    /// Panics if the request was not admitted.
    pub fn on_success(self) {
        assert!(
            self.is_allowed(),
            "on_success must only be called if the call was not throttled"
        );
        for &slot in &self.probes[..self.probe_count as usize] {
            self.buckets[slot as usize].on_success();
        }
    }

    /// Report that the admitted call failed from overload.
    ///
    /// # Panics
    ///
    /// Panics if the request was not admitted.
    pub fn on_failure(self) {
        assert!(
            self.is_allowed(),
            "on_failure must only be called if the call was not throttled"
        );
        for &slot in &self.probes[..self.probe_count as usize] {
            self.buckets[slot as usize].on_failure();
        }
    }
}

/// Periodically rotated salt for the key-to-bucket hash.
///
/// Rotation reshuffles which tenants share a bucket, so an unlucky collision
/// only lasts until the next window. One CAS on the last-update timestamp
/// elects a single rotator per window; losers leave the tweak untouched.
/// The randomness is jitter, not security, so a plain thread-local RNG does.
pub(crate) struct TweakCell {
    tweak: AtomicI32,
    last_update_ns: AtomicI64,
    period_ns: i64,
}

impl TweakCell {
    pub(crate) fn new(period_ns: i64, now_ns: i64) -> Self {
        Self {
            tweak: AtomicI32::new(rand::random()),
            last_update_ns: AtomicI64::new(now_ns),
            period_ns,
        }
    }

    /// Rotate if the window has elapsed, then return the current tweak.
    pub(crate) fn current(&self, now_ns: i64) -> i32 {
        let last_update = self.last_update_ns.load(Ordering::Acquire);
        if now_ns - last_update > self.period_ns
            && self
                .last_update_ns
                .compare_exchange(last_update, now_ns, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            let fresh: i32 = rand::random();
            self.tweak.store(fresh, Ordering::Release);
            debug!(tweak = fresh, "rotated bucket tweak");
        }
        self.tweak.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn last_update_ns(&self) -> i64 {
        self.last_update_ns.load(Ordering::Acquire)
    }
}
