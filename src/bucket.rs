//! Lock-free token bucket refilled at the shared AIMD target rate.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use atomic_float::AtomicF64;

use crate::aimd::SharedAimd;
use crate::time::TimeSource;

/// A token bucket whose refill rate tracks a [`SharedAimd`] target.
///
/// Throttling is split into two parts: [`would_allow`] says whether a token
/// is available, and [`claim_token`] actually takes one. The split keeps both
/// operations wait-free at the cost of a race that can over-commit tokens;
/// that debt is paid on the next refill cycle. The contract is to call
/// `would_allow()` and, if it returns true, optionally `claim_token()` soon
/// after.
///
/// [`would_allow`]: AimdTokenBucket::would_allow
/// [`claim_token`]: AimdTokenBucket::claim_token
pub struct AimdTokenBucket {
    capacity: f64,
    tokens: AtomicF64,
    last_refill_ns: AtomicI64,
    aimd: Arc<SharedAimd>,
    time: Arc<dyn TimeSource>,
}

impl AimdTokenBucket {
    /// Create a full bucket.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not positive.
    pub fn new(capacity: f64, time: Arc<dyn TimeSource>, aimd: Arc<SharedAimd>) -> Self {
        assert!(capacity > 0.0, "capacity must be positive");
        Self {
            capacity,
            tokens: AtomicF64::new(capacity),
            last_refill_ns: AtomicI64::new(time.now_ns()),
            aimd,
            time,
        }
    }

    /// Whether a token is currently available.
    ///
    /// The fast path is a single relaxed load. Under contention it can
    /// return false while a racing refill would have admitted; the caller's
    /// next attempt sees the refilled bucket.
    pub fn would_allow(&self) -> bool {
        if self.tokens.load(Ordering::Relaxed) > 1.0 {
            return true;
        }
        self.refill() > 1.0
    }

    /// Take one token. May transiently drive the level below zero; the next
    /// refill corrects it.
    pub fn claim_token(&self) {
        self.tokens.fetch_add(-1.0, Ordering::AcqRel);
    }

    /// Report a successful call to the shared control loop.
    pub fn on_success(&self) {
        self.aimd.on_success();
    }

    /// Report an overload failure to the shared control loop.
    pub fn on_failure(&self) {
        self.aimd.on_failure();
    }

    // Non-blocking refill. Swapping `tokens` and `last_refill_ns` together
    // would need a lock; instead one CAS on `last_refill_ns` elects a single
    // refiller, which then fetch-adds into `tokens`. The two reads are not
    // atomic as a pair, so two racers that both observe a stale token count
    // can together overshoot the top of the bucket:
    //
    //   t=2s  T1 reads now, wins the CAS, reads tokens = 0, to_add = 1
    //   t=3s  T2 reads now, wins the CAS, reads tokens = 0, to_add = 1
    //   t=4s  T1 adds, tokens = 1
    //   t=5s  T2 adds, tokens = 2 (one above capacity)
    //
    // Capping `to_add` at `capacity - last_tokens` bounds the overshoot to
    // one losing racer's contribution, and the next cycle absorbs it.
    #[inline]
    fn refill(&self) -> f64 {
        loop {
            let now = self.time.now_ns();
            let last_refill = self.last_refill_ns.load(Ordering::Acquire);
            let mut to_add = self.aimd.target_tps() * ((now - last_refill) as f64 / 1e9);
            if to_add < 1.0 {
                return self.tokens.load(Ordering::Acquire);
            }
            if self
                .last_refill_ns
                .compare_exchange(last_refill, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let last_tokens = self.tokens.load(Ordering::Acquire);
                to_add = to_add.min(self.capacity - last_tokens);
                return self.tokens.fetch_add(to_add, Ordering::AcqRel) + to_add;
            }
        }
    }
}

impl fmt::Debug for AimdTokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AimdTokenBucket")
            .field("capacity", &self.capacity)
            .field("tokens", &self.tokens.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
