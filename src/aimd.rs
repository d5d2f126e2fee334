//! Shared AIMD control-loop state.

use std::sync::atomic::Ordering;

use atomic_float::AtomicF64;
use tracing::trace;

/// Additive-increase, multiplicative-decrease target rate.
///
/// One `SharedAimd` is shared by every token bucket of a throttle. Each
/// bucket throttles its own tenants independently, while the shared control
/// loop dials in the right system-wide throughput: every successful call
/// nudges the target up by one TPS, every overload failure cuts it to 70%.
///
/// Updates are deliberately last-writer-wins on a single atomic. Concurrent
/// outcomes can overwrite each other; the aggregate effect is a stochastic
/// random walk toward the downstream's capacity, which is all the control
/// loop needs.
#[derive(Debug)]
pub struct SharedAimd {
    target_tps: AtomicF64,
    floor_tps: f64,
    ceiling_tps: f64,
}

impl SharedAimd {
    const ADDITIVE_STEP_TPS: f64 = 1.0;
    const MULTIPLICATIVE_FACTOR: f64 = 0.7;

    /// Default lower bound for the target rate.
    pub const DEFAULT_FLOOR_TPS: f64 = 5.0;
    /// Default upper bound for the target rate (effectively unbounded).
    pub const DEFAULT_CEILING_TPS: f64 = f64::MAX;

    /// Create with the default floor and ceiling.
    pub fn new(initial_tps: f64) -> Self {
        Self::with_range(
            initial_tps,
            Self::DEFAULT_FLOOR_TPS,
            Self::DEFAULT_CEILING_TPS,
        )
    }

    /// Create with an explicit floor and ceiling.
    pub fn with_range(initial_tps: f64, floor_tps: f64, ceiling_tps: f64) -> Self {
        assert!(floor_tps >= 0.0, "floor must not be negative");
        assert!(floor_tps <= ceiling_tps, "floor must not exceed ceiling");
        assert!(floor_tps <= initial_tps, "initial rate below floor");
        assert!(initial_tps <= ceiling_tps, "initial rate above ceiling");

        Self {
            target_tps: AtomicF64::new(initial_tps),
            floor_tps,
            ceiling_tps,
        }
    }

    /// The current target rate in transactions per second.
    pub fn target_tps(&self) -> f64 {
        self.target_tps.load(Ordering::Relaxed)
    }

    /// Record a successful call: additive increase, saturating at the ceiling.
    pub fn on_success(&self) {
        let target = self.target_tps.load(Ordering::Relaxed);
        self.target_tps.store(
            self.ceiling_tps.min(target + Self::ADDITIVE_STEP_TPS),
            Ordering::Relaxed,
        );
    }

    /// Record an overload failure: multiplicative decrease, saturating at the floor.
    pub fn on_failure(&self) {
        let target = self.target_tps.load(Ordering::Relaxed);
        let cut = self.floor_tps.max(target * Self::MULTIPLICATIVE_FACTOR);
        trace!(from = target, to = cut, "cut target rate");
        self.target_tps.store(cut, Ordering::Relaxed);
    }

    /// Set the target rate directly, bypassing the control loop.
    pub fn set_target_tps(&self, target_tps: f64) {
        self.target_tps.store(target_tps, Ordering::Relaxed);
    }
}
