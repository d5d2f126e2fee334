//! Hash-partitioned fair throttle in the stochastic fair queueing style.

use std::sync::Arc;

use crossbeam_utils::CachePadded;
use tracing::debug;

use crate::aimd::SharedAimd;
use crate::bucket::AimdTokenBucket;
use crate::hash::tweaked_hash;
use crate::throttle::{FairThrottle, ThrottleResult, TweakCell, MAX_PROBES};
use crate::time::{SystemTimeSource, TimeSource};

const TWEAK_PERIOD_NS: i64 = 5_000_000_000;

/// A [`FairThrottle`] that allocates the available downstream call rate
/// fairly across tenants in O(1) space and time.
///
/// Each tenant key hashes to one of an array of token buckets, which it
/// potentially shares with (many) other tenants, a bit like a hash table
/// without collision handling. A greedy tenant can only starve the tenants
/// in its own bucket, and because the hash is salted with a periodically
/// rotated tweak, even those collisions dissolve within seconds. The scheme
/// follows stochastic fairness queueing from the networking literature.
///
/// Goodput adaptation happens in the buckets themselves, which share one
/// [`SharedAimd`] control loop. See [`AimdTokenBucket`].
pub struct StochasticFairThrottle {
    buckets: Box<[CachePadded<AimdTokenBucket>]>,
    tweak: TweakCell,
    time: Arc<dyn TimeSource>,
}

impl StochasticFairThrottle {
    /// Create a throttle from a [`Config`].
    pub fn new(config: Config) -> Self {
        let aimd = Arc::new(SharedAimd::with_range(
            config.initial_tps,
            config.floor_tps,
            config.ceiling_tps,
        ));
        let buckets = (0..config.buckets)
            .map(|_| {
                CachePadded::new(AimdTokenBucket::new(
                    config.initial_tps,
                    Arc::clone(&config.time_source),
                    Arc::clone(&aimd),
                ))
            })
            .collect();
        debug!(
            buckets = config.buckets,
            initial_tps = config.initial_tps,
            "created stochastic fair throttle"
        );
        let now = config.time_source.now_ns();
        Self {
            buckets,
            tweak: TweakCell::new(TWEAK_PERIOD_NS, now),
            time: config.time_source,
        }
    }
}

impl Default for StochasticFairThrottle {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl FairThrottle for StochasticFairThrottle {
    fn should_accept(&self, key: &str) -> ThrottleResult<'_> {
        let tweak = self.tweak.current(self.time.now_ns());
        let slot = tweaked_hash(key, tweak, self.buckets.len() as u32);
        if self.buckets[slot as usize].would_allow() {
            self.buckets[slot as usize].claim_token();
            let mut probes = [0u32; MAX_PROBES];
            probes[0] = slot;
            return ThrottleResult::allowed(&self.buckets, probes, 1);
        }
        ThrottleResult::denied()
    }
}

/// Configuration for [`StochasticFairThrottle`].
///
/// `Config::default()` is ready to use; override the fields you need with
/// the corresponding `with_` method.
pub struct Config {
    time_source: Arc<dyn TimeSource>,
    buckets: usize,
    initial_tps: f64,
    floor_tps: f64,
    ceiling_tps: f64,
}

impl Config {
    const DEFAULT_BUCKETS: usize = 17;
    const DEFAULT_INITIAL_TPS: f64 = 100.0;

    /// Replace the system clock, usually with a mock for tests.
    pub fn with_time_source(self, time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            time_source,
            ..self
        }
    }

    /// Set the number of token buckets tenants are hashed across.
    pub fn with_buckets(self, buckets: usize) -> Self {
        assert!(buckets > 0, "buckets must be positive");
        Self { buckets, ..self }
    }

    /// Set the rate the control loop starts from.
    pub fn with_initial_tps(self, initial_tps: f64) -> Self {
        assert!(initial_tps > 0.0, "initial rate must be positive");
        Self {
            initial_tps,
            ..self
        }
    }

    /// Bound the rate the control loop may reach in either direction.
    pub fn with_tps_range(self, floor_tps: f64, ceiling_tps: f64) -> Self {
        assert!(floor_tps > 0.0, "floor must be positive");
        assert!(ceiling_tps > 0.0, "ceiling must be positive");
        assert!(floor_tps <= ceiling_tps, "floor must not exceed ceiling");
        Self {
            floor_tps,
            ceiling_tps,
            ..self
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            time_source: Arc::new(SystemTimeSource::new()),
            buckets: Self::DEFAULT_BUCKETS,
            initial_tps: Self::DEFAULT_INITIAL_TPS,
            floor_tps: SharedAimd::DEFAULT_FLOOR_TPS,
            ceiling_tps: SharedAimd::DEFAULT_CEILING_TPS,
        }
    }
}
