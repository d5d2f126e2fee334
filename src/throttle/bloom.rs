//! Bloom-filter-of-buckets fair throttle.

use std::sync::Arc;

use crossbeam_utils::CachePadded;
use tracing::debug;

use crate::aimd::SharedAimd;
use crate::bucket::AimdTokenBucket;
use crate::hash::generate_n_hashes;
use crate::throttle::{FairThrottle, ThrottleResult, TweakCell, MAX_PROBES};
use crate::time::TimeSource;

const TWEAK_PERIOD_NS: i64 = 60_000_000_000;
const DEFAULT_BUCKET_CAPACITY: f64 = 100.0;

/// A [`FairThrottle`] built as a Bloom filter of token buckets.
///
/// Instead of hashing each tenant to one bucket, the key and a slowly
/// rotating tweak hash it to a set of buckets, and a request is admitted
/// only if every bucket in the set allows it. On admission one token is
/// consumed from each. A greedy tenant therefore only affects tenants that
/// hash to the same set.
///
/// Compared to [`StochasticFairThrottle`], this provides less fairness for
/// small numbers of tenants (a collision in any one probe couples two
/// tenants) but scales with less crosstalk for large numbers of tenants.
/// For most use cases, pick [`StochasticFairThrottle`].
///
/// [`StochasticFairThrottle`]: crate::throttle::StochasticFairThrottle
pub struct BloomFilterFairThrottle {
    buckets: Box<[CachePadded<AimdTokenBucket>]>,
    probes: usize,
    tweak: TweakCell,
    time: Arc<dyn TimeSource>,
}

impl BloomFilterFairThrottle {
    /// Create a throttle with `buckets` buckets of the default capacity.
    ///
    /// # Panics
    ///
    /// Panics if `buckets` is zero or `initial_tps` lies outside the default
    /// AIMD range.
    pub fn new(initial_tps: f64, buckets: usize, time_source: Arc<dyn TimeSource>) -> Self {
        Self::with_bucket_capacity(initial_tps, buckets, DEFAULT_BUCKET_CAPACITY, time_source)
    }

    /// Create a throttle with an explicit per-bucket burst capacity.
    pub fn with_bucket_capacity(
        initial_tps: f64,
        buckets: usize,
        bucket_capacity: f64,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        assert!(buckets > 0, "buckets must be positive");
        let aimd = Arc::new(SharedAimd::new(initial_tps));
        let bucket_array: Box<[_]> = (0..buckets)
            .map(|_| {
                CachePadded::new(AimdTokenBucket::new(
                    bucket_capacity,
                    Arc::clone(&time_source),
                    Arc::clone(&aimd),
                ))
            })
            .collect();
        debug!(
            buckets,
            probes = MAX_PROBES.min(buckets),
            initial_tps,
            "created bloom filter fair throttle"
        );
        let now = time_source.now_ns();
        Self {
            buckets: bucket_array,
            probes: MAX_PROBES.min(buckets),
            tweak: TweakCell::new(TWEAK_PERIOD_NS, now),
            time: time_source,
        }
    }
}

impl FairThrottle for BloomFilterFairThrottle {
    /// A request is admitted only if all the buckets its key hashes to allow
    /// it, in which case a token is consumed from each. A denied request
    /// consumes nothing.
    fn should_accept(&self, key: &str) -> ThrottleResult<'_> {
        let tweak = self.tweak.current(self.time.now_ns());
        let mut probes = [0u32; MAX_PROBES];
        generate_n_hashes(
            key,
            tweak,
            &mut probes[..self.probes],
            self.buckets.len() as u32,
        );
        for &slot in &probes[..self.probes] {
            if !self.buckets[slot as usize].would_allow() {
                return ThrottleResult::denied();
            }
        }
        for &slot in &probes[..self.probes] {
            self.buckets[slot as usize].claim_token();
        }
        ThrottleResult::allowed(&self.buckets, probes, self.probes as u8)
    }
}
