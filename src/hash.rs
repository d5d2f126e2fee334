//! Deterministic hashing for key-to-bucket assignment.
//!
//! Both functions take a `tweak`, a salt that the throttles rotate
//! periodically so that keys which collide in the same buckets only collide
//! for a bounded time.

use xxhash_rust::xxh3::xxh3_64_with_seed;
use xxhash_rust::xxh32::xxh32;

const SIGN_MASK: u32 = i32::MAX as u32;

/// Deterministic value in `[0, range)` for a `key` string and a `tweak`.
///
/// # Panics
///
/// Panics if `range` is zero.
pub fn tweaked_hash(key: &str, tweak: i32, range: u32) -> u32 {
    assert!(range > 0, "range must be positive");
    (xxh32(key.as_bytes(), tweak as u32) & SIGN_MASK) % range
}

/// Fill `out` with hashes of `key` in `[0, range)`, salted with `tweak`.
///
/// A classic Bloom filter computes `n` independent hashes. Here a single
/// 64-bit hash of the key seeds a small PCG which is drawn `out.len()` times,
/// which is cheaper and distributes just as well. Values may repeat; callers
/// that probe buckets simply probe the same bucket more than once.
///
/// # Panics
///
/// Panics if `range` is zero.
pub fn generate_n_hashes(key: &str, tweak: i32, out: &mut [u32], range: u32) {
    assert!(range > 0, "range must be positive");
    let seed = xxh3_64_with_seed(key.as_bytes(), tweak as i64 as u64);
    let mut pcg = Pcg32::new(seed, i64::from(tweak));
    for slot in out {
        *slot = (pcg.next_u32() & SIGN_MASK) % range;
    }
}

/// The 32-bit flavor of O'Neill's PCG PRNG (PCG-XSH-RR).
/// See <https://www.pcg-random.org/> for background.
struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    const MULTIPLIER: u64 = 6364136223846793005;

    fn new(init_state: u64, init_seq: i64) -> Self {
        let mut pcg = Pcg32 {
            state: 0,
            inc: init_seq.wrapping_mul(2).wrapping_add(1) as u64,
        };
        pcg.next_u32();
        pcg.state = pcg.state.wrapping_add(init_state);
        pcg.next_u32();
        pcg
    }

    fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(Self::MULTIPLIER)
            .wrapping_add(self.inc);
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }
}
