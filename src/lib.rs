//! Self-tuning fair admission control for calls to a remote dependency.
//!
//! A [`FairThrottle`] runs inside every caller process, learns the
//! downstream's available goodput from call outcomes (an AIMD control loop),
//! and spreads that capacity approximately fairly across tenant keys. All of
//! it is lock-free, O(1) in the number of tenants, and free of cross-process
//! coordination.

#![deny(missing_docs)]

#[cfg(doctest)]
use doc_comment::doctest;
#[cfg(doctest)]
doctest!("../README.md");

pub mod aimd;
pub mod bucket;
pub mod hash;
pub mod throttle;
pub mod time;

// Re-export main types for convenience
pub use throttle::{
    BloomFilterFairThrottle, Config, FairThrottle, StochasticFairThrottle, ThrottleResult,
};
pub use time::{MockTimeSource, SystemTimeSource, TimeSource};
