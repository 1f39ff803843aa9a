//! Rate limiting algorithms.
//!
//! Each algorithm reads and writes only the keys carrying its own suffix,
//! through the [`Storage`] trait, and produces a [`RateLimitResult`].
//!
//! Fixed window and cost-based rules count with the backend's atomic
//! increment and cannot over-admit. Token bucket, leaky bucket and sliding
//! window do a read followed by a write, so concurrent checks for the same
//! identifier may admit slightly more than the limit.

mod cost_based;
mod fixed_window;
mod leaky_bucket;
mod sliding_window;
mod token_bucket;

use std::time::Duration;

use super::decision::RateLimitResult;
use super::key::StateKey;
use super::rules::{Algorithm, RateLimitRule};
use crate::storage::{Storage, StorageResult};

/// Everything an algorithm needs to evaluate one rule.
pub struct Evaluation<'a> {
    pub storage: &'a dyn Storage,
    pub key: &'a StateKey,
    pub rule: &'a RateLimitRule,
    /// Epoch milliseconds, shared by all rules of one check
    pub now: u64,
}

/// Evaluate one rule.
///
/// `units` is the number of tokens a token bucket check consumes; cost-based
/// rules add the already resolved `cost` instead. The other algorithms count
/// one request. Both amounts must be finite and non-negative.
pub async fn evaluate(
    eval: &Evaluation<'_>,
    cost: f64,
    units: f64,
) -> StorageResult<RateLimitResult> {
    let result = match eval.rule.algorithm {
        Algorithm::TokenBucket => token_bucket::check(eval, units).await?,
        Algorithm::FixedWindow => fixed_window::check(eval).await?,
        Algorithm::SlidingWindow => sliding_window::check(eval).await?,
        Algorithm::LeakyBucket => leaky_bucket::check(eval).await?,
        Algorithm::CostBased => cost_based::check(eval, cost).await?,
    };
    Ok(result.with_action(eval.rule.action))
}

/// Milliseconds needed to move `amount` units at `rate_per_sec`.
fn millis_for(amount: f64, rate_per_sec: f64) -> u64 {
    (amount / rate_per_sec * 1000.0).ceil().max(0.0) as u64
}

/// Start of the fixed window containing `now`.
fn window_start(now: u64, window_ms: u64) -> u64 {
    now / window_ms * window_ms
}

/// Expiry for state that is worthless once `ms` have passed.
fn ttl(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}
