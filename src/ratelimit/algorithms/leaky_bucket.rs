//! Leaky bucket.
//!
//! Every admitted request adds one unit to the bucket, which drains at
//! `leak_rate` units per second. Requests are admitted while the level is
//! below `limit`.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{millis_for, ttl, Evaluation};
use crate::ratelimit::decision::RateLimitResult;
use crate::ratelimit::rules::Algorithm;
use crate::storage::StorageResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeakState {
    level: f64,
    last_leak: u64,
}

pub(super) async fn check(eval: &Evaluation<'_>) -> StorageResult<RateLimitResult> {
    let key = eval.key.for_rule(eval.rule);
    let capacity = eval.rule.limit as f64;
    let rate = eval.rule.leak_rate_per_sec();
    let now = eval.now;

    let state = match eval.storage.get(&key).await? {
        Some(raw) => serde_json::from_str::<LeakState>(&raw)?,
        None => LeakState {
            level: 0.0,
            last_leak: now,
        },
    };

    let elapsed = now.saturating_sub(state.last_leak) as f64 / 1000.0;
    let level = (state.level - elapsed * rate).max(0.0);

    trace!(key = %key, level = level, capacity = capacity, "Leaky bucket check");

    if level < capacity {
        let level = level + 1.0;
        let empty_in = millis_for(level, rate);
        let state = LeakState {
            level,
            last_leak: now,
        };
        eval.storage
            .set(&key, serde_json::to_string(&state)?, Some(ttl(empty_in)))
            .await?;

        Ok(RateLimitResult::allow(
            Algorithm::LeakyBucket,
            eval.rule.limit,
            (capacity - level).max(0.0).floor() as u64,
            now + empty_in,
        ))
    } else {
        let retry_after = millis_for(level - capacity + 1.0, rate);
        debug!(key = %key, retry_after = retry_after, "Leaky bucket full");

        Ok(RateLimitResult::reject(
            Algorithm::LeakyBucket,
            eval.rule.limit,
            0,
            now + retry_after,
            retry_after,
        ))
    }
}
