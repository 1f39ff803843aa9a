//! Cost-based window.
//!
//! Windowed like the fixed window counter, but each request adds its
//! resolved cost (tokens, currency, or a custom unit) instead of one.

use tracing::{debug, trace};

use super::{ttl, window_start, Evaluation};
use crate::ratelimit::decision::RateLimitResult;
use crate::ratelimit::rules::Algorithm;
use crate::storage::StorageResult;

pub(super) async fn check(eval: &Evaluation<'_>, cost: f64) -> StorageResult<RateLimitResult> {
    let rule = eval.rule;
    let now = eval.now;
    let start = window_start(now, rule.window_ms);
    let window_end = start + rule.window_ms;
    let key = eval.key.for_window(rule, start);
    let limit = rule.limit as f64;

    let accumulated = eval.storage.increment(&key, cost).await?;
    eval.storage.expire(&key, ttl(rule.window_ms)).await?;

    trace!(key = %key, cost = cost, accumulated = accumulated, limit = limit, "Cost check");

    if accumulated <= limit {
        Ok(RateLimitResult::allow(
            Algorithm::CostBased,
            rule.limit,
            (limit - accumulated).max(0.0).floor() as u64,
            window_end,
        )
        .with_cost_consumed(accumulated))
    } else {
        let accumulated = eval.storage.increment(&key, -cost).await?;
        debug!(key = %key, cost = cost, accumulated = accumulated, "Cost limit exceeded");

        Ok(RateLimitResult::reject(
            Algorithm::CostBased,
            rule.limit,
            (limit - accumulated).max(0.0).floor() as u64,
            window_end,
            window_end - now,
        )
        .with_cost_consumed(accumulated))
    }
}
