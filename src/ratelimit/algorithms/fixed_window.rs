//! Fixed window counter.
//!
//! Time is cut into windows aligned to multiples of the window length. Each
//! window gets its own counter key, so a new window starts from zero and old
//! counters simply expire.

use tracing::{debug, trace};

use super::{ttl, window_start, Evaluation};
use crate::ratelimit::decision::RateLimitResult;
use crate::ratelimit::rules::Algorithm;
use crate::storage::StorageResult;

pub(super) async fn check(eval: &Evaluation<'_>) -> StorageResult<RateLimitResult> {
    let rule = eval.rule;
    let now = eval.now;
    let start = window_start(now, rule.window_ms);
    let window_end = start + rule.window_ms;
    let key = eval.key.for_window(rule, start);

    // Count first, then decide: two concurrent checks can never both take the last slot.
    let count = eval.storage.increment(&key, 1.0).await?;
    eval.storage.expire(&key, ttl(rule.window_ms)).await?;
    let count = count.max(0.0) as u64;

    trace!(key = %key, count = count, limit = rule.limit, "Fixed window check");

    if count <= rule.limit {
        Ok(
            RateLimitResult::allow(Algorithm::FixedWindow, rule.limit, rule.limit - count, window_end)
                .with_total_requests(count),
        )
    } else {
        // Give the slot back so the counter keeps reflecting admitted requests.
        let admitted = eval.storage.increment(&key, -1.0).await?.max(0.0) as u64;
        debug!(key = %key, limit = rule.limit, "Fixed window limit exceeded");

        Ok(RateLimitResult::reject(
            Algorithm::FixedWindow,
            rule.limit,
            0,
            window_end,
            window_end - now,
        )
        .with_total_requests(admitted))
    }
}
