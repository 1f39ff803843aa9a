//! Sliding window log.
//!
//! Keeps the timestamp of every admitted request and admits a new one when
//! fewer than `limit` timestamps fall inside the trailing window.

use tracing::{debug, trace};

use super::{ttl, Evaluation};
use crate::ratelimit::decision::RateLimitResult;
use crate::ratelimit::rules::Algorithm;
use crate::storage::{StorageError, StorageResult};

pub(super) async fn check(eval: &Evaluation<'_>) -> StorageResult<RateLimitResult> {
    let rule = eval.rule;
    let now = eval.now;
    let key = eval.key.for_rule(rule);

    let logged = eval.storage.lrange(&key, 0, -1).await?;
    let mut valid = Vec::with_capacity(logged.len());
    let mut stale = Vec::new();
    for raw in &logged {
        let timestamp: u64 = raw.parse().map_err(|_| StorageError::WrongType {
            key: key.clone(),
        })?;
        if timestamp + rule.window_ms > now {
            valid.push(timestamp);
        } else {
            stale.push(raw.as_str());
        }
    }
    let count = valid.len() as u64;
    let oldest = valid.iter().min().copied();

    trace!(key = %key, count = count, limit = rule.limit, "Sliding window check");

    if count < rule.limit {
        eval.storage.lpush(&key, now.to_string()).await?;
        eval.storage.expire(&key, ttl(rule.window_ms)).await?;

        // Bound memory once the log holds far more than the limit.
        if logged.len() as u64 + 1 > 2 * rule.limit {
            stale.sort_unstable();
            stale.dedup();
            for value in &stale {
                eval.storage.lrem(&key, 0, value).await?;
            }
            debug!(key = %key, pruned = stale.len(), "Pruned sliding window log");
        }

        Ok(RateLimitResult::allow(
            Algorithm::SlidingWindow,
            rule.limit,
            rule.limit - count - 1,
            oldest.unwrap_or(now) + rule.window_ms,
        )
        .with_total_requests(count + 1))
    } else {
        let reset_at = oldest.unwrap_or(now) + rule.window_ms;
        debug!(key = %key, limit = rule.limit, "Sliding window limit exceeded");

        Ok(RateLimitResult::reject(
            Algorithm::SlidingWindow,
            rule.limit,
            0,
            reset_at,
            reset_at - now,
        )
        .with_total_requests(count))
    }
}
