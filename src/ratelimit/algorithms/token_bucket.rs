//! Token bucket.
//!
//! The bucket holds up to `burst` tokens (default `limit`) and refills
//! continuously at `refill_rate` tokens per second. A check takes the
//! requested number of tokens or is rejected.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{millis_for, ttl, Evaluation};
use crate::ratelimit::decision::RateLimitResult;
use crate::ratelimit::rules::Algorithm;
use crate::storage::StorageResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BucketState {
    tokens: f64,
    last_refill: u64,
}

pub(super) async fn check(eval: &Evaluation<'_>, units: f64) -> StorageResult<RateLimitResult> {
    let key = eval.key.for_rule(eval.rule);
    let capacity = eval.rule.capacity() as f64;
    let rate = eval.rule.refill_rate_per_sec();
    let now = eval.now;

    let state = match eval.storage.get(&key).await? {
        Some(raw) => serde_json::from_str::<BucketState>(&raw)?,
        None => {
            debug!(key = %key, capacity = capacity, "Creating new token bucket");
            BucketState {
                tokens: capacity,
                last_refill: now,
            }
        }
    };

    let elapsed = now.saturating_sub(state.last_refill) as f64 / 1000.0;
    let available = (state.tokens + elapsed * rate).min(capacity);

    trace!(key = %key, available = available, requested = units, "Token bucket check");

    if available >= units {
        let tokens = available - units;
        let state = BucketState {
            tokens,
            last_refill: now,
        };
        // Once full again the state carries no information.
        let full_in = millis_for(capacity - tokens, rate);
        eval.storage
            .set(&key, serde_json::to_string(&state)?, Some(ttl(full_in)))
            .await?;

        Ok(RateLimitResult::allow(
            Algorithm::TokenBucket,
            capacity as u64,
            tokens.floor() as u64,
            now + full_in,
        ))
    } else {
        let retry_after = millis_for(units - available, rate);
        debug!(key = %key, retry_after = retry_after, "Token bucket exhausted");

        Ok(RateLimitResult::reject(
            Algorithm::TokenBucket,
            capacity as u64,
            available.max(0.0).floor() as u64,
            now + millis_for(capacity - available, rate),
            retry_after,
        ))
    }
}
