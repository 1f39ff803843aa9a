//! Rate limiting rules, algorithms and the admission control engine.

mod algorithms;
mod cost;
mod decision;
mod key;
mod limiter;
mod rules;
mod stats;

pub use cost::{effective_cost, RequestCost};
pub use decision::RateLimitResult;
pub use key::StateKey;
pub use limiter::RateLimiter;
pub use rules::{Action, Algorithm, RateLimitRule, RateLimiterConfig, Scope};
pub use stats::{LimiterStats, StatsSnapshot};
