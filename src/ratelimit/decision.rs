//! The admission decision returned by a check.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::rules::{Action, Algorithm};

/// Outcome of a rate limit check.
///
/// `reset_at` is an absolute epoch-millisecond timestamp; `retry_after` is a
/// relative delay in milliseconds and is only present when the request was
/// blocked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Requests counted in the current window, where the algorithm tracks them
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_requests: Option<u64>,
    /// Accumulated cost in the current window (cost-based rules only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_consumed: Option<f64>,
    pub action: Action,
    /// The algorithm that produced this result; `None` when no rule applied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<Algorithm>,
}

impl RateLimitResult {
    /// An admitted request.
    pub fn allow(algorithm: Algorithm, limit: u64, remaining: u64, reset_at: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_at,
            retry_after: None,
            total_requests: None,
            cost_consumed: None,
            action: Action::default(),
            algorithm: Some(algorithm),
        }
    }

    /// A blocked request.
    pub fn reject(
        algorithm: Algorithm,
        limit: u64,
        remaining: u64,
        reset_at: u64,
        retry_after: u64,
    ) -> Self {
        Self {
            allowed: false,
            retry_after: Some(retry_after),
            ..Self::allow(algorithm, limit, remaining, reset_at)
        }
    }

    /// Result for a scope with no rules: always allowed, unbounded headroom.
    pub fn unlimited(now: u64) -> Self {
        Self {
            allowed: true,
            limit: u64::MAX,
            remaining: u64::MAX,
            reset_at: now,
            retry_after: None,
            total_requests: None,
            cost_consumed: None,
            action: Action::default(),
            algorithm: None,
        }
    }

    pub fn with_total_requests(mut self, total: u64) -> Self {
        self.total_requests = Some(total);
        self
    }

    pub fn with_cost_consumed(mut self, cost: f64) -> Self {
        self.cost_consumed = Some(cost);
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    /// `retry_after` as a duration.
    pub fn retry_after_duration(&self) -> Option<Duration> {
        self.retry_after.map(Duration::from_millis)
    }

    /// Whether this result imposes no limit at all.
    pub fn is_unlimited(&self) -> bool {
        self.algorithm.is_none()
    }
}
