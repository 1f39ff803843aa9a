//! Core rate limiter implementation.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::algorithms::{self, Evaluation};
use super::cost::{effective_cost, RequestCost};
use super::decision::RateLimitResult;
use super::key::StateKey;
use super::rules::{Action, Algorithm, RateLimitRule, RateLimiterConfig, Scope};
use super::stats::{LimiterStats, StatsSnapshot};
use crate::clock::{Clock, SystemClock};
use crate::error::{RateLimitError, Result};
use crate::storage::{self, Storage};

/// The admission control engine.
///
/// Resolves the rules of a scope, evaluates every one of them and combines
/// the results. The engine keeps no per-key state of its own; everything
/// lives in the storage backend, so one instance can be shared across tasks
/// behind an `Arc`.
pub struct RateLimiter {
    config: RateLimiterConfig,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    stats: LimiterStats,
    /// Background sweep of expired entries; `None` once closed
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("key_prefix", &self.config.key_prefix)
            .field("storage", &self.storage.backend_name())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl RateLimiter {
    /// Create a rate limiter, connecting the configured storage backend.
    ///
    /// Invalid rules and missing backend parameters fail here.
    pub async fn new(config: RateLimiterConfig) -> Result<Self> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let storage = storage::connect(&config.storage, clock.clone()).await?;
        Self::with_storage(config, storage, clock)
    }

    /// Create a rate limiter over an existing backend and clock.
    ///
    /// The storage selection in `config` is ignored. Must be called from
    /// within a Tokio runtime, which hosts the expiry sweep.
    pub fn with_storage(
        config: RateLimiterConfig,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate_rules()?;
        let runtime = Handle::try_current().map_err(|_| {
            RateLimitError::Config("the rate limiter must be created inside a Tokio runtime".to_string())
        })?;

        let sweeper = spawn_sweeper(&runtime, storage.clone(), config.sweep_interval());

        info!(
            key_prefix = %config.key_prefix,
            storage = storage.backend_name(),
            scopes = config.rules.len(),
            sweep_interval_ms = config.sweep_interval_ms,
            "Rate limiter initialized"
        );

        Ok(Self {
            config,
            storage,
            clock,
            stats: LimiterStats::new(),
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Check whether `identifier` may proceed under every rule of `scope`.
    ///
    /// `cost` feeds cost-based rules; `tokens` is the number of units token
    /// bucket rules consume (default 1). Every rule is evaluated, in
    /// declaration order. The first blocking result is returned; when all
    /// rules admit, the one with the least remaining headroom is returned.
    /// A scope without rules admits everything.
    ///
    /// Invalid costs or token counts fail before any state is touched. Only
    /// checks that reach a decision are counted in the statistics.
    pub async fn check(
        &self,
        identifier: &str,
        scope: Scope,
        cost: Option<&RequestCost>,
        tokens: Option<f64>,
    ) -> Result<RateLimitResult> {
        let units = validate_request(cost, tokens)?;
        let now = self.clock.now_ms();
        let rules = self.config.rules_for(scope);

        if rules.is_empty() {
            trace!(scope = %scope, identifier = %identifier, "No rules for scope");
            self.stats.record_request();
            self.stats.record_allowed();
            return Ok(RateLimitResult::unlimited(now));
        }

        let key = StateKey::new(&self.config.key_prefix, scope, identifier);
        trace!(key = %key, rules = rules.len(), "Checking rate limit");

        let mut blocking: Option<RateLimitResult> = None;
        let mut tightest: Option<RateLimitResult> = None;

        for rule in rules {
            let result = self.evaluate(&key, rule, now, cost, units).await?;
            if !result.allowed {
                if blocking.is_none() {
                    blocking = Some(result);
                }
            } else if tightest
                .as_ref()
                .map_or(true, |best| result.remaining < best.remaining)
            {
                tightest = Some(result);
            }
        }

        self.stats.record_request();
        match blocking {
            Some(result) => {
                self.record_block(&key, &result);
                Ok(result)
            }
            None => {
                self.stats.record_allowed();
                Ok(tightest.unwrap_or_else(|| RateLimitResult::unlimited(now)))
            }
        }
    }

    /// Evaluate a single rule for an identifier, outside the configured rule set.
    ///
    /// Like `check`, this consumes capacity and validates its inputs. It does
    /// not touch the statistics.
    pub async fn check_rule(
        &self,
        identifier: &str,
        scope: Scope,
        rule: &RateLimitRule,
        cost: Option<&RequestCost>,
        tokens: Option<f64>,
    ) -> Result<RateLimitResult> {
        rule.validate()?;
        let units = validate_request(cost, tokens)?;
        let key = StateKey::new(&self.config.key_prefix, scope, identifier);
        let now = self.clock.now_ms();
        self.evaluate(&key, rule, now, cost, units).await
    }

    /// Remaining headroom under the first rule of `scope` using `algorithm`.
    ///
    /// Best effort, and not a pure read: the lookup is a real check and
    /// consumes one unit of the rule like any other request.
    pub async fn get_remaining(
        &self,
        scope: Scope,
        identifier: &str,
        algorithm: Algorithm,
    ) -> Result<u64> {
        let rule = self
            .config
            .rules_for(scope)
            .iter()
            .find(|rule| rule.algorithm == algorithm)
            .ok_or_else(|| {
                RateLimitError::Config(format!(
                    "no {} rule is configured for scope {}",
                    algorithm, scope
                ))
            })?;
        let result = self.check_rule(identifier, scope, rule, None, None).await?;
        Ok(result.remaining)
    }

    /// Clear all algorithm state of `identifier` within `scope`.
    ///
    /// Every key the identifier owns is removed, including state left by
    /// rules that are no longer configured.
    pub async fn reset(&self, scope: Scope, identifier: &str) -> Result<()> {
        let key = StateKey::new(&self.config.key_prefix, scope, identifier);
        let removed = self.storage.delete_prefix(&key.reset_prefix()).await?;
        debug!(key = %key, removed = removed, "Reset rate limit state");
        Ok(())
    }

    /// Decision counters since creation or the last `reset_stats`.
    pub fn get_stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Zero the decision counters.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Stop the background sweep. Stored state is kept. Idempotent.
    pub fn close(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            info!("Rate limiter closed");
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.sweeper.lock().is_none()
    }

    /// The rules configured for a scope.
    pub fn rules_for(&self, scope: Scope) -> &[RateLimitRule] {
        self.config.rules_for(scope)
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    async fn evaluate(
        &self,
        key: &StateKey,
        rule: &RateLimitRule,
        now: u64,
        cost: Option<&RequestCost>,
        units: f64,
    ) -> Result<RateLimitResult> {
        let cost = effective_cost(cost, rule.cost_per_request)?;
        let eval = Evaluation {
            storage: self.storage.as_ref(),
            key,
            rule,
            now,
        };
        Ok(algorithms::evaluate(&eval, cost, units).await?)
    }

    fn record_block(&self, key: &StateKey, result: &RateLimitResult) {
        match result.action {
            Action::Reject => {
                debug!(
                    key = %key,
                    algorithm = ?result.algorithm,
                    limit = result.limit,
                    retry_after = ?result.retry_after,
                    "Rate limit exceeded"
                );
            }
            Action::Warn => {
                warn!(
                    key = %key,
                    algorithm = ?result.algorithm,
                    limit = result.limit,
                    retry_after = ?result.retry_after,
                    "Rate limit exceeded on a warn rule, request blocked"
                );
            }
            Action::Queue => {
                debug!(
                    key = %key,
                    algorithm = ?result.algorithm,
                    retry_after = ?result.retry_after,
                    "Rate limit exceeded on a queue rule, caller should retry later"
                );
            }
        }
        self.stats.record_blocked(result.action == Action::Queue);
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

/// Check caller-supplied amounts and return the token units to consume.
fn validate_request(cost: Option<&RequestCost>, tokens: Option<f64>) -> Result<f64> {
    if let Some(cost) = cost {
        cost.validate()?;
    }
    let units = tokens.unwrap_or(1.0);
    if !units.is_finite() || units < 0.0 {
        return Err(RateLimitError::Validation(format!(
            "requested tokens must be a non-negative number, got {}",
            units
        )));
    }
    Ok(units)
}

fn spawn_sweeper(runtime: &Handle, storage: Arc<dyn Storage>, every: Duration) -> JoinHandle<()> {
    runtime.spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            interval.tick().await;
            match storage.sweep_expired().await {
                Ok(0) => {}
                Ok(evicted) => debug!(
                    evicted = evicted,
                    storage = storage.backend_name(),
                    "Swept expired rate limit state"
                ),
                Err(e) => warn!(error = %e, "Failed to sweep expired rate limit state"),
            }
        }
    })
}
