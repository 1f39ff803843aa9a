//! Rate limit rules configuration.
//!
//! A [`RateLimiterConfig`] maps every [`Scope`] to an ordered list of
//! [`RateLimitRule`]s. Declaration order is significant: when several rules
//! block, the first declared one is reported.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::{RateLimitError, Result};
use crate::storage::StorageConfig;

/// The limiting strategy a rule uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    TokenBucket,
    FixedWindow,
    SlidingWindow,
    LeakyBucket,
    CostBased,
}

impl Algorithm {
    /// Every algorithm, in a stable order.
    pub const ALL: [Algorithm; 5] = [
        Algorithm::TokenBucket,
        Algorithm::FixedWindow,
        Algorithm::SlidingWindow,
        Algorithm::LeakyBucket,
        Algorithm::CostBased,
    ];

    /// Configuration name of the algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::LeakyBucket => "leaky_bucket",
            Algorithm::CostBased => "cost_based",
        }
    }

    /// Suffix identifying state owned by this algorithm in storage keys.
    pub fn key_suffix(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "tb",
            Algorithm::FixedWindow => "fw",
            Algorithm::SlidingWindow => "sw",
            Algorithm::LeakyBucket => "lb",
            Algorithm::CostBased => "cost",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self> {
        Algorithm::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| RateLimitError::Config(format!("unknown algorithm: {}", s)))
    }
}

/// What happens when a rule blocks a request.
///
/// Only `Reject` is enforced as such; `Queue` and `Warn` also block, the
/// result just carries the action so callers can act on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    #[default]
    Reject,
    Queue,
    Warn,
}

/// The dimension along which limits are isolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    User,
    Ip,
    Global,
    ApiKey,
}

impl Scope {
    pub const ALL: [Scope; 4] = [Scope::User, Scope::Ip, Scope::Global, Scope::ApiKey];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::Ip => "ip",
            Scope::Global => "global",
            Scope::ApiKey => "api_key",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self> {
        Scope::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| RateLimitError::Config(format!("unsupported scope: {}", s)))
    }
}

/// A single limit: which algorithm, how much, over what window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// The limiting strategy
    pub algorithm: Algorithm,
    /// Maximum units per window (requests, or cost units for cost-based rules)
    pub limit: u64,
    /// Window length in milliseconds
    #[serde(alias = "window")]
    pub window_ms: u64,
    /// Token bucket capacity, defaults to `limit`
    #[serde(default)]
    pub burst: Option<u64>,
    /// Token refill rate in units per second
    #[serde(default)]
    pub refill_rate: Option<f64>,
    /// Leak rate in units per second, falls back to `refill_rate`
    #[serde(default)]
    pub leak_rate: Option<f64>,
    /// Cost charged when the caller supplies none
    #[serde(default = "default_cost_per_request")]
    pub cost_per_request: f64,
    /// What to do when this rule blocks
    #[serde(default)]
    pub action: Action,
    /// Optional name, also used to keep state of same-algorithm rules apart
    #[serde(default)]
    pub name: Option<String>,
}

fn default_cost_per_request() -> f64 {
    1.0
}

impl RateLimitRule {
    /// Create a rule with default burst, rates, cost and action.
    pub fn new(algorithm: Algorithm, limit: u64, window: Duration) -> Self {
        Self {
            algorithm,
            limit,
            window_ms: window.as_millis() as u64,
            burst: None,
            refill_rate: None,
            leak_rate: None,
            cost_per_request: default_cost_per_request(),
            action: Action::default(),
            name: None,
        }
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn with_refill_rate(mut self, per_second: f64) -> Self {
        self.refill_rate = Some(per_second);
        self
    }

    pub fn with_leak_rate(mut self, per_second: f64) -> Self {
        self.leak_rate = Some(per_second);
        self
    }

    pub fn with_cost_per_request(mut self, cost: f64) -> Self {
        self.cost_per_request = cost;
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Token bucket capacity.
    pub fn capacity(&self) -> u64 {
        self.burst.unwrap_or(self.limit)
    }

    /// `limit` spread evenly over the window, in units per second.
    fn default_rate(&self) -> f64 {
        self.limit as f64 / (self.window_ms as f64 / 1000.0)
    }

    /// Token bucket refill rate in units per second.
    pub fn refill_rate_per_sec(&self) -> f64 {
        self.refill_rate.unwrap_or_else(|| self.default_rate())
    }

    /// Leaky bucket drain rate in units per second.
    pub fn leak_rate_per_sec(&self) -> f64 {
        self.leak_rate
            .or(self.refill_rate)
            .unwrap_or_else(|| self.default_rate())
    }

    /// Distinguishes this rule's state from other rules of the same algorithm.
    pub fn fingerprint(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}x{}", self.limit, self.window_ms),
        }
    }

    /// Reject nonsensical numeric parameters.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(RateLimitError::Validation(msg));

        if self.limit == 0 {
            return invalid(format!("{} rule: `limit` must be greater than 0", self.algorithm));
        }
        if self.window_ms == 0 {
            return invalid(format!("{} rule: `window` must be greater than 0", self.algorithm));
        }
        if self.burst == Some(0) {
            return invalid(format!("{} rule: `burst` must be greater than 0", self.algorithm));
        }
        for (field, rate) in [("refill_rate", self.refill_rate), ("leak_rate", self.leak_rate)] {
            if let Some(rate) = rate {
                if !rate.is_finite() || rate <= 0.0 {
                    return invalid(format!(
                        "{} rule: `{}` must be a positive number, got {}",
                        self.algorithm, field, rate
                    ));
                }
            }
        }
        if !self.cost_per_request.is_finite() || self.cost_per_request < 0.0 {
            return invalid(format!(
                "{} rule: `cost_per_request` must be non-negative, got {}",
                self.algorithm, self.cost_per_request
            ));
        }
        if self.name.as_deref().is_some_and(|n| n.is_empty() || n.contains(':')) {
            return invalid(format!(
                "{} rule: `name` must be non-empty and must not contain ':'",
                self.algorithm
            ));
        }
        Ok(())
    }
}

/// Engine configuration: key prefix, storage backend, and rules per scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Prefix of every storage key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Storage backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// How often expired entries are swept, in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Ordered rules per scope
    #[serde(default)]
    pub rules: HashMap<Scope, Vec<RateLimitRule>>,
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            storage: StorageConfig::default(),
            sweep_interval_ms: default_sweep_interval_ms(),
            rules: HashMap::new(),
        }
    }
}

impl RateLimiterConfig {
    /// Create an empty in-memory configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule to a scope.
    pub fn with_rule(mut self, scope: Scope, rule: RateLimitRule) -> Self {
        self.rules.entry(scope).or_default().push(rule);
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    /// The rules declared for a scope, in declaration order.
    pub fn rules_for(&self, scope: Scope) -> &[RateLimitRule] {
        self.rules.get(&scope).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Sweep interval as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Validate every rule and the storage selection.
    pub fn validate(&self) -> Result<()> {
        self.validate_rules()?;
        self.storage.validate()
    }

    /// Validate the key prefix, sweep interval and rules, ignoring storage.
    pub fn validate_rules(&self) -> Result<()> {
        if self.key_prefix.is_empty() || self.key_prefix.contains(':') {
            return Err(RateLimitError::Validation(
                "`key_prefix` must be non-empty and must not contain ':'".to_string(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(RateLimitError::Validation(
                "`sweep_interval_ms` must be greater than 0".to_string(),
            ));
        }
        for (scope, rules) in &self.rules {
            let mut seen = HashSet::new();
            for rule in rules {
                rule.validate().map_err(|e| match e {
                    RateLimitError::Validation(msg) => {
                        RateLimitError::Validation(format!("scope {}: {}", scope, msg))
                    }
                    other => other,
                })?;
                // Rules sharing algorithm and fingerprint would share state.
                if !seen.insert((rule.algorithm, rule.fingerprint())) {
                    return Err(RateLimitError::Config(format!(
                        "scope {}: two {} rules share the state key {:?}; give one a `name`",
                        scope,
                        rule.algorithm,
                        rule.fingerprint()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string. Unknown algorithms and scopes fail here.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RateLimiterConfig = serde_yaml::from_str(yaml).map_err(|e| {
            RateLimitError::Config(format!("Failed to parse rate limit config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
key_prefix: rl
rules:
  user:
    - algorithm: token_bucket
      limit: 10
      window: 10000
      burst: 20
    - algorithm: cost_based
      limit: 100000
      window: 3600000
      action: warn
  api_key:
    - algorithm: sliding_window
      limit: 5
      window_ms: 1000
"#;
        let config = RateLimiterConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.key_prefix, "rl");
        assert_eq!(config.storage, StorageConfig::Memory);

        let user = config.rules_for(Scope::User);
        assert_eq!(user.len(), 2);
        assert_eq!(user[0].algorithm, Algorithm::TokenBucket);
        assert_eq!(user[0].capacity(), 20);
        assert_eq!(user[1].action, Action::Warn);
        assert_eq!(user[1].cost_per_request, 1.0);

        assert_eq!(config.rules_for(Scope::ApiKey)[0].window_ms, 1000);
        assert!(config.rules_for(Scope::Ip).is_empty());
    }

    #[test]
    fn test_unknown_algorithm_is_config_error() {
        let yaml = r#"
rules:
  user:
    - algorithm: gcra
      limit: 10
      window: 1000
"#;
        let err = RateLimiterConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, RateLimitError::Config(_)));

        let err = "gcra".parse::<Algorithm>().unwrap_err();
        assert!(matches!(err, RateLimitError::Config(_)));
    }

    #[test]
    fn test_unsupported_scope_is_config_error() {
        let yaml = r#"
rules:
  tenant:
    - algorithm: fixed_window
      limit: 10
      window: 1000
"#;
        assert!(matches!(
            RateLimiterConfig::from_yaml(yaml),
            Err(RateLimitError::Config(_))
        ));
        assert!("tenant".parse::<Scope>().is_err());
        assert_eq!("api_key".parse::<Scope>().unwrap(), Scope::ApiKey);
    }

    #[test]
    fn test_invalid_numbers_are_validation_errors() {
        let zero_limit = RateLimiterConfig::new().with_rule(
            Scope::User,
            RateLimitRule::new(Algorithm::FixedWindow, 0, Duration::from_secs(1)),
        );
        assert!(matches!(zero_limit.validate(), Err(RateLimitError::Validation(_))));

        let zero_window = RateLimiterConfig::new().with_rule(
            Scope::User,
            RateLimitRule::new(Algorithm::FixedWindow, 5, Duration::ZERO),
        );
        assert!(matches!(zero_window.validate(), Err(RateLimitError::Validation(_))));

        let negative_rate = RateLimitRule::new(Algorithm::TokenBucket, 5, Duration::from_secs(1))
            .with_refill_rate(-1.0);
        assert!(matches!(negative_rate.validate(), Err(RateLimitError::Validation(_))));

        let negative_cost = RateLimitRule::new(Algorithm::CostBased, 5, Duration::from_secs(1))
            .with_cost_per_request(-0.5);
        assert!(matches!(negative_cost.validate(), Err(RateLimitError::Validation(_))));

        let negative_yaml = r#"
rules:
  user:
    - algorithm: fixed_window
      limit: -5
      window: 1000
"#;
        assert!(RateLimiterConfig::from_yaml(negative_yaml).is_err());
    }

    #[test]
    fn test_default_rates() {
        let rule = RateLimitRule::new(Algorithm::TokenBucket, 10, Duration::from_secs(10));
        assert_eq!(rule.capacity(), 10);
        assert_eq!(rule.refill_rate_per_sec(), 1.0);

        let rule = RateLimitRule::new(Algorithm::LeakyBucket, 5, Duration::from_secs(1))
            .with_refill_rate(2.0);
        assert_eq!(rule.leak_rate_per_sec(), 2.0);
        assert_eq!(rule.clone().with_leak_rate(3.0).leak_rate_per_sec(), 3.0);
    }

    #[test]
    fn test_rules_sharing_state_are_rejected() {
        let rule = RateLimitRule::new(Algorithm::TokenBucket, 10, Duration::from_secs(1));
        let config = RateLimiterConfig::new()
            .with_rule(Scope::User, rule.clone())
            .with_rule(Scope::User, rule.clone().with_burst(50));
        assert!(matches!(config.validate(), Err(RateLimitError::Config(_))));

        let config = RateLimiterConfig::new()
            .with_rule(Scope::User, rule.clone())
            .with_rule(Scope::User, rule.with_burst(50).with_name("bursty"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fingerprint() {
        let rule = RateLimitRule::new(Algorithm::FixedWindow, 2, Duration::from_secs(1));
        assert_eq!(rule.fingerprint(), "2x1000");
        assert_eq!(rule.with_name("burst").fingerprint(), "burst");
    }

    #[test]
    fn test_algorithm_names_round_trip() {
        for algorithm in Algorithm::ALL {
            assert_eq!(algorithm.as_str().parse::<Algorithm>().unwrap(), algorithm);
        }
    }
}
