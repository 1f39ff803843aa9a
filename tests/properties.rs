//! End-to-end behavior of the engine through the public API.

use std::sync::Arc;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use ratewarden::ratelimit::{
    Algorithm, RateLimitResult, RateLimitRule, RateLimiter, RateLimiterConfig, RequestCost, Scope,
};
use ratewarden::{ManualClock, MemoryStorage, RateLimitError};

struct Harness {
    limiter: RateLimiter,
    clock: ManualClock,
}

impl Harness {
    fn new(config: RateLimiterConfig) -> Self {
        let clock = ManualClock::new(0);
        let storage = Arc::new(MemoryStorage::with_clock(Arc::new(clock.clone())));
        let limiter = assert_ok!(RateLimiter::with_storage(
            config,
            storage,
            Arc::new(clock.clone())
        ));
        Self { limiter, clock }
    }

    fn single(scope: Scope, rule: RateLimitRule) -> Self {
        Self::new(RateLimiterConfig::new().with_rule(scope, rule))
    }

    async fn check(&self, scope: Scope, id: &str) -> RateLimitResult {
        assert_ok!(self.limiter.check(id, scope, None, None).await)
    }

    async fn check_cost(&self, scope: Scope, id: &str, cost: f64) -> RateLimitResult {
        let cost = RequestCost::custom(cost);
        assert_ok!(self.limiter.check(id, scope, Some(&cost), None).await)
    }
}

#[tokio::test]
async fn token_bucket_exhausts_and_refills() {
    let h = Harness::single(
        Scope::User,
        RateLimitRule::new(Algorithm::TokenBucket, 10, Duration::from_secs(10)).with_refill_rate(1.0),
    );

    for _ in 0..10 {
        assert!(h.check(Scope::User, "alice").await.allowed);
    }

    let rejected = h.check(Scope::User, "alice").await;
    assert!(!rejected.allowed);
    let retry_after = rejected.retry_after.unwrap();
    assert!((900..=1100).contains(&retry_after), "retry_after = {}", retry_after);

    h.clock.advance(Duration::from_millis(1000));
    assert!(h.check(Scope::User, "alice").await.allowed);
}

#[tokio::test]
async fn fixed_window_boundary() {
    let h = Harness::single(
        Scope::Ip,
        RateLimitRule::new(Algorithm::FixedWindow, 5, Duration::from_millis(1000)),
    );

    for _ in 0..5 {
        assert!(h.check(Scope::Ip, "10.0.0.1").await.allowed);
    }

    let rejected = h.check(Scope::Ip, "10.0.0.1").await;
    assert!(!rejected.allowed);
    assert_eq!(rejected.reset_at, 1000);

    h.clock.set(1001);
    let result = h.check(Scope::Ip, "10.0.0.1").await;
    assert!(result.allowed);
    assert_eq!(result.remaining, 4);
}

#[tokio::test]
async fn sliding_window_precision() {
    let h = Harness::single(
        Scope::User,
        RateLimitRule::new(Algorithm::SlidingWindow, 3, Duration::from_millis(1000)),
    );

    for t in 0..3 {
        h.clock.set(t);
        assert!(h.check(Scope::User, "bob").await.allowed);
    }

    h.clock.set(500);
    assert!(!h.check(Scope::User, "bob").await.allowed);

    h.clock.set(1001);
    assert!(h.check(Scope::User, "bob").await.allowed);
}

#[tokio::test]
async fn leaky_bucket_steady_state() {
    let h = Harness::single(
        Scope::Global,
        RateLimitRule::new(Algorithm::LeakyBucket, 5, Duration::from_secs(1)).with_leak_rate(5.0),
    );

    for _ in 0..5 {
        assert!(h.check(Scope::Global, "all").await.allowed);
    }
    assert!(!h.check(Scope::Global, "all").await.allowed);

    h.clock.advance(Duration::from_millis(200));
    assert!(h.check(Scope::Global, "all").await.allowed);
}

#[tokio::test]
async fn cost_based_accounting() {
    let h = Harness::single(
        Scope::ApiKey,
        RateLimitRule::new(Algorithm::CostBased, 100, Duration::from_secs(60)),
    );

    let first = h.check_cost(Scope::ApiKey, "key-1", 60.0).await;
    assert!(first.allowed);
    assert_eq!(first.remaining, 40);

    let second = h.check_cost(Scope::ApiKey, "key-1", 50.0).await;
    assert!(!second.allowed);
    assert_eq!(second.remaining, 40);

    // The rejected request consumed nothing.
    let third = h.check_cost(Scope::ApiKey, "key-1", 40.0).await;
    assert!(third.allowed);
    assert_eq!(third.remaining, 0);
}

#[tokio::test]
async fn cost_resolution_prefers_explicit_costs() {
    let h = Harness::single(
        Scope::ApiKey,
        RateLimitRule::new(Algorithm::CostBased, 1000, Duration::from_secs(60)),
    );

    let cost = RequestCost::tokens(100, 200).with_total_tokens(250);
    let result = assert_ok!(h.limiter.check("key-2", Scope::ApiKey, Some(&cost), None).await);
    assert_eq!(result.remaining, 750);

    let cost = RequestCost::tokens(100, 200).with_custom_cost(10.0);
    let result = assert_ok!(h.limiter.check("key-2", Scope::ApiKey, Some(&cost), None).await);
    assert_eq!(result.remaining, 740);

    // No cost at all falls back to the rule's per-request cost.
    let result = h.check(Scope::ApiKey, "key-2").await;
    assert_eq!(result.remaining, 739);
}

#[tokio::test]
async fn multi_rule_reports_blocking_rule() {
    let config = RateLimiterConfig::new()
        .with_rule(
            Scope::User,
            RateLimitRule::new(Algorithm::FixedWindow, 2, Duration::from_millis(1000)),
        )
        .with_rule(
            Scope::User,
            RateLimitRule::new(Algorithm::FixedWindow, 100, Duration::from_millis(3_600_000)),
        );
    let h = Harness::new(config);

    assert!(h.check(Scope::User, "carol").await.allowed);
    assert!(h.check(Scope::User, "carol").await.allowed);

    let rejected = h.check(Scope::User, "carol").await;
    assert!(!rejected.allowed);
    assert_eq!(rejected.limit, 2);
}

#[tokio::test]
async fn reset_restores_full_capacity() {
    let h = Harness::single(
        Scope::User,
        RateLimitRule::new(Algorithm::TokenBucket, 3, Duration::from_secs(30)),
    );

    for _ in 0..3 {
        h.check(Scope::User, "dave").await;
    }
    assert!(!h.check(Scope::User, "dave").await.allowed);

    assert_ok!(h.limiter.reset(Scope::User, "dave").await);
    let result = h.check(Scope::User, "dave").await;
    assert!(result.allowed);
    assert_eq!(result.remaining, 2);

    assert_ok!(h.limiter.reset(Scope::User, "dave").await);
    assert_ok!(h.limiter.reset(Scope::User, "dave").await);
}

#[tokio::test]
async fn identifiers_with_separators_stay_isolated() {
    let h = Harness::single(
        Scope::Ip,
        RateLimitRule::new(Algorithm::FixedWindow, 1, Duration::from_secs(1)),
    );

    assert!(h.check(Scope::Ip, "2001:db8::1").await.allowed);
    assert!(h.check(Scope::Ip, "2001:db8::2").await.allowed);
    assert!(h.check(Scope::Ip, "2001:db8:").await.allowed);

    // Resetting a prefix-like identifier leaves the others alone.
    assert_ok!(h.limiter.reset(Scope::Ip, "2001:db8:").await);
    assert!(!h.check(Scope::Ip, "2001:db8::1").await.allowed);
}

#[tokio::test]
async fn configuration_errors_surface_at_construction() {
    let yaml = r#"
rules:
  user:
    - { algorithm: exponential_backoff, limit: 5, window: 1000 }
"#;
    let err = assert_err!(RateLimiterConfig::from_yaml(yaml));
    assert!(matches!(err, RateLimitError::Config(_)));

    let yaml = r#"
storage:
  type: mesh
rules:
  user:
    - { algorithm: fixed_window, limit: 5, window: 1000 }
"#;
    let err = assert_err!(RateLimiterConfig::from_yaml(yaml));
    assert!(matches!(err, RateLimitError::Config(_)));

    let config = RateLimiterConfig::new().with_storage(ratewarden::StorageConfig::Mesh(
        Default::default(),
    ));
    let err = assert_err!(RateLimiter::new(config).await);
    assert!(err.is_configuration());
}

#[tokio::test]
async fn stats_and_close() {
    let h = Harness::single(
        Scope::User,
        RateLimitRule::new(Algorithm::SlidingWindow, 1, Duration::from_secs(1)),
    );

    h.check(Scope::User, "erin").await;
    h.check(Scope::User, "erin").await;
    h.check(Scope::Ip, "erin").await;

    let stats = h.limiter.get_stats();
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.allowed, 2);
    assert_eq!(stats.blocked, 1);

    h.limiter.close();
    h.limiter.close();
    assert!(h.limiter.is_closed());

    // State survives close.
    assert!(!h.check(Scope::User, "erin").await.allowed);
}

#[tokio::test]
async fn malformed_costs_are_rejected_without_consuming_budget() {
    let h = Harness::single(
        Scope::ApiKey,
        RateLimitRule::new(Algorithm::CostBased, 100, Duration::from_secs(60)),
    );

    for bad in [f64::NAN, f64::INFINITY, -1000.0] {
        let cost = RequestCost::custom(bad);
        let err = assert_err!(h.limiter.check("key-3", Scope::ApiKey, Some(&cost), None).await);
        assert!(matches!(err, RateLimitError::Validation(_)));
    }

    let result = h.check_cost(Scope::ApiKey, "key-3", 1.0).await;
    assert!(result.allowed);
    assert_eq!(result.remaining, 99);
    assert_eq!(h.limiter.get_stats().total_requests, 1);
}

#[tokio::test]
async fn negative_tokens_cannot_overfill_a_bucket() {
    let h = Harness::single(
        Scope::User,
        RateLimitRule::new(Algorithm::TokenBucket, 10, Duration::from_secs(10)),
    );
    let bucket = h.limiter.rules_for(Scope::User)[0].clone();

    let err = assert_err!(
        h.limiter
            .check_rule("frank", Scope::User, &bucket, None, Some(-50.0))
            .await
    );
    assert!(matches!(err, RateLimitError::Validation(_)));

    let err = assert_err!(h.limiter.check("frank", Scope::User, None, Some(-50.0)).await);
    assert!(matches!(err, RateLimitError::Validation(_)));

    let result = h.check(Scope::User, "frank").await;
    assert_eq!(result.remaining, 9);
    assert!(result.remaining <= result.limit);
}
