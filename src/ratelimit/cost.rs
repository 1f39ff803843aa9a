//! Caller-supplied request cost.

use serde::{Deserialize, Serialize};

use crate::error::{RateLimitError, Result};

/// Measured cost of a request, used by cost-based rules.
///
/// The effective cost is resolved by priority: `custom_cost`, then
/// `monetary_cost`, then `total_tokens`, then `input_tokens + output_tokens`,
/// and finally the rule's `cost_per_request`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestCost {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
    #[serde(default)]
    pub monetary_cost: Option<f64>,
    #[serde(default)]
    pub custom_cost: Option<f64>,
}

impl RequestCost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cost from token usage of an LLM call.
    pub fn tokens(input: u64, output: u64) -> Self {
        Self {
            input_tokens: Some(input),
            output_tokens: Some(output),
            ..Self::default()
        }
    }

    /// An arbitrary cost in rule units.
    pub fn custom(cost: f64) -> Self {
        Self {
            custom_cost: Some(cost),
            ..Self::default()
        }
    }

    pub fn with_total_tokens(mut self, total: u64) -> Self {
        self.total_tokens = Some(total);
        self
    }

    pub fn with_monetary_cost(mut self, cost: f64) -> Self {
        self.monetary_cost = Some(cost);
        self
    }

    pub fn with_custom_cost(mut self, cost: f64) -> Self {
        self.custom_cost = Some(cost);
        self
    }

    /// Reject measured costs that would corrupt a window total.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("custom_cost", self.custom_cost),
            ("monetary_cost", self.monetary_cost),
        ] {
            if let Some(value) = value {
                if !value.is_finite() || value < 0.0 {
                    return Err(RateLimitError::Validation(format!(
                        "`{}` must be a non-negative number, got {}",
                        field, value
                    )));
                }
            }
        }
        Ok(())
    }

    /// The effective cost, falling back to `default` when nothing was measured.
    pub fn resolve(&self, default: f64) -> Result<f64> {
        self.validate()?;
        if let Some(cost) = self.custom_cost {
            return Ok(cost);
        }
        if let Some(cost) = self.monetary_cost {
            return Ok(cost);
        }
        if let Some(total) = self.total_tokens {
            return Ok(total as f64);
        }
        Ok(match (self.input_tokens, self.output_tokens) {
            (None, None) => default,
            (input, output) => input.unwrap_or(0).saturating_add(output.unwrap_or(0)) as f64,
        })
    }
}

/// Resolve an optional cost against a rule default.
pub fn effective_cost(cost: Option<&RequestCost>, default: f64) -> Result<f64> {
    cost.map_or(Ok(default), |c| c.resolve(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(cost: &RequestCost, default: f64) -> f64 {
        cost.resolve(default).unwrap()
    }

    #[test]
    fn test_resolution_priority() {
        let cost = RequestCost::tokens(10, 20)
            .with_total_tokens(35)
            .with_monetary_cost(0.25)
            .with_custom_cost(7.0);
        assert_eq!(resolve(&cost, 1.0), 7.0);

        let cost = RequestCost::tokens(10, 20)
            .with_total_tokens(35)
            .with_monetary_cost(0.25);
        assert_eq!(resolve(&cost, 1.0), 0.25);

        let cost = RequestCost::tokens(10, 20).with_total_tokens(35);
        assert_eq!(resolve(&cost, 1.0), 35.0);

        assert_eq!(resolve(&RequestCost::tokens(10, 20), 1.0), 30.0);
        assert_eq!(resolve(&RequestCost::new(), 3.0), 3.0);
    }

    #[test]
    fn test_partial_token_counts() {
        let cost = RequestCost {
            output_tokens: Some(12),
            ..RequestCost::default()
        };
        assert_eq!(resolve(&cost, 1.0), 12.0);
    }

    #[test]
    fn test_effective_cost_without_request_cost() {
        assert_eq!(effective_cost(None, 2.5).unwrap(), 2.5);
        assert_eq!(effective_cost(Some(&RequestCost::custom(4.0)), 2.5).unwrap(), 4.0);
    }

    #[test]
    fn test_invalid_costs_are_rejected() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, -1.0] {
            let err = RequestCost::custom(bad).resolve(1.0).unwrap_err();
            assert!(matches!(err, RateLimitError::Validation(_)), "custom {}", bad);

            let cost = RequestCost::new().with_monetary_cost(bad);
            assert!(cost.validate().is_err(), "monetary {}", bad);
            assert!(effective_cost(Some(&cost), 1.0).is_err());
        }

        // A bad field is rejected even when a higher-priority one is present.
        let cost = RequestCost::custom(5.0).with_monetary_cost(f64::NAN);
        assert!(cost.resolve(1.0).is_err());

        assert_eq!(resolve(&RequestCost::custom(0.0), 1.0), 0.0);
    }
}
