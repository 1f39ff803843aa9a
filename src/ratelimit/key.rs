//! Storage key generation.
//!
//! Every piece of algorithm state lives under
//! `prefix:scope:identifier:suffix[:fingerprint[:window_start]]`. The
//! identifier is escaped so that identifiers containing `:` (IPv6 addresses)
//! can never alias another identifier's keys.

use std::fmt;

use super::rules::{RateLimitRule, Scope};

/// The isolation unit of all algorithm state: one identifier within one scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    base: String,
}

fn escape(identifier: &str) -> String {
    identifier.replace('%', "%25").replace(':', "%3A")
}

impl StateKey {
    /// Create the key for an identifier within a scope.
    pub fn new(prefix: &str, scope: Scope, identifier: &str) -> Self {
        Self {
            base: format!("{}:{}:{}", prefix, scope, escape(identifier)),
        }
    }

    /// Prefix shared by every key this identifier owns.
    pub fn reset_prefix(&self) -> String {
        format!("{}:", self.base)
    }

    /// Key of a rule's state for algorithms with one entry per rule.
    pub fn for_rule(&self, rule: &RateLimitRule) -> String {
        format!(
            "{}:{}:{}",
            self.base,
            rule.algorithm.key_suffix(),
            rule.fingerprint()
        )
    }

    /// Key of a rule's state for one window starting at `window_start`.
    pub fn for_window(&self, rule: &RateLimitRule, window_start: u64) -> String {
        format!("{}:{}", self.for_rule(rule), window_start)
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base)
    }
}
