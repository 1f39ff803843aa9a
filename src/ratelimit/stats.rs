//! Process-wide decision counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters of every decision an engine has made.
#[derive(Debug, Default)]
pub struct LimiterStats {
    total_requests: AtomicU64,
    allowed: AtomicU64,
    blocked: AtomicU64,
    queued: AtomicU64,
}

/// A point-in-time copy of [`LimiterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub allowed: u64,
    pub blocked: u64,
    /// Blocked requests whose rule asked for queueing
    pub queued: u64,
}

impl LimiterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_blocked(&self, queued: bool) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
        if queued {
            self.queued.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Read all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
        }
    }

    /// Zero all counters.
    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.allowed.store(0, Ordering::Relaxed);
        self.blocked.store(0, Ordering::Relaxed);
        self.queued.store(0, Ordering::Relaxed);
    }
}
