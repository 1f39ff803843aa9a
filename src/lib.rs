//! Ratewarden - Multi-Algorithm Rate Limiting Engine
//!
//! This crate decides whether a request identified by a scope and an
//! identifier may proceed. Five algorithms are available (token bucket, fixed
//! window, sliding window log, leaky bucket and cost-based) and any number of
//! rules may apply to one scope. All state lives behind a pluggable storage
//! backend: in-process, or replicated across a gossip mesh of nodes.

pub mod clock;
pub mod config;
pub mod error;
pub mod mesh;
pub mod ratelimit;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{RateLimitError, Result};
pub use ratelimit::{
    Action, Algorithm, RateLimitResult, RateLimitRule, RateLimiter, RateLimiterConfig,
    RequestCost, Scope, StatsSnapshot,
};
pub use storage::{MemoryStorage, MeshStorage, Storage, StorageConfig, StorageError};
