//! Storage backends for rate limiter state.
//!
//! Algorithms never hold state themselves; everything lives behind the
//! [`Storage`] trait so a networked backend can replace the in-process one
//! without touching the engine.
//!
//! - **Memory**: in-process maps with per-entry expiry and a periodic sweep
//! - **Mesh**: gossip-replicated state shared between nodes of a cluster

mod memory;
mod mesh;

pub use memory::MemoryStorage;
pub use mesh::MeshStorage;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::clock::Clock;
use crate::error::{RateLimitError, Result};
use crate::mesh::{Cluster, ClusterConfig};

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("failed to encode or decode stored state: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("value at key {key} has the wrong type for this operation")]
    WrongType { key: String },
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Key/value and list storage used by the rate limiting algorithms.
///
/// Scalars and lists live in separate namespaces. A `ttl` of `None` keeps the
/// entry until it is deleted. Lists follow Redis conventions: `lpush` adds to
/// the head and `lrange` indexes may be negative to count from the tail.
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Read a scalar value.
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Write a scalar value, replacing any previous expiry.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StorageResult<()>;

    /// Atomically add `amount` to a numeric scalar (absent counts as zero) and
    /// return the new value. The existing expiry is kept.
    async fn increment(&self, key: &str, amount: f64) -> StorageResult<f64>;

    /// Remove the scalar and list stored at `key`. Returns whether anything was removed.
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Read several scalars at once.
    async fn mget(&self, keys: &[String]) -> StorageResult<Vec<Option<String>>> {
        try_join_all(keys.iter().map(|key| self.get(key))).await
    }

    /// Write several scalars at once with a shared expiry.
    async fn mset(&self, entries: &[(String, String)], ttl: Option<Duration>) -> StorageResult<()> {
        try_join_all(
            entries
                .iter()
                .map(|(key, value)| self.set(key, value.clone(), ttl)),
        )
        .await?;
        Ok(())
    }

    /// Push a value onto the head of a list and return the new length.
    async fn lpush(&self, key: &str, value: String) -> StorageResult<usize>;

    /// Read the inclusive range `start..=stop` of a list.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StorageResult<Vec<String>>;

    /// Remove occurrences of `value`: the first `count` from the head when
    /// positive, the last `-count` from the tail when negative, all when zero.
    async fn lrem(&self, key: &str, count: i64, value: &str) -> StorageResult<usize>;

    /// Length of a list.
    async fn llen(&self, key: &str) -> StorageResult<usize>;

    /// Set the expiry of the scalar and list at `key`. Returns whether the key exists.
    async fn expire(&self, key: &str, ttl: Duration) -> StorageResult<bool>;

    /// Remove every scalar and list whose key starts with `prefix`.
    ///
    /// Returns the number of entries removed where the backend can tell.
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize>;

    /// Evict expired entries. Returns the number evicted.
    async fn sweep_expired(&self) -> StorageResult<usize> {
        Ok(0)
    }

    /// Short backend name for logging.
    fn backend_name(&self) -> &'static str;
}

/// Which storage backend the limiter should use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-process storage (single instance only)
    #[default]
    Memory,
    /// Gossip mesh shared by every node in the cluster
    Mesh(MeshStorageConfig),
}

/// Connection parameters for the mesh backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshStorageConfig {
    /// Address to listen on for gossip (required)
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,

    /// Address advertised to peers, defaults to `listen_addr`
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    /// Node identifier, a random UUID when unset
    #[serde(default)]
    pub node_id: Option<String>,

    /// Seed nodes used to join the cluster
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    /// Nodes only gossip with peers carrying the same cluster id
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// Gossip interval in milliseconds
    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,

    /// How long delete and reset tombstones are kept before sweeps drop them.
    /// Must outlive the longest rule window.
    #[serde(default = "default_tombstone_retention_ms")]
    pub tombstone_retention_ms: u64,
}

impl Default for MeshStorageConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            advertise_addr: None,
            node_id: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval_ms(),
            tombstone_retention_ms: default_tombstone_retention_ms(),
        }
    }
}

fn default_cluster_id() -> String {
    "ratewarden".to_string()
}

fn default_gossip_interval_ms() -> u64 {
    100
}

fn default_tombstone_retention_ms() -> u64 {
    3_600_000
}

impl MeshStorageConfig {
    /// Turn the storage settings into cluster settings, failing on missing parameters.
    pub fn cluster_config(&self) -> Result<ClusterConfig> {
        let listen_addr = self.listen_addr.ok_or_else(|| {
            RateLimitError::Config("mesh storage requires `listen_addr`".to_string())
        })?;
        if self.gossip_interval_ms == 0 {
            return Err(RateLimitError::Validation(
                "mesh `gossip_interval_ms` must be greater than 0".to_string(),
            ));
        }

        let defaults = ClusterConfig::default();
        Ok(ClusterConfig {
            node_id: self.node_id.clone().unwrap_or(defaults.node_id),
            listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(listen_addr),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: defaults.dead_node_grace_period,
        })
    }
}

impl StorageConfig {
    /// Check that the selected backend has everything it needs.
    pub fn validate(&self) -> Result<()> {
        match self {
            StorageConfig::Memory => Ok(()),
            StorageConfig::Mesh(mesh) => mesh.cluster_config().map(|_| ()),
        }
    }
}

/// Build the configured backend.
///
/// Missing connection parameters fail here rather than on first use.
pub async fn connect(config: &StorageConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn Storage>> {
    match config {
        StorageConfig::Memory => {
            info!("Using in-memory storage backend");
            Ok(Arc::new(MemoryStorage::with_clock(clock)))
        }
        StorageConfig::Mesh(mesh) => {
            let cluster_config = mesh.cluster_config()?;
            let cluster = Cluster::start(cluster_config)
                .await
                .map_err(|e| RateLimitError::Storage(StorageError::Unavailable(e.to_string())))?;
            info!(
                node_id = %cluster.node_id(),
                live_nodes = cluster.live_node_count().await,
                "Using mesh storage backend"
            );
            let retention = Duration::from_millis(mesh.tombstone_retention_ms);
            Ok(Arc::new(
                MeshStorage::new(Arc::new(cluster), clock).with_tombstone_retention(retention),
            ))
        }
    }
}

/// Resolve Redis-style inclusive list indexes against a list of `len` items.
///
/// Returns `None` when the range selects nothing.
pub(crate) fn list_range_bounds(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Format a counter value the way it is stored.
pub(crate) fn format_number(value: f64) -> String {
    value.to_string()
}

/// Parse a stored counter value.
pub(crate) fn parse_number(key: &str, raw: &str) -> StorageResult<f64> {
    raw.parse().map_err(|_| StorageError::WrongType {
        key: key.to_string(),
    })
}
