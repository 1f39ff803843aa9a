//! A gossip node built on chitchat.
//!
//! Membership, failure detection and state dissemination all come from
//! chitchat. Each node owns a flat key-value map that only it may write;
//! peers receive it by gossip and readers combine the maps of live nodes.

use std::net::SocketAddr;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while joining or leaving the mesh.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to shut down cluster: {0}")]
    ShutdownError(String),
}

/// Settings of one mesh node.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub node_id: String,
    /// UDP address gossip is received on
    pub listen_addr: SocketAddr,
    /// Address peers use to reach this node
    pub advertise_addr: SocketAddr,
    /// Peers contacted when joining
    pub seed_nodes: Vec<String>,
    /// Only nodes with the same id gossip with each other
    pub cluster_id: String,
    pub gossip_interval: Duration,
    /// How long deleted keys and dead nodes linger before being forgotten
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: addr,
            advertise_addr: addr,
            seed_nodes: Vec::new(),
            cluster_id: "ratewarden".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

/// A value one node holds for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeValue {
    pub node_id: String,
    pub value: String,
}

/// Exclusive access to the gossip state for the duration of one operation.
///
/// Holding a view serializes all operations on this node, which makes each
/// read-modify-write atomic locally. Peers are only eventually consistent.
pub struct ClusterView<'a> {
    chitchat: &'a mut Chitchat,
}

impl ClusterView<'_> {
    /// This node's own value for a key.
    pub fn local(&mut self, key: &str) -> Option<String> {
        self.chitchat.self_node_state().get(key).map(str::to_string)
    }

    /// Write this node's own value for a key.
    pub fn set_local(&mut self, key: &str, value: String) {
        self.chitchat.self_node_state().set(key, value);
    }

    /// Every key this node currently holds, with its value.
    pub fn local_entries(&mut self) -> Vec<(String, String)> {
        self.chitchat
            .self_node_state()
            .key_values()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    /// Remove one of this node's keys. Peers learn of the removal by gossip.
    pub fn delete_local(&mut self, key: &str) {
        self.chitchat.self_node_state().delete(key);
    }

    /// The values every live node, this one included, holds for a key.
    pub fn collect(&self, key: &str) -> Vec<NodeValue> {
        self.chitchat
            .live_nodes()
            .filter_map(|node| {
                let value = self.chitchat.node_state(node)?.get(key)?;
                Some(NodeValue {
                    node_id: node.node_id.clone(),
                    value: value.to_string(),
                })
            })
            .collect()
    }
}

/// A running mesh node.
pub struct Cluster {
    node_id: String,
    handle: ChitchatHandle,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster").field("node_id", &self.node_id).finish()
    }
}

impl Cluster {
    /// Bind the gossip socket and join the mesh through the seed nodes.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_config = ChitchatConfig {
            chitchat_id: ChitchatId {
                node_id: config.node_id.clone(),
                generation_id: 0,
                gossip_advertise_addr: config.advertise_addr,
            },
            cluster_id: config.cluster_id,
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes,
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let handle = spawn_chitchat(chitchat_config, Vec::new(), &UdpTransport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        debug!(node_id = %config.node_id, "Cluster node started");
        Ok(Self {
            node_id: config.node_id,
            handle,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Run `f` with exclusive access to the gossip state.
    pub async fn with_view<R>(&self, f: impl FnOnce(&mut ClusterView<'_>) -> R) -> R {
        let chitchat = self.handle.chitchat();
        let mut guard = chitchat.lock().await;
        let mut view = ClusterView {
            chitchat: &mut *guard,
        };
        f(&mut view)
    }

    /// Number of nodes currently considered alive, this one included.
    pub async fn live_node_count(&self) -> usize {
        let chitchat = self.handle.chitchat();
        let guard = chitchat.lock().await;
        guard.live_nodes().count()
    }

    /// Leave the mesh.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))
    }
}
