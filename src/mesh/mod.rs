//! Peer mesh networking module using Chitchat.
//!
//! This module implements the peer-to-peer mesh that backs the networked
//! storage backend. It uses the chitchat library for gossip-based cluster
//! membership and state dissemination.

mod cluster;

pub use cluster::{Cluster, ClusterConfig, ClusterError, ClusterView, NodeValue};
