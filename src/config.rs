//! Node bootstrap configuration
//!
//! Everything the management layer needs to know about the host node:
//! its identity within the cluster, its endpoints, and the process
//! topology. Passed explicitly to [`LifecycleController`] at
//! construction so independent instances (one per hosted role, or
//! several in tests) never share global state.
//!
//! [`LifecycleController`]: crate::lifecycle::LifecycleController

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Unique node identifier; 0 means "not yet assigned by the cluster".
pub type NodeId = u32;

/// One member of a role's consensus group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    /// Node id of the replica
    pub id: NodeId,
    /// Network endpoint ("host:port") of the replica
    pub endpoint: String,
}

/// Bootstrap configuration for the host node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's id; 0 until the cluster assigns one
    pub node_id: NodeId,
    /// Cluster id; 0 until the node joins a cluster
    pub cluster_id: u64,
    /// Endpoint this node listens on
    pub local_endpoint: String,
    /// Endpoint of the cluster's first node
    pub first_endpoint: String,
    /// Replica set supplied at bootstrap, if any
    pub replicas: Vec<Replica>,
    /// Directory holding role state files and role storage
    pub data_dir: PathBuf,
    /// Whether roles run in separate processes; gates the monitor lane
    pub multi_process: bool,
}

impl NodeConfig {
    /// Whether this node must self-deploy a role at first startup.
    ///
    /// True only for a brand-new node (no assigned node or cluster id)
    /// that is configured as the cluster's first endpoint, i.e. the
    /// single-node bootstrap condition.
    pub fn is_bootstrap_node(&self) -> bool {
        self.node_id == 0 && self.cluster_id == 0 && self.local_endpoint == self.first_endpoint
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            cluster_id: 0,
            local_endpoint: "localhost:7100".to_string(),
            first_endpoint: "localhost:7100".to_string(),
            replicas: Vec::new(),
            data_dir: PathBuf::from("."),
            multi_process: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_bootstrap() {
        let cfg = NodeConfig::default();
        assert!(cfg.is_bootstrap_node());
    }

    #[test]
    fn test_assigned_node_is_not_bootstrap() {
        let cfg = NodeConfig {
            node_id: 2,
            ..NodeConfig::default()
        };
        assert!(!cfg.is_bootstrap_node());

        let cfg = NodeConfig {
            cluster_id: 77,
            ..NodeConfig::default()
        };
        assert!(!cfg.is_bootstrap_node());
    }

    #[test]
    fn test_non_first_endpoint_is_not_bootstrap() {
        let cfg = NodeConfig {
            first_endpoint: "other:7100".to_string(),
            ..NodeConfig::default()
        };
        assert!(!cfg.is_bootstrap_node());
    }
}
