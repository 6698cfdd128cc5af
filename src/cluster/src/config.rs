use std::time::Duration;

use crate::quorum::{default_write_timeout, WriteConsistency};
use crate::types::PeerSpec;

/// Cluster configuration
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique, stable identity of this node; used for echo suppression and
    /// merge tie-breaking, so it must not be shared between live nodes
    pub node_id: String,
    pub cluster_port: u16,
    pub peers: Vec<PeerSpec>,
    pub write_consistency: WriteConsistency,
    pub write_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl ClusterConfig {
    /// Build a configuration from `ARCA_*` environment variables
    ///
    /// Returns `None` when `ARCA_NODE_ID` is unset or a value fails to
    /// parse; everything else has defaults.
    pub fn from_env() -> Option<Self> {
        let node_id = std::env::var("ARCA_NODE_ID").ok()?;

        let cluster_port = std::env::var("ARCA_CLUSTER_PORT")
            .unwrap_or_else(|_| "4517".to_string())
            .parse()
            .ok()?;

        let peers_str = std::env::var("ARCA_CLUSTER_PEERS").unwrap_or_default();
        let mut peers = Vec::new();
        for spec in peers_str.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            peers.push(PeerSpec::parse(spec)?);
        }

        let write_consistency = match std::env::var("ARCA_WRITE_CONSISTENCY") {
            Ok(v) => WriteConsistency::parse(&v)?,
            Err(_) => WriteConsistency::Majority,
        };

        let write_timeout = std::env::var("ARCA_WRITE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(default_write_timeout);

        let heartbeat_interval = std::env::var("ARCA_HEARTBEAT_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(1000));

        let heartbeat_timeout = std::env::var("ARCA_HEARTBEAT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(5000));

        Some(ClusterConfig {
            node_id,
            cluster_port,
            peers,
            write_consistency,
            write_timeout,
            heartbeat_interval,
            heartbeat_timeout,
        })
    }

    /// Single-node configuration, mostly for tests and local development
    pub fn standalone(node_id: impl Into<String>, cluster_port: u16) -> Self {
        ClusterConfig {
            node_id: node_id.into(),
            cluster_port,
            peers: Vec::new(),
            write_consistency: WriteConsistency::Majority,
            write_timeout: default_write_timeout(),
            heartbeat_interval: Duration::from_millis(1000),
            heartbeat_timeout: Duration::from_millis(5000),
        }
    }

    /// Total replica count this node believes in (configured peers + self)
    pub fn replica_count(&self) -> usize {
        self.peers.len() + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standalone_defaults() {
        let config = ClusterConfig::standalone("node1", 4517);
        assert_eq!(config.replica_count(), 1);
        assert_eq!(config.write_consistency, WriteConsistency::Majority);
        assert_eq!(config.write_timeout, Duration::from_secs(5));
    }

    // All env manipulation lives in this one test; tests run in parallel
    // threads and the environment is process-global.
    #[test]
    fn test_from_env() {
        std::env::remove_var("ARCA_NODE_ID");
        assert!(ClusterConfig::from_env().is_none());

        std::env::set_var("ARCA_NODE_ID", "node1");
        std::env::set_var("ARCA_CLUSTER_PORT", "4600");
        std::env::set_var(
            "ARCA_CLUSTER_PEERS",
            "node2:127.0.0.1:4601, node3:127.0.0.1:4602",
        );
        std::env::set_var("ARCA_WRITE_CONSISTENCY", "all");
        std::env::set_var("ARCA_WRITE_TIMEOUT_SECS", "9");

        let config = ClusterConfig::from_env().unwrap();
        assert_eq!(config.node_id, "node1");
        assert_eq!(config.cluster_port, 4600);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[0].id, "node2");
        assert_eq!(config.peers[1].addr(), "127.0.0.1:4602");
        assert_eq!(config.write_consistency, WriteConsistency::All);
        assert_eq!(config.write_timeout, Duration::from_secs(9));
        assert_eq!(config.replica_count(), 3);

        // Everything but the node id falls back to a default
        std::env::remove_var("ARCA_CLUSTER_PORT");
        std::env::remove_var("ARCA_CLUSTER_PEERS");
        std::env::remove_var("ARCA_WRITE_CONSISTENCY");
        std::env::remove_var("ARCA_WRITE_TIMEOUT_SECS");

        let config = ClusterConfig::from_env().unwrap();
        assert_eq!(config.cluster_port, 4517);
        assert!(config.peers.is_empty());
        assert_eq!(config.write_consistency, WriteConsistency::Majority);
        assert_eq!(config.write_timeout, default_write_timeout());

        std::env::remove_var("ARCA_NODE_ID");
    }

    #[test]
    fn test_replica_count_includes_self() {
        let mut config = ClusterConfig::standalone("node1", 4517);
        config.peers.push(PeerSpec::parse("node2:127.0.0.1:4518").unwrap());
        config.peers.push(PeerSpec::parse("node3:127.0.0.1:4519").unwrap());
        assert_eq!(config.replica_count(), 3);
    }
}
