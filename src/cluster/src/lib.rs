//! Cluster replication substrate: peer links, write quorum tracking,
//! heartbeat-based failure detection, and full-state sync for nodes that
//! join or rejoin the cluster.

pub mod config;
pub mod error;
pub mod manager;
pub mod quorum;
pub mod replication;
pub mod store;
pub mod types;

pub use config::ClusterConfig;
pub use error::ClusterError;
pub use manager::{ClusterHandle, ClusterManager};
pub use quorum::{QuorumTracker, WriteConsistency};
pub use replication::{ReplicationEntry, ReplicationOp};
pub use store::{ReplicatedStore, StoreSnapshot};
pub use types::{NodeState, PeerNode, PeerSpec};
