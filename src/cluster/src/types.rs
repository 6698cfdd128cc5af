use std::time::Instant;

/// Operation codes for the cluster protocol
pub const CLUSTER_OP_REPLICATE: u8 = 1;
pub const CLUSTER_OP_REPLICATE_ACK: u8 = 2;
pub const CLUSTER_OP_HEARTBEAT: u8 = 3;
pub const CLUSTER_OP_HEARTBEAT_ACK: u8 = 4;
pub const CLUSTER_OP_SYNC_REQUEST: u8 = 5;
pub const CLUSTER_OP_SYNC_DATA: u8 = 6;

/// Node state in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Healthy,
    Suspect,
    Dead,
}

/// Statically configured peer, `node_id:host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSpec {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl PeerSpec {
    /// Parse a `node_id:host:port` spec; `None` when malformed
    pub fn parse(spec: &str) -> Option<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        if parts.len() != 3 {
            return None;
        }
        let port = parts[2].parse().ok()?;
        if parts[0].is_empty() || parts[1].is_empty() {
            return None;
        }
        Some(PeerSpec {
            id: parts[0].to_string(),
            host: parts[1].to_string(),
            port,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Live view of a peer's health
#[derive(Debug, Clone)]
pub struct PeerNode {
    pub spec: PeerSpec,
    pub state: NodeState,
    pub last_heartbeat: Instant,
}

impl PeerNode {
    pub fn new(spec: PeerSpec) -> Self {
        PeerNode {
            spec,
            state: NodeState::Suspect,
            last_heartbeat: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_spec_parse() {
        let spec = PeerSpec::parse("node2:127.0.0.1:4517").unwrap();
        assert_eq!(spec.id, "node2");
        assert_eq!(spec.addr(), "127.0.0.1:4517");
    }

    #[test]
    fn test_peer_spec_parse_malformed() {
        assert_eq!(PeerSpec::parse("node2:127.0.0.1"), None);
        assert_eq!(PeerSpec::parse("node2:127.0.0.1:notaport"), None);
        assert_eq!(PeerSpec::parse(":host:1"), None);
        assert_eq!(PeerSpec::parse(""), None);
    }
}
