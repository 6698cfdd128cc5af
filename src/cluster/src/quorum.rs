//! Write-quorum policy applied to every replicated mutation.

use std::time::Duration;

/// Durability requirement for a write before it is acknowledged
///
/// `All` waits for every known replica (strongest, least available under
/// partition); `Majority` waits for more than half (tolerates a minority
/// partition). Both are bounded by the configured timeout; a write that
/// misses its quorum is reported failed but stays applied locally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteConsistency {
    All,
    Majority,
}

impl WriteConsistency {
    /// Parse a configuration value; `None` for anything unrecognized
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Some(WriteConsistency::All),
            "majority" => Some(WriteConsistency::Majority),
            _ => None,
        }
    }

    /// Number of replica acknowledgements required out of `replicas`
    /// (the local replica counts; its apply is the first ack)
    pub fn required_acks(&self, replicas: usize) -> usize {
        match self {
            WriteConsistency::All => replicas,
            WriteConsistency::Majority => replicas / 2 + 1,
        }
    }
}

impl std::fmt::Display for WriteConsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteConsistency::All => write!(f, "all"),
            WriteConsistency::Majority => write!(f, "majority"),
        }
    }
}

/// Counts acknowledgements for one in-flight write
#[derive(Debug)]
pub struct QuorumTracker {
    required: usize,
    acks: usize,
}

impl QuorumTracker {
    /// Start tracking with the local apply already counted
    pub fn new(consistency: WriteConsistency, replicas: usize) -> Self {
        QuorumTracker {
            required: consistency.required_acks(replicas),
            acks: 1,
        }
    }

    /// Record one remote acknowledgement; returns true once the quorum is
    /// reached
    pub fn record_ack(&mut self) -> bool {
        self.acks += 1;
        self.reached()
    }

    pub fn reached(&self) -> bool {
        self.acks >= self.required
    }

    pub fn acks(&self) -> usize {
        self.acks
    }

    pub fn required(&self) -> usize {
        self.required
    }
}

/// The only timeout in the system: how long a write may wait for its quorum
pub fn default_write_timeout() -> Duration {
    Duration::from_secs(5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(WriteConsistency::parse("all"), Some(WriteConsistency::All));
        assert_eq!(
            WriteConsistency::parse("MAJORITY"),
            Some(WriteConsistency::Majority)
        );
        assert_eq!(WriteConsistency::parse("eventual"), None);
    }

    #[test]
    fn test_required_acks_all() {
        assert_eq!(WriteConsistency::All.required_acks(1), 1);
        assert_eq!(WriteConsistency::All.required_acks(3), 3);
        assert_eq!(WriteConsistency::All.required_acks(5), 5);
    }

    #[test]
    fn test_required_acks_majority() {
        assert_eq!(WriteConsistency::Majority.required_acks(1), 1);
        assert_eq!(WriteConsistency::Majority.required_acks(2), 2);
        assert_eq!(WriteConsistency::Majority.required_acks(3), 2);
        assert_eq!(WriteConsistency::Majority.required_acks(4), 3);
        assert_eq!(WriteConsistency::Majority.required_acks(5), 3);
    }

    #[test]
    fn test_tracker_counts_local_apply() {
        // Single node: the local apply alone satisfies any quorum
        let tracker = QuorumTracker::new(WriteConsistency::All, 1);
        assert!(tracker.reached());

        let mut tracker = QuorumTracker::new(WriteConsistency::Majority, 3);
        assert!(!tracker.reached());
        assert!(tracker.record_ack());
        assert_eq!(tracker.acks(), 2);
    }

    #[test]
    fn test_tracker_all_needs_every_replica() {
        let mut tracker = QuorumTracker::new(WriteConsistency::All, 3);
        assert!(!tracker.record_ack());
        assert!(tracker.record_ack());
        assert_eq!(tracker.required(), 3);
    }
}
