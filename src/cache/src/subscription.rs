//! Tracks which replicated slots this node listens to.

use std::collections::HashSet;

use log::warn;

use crate::crdt::key_set_delta;
use crate::keys::CacheKey;

/// Per-key subscription state
///
/// Keys move from unknown to subscribed exactly once; there is no
/// unsubscribe path in normal operation. Duplicate or overlapping key-set
/// deltas are tolerated: a key already subscribed is never returned again.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    /// Last adopted view of the replicated key set
    known: HashSet<String>,
    subscribed: HashSet<String>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        SubscriptionManager {
            known: HashSet::new(),
            subscribed: HashSet::new(),
        }
    }

    /// Whether `key` has been observed in the replicated key set
    pub fn is_known(&self, key: &CacheKey) -> bool {
        self.known.contains(&key.to_string())
    }

    /// Record a key this node registered itself, ahead of the substrate's
    /// own notification coming back around
    pub fn mark_known(&mut self, key: &CacheKey) {
        self.known.insert(key.to_string());
    }

    /// Adopt a grown key-set view; returns the keys to newly subscribe to
    ///
    /// The delta is taken against the subscribed set, not the known set:
    /// a key this node registered itself is already known but still needs
    /// its subscription. Keys that do not parse as cache keys are logged
    /// and skipped; they stay in the subscribed set so they are not
    /// re-reported on every delta.
    pub fn observe(&mut self, new_keys: HashSet<String>) -> Vec<CacheKey> {
        let fresh = key_set_delta(&new_keys, &self.subscribed);
        self.known.extend(new_keys);

        let mut to_subscribe = Vec::new();
        for raw in fresh {
            if !self.subscribed.insert(raw.clone()) {
                continue;
            }
            match CacheKey::parse(&raw) {
                Some(key) => to_subscribe.push(key),
                None => warn!("Ignoring unclassifiable cache key '{}'", raw),
            }
        }
        to_subscribe
    }

    pub fn subscribed_count(&self) -> usize {
        self.subscribed.len()
    }
}
