//! CRDT (Conflict-free Replicated Data Types) building blocks
//!
//! This module provides the replicated value types the cache is built on:
//! a versioned entry with a deterministic merge rule, and a grow-only set
//! used to track which cache keys exist anywhere in the cluster.

use std::collections::HashSet;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::types::Principal;

/// An immutable versioned cache entry
///
/// Wraps a principal together with the replication metadata needed for
/// conflict resolution: the originating node, a per-node logical timestamp
/// (wall-clock milliseconds, compared only relatively), and whether the
/// write was an update or a creation. A new mutation always produces a new
/// entry; an existing one is never modified in place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionedEntry {
    payload: Principal,
    is_update: bool,
    origin_id: String,
    timestamp_ms: u64,
}

impl VersionedEntry {
    pub fn new(payload: Principal, is_update: bool, origin_id: String, timestamp_ms: u64) -> Self {
        VersionedEntry {
            payload,
            is_update,
            origin_id,
            timestamp_ms,
        }
    }

    pub fn payload(&self) -> &Principal {
        &self.payload
    }

    pub fn is_update(&self) -> bool {
        self.is_update
    }

    pub fn origin_id(&self) -> &str {
        &self.origin_id
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// Resolve a conflict between the locally held entry (`self`) and an
    /// incoming remote one
    ///
    /// The local side wins only when it comes from a different origin AND
    /// is strictly newer; in every other case (same origin, equal
    /// timestamps, or a newer remote) the remote side wins. Same-origin
    /// writes are causally ordered by the substrate, so always taking the
    /// remote one there yields the latest accepted write from that origin.
    ///
    /// Note the asymmetry: an older remote entry from a different origin
    /// still wins a tie. This skew is preserved deliberately for
    /// compatibility with existing deployments; do not symmetrize it.
    ///
    /// Idempotent (`merge(x, x) = x`) and deterministic in the four fields,
    /// which is what the anti-entropy protocol needs to converge.
    pub fn merge<'a>(&'a self, remote: &'a VersionedEntry) -> &'a VersionedEntry {
        if self.origin_id != remote.origin_id && self.timestamp_ms > remote.timestamp_ms {
            warn!(
                "Maintaining local version of '{}' (local origin={} ts={}, remote origin={} ts={})",
                self.payload.id(),
                self.origin_id,
                self.timestamp_ms,
                remote.origin_id,
                remote.timestamp_ms
            );
            self
        } else {
            remote
        }
    }
}

/// Grow-only set of rendered cache keys
///
/// Keys are only ever added, never removed; a deleted principal leaves an
/// empty slot behind, not a missing key. The delta against a previously
/// known view is what drives lazy per-key subscription.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeySet {
    elements: HashSet<String>,
}

impl KeySet {
    pub fn new() -> Self {
        KeySet {
            elements: HashSet::new(),
        }
    }

    /// Add a key; returns false if it was already present (no-op)
    pub fn insert(&mut self, key: impl Into<String>) -> bool {
        self.elements.insert(key.into())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.elements.contains(key)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn elements(&self) -> &HashSet<String> {
        &self.elements
    }

    /// Merge with another key set (set union)
    pub fn merge(&mut self, other: &KeySet) -> bool {
        let before = self.elements.len();
        self.elements.extend(other.elements.iter().cloned());
        self.elements.len() > before
    }
}

/// Compute which keys of `new` have not been seen in `known`
///
/// Pure function so the "newly observed keys" step of subscription can be
/// tested in isolation. Order of the result is unspecified.
pub fn key_set_delta(new: &HashSet<String>, known: &HashSet<String>) -> Vec<String> {
    new.difference(known).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Group, User};

    fn entry(id: &str, origin: &str, ts: u64) -> VersionedEntry {
        VersionedEntry::new(
            Principal::User(User::new(id, id)),
            false,
            origin.to_string(),
            ts,
        )
    }

    #[test]
    fn test_merge_local_newer_different_origin_keeps_local() {
        let local = entry("u1", "node-a", 200);
        let remote = entry("u1", "node-b", 100);
        assert_eq!(local.merge(&remote), &local);
    }

    #[test]
    fn test_merge_remote_newer_different_origin_keeps_remote() {
        let local = entry("u1", "node-a", 100);
        let remote = entry("u1", "node-b", 200);
        assert_eq!(local.merge(&remote), &remote);
    }

    #[test]
    fn test_merge_tie_different_origin_keeps_remote() {
        let local = entry("u1", "node-a", 100);
        let remote = entry("u1", "node-b", 100);
        assert_eq!(local.merge(&remote), &remote);
    }

    #[test]
    fn test_merge_same_origin_always_keeps_remote() {
        // Same-origin writes are causally ordered by the substrate, so the
        // incoming one is by definition the latest, even if its timestamp
        // reads older.
        let local = entry("u1", "node-a", 500);
        let remote = entry("u1", "node-a", 100);
        assert_eq!(local.merge(&remote), &remote);
    }

    #[test]
    fn test_merge_idempotent() {
        let a = entry("u1", "node-a", 100);
        assert_eq!(a.merge(&a), &a);
    }

    #[test]
    fn test_merge_deterministic() {
        // Same concrete values in the same roles resolve identically no
        // matter how often or where the merge is evaluated.
        let local = entry("u1", "node-a", 300);
        let remote = entry("u1", "node-b", 100);
        let first = local.merge(&remote).clone();
        for _ in 0..10 {
            assert_eq!(local.merge(&remote), &first);
        }
    }

    #[test]
    fn test_merge_group_entries() {
        let local = VersionedEntry::new(
            Principal::Group(Group::new("g1", "admins")),
            true,
            "node-a".to_string(),
            100,
        );
        let remote = VersionedEntry::new(
            Principal::Group(Group::new("g1", "admins-renamed")),
            true,
            "node-b".to_string(),
            150,
        );
        let winner = local.merge(&remote);
        assert_eq!(winner.payload().id(), "g1");
        assert!(matches!(winner.payload(), Principal::Group(g) if g.name == "admins-renamed"));
    }

    #[test]
    fn test_key_set_grow_only() {
        let mut keys = KeySet::new();
        assert!(keys.insert("user-u1"));
        assert!(keys.insert("group-g1"));
        // Re-registering an already-present key is a no-op
        assert!(!keys.insert("user-u1"));
        assert_eq!(keys.len(), 2);
        assert!(keys.contains("user-u1"));
    }

    #[test]
    fn test_key_set_merge() {
        let mut a = KeySet::new();
        a.insert("user-u1");
        let mut b = KeySet::new();
        b.insert("user-u1");
        b.insert("user-u2");

        assert!(a.merge(&b));
        assert_eq!(a.len(), 2);
        // Merging again changes nothing
        assert!(!a.merge(&b));
    }

    #[test]
    fn test_key_set_delta() {
        let known: HashSet<String> = ["user-u1".to_string()].into_iter().collect();
        let new: HashSet<String> = ["user-u1".to_string(), "group-g1".to_string()]
            .into_iter()
            .collect();

        let delta = key_set_delta(&new, &known);
        assert_eq!(delta, vec!["group-g1".to_string()]);
        assert!(key_set_delta(&known, &known).is_empty());
    }
}
