//! Boundary between the cache and the replication substrate.
//!
//! The cache never talks to peers directly; it issues fire-and-forget
//! commands through [`Replicator`] and hears back through change
//! notifications pushed into its mailbox via a [`Notifier`]. This keeps the
//! core testable against an in-process fake substrate.

use std::collections::HashSet;

use tokio::sync::mpsc;

use crate::crdt::VersionedEntry;
use crate::keys::CacheKey;
use crate::translator::CacheMessage;

/// Outcome of a quorum-governed write, delivered asynchronously
///
/// A timed-out write is only unacknowledged cluster-wide; the local replica
/// keeps its applied copy. Retrying is up to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Acknowledged,
    TimedOut,
}

/// A change pushed from the substrate into the cache actor
#[derive(Clone, Debug)]
pub enum ChangeNotification {
    /// The replicated key set grew; carries the full current view
    KeySet(HashSet<String>),
    /// A subscribed slot changed. `entry` absent means deletion; `origin`
    /// is the node that produced the change (for removals too, where the
    /// entry itself is gone).
    Entry {
        key: CacheKey,
        entry: Option<VersionedEntry>,
        origin: String,
    },
    /// A previously submitted write finished (or timed out)
    Write { key: String, outcome: WriteOutcome },
}

/// Commands the cache issues against the replication substrate
///
/// All calls are fire-and-forget from the caller's point of view; results
/// arrive later as [`ChangeNotification`]s. Every mutation is subject to
/// the substrate's configured write-quorum policy.
pub trait Replicator: Send + Sync {
    /// Add `key` to the cluster-wide grow-only key set (idempotent)
    fn register_key(&self, key: &CacheKey);

    /// Replace the slot for `key` with `entry`
    fn put(&self, key: &CacheKey, entry: VersionedEntry);

    /// Clear the slot for `key` (the key itself stays registered)
    fn remove(&self, key: &CacheKey);

    /// Start receiving entry-change notifications for `key`
    fn subscribe(&self, key: &CacheKey);
}

/// Sender half handed to the substrate for pushing notifications into the
/// cache actor's mailbox
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<CacheMessage>,
}

impl Notifier {
    pub(crate) fn new(tx: mpsc::UnboundedSender<CacheMessage>) -> Self {
        Notifier { tx }
    }

    /// Deliver a notification; silently dropped once the cache shut down
    pub fn notify(&self, notification: ChangeNotification) {
        let _ = self.tx.send(CacheMessage::Change(notification));
    }
}
