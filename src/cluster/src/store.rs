//! Local view of the replicated state: the grow-only key set plus one
//! versioned-entry slot per cache key.
//!
//! The store is the only shared mutable state in the substrate. Local
//! writes overwrite their slot (the cache actor externally serializes
//! same-key writes); remote deliveries go through the entry merge rule.
//! Subscribed keys push change notifications into the cache actor's
//! mailbox, and only when the visible state actually changed, so
//! convergence noise does not multiply callbacks.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use cache::{CacheKey, ChangeNotification, KeySet, Notifier, VersionedEntry};

struct Slot {
    entry: Option<VersionedEntry>,
    /// Node that produced the current state; kept for removals, where the
    /// entry itself carries no origin anymore
    last_origin: String,
}

struct StoreInner {
    keys: KeySet,
    slots: HashMap<String, Slot>,
    subscribed: HashSet<String>,
}

/// Replicated store shared by the listener, the peer links, and the
/// command loop
pub struct ReplicatedStore {
    inner: RwLock<StoreInner>,
    notifier: Notifier,
}

/// Serialized full state exchanged when a node (re)joins
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub keys: Vec<String>,
    pub slots: Vec<SlotSnapshot>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub key: String,
    pub entry: Option<VersionedEntry>,
    pub last_origin: String,
}

impl ReplicatedStore {
    pub fn new(notifier: Notifier) -> Self {
        ReplicatedStore {
            inner: RwLock::new(StoreInner {
                keys: KeySet::new(),
                slots: HashMap::new(),
                subscribed: HashSet::new(),
            }),
            notifier,
        }
    }

    /// Add a key to the grow-only set; notifies on growth, no-op otherwise
    pub fn register_key(&self, key: &str) -> bool {
        let grew = {
            let mut inner = self.inner.write().expect("Poisoned store lock");
            inner.keys.insert(key)
        };
        if grew {
            self.notify_key_set();
        }
        grew
    }

    /// Apply a write issued by this node: the slot is replaced outright
    pub fn apply_local_put(&self, key: &str, entry: VersionedEntry) {
        let (grew, notify) = {
            let mut inner = self.inner.write().expect("Poisoned store lock");
            let grew = inner.keys.insert(key);
            let origin = entry.origin_id().to_string();
            let slot = inner.slots.entry(key.to_string()).or_insert(Slot {
                entry: None,
                last_origin: String::new(),
            });
            let changed = slot.entry.as_ref() != Some(&entry);
            slot.entry = Some(entry);
            slot.last_origin = origin;
            (grew, changed && inner.subscribed.contains(key))
        };
        if grew {
            self.notify_key_set();
        }
        if notify {
            self.notify_entry(key);
        }
    }

    /// Clear a slot for a deletion issued by `origin` (local or remote);
    /// the key itself stays registered
    pub fn apply_remove(&self, key: &str, origin: &str) {
        let (grew, notify) = {
            let mut inner = self.inner.write().expect("Poisoned store lock");
            let grew = inner.keys.insert(key);
            let slot = inner.slots.entry(key.to_string()).or_insert(Slot {
                entry: None,
                last_origin: String::new(),
            });
            let changed = slot.entry.is_some();
            slot.entry = None;
            slot.last_origin = origin.to_string();
            (grew, changed && inner.subscribed.contains(key))
        };
        if grew {
            self.notify_key_set();
        }
        if notify {
            self.notify_entry(key);
        }
    }

    /// Apply an entry replicated from a peer through the merge rule
    ///
    /// An empty slot adopts the incoming entry (presence always restores a
    /// deleted key); an occupied one keeps whichever side the merge picks.
    pub fn apply_remote_put(&self, key: &str, incoming: VersionedEntry) {
        let (grew, notify) = {
            let mut inner = self.inner.write().expect("Poisoned store lock");
            let grew = inner.keys.insert(key);
            let slot = inner.slots.entry(key.to_string()).or_insert(Slot {
                entry: None,
                last_origin: String::new(),
            });
            let adopt = match &slot.entry {
                None => true,
                Some(current) => !std::ptr::eq(current.merge(&incoming), current),
            };
            let notify = if !adopt {
                debug!("Merge kept local entry for '{}'", key);
                false
            } else {
                let changed = slot.entry.as_ref() != Some(&incoming);
                slot.last_origin = incoming.origin_id().to_string();
                slot.entry = Some(incoming);
                changed && inner.subscribed.contains(key)
            };
            (grew, notify)
        };
        if grew {
            self.notify_key_set();
        }
        if notify {
            self.notify_entry(key);
        }
    }

    /// Start delivering change notifications for `key`
    ///
    /// If the slot already carries replicated state, its current value is
    /// delivered immediately, covering the first-replication-from-a-peer
    /// case where the write arrived before anyone subscribed.
    pub fn subscribe(&self, key: &CacheKey) {
        let rendered = key.to_string();
        let deliver_current = {
            let mut inner = self.inner.write().expect("Poisoned store lock");
            inner.subscribed.insert(rendered.clone()) && inner.slots.contains_key(&rendered)
        };
        if deliver_current {
            self.notify_entry(&rendered);
        }
    }

    /// Current entry for a key, if any
    pub fn entry(&self, key: &str) -> Option<VersionedEntry> {
        let inner = self.inner.read().expect("Poisoned store lock");
        inner.slots.get(key).and_then(|s| s.entry.clone())
    }

    /// Current view of the replicated key set
    pub fn known_keys(&self) -> HashSet<String> {
        let inner = self.inner.read().expect("Poisoned store lock");
        inner.keys.elements().clone()
    }

    /// Full state for a joining peer
    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.inner.read().expect("Poisoned store lock");
        StoreSnapshot {
            keys: inner.keys.elements().iter().cloned().collect(),
            slots: inner
                .slots
                .iter()
                .map(|(key, slot)| SlotSnapshot {
                    key: key.clone(),
                    entry: slot.entry.clone(),
                    last_origin: slot.last_origin.clone(),
                })
                .collect(),
        }
    }

    /// Fold a peer's full state into this store, entry by entry
    ///
    /// Snapshot absences do not clear local entries: absence carries no
    /// timestamp, so a locally present entry wins until an explicit
    /// removal arrives.
    pub fn merge_snapshot(&self, snapshot: StoreSnapshot) {
        let mut grew = false;
        {
            let mut inner = self.inner.write().expect("Poisoned store lock");
            for key in &snapshot.keys {
                grew |= inner.keys.insert(key.clone());
            }
        }
        if grew {
            self.notify_key_set();
        }

        for slot in snapshot.slots {
            match slot.entry {
                Some(entry) => self.apply_remote_put(&slot.key, entry),
                None => {
                    // Record the empty slot so a later subscription sees the
                    // deletion, but never override a present local entry
                    let notify = {
                        let mut inner = self.inner.write().expect("Poisoned store lock");
                        inner.keys.insert(&slot.key);
                        if inner.slots.contains_key(&slot.key) {
                            false
                        } else {
                            inner.slots.insert(
                                slot.key.clone(),
                                Slot {
                                    entry: None,
                                    last_origin: slot.last_origin.clone(),
                                },
                            );
                            inner.subscribed.contains(&slot.key)
                        }
                    };
                    if notify {
                        self.notify_entry(&slot.key);
                    }
                }
            }
        }
    }

    fn notify_key_set(&self) {
        let keys = self.known_keys();
        self.notifier.notify(ChangeNotification::KeySet(keys));
    }

    fn notify_entry(&self, key: &str) {
        let parsed = match CacheKey::parse(key) {
            Some(parsed) => parsed,
            None => {
                warn!("Not notifying unclassifiable key '{}'", key);
                return;
            }
        };
        let (entry, origin) = {
            let inner = self.inner.read().expect("Poisoned store lock");
            match inner.slots.get(key) {
                Some(slot) => (slot.entry.clone(), slot.last_origin.clone()),
                None => return,
            }
        };
        self.notifier.notify(ChangeNotification::Entry {
            key: parsed,
            entry,
            origin,
        });
    }
}
