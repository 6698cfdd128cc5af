//! Event translator: the single actor bridging domain events and the
//! replicated cache.
//!
//! Outbound, a local create/update/delete becomes a versioned entry written
//! into the entry's replicated slot (registering the cache key first if this
//! node has never seen it). Inbound, change notifications from the substrate
//! are turned back into domain callbacks, unless they are echoes of this
//! node's own writes. Everything (domain events, change notifications,
//! write acknowledgements) is funneled through one mailbox and processed
//! strictly sequentially, so no further locking is needed here.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::crdt::VersionedEntry;
use crate::events::{DomainEvent, EventsHandler};
use crate::keys::CacheKey;
use crate::replicator::{ChangeNotification, Notifier, Replicator, WriteOutcome};
use crate::subscription::SubscriptionManager;
use crate::types::{current_timestamp_ms, Principal, PrincipalKind};

/// A message in the cache actor's mailbox
#[derive(Clone, Debug)]
pub enum CacheMessage {
    Event(DomainEvent),
    Change(ChangeNotification),
}

/// Receiver half of the cache mailbox
pub type Mailbox = mpsc::UnboundedReceiver<CacheMessage>;

/// Cloneable handle for submitting local domain events to the cache actor
///
/// Callers on any thread may submit concurrently; the mailbox serializes
/// processing.
#[derive(Clone)]
pub struct CacheHandle {
    tx: mpsc::UnboundedSender<CacheMessage>,
}

impl CacheHandle {
    /// Create the mailbox pair the actor and its collaborators share
    pub fn channel() -> (CacheHandle, Mailbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CacheHandle { tx }, rx)
    }

    /// Notifier for the replication substrate to push changes through
    pub fn notifier(&self) -> Notifier {
        Notifier::new(self.tx.clone())
    }

    pub fn submit(&self, event: DomainEvent) {
        let _ = self.tx.send(CacheMessage::Event(event));
    }

    pub fn notify_user_created(&self, user: crate::types::User) {
        self.submit(DomainEvent::UserCreated(user));
    }

    pub fn notify_user_updated(&self, user: crate::types::User) {
        self.submit(DomainEvent::UserUpdated(user));
    }

    pub fn notify_user_deleted(&self, user_id: impl Into<String>) {
        self.submit(DomainEvent::UserDeleted(user_id.into()));
    }

    pub fn notify_group_created(&self, group: crate::types::Group) {
        self.submit(DomainEvent::GroupCreated(group));
    }

    pub fn notify_group_updated(&self, group: crate::types::Group) {
        self.submit(DomainEvent::GroupUpdated(group));
    }

    pub fn notify_group_deleted(&self, group_id: impl Into<String>) {
        self.submit(DomainEvent::GroupDeleted(group_id.into()));
    }
}

/// The cache actor
pub struct EventCache {
    node_id: String,
    mailbox: Mailbox,
    replicator: Arc<dyn Replicator>,
    handler: Box<dyn EventsHandler>,
    subscriptions: SubscriptionManager,
}

impl EventCache {
    pub fn new(
        node_id: String,
        mailbox: Mailbox,
        replicator: Arc<dyn Replicator>,
        handler: Box<dyn EventsHandler>,
    ) -> Self {
        EventCache {
            node_id,
            mailbox,
            replicator,
            handler,
            subscriptions: SubscriptionManager::new(),
        }
    }

    /// Process mailbox messages until every sender has gone away
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            self.handle(msg);
        }
        debug!("Cache actor on '{}' stopped", self.node_id);
    }

    fn handle(&mut self, msg: CacheMessage) {
        match msg {
            CacheMessage::Event(event) => self.handle_event(event),
            CacheMessage::Change(change) => self.handle_change(change),
        }
    }

    fn handle_event(&mut self, event: DomainEvent) {
        match event {
            DomainEvent::UserCreated(user) => self.put_principal(Principal::User(user), false),
            DomainEvent::UserUpdated(user) => self.put_principal(Principal::User(user), true),
            DomainEvent::UserDeleted(id) => self.evict(CacheKey::user(id)),
            DomainEvent::GroupCreated(group) => self.put_principal(Principal::Group(group), false),
            DomainEvent::GroupUpdated(group) => self.put_principal(Principal::Group(group), true),
            DomainEvent::GroupDeleted(id) => self.evict(CacheKey::group(id)),
        }
    }

    fn put_principal(&mut self, principal: Principal, is_update: bool) {
        let key = CacheKey::for_principal(&principal);
        self.ensure_registered(&key);

        let entry = VersionedEntry::new(
            principal,
            is_update,
            self.node_id.clone(),
            current_timestamp_ms(),
        );
        self.replicator.put(&key, entry);
    }

    fn evict(&mut self, key: CacheKey) {
        self.ensure_registered(&key);
        self.replicator.remove(&key);
    }

    fn ensure_registered(&mut self, key: &CacheKey) {
        if !self.subscriptions.is_known(key) {
            self.replicator.register_key(key);
            // Remember it right away; the substrate's own key-set
            // notification may lag behind further writes to the same key.
            self.subscriptions.mark_known(key);
        }
    }

    fn handle_change(&mut self, change: ChangeNotification) {
        match change {
            ChangeNotification::KeySet(keys) => {
                for key in self.subscriptions.observe(keys) {
                    self.replicator.subscribe(&key);
                }
            }
            ChangeNotification::Entry { key, entry, origin } => {
                if origin == self.node_id {
                    debug!("Suppressing echo of own write for '{}'", key);
                    return;
                }
                match entry {
                    Some(entry) => self.deliver_present(&key, &entry),
                    None => self.deliver_absent(&key),
                }
            }
            ChangeNotification::Write { key, outcome } => match outcome {
                WriteOutcome::Acknowledged => {
                    debug!("Write for '{}' reached quorum", key);
                }
                WriteOutcome::TimedOut => {
                    // The local copy stands; only the cluster-wide
                    // acknowledgement is missing. No automatic retry.
                    warn!("Write for '{}' did not reach quorum before timeout", key);
                }
            },
        }
    }

    fn deliver_present(&self, key: &CacheKey, entry: &VersionedEntry) {
        match (key.kind, entry.payload()) {
            (PrincipalKind::User, Principal::User(user)) => {
                if entry.is_update() {
                    self.handler.on_user_updated(user);
                } else {
                    self.handler.on_user_created(user);
                }
            }
            (PrincipalKind::Group, Principal::Group(group)) => {
                if entry.is_update() {
                    self.handler.on_group_updated(group);
                } else {
                    self.handler.on_group_created(group);
                }
            }
            (kind, payload) => {
                warn!(
                    "Ignoring notification for '{}': {} key carries a {} payload",
                    key,
                    kind,
                    payload.kind()
                );
            }
        }
    }

    fn deliver_absent(&self, key: &CacheKey) {
        match key.kind {
            PrincipalKind::User => self.handler.on_user_deleted(&key.id),
            PrincipalKind::Group => self.handler.on_group_deleted(&key.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Group, User};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    /// In-process substrate connecting several fake replicators: every
    /// write is merged into each node's view synchronously and subscribed
    /// nodes are notified, echoes included.
    #[derive(Default)]
    struct HubInner {
        nodes: HashMap<String, NodeView>,
        register_calls: HashMap<String, usize>,
    }

    struct NodeView {
        notifier: Notifier,
        subscribed: HashSet<String>,
        keys: HashSet<String>,
        slots: HashMap<String, SlotView>,
    }

    struct SlotView {
        entry: Option<VersionedEntry>,
        origin: String,
    }

    #[derive(Clone, Default)]
    struct FakeHub {
        inner: Arc<Mutex<HubInner>>,
    }

    impl FakeHub {
        fn join(&self, node_id: &str, notifier: Notifier) -> Arc<dyn Replicator> {
            let mut inner = self.inner.lock().unwrap();
            inner.nodes.insert(
                node_id.to_string(),
                NodeView {
                    notifier,
                    subscribed: HashSet::new(),
                    keys: HashSet::new(),
                    slots: HashMap::new(),
                },
            );
            Arc::new(FakeReplicator {
                node_id: node_id.to_string(),
                hub: self.inner.clone(),
            })
        }

        fn register_calls(&self, key: &str) -> usize {
            *self
                .inner
                .lock()
                .unwrap()
                .register_calls
                .get(key)
                .unwrap_or(&0)
        }

        fn keys_on(&self, node_id: &str) -> HashSet<String> {
            self.inner.lock().unwrap().nodes[node_id].keys.clone()
        }
    }

    struct FakeReplicator {
        node_id: String,
        hub: Arc<Mutex<HubInner>>,
    }

    impl Replicator for FakeReplicator {
        fn register_key(&self, key: &CacheKey) {
            let rendered = key.to_string();
            let mut inner = self.hub.lock().unwrap();
            *inner.register_calls.entry(rendered.clone()).or_insert(0) += 1;
            for node in inner.nodes.values_mut() {
                if node.keys.insert(rendered.clone()) {
                    node.notifier
                        .notify(ChangeNotification::KeySet(node.keys.clone()));
                }
            }
        }

        fn put(&self, key: &CacheKey, entry: VersionedEntry) {
            let rendered = key.to_string();
            let mut inner = self.hub.lock().unwrap();
            for node in inner.nodes.values_mut() {
                let slot = node.slots.entry(rendered.clone()).or_insert(SlotView {
                    entry: None,
                    origin: String::new(),
                });
                let adopted = match &slot.entry {
                    None => entry.clone(),
                    Some(current) => current.merge(&entry).clone(),
                };
                let changed = slot.entry.as_ref() != Some(&adopted);
                if changed {
                    slot.entry = Some(adopted);
                    slot.origin = entry.origin_id().to_string();
                    if node.subscribed.contains(&rendered) {
                        node.notifier.notify(ChangeNotification::Entry {
                            key: key.clone(),
                            entry: slot.entry.clone(),
                            origin: slot.origin.clone(),
                        });
                    }
                }
            }
            if let Some(node) = inner.nodes.get(&self.node_id) {
                node.notifier.notify(ChangeNotification::Write {
                    key: rendered,
                    outcome: WriteOutcome::Acknowledged,
                });
            }
        }

        fn remove(&self, key: &CacheKey) {
            let rendered = key.to_string();
            let mut inner = self.hub.lock().unwrap();
            for node in inner.nodes.values_mut() {
                let slot = node.slots.entry(rendered.clone()).or_insert(SlotView {
                    entry: None,
                    origin: String::new(),
                });
                let changed = slot.entry.is_some();
                slot.entry = None;
                slot.origin = self.node_id.clone();
                if changed && node.subscribed.contains(&rendered) {
                    node.notifier.notify(ChangeNotification::Entry {
                        key: key.clone(),
                        entry: None,
                        origin: slot.origin.clone(),
                    });
                }
            }
            if let Some(node) = inner.nodes.get(&self.node_id) {
                node.notifier.notify(ChangeNotification::Write {
                    key: rendered,
                    outcome: WriteOutcome::Acknowledged,
                });
            }
        }

        fn subscribe(&self, key: &CacheKey) {
            let rendered = key.to_string();
            let mut inner = self.hub.lock().unwrap();
            if let Some(node) = inner.nodes.get_mut(&self.node_id) {
                node.subscribed.insert(rendered.clone());
                // Deliver current state right away, as the substrate does
                // for a fresh subscription
                if let Some(slot) = node.slots.get(&rendered) {
                    node.notifier.notify(ChangeNotification::Entry {
                        key: key.clone(),
                        entry: slot.entry.clone(),
                        origin: slot.origin.clone(),
                    });
                }
            }
        }
    }

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl EventsHandler for Recorder {
        fn on_user_created(&self, user: &User) {
            self.calls.lock().unwrap().push(format!("user_created:{}", user.id));
        }
        fn on_user_updated(&self, user: &User) {
            self.calls.lock().unwrap().push(format!("user_updated:{}", user.id));
        }
        fn on_user_deleted(&self, user_id: &str) {
            self.calls.lock().unwrap().push(format!("user_deleted:{}", user_id));
        }
        fn on_group_created(&self, group: &Group) {
            self.calls.lock().unwrap().push(format!("group_created:{}", group.id));
        }
        fn on_group_updated(&self, group: &Group) {
            self.calls.lock().unwrap().push(format!("group_updated:{}", group.id));
        }
        fn on_group_deleted(&self, group_id: &str) {
            self.calls.lock().unwrap().push(format!("group_deleted:{}", group_id));
        }
    }

    struct TestNode {
        handle: CacheHandle,
        recorder: Recorder,
    }

    fn spawn_node(hub: &FakeHub, node_id: &str) -> TestNode {
        let (handle, mailbox) = CacheHandle::channel();
        let recorder = Recorder::default();
        let replicator = hub.join(node_id, handle.notifier());
        let cache = EventCache::new(
            node_id.to_string(),
            mailbox,
            replicator,
            Box::new(recorder.clone()),
        );
        tokio::spawn(cache.run());
        TestNode { handle, recorder }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_remote_create_reaches_peer_not_origin() {
        let hub = FakeHub::default();
        let a = spawn_node(&hub, "node-a");
        let b = spawn_node(&hub, "node-b");

        a.handle.notify_user_created(User::new("u1", "alice"));
        settle().await;

        assert_eq!(b.recorder.calls(), vec!["user_created:u1"]);
        // Echo suppression: the originating node's handler stays silent
        assert!(a.recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_update_delete_flow() {
        let hub = FakeHub::default();
        let a = spawn_node(&hub, "node-a");
        let b = spawn_node(&hub, "node-b");

        a.handle.notify_user_created(User::new("u1", "alice"));
        settle().await;
        a.handle.notify_user_updated(User::new("u1", "alice-renamed"));
        settle().await;
        a.handle.notify_user_deleted("u1");
        settle().await;

        assert_eq!(
            b.recorder.calls(),
            vec!["user_created:u1", "user_updated:u1", "user_deleted:u1"]
        );
        assert!(a.recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_group_events_replicate() {
        let hub = FakeHub::default();
        let a = spawn_node(&hub, "node-a");
        let b = spawn_node(&hub, "node-b");

        a.handle.notify_group_created(Group::new("g1", "admins"));
        settle().await;
        b.handle.notify_group_deleted("g1");
        settle().await;

        assert_eq!(b.recorder.calls(), vec!["group_created:g1"]);
        // The deletion originated on b, so only a hears about it
        assert_eq!(a.recorder.calls(), vec!["group_deleted:g1"]);
    }

    #[tokio::test]
    async fn test_key_registered_once_per_entity() {
        let hub = FakeHub::default();
        let a = spawn_node(&hub, "node-a");

        a.handle.notify_user_created(User::new("u1", "alice"));
        a.handle.notify_user_updated(User::new("u1", "alice2"));
        a.handle.notify_user_updated(User::new("u1", "alice3"));
        settle().await;

        assert_eq!(hub.register_calls("user-u1"), 1);
        assert!(hub.keys_on("node-a").contains("user-u1"));
    }

    #[tokio::test]
    async fn test_deleted_entity_key_stays_registered() {
        let hub = FakeHub::default();
        let a = spawn_node(&hub, "node-a");
        let b = spawn_node(&hub, "node-b");

        a.handle.notify_user_created(User::new("u1", "alice"));
        settle().await;
        a.handle.notify_user_deleted("u1");
        settle().await;

        // Deletion empties the slot but never shrinks the key set
        assert!(hub.keys_on("node-a").contains("user-u1"));
        assert!(hub.keys_on("node-b").contains("user-u1"));
        assert_eq!(
            b.recorder.calls(),
            vec!["user_created:u1", "user_deleted:u1"]
        );
    }

    #[tokio::test]
    async fn test_update_after_remote_delete_restores_entry() {
        let hub = FakeHub::default();
        let a = spawn_node(&hub, "node-a");
        let b = spawn_node(&hub, "node-b");

        a.handle.notify_user_created(User::new("u1", "alice"));
        settle().await;
        b.handle.notify_user_deleted("u1");
        settle().await;
        a.handle.notify_user_updated(User::new("u1", "alice-back"));
        settle().await;

        // Presence from a different origin restores the deleted entry
        assert_eq!(
            b.recorder.calls(),
            vec!["user_created:u1", "user_updated:u1"]
        );
        assert_eq!(a.recorder.calls(), vec!["user_deleted:u1"]);
    }

    #[tokio::test]
    async fn test_mismatched_payload_is_ignored() {
        let hub = FakeHub::default();
        let a = spawn_node(&hub, "node-a");

        // A user key carrying a group payload cannot be classified
        let entry = VersionedEntry::new(
            Principal::Group(Group::new("g1", "admins")),
            false,
            "node-x".to_string(),
            1,
        );
        a.handle.notifier().notify(ChangeNotification::Entry {
            key: CacheKey::user("g1"),
            entry: Some(entry),
            origin: "node-x".to_string(),
        });
        settle().await;

        assert!(a.recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_notification_is_redelivered() {
        // Convergence gives at-least-once semantics; the translator does
        // not deduplicate, downstream handlers are expected to be
        // idempotent.
        let hub = FakeHub::default();
        let a = spawn_node(&hub, "node-a");

        let entry = VersionedEntry::new(
            Principal::User(User::new("u1", "alice")),
            true,
            "node-x".to_string(),
            1,
        );
        let notification = ChangeNotification::Entry {
            key: CacheKey::user("u1"),
            entry: Some(entry),
            origin: "node-x".to_string(),
        };
        a.handle.notifier().notify(notification.clone());
        a.handle.notifier().notify(notification);
        settle().await;

        assert_eq!(
            a.recorder.calls(),
            vec!["user_updated:u1", "user_updated:u1"]
        );
    }

    #[tokio::test]
    async fn test_late_joining_node_subscribes_via_key_set() {
        let hub = FakeHub::default();
        let a = spawn_node(&hub, "node-a");
        let b = spawn_node(&hub, "node-b");

        a.handle.notify_user_created(User::new("u1", "alice"));
        settle().await;

        // b was already up, but drive a second entity to check that each
        // new key triggers exactly one subscription on every node
        a.handle.notify_group_created(Group::new("g1", "admins"));
        settle().await;

        assert_eq!(
            b.recorder.calls(),
            vec!["user_created:u1", "group_created:g1"]
        );
    }
}
