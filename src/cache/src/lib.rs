// Core modules
pub mod types;
pub mod keys;
pub mod crdt;

// Event plumbing
pub mod events;
pub mod replicator;
pub mod subscription;
pub mod translator;

// Re-export main types for convenience
pub use types::{current_timestamp_ms, Group, Principal, PrincipalKind, User};
pub use keys::{CacheKey, GROUP_KEY_PREFIX, USER_KEY_PREFIX};
pub use crdt::{key_set_delta, KeySet, VersionedEntry};
pub use events::{DomainEvent, EventsHandler, LoggingEventsHandler};
pub use replicator::{ChangeNotification, Notifier, Replicator, WriteOutcome};
pub use subscription::SubscriptionManager;
pub use translator::{CacheHandle, CacheMessage, EventCache, Mailbox};
