//! Domain event vocabulary and the callback surface exposed to the rest
//! of the system.

use log::info;

use crate::types::{Group, User};

/// A local mutation of a security principal
///
/// Closed set: the event translator matches exhaustively over it, so a new
/// event kind cannot be forgotten in the routing logic.
#[derive(Clone, Debug)]
pub enum DomainEvent {
    UserCreated(User),
    UserUpdated(User),
    UserDeleted(String),
    GroupCreated(Group),
    GroupUpdated(Group),
    GroupDeleted(String),
}

/// Callbacks invoked when a change that originated on another node has been
/// applied locally
///
/// Deletions carry only the principal id, since absence of the entry means
/// there is no payload left to deliver. Implementations should be
/// idempotent: convergence may deliver the same change more than once.
pub trait EventsHandler: Send {
    fn on_user_created(&self, user: &User);
    fn on_user_updated(&self, user: &User);
    fn on_user_deleted(&self, user_id: &str);
    fn on_group_created(&self, group: &Group);
    fn on_group_updated(&self, group: &Group);
    fn on_group_deleted(&self, group_id: &str);
}

/// Handler that just logs remote changes; used by the standalone daemon
pub struct LoggingEventsHandler;

impl EventsHandler for LoggingEventsHandler {
    fn on_user_created(&self, user: &User) {
        info!("Remote change: user '{}' created", user.id);
    }

    fn on_user_updated(&self, user: &User) {
        info!("Remote change: user '{}' updated", user.id);
    }

    fn on_user_deleted(&self, user_id: &str) {
        info!("Remote change: user '{}' deleted", user_id);
    }

    fn on_group_created(&self, group: &Group) {
        info!("Remote change: group '{}' created", group.id);
    }

    fn on_group_updated(&self, group: &Group) {
        info!("Remote change: group '{}' updated", group.id);
    }

    fn on_group_deleted(&self, group_id: &str) {
        info!("Remote change: group '{}' deleted", group_id);
    }
}
