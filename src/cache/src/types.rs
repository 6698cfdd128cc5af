use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A user account replicated across the cluster
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub full_name: String,
    pub email: String,
    pub active: bool,
    /// Ids of the groups this user belongs to
    pub groups: HashSet<String>,
    pub direct_roles: HashSet<String>,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        User {
            id: id.into(),
            full_name: name.clone(),
            name,
            email: String::new(),
            active: true,
            groups: HashSet::new(),
            direct_roles: HashSet::new(),
        }
    }
}

/// A group of users replicated across the cluster
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub full_name: String,
    pub active: bool,
    /// Ids of the users that are members of this group
    pub users: HashSet<String>,
    pub direct_roles: HashSet<String>,
}

impl Group {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Group {
            id: id.into(),
            full_name: name.clone(),
            name,
            active: true,
            users: HashSet::new(),
            direct_roles: HashSet::new(),
        }
    }
}

/// Kind of security principal held in a cache entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrincipalKind {
    User,
    Group,
}

impl std::fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrincipalKind::User => write!(f, "user"),
            PrincipalKind::Group => write!(f, "group"),
        }
    }
}

/// The payload carried by a replicated cache entry
///
/// The cache itself only cares about the principal's identity and kind;
/// everything else is opaque and travels as-is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Principal {
    User(User),
    Group(Group),
}

impl Principal {
    pub fn id(&self) -> &str {
        match self {
            Principal::User(u) => &u.id,
            Principal::Group(g) => &g.id,
        }
    }

    pub fn kind(&self) -> PrincipalKind {
        match self {
            Principal::User(_) => PrincipalKind::User,
            Principal::Group(_) => PrincipalKind::Group,
        }
    }
}

/// Get current timestamp in milliseconds since epoch
///
/// Only ever compared for relative ordering between writes; never treated
/// as an absolute wall-clock time across nodes.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
