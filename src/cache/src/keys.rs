use serde::{Deserialize, Serialize};

use crate::types::{Principal, PrincipalKind};

pub const USER_KEY_PREFIX: &str = "user-";
pub const GROUP_KEY_PREFIX: &str = "group-";

/// Identifier of one replicated cache entry
///
/// Rendered as `user-<id>` or `group-<id>`; stable for the lifetime of the
/// principal it names. One key identifies exactly one replicated slot.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub kind: PrincipalKind,
    pub id: String,
}

impl CacheKey {
    pub fn user(id: impl Into<String>) -> Self {
        CacheKey {
            kind: PrincipalKind::User,
            id: id.into(),
        }
    }

    pub fn group(id: impl Into<String>) -> Self {
        CacheKey {
            kind: PrincipalKind::Group,
            id: id.into(),
        }
    }

    pub fn for_principal(principal: &Principal) -> Self {
        CacheKey {
            kind: principal.kind(),
            id: principal.id().to_string(),
        }
    }

    /// Parse a rendered key back into its parts; `None` for unknown prefixes
    pub fn parse(s: &str) -> Option<Self> {
        if let Some(id) = s.strip_prefix(USER_KEY_PREFIX) {
            Some(CacheKey::user(id))
        } else if let Some(id) = s.strip_prefix(GROUP_KEY_PREFIX) {
            Some(CacheKey::group(id))
        } else {
            None
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            PrincipalKind::User => write!(f, "{}{}", USER_KEY_PREFIX, self.id),
            PrincipalKind::Group => write!(f, "{}{}", GROUP_KEY_PREFIX, self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::User;

    #[test]
    fn test_render_and_parse() {
        let key = CacheKey::user("alice");
        assert_eq!(key.to_string(), "user-alice");
        assert_eq!(CacheKey::parse("user-alice"), Some(key));

        let key = CacheKey::group("admins");
        assert_eq!(key.to_string(), "group-admins");
        assert_eq!(CacheKey::parse("group-admins"), Some(key));
    }

    #[test]
    fn test_parse_unknown_prefix() {
        assert_eq!(CacheKey::parse("task-123"), None);
        assert_eq!(CacheKey::parse(""), None);
    }

    #[test]
    fn test_for_principal() {
        let principal = Principal::User(User::new("u1", "alice"));
        let key = CacheKey::for_principal(&principal);
        assert_eq!(key, CacheKey::user("u1"));
    }

    #[test]
    fn test_id_containing_separator() {
        // Principal ids may contain dashes themselves
        let key = CacheKey::parse("user-a-b-c").unwrap();
        assert_eq!(key.id, "a-b-c");
    }
}
