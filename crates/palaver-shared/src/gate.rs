//! Authorization gate: may two users exchange messages or friend requests?

use crate::error::ChatError;
use crate::models::User;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    Allowed,
    Blocked,
}

impl Exchange {
    /// Converts a denial into the error surfaced to the acting client.
    pub fn require(self, denial: &str) -> Result<(), ChatError> {
        match self {
            Exchange::Allowed => Ok(()),
            Exchange::Blocked => Err(ChatError::forbidden(denial)),
        }
    }
}

/// Blocked iff either side has blocked the other. Friendship is not required.
pub fn can_exchange(a: &User, b: &User) -> Exchange {
    if a.has_blocked(&b.id) || b.has_blocked(&a.id) {
        Exchange::Blocked
    } else {
        Exchange::Allowed
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Utc;

    use super::*;
    use crate::types::UserId;

    fn user(name: &str) -> User {
        User {
            id: UserId::new(),
            username: name.to_string(),
            avatar: String::new(),
            status: String::new(),
            online: false,
            friends: BTreeSet::new(),
            blocked_users: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_strangers_may_exchange() {
        let a = user("alice");
        let b = user("bob");
        assert_eq!(can_exchange(&a, &b), Exchange::Allowed);
    }

    #[test]
    fn test_block_is_symmetric() {
        let mut a = user("alice");
        let b = user("bob");
        a.blocked_users.insert(b.id);

        assert_eq!(can_exchange(&a, &b), Exchange::Blocked);
        assert_eq!(can_exchange(&b, &a), Exchange::Blocked);
    }

    #[test]
    fn test_require_maps_to_forbidden() {
        let mut a = user("alice");
        let b = user("bob");
        a.blocked_users.insert(b.id);

        let err = can_exchange(&b, &a).require("blocked").unwrap_err();
        assert_eq!(err, ChatError::Forbidden("blocked".into()));
    }
}
