//! Live presence: which users have at least one open connection.
//!
//! A user is online iff their connection set is non-empty. Each mutation
//! goes through a single `DashMap` entry, so concurrent connects and
//! disconnects of the same user serialize on that entry.

use std::collections::HashSet;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use palaver_shared::UserId;

use crate::hub::ConnectionId;

#[derive(Default)]
pub struct PresenceRegistry {
    users: DashMap<UserId, HashSet<ConnectionId>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Returns `true` if it is the user's first.
    pub fn register(&self, user: UserId, conn: ConnectionId) -> bool {
        let mut conns = self.users.entry(user).or_default();
        let first = conns.is_empty();
        conns.insert(conn);
        first
    }

    /// Remove a connection. Returns `true` if the user has none left.
    pub fn unregister(&self, user: UserId, conn: ConnectionId) -> bool {
        match self.users.entry(user) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().remove(&conn);
                if entry.get().is_empty() {
                    entry.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => false,
        }
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        self.users.contains_key(user)
    }

    pub fn connections_for(&self, user: &UserId) -> Vec<ConnectionId> {
        self.users
            .get(user)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every online user, sorted.
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.users.iter().map(|e| *e.key()).collect();
        users.sort();
        users
    }

    pub fn online_count(&self) -> usize {
        self.users.len()
    }
}
