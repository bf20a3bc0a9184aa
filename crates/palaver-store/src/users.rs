//! User records, profile updates, presence flag and the per-viewer directory.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use palaver_shared::constants::DEFAULT_STATUS;
use palaver_shared::models::{DirectoryEntry, FriendshipStatus, User};
use palaver_shared::{RequestId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::rows::{request_id_at, timestamp_at, ts, user_id_at};

/// Input for provisioning a user. Fields are expected to be validated.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub username: String,
    pub avatar: Option<String>,
    pub status: Option<String>,
}

/// Partial profile update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub username: Option<String>,
    pub status: Option<String>,
    pub avatar: Option<String>,
}

/// Row counts reported by the admin surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub users: u64,
    pub messages: u64,
    pub pending_requests: u64,
}

const USER_COLUMNS: &str = "id, username, avatar, status, online, created_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    pub fn create_user(&self, new: &NewUser) -> Result<User> {
        let user = User {
            id: UserId::new(),
            username: new.username.clone(),
            avatar: new.avatar.clone().unwrap_or_default(),
            status: new
                .status
                .clone()
                .unwrap_or_else(|| DEFAULT_STATUS.to_string()),
            online: false,
            friends: BTreeSet::new(),
            blocked_users: BTreeSet::new(),
            created_at: Utc::now().trunc_subsecs(6),
        };

        self.conn()
            .execute(
                "INSERT INTO users (id, username, avatar, status, online, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![
                    user.id.to_string(),
                    user.username,
                    user.avatar,
                    user.status,
                    ts(&user.created_at),
                ],
            )
            .map_err(|e| StoreError::classify(e, "username already taken"))?;

        tracing::debug!(user = %user.id, username = %user.username, "user created");
        Ok(user)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a user together with their friend and block sets.
    pub fn get_user(&self, id: &UserId) -> Result<User> {
        let mut user = self
            .conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id.to_string()],
                row_to_user,
            )
            .map_err(|e| StoreError::classify(e, "user"))?;
        load_edges(self.conn(), &mut user)?;
        Ok(user)
    }

    pub fn user_exists(&self, id: &UserId) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM users WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Every user as seen by `me`, online users first then by username.
    pub fn directory_for(&self, me: &UserId) -> Result<Vec<DirectoryEntry>> {
        let viewer = self.get_user(me)?;
        let me_str = me.to_string();

        let blocked_me: HashSet<UserId> = {
            let mut stmt = self
                .conn()
                .prepare("SELECT blocker_id FROM blocks WHERE blocked_id = ?1")?;
            let rows = stmt.query_map(params![me_str], |row| user_id_at(row, 0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        // other user -> (status, request id)
        let pending: HashMap<UserId, (FriendshipStatus, RequestId)> = {
            let mut stmt = self.conn().prepare(
                "SELECT id, sender_id, receiver_id FROM friend_requests
                 WHERE status = 'pending' AND (sender_id = ?1 OR receiver_id = ?1)",
            )?;
            let rows = stmt.query_map(params![me_str], |row| {
                Ok((request_id_at(row, 0)?, user_id_at(row, 1)?, user_id_at(row, 2)?))
            })?;
            let mut map = HashMap::new();
            for row in rows {
                let (id, sender, receiver) = row?;
                if sender == *me {
                    map.insert(receiver, (FriendshipStatus::Sent, id));
                } else {
                    map.insert(sender, (FriendshipStatus::Received, id));
                }
            }
            map
        };

        let unread: HashMap<UserId, u32> = {
            let mut stmt = self.conn().prepare(
                "SELECT sender_id, COUNT(*) FROM messages
                 WHERE receiver_id = ?1 AND seen = 0
                 GROUP BY sender_id",
            )?;
            let rows = stmt.query_map(params![me_str], |row| {
                Ok((user_id_at(row, 0)?, row.get::<_, u32>(1)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut stmt = self.conn().prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY online DESC, username ASC"
        ))?;
        let users = stmt.query_map([], row_to_user)?;

        let mut entries = Vec::new();
        for user in users {
            let user = user?;
            let is_me = user.id == *me;
            let is_blocked_by_me = viewer.has_blocked(&user.id);
            let has_blocked_me = blocked_me.contains(&user.id);

            let (friendship_status, request_id) = if is_me {
                (FriendshipStatus::Me, None)
            } else if viewer.is_friend(&user.id) {
                (FriendshipStatus::Accepted, None)
            } else if let Some((status, id)) = pending.get(&user.id) {
                (*status, Some(*id))
            } else {
                (FriendshipStatus::None, None)
            };

            entries.push(DirectoryEntry {
                id: user.id,
                online: user.online && !is_blocked_by_me && !has_blocked_me,
                username: user.username,
                avatar: user.avatar,
                status: user.status,
                is_me,
                is_blocked_by_me,
                has_blocked_me,
                unread_count: unread.get(&user.id).copied().unwrap_or(0),
                friendship_status,
                request_id,
            });
        }
        Ok(entries)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let count = |sql: &str| -> Result<u64> {
            Ok(self.conn().query_row(sql, [], |row| row.get::<_, i64>(0))? as u64)
        };
        Ok(StoreStats {
            users: count("SELECT COUNT(*) FROM users")?,
            messages: count("SELECT COUNT(*) FROM messages")?,
            pending_requests: count(
                "SELECT COUNT(*) FROM friend_requests WHERE status = 'pending'",
            )?,
        })
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    pub fn update_profile(&self, id: &UserId, update: &ProfileUpdate) -> Result<User> {
        let affected = self
            .conn()
            .execute(
                "UPDATE users SET
                    username = COALESCE(?2, username),
                    status   = COALESCE(?3, status),
                    avatar   = COALESCE(?4, avatar)
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    update.username,
                    update.status,
                    update.avatar,
                ],
            )
            .map_err(|e| StoreError::classify(e, "username already taken"))?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        self.get_user(id)
    }

    /// Write the persisted mirror of live presence.
    pub fn set_online(&self, id: &UserId, online: bool) -> Result<()> {
        self.conn().execute(
            "UPDATE users SET online = ?2 WHERE id = ?1",
            params![id.to_string(), online],
        )?;
        Ok(())
    }

    /// Clear every online flag. Run at boot, when no connection can exist.
    pub fn reset_all_online(&self) -> Result<usize> {
        let n = self
            .conn()
            .execute("UPDATE users SET online = 0 WHERE online <> 0", [])?;
        Ok(n)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Administrative purge. Messages, reactions, friendships, blocks and
    /// friend requests referencing the user go with it.
    pub fn purge_user(&self, id: &UserId) -> Result<()> {
        let affected = self
            .conn()
            .execute("DELETE FROM users WHERE id = ?1", params![id.to_string()])?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        tracing::info!(user = %id, "user purged");
        Ok(())
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: user_id_at(row, 0)?,
        username: row.get(1)?,
        avatar: row.get(2)?,
        status: row.get(3)?,
        online: row.get(4)?,
        friends: BTreeSet::new(),
        blocked_users: BTreeSet::new(),
        created_at: timestamp_at(row, 5)?,
    })
}

fn load_edges(conn: &Connection, user: &mut User) -> Result<()> {
    let id = user.id.to_string();

    let mut stmt = conn.prepare("SELECT friend_id FROM friendships WHERE user_id = ?1")?;
    let friends = stmt.query_map(params![id], |row| user_id_at(row, 0))?;
    user.friends = friends.collect::<rusqlite::Result<_>>()?;

    let mut stmt = conn.prepare("SELECT blocked_id FROM blocks WHERE blocker_id = ?1")?;
    let blocked = stmt.query_map(params![id], |row| user_id_at(row, 0))?;
    user.blocked_users = blocked.collect::<rusqlite::Result<_>>()?;

    Ok(())
}
