//! Friendships, friend requests and blocks.
//!
//! Friendship is mutual: it only ever changes through a transaction that
//! writes both directed rows. Creating a block severs the pair's friendship
//! and clears every request between them in the same transaction.

use chrono::{SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use palaver_shared::models::{FriendRequest, RequestStatus};
use palaver_shared::{RequestId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::rows::{enum_at, request_id_at, timestamp_at, ts, user_id_at};

/// Result of a block call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The block row was created and prior social state was severed.
    Blocked,
    /// The block already existed; nothing changed.
    AlreadyBlocked,
}

const REQUEST_COLUMNS: &str = "id, sender_id, receiver_id, status, created_at, updated_at";

impl Database {
    // ------------------------------------------------------------------
    // Friend requests
    // ------------------------------------------------------------------

    /// Create a pending request. Fails with [`StoreError::Conflict`] when a
    /// block exists in either direction, when the pair are already friends,
    /// or when a request between them is already pending.
    pub fn create_friend_request(
        &self,
        sender: &UserId,
        receiver: &UserId,
    ) -> Result<FriendRequest> {
        let now = Utc::now().trunc_subsecs(6);
        let request = FriendRequest {
            id: RequestId::new(),
            sender_id: *sender,
            receiver_id: *receiver,
            status: RequestStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        let tx = self.conn().unchecked_transaction()?;
        if blocked_between(&tx, sender, receiver)? {
            return Err(StoreError::Conflict("a block exists between the users".into()));
        }
        if friendship_exists(&tx, sender, receiver)? {
            return Err(StoreError::Conflict("already friends".into()));
        }
        tx.execute(
            "INSERT INTO friend_requests (id, sender_id, receiver_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?4)",
            params![
                request.id.to_string(),
                sender.to_string(),
                receiver.to_string(),
                ts(&now),
            ],
        )
        .map_err(|e| StoreError::classify(e, "a friend request is already pending"))?;
        tx.commit()?;

        tracing::debug!(
            request = %request.id,
            from = %sender,
            to = %receiver,
            "friend request created"
        );
        Ok(request)
    }

    pub fn get_friend_request(&self, id: &RequestId) -> Result<FriendRequest> {
        self.conn()
            .query_row(
                &format!("SELECT {REQUEST_COLUMNS} FROM friend_requests WHERE id = ?1"),
                params![id.to_string()],
                row_to_request,
            )
            .map_err(|e| StoreError::classify(e, "friend request"))
    }

    /// Accept a pending request addressed to `receiver` and insert the mutual
    /// friendship in the same transaction. A request left between a blocked
    /// pair is refused with [`StoreError::Conflict`].
    pub fn accept_friend_request(
        &self,
        id: &RequestId,
        receiver: &UserId,
    ) -> Result<FriendRequest> {
        let tx = self.conn().unchecked_transaction()?;

        let mut request = pending_request(&tx, id)?;
        if request.receiver_id != *receiver {
            return Err(StoreError::NotFound);
        }
        if blocked_between(&tx, &request.sender_id, receiver)? {
            return Err(StoreError::Conflict("a block exists between the users".into()));
        }

        let now = Utc::now().trunc_subsecs(6);
        tx.execute(
            "UPDATE friend_requests SET status = 'accepted', updated_at = ?2 WHERE id = ?1",
            params![id.to_string(), ts(&now)],
        )?;
        insert_friendship(&tx, &request.sender_id, &request.receiver_id)?;
        tx.commit()?;

        request.status = RequestStatus::Accepted;
        request.updated_at = now;
        tracing::debug!(request = %id, "friend request accepted");
        Ok(request)
    }

    /// Sender withdraws a pending request. The row is deleted.
    pub fn cancel_friend_request(&self, id: &RequestId, sender: &UserId) -> Result<FriendRequest> {
        self.remove_pending(id, |r| r.sender_id == *sender)
    }

    /// Receiver rejects a pending request. The row is deleted.
    pub fn decline_friend_request(
        &self,
        id: &RequestId,
        receiver: &UserId,
    ) -> Result<FriendRequest> {
        self.remove_pending(id, |r| r.receiver_id == *receiver)
    }

    fn remove_pending(
        &self,
        id: &RequestId,
        allowed: impl Fn(&FriendRequest) -> bool,
    ) -> Result<FriendRequest> {
        let tx = self.conn().unchecked_transaction()?;
        let request = pending_request(&tx, id)?;
        if !allowed(&request) {
            return Err(StoreError::NotFound);
        }
        tx.execute(
            "DELETE FROM friend_requests WHERE id = ?1",
            params![id.to_string()],
        )?;
        tx.commit()?;
        Ok(request)
    }

    // ------------------------------------------------------------------
    // Friendship
    // ------------------------------------------------------------------

    /// Remove the friendship both ways and every request row between the
    /// pair so either side may request again. Returns whether they were
    /// friends.
    pub fn unfriend(&self, a: &UserId, b: &UserId) -> Result<bool> {
        let tx = self.conn().unchecked_transaction()?;
        let removed = delete_friendship(&tx, a, b)?;
        delete_requests_between(&tx, a, b)?;
        tx.commit()?;
        Ok(removed > 0)
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    /// Block `blocked` on behalf of `blocker`. On a new block the friendship
    /// is removed in both directions and all requests between the pair are
    /// deleted, atomically.
    pub fn block(&self, blocker: &UserId, blocked: &UserId) -> Result<BlockOutcome> {
        let tx = self.conn().unchecked_transaction()?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO blocks (blocker_id, blocked_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![blocker.to_string(), blocked.to_string(), ts(&Utc::now())],
            )
            .map_err(|e| StoreError::classify(e, "block"))?;

        if inserted == 0 {
            return Ok(BlockOutcome::AlreadyBlocked);
        }

        let severed = delete_friendship(&tx, blocker, blocked)?;
        let requests = delete_requests_between(&tx, blocker, blocked)?;
        tx.commit()?;

        tracing::debug!(
            blocker = %blocker,
            blocked = %blocked,
            severed_friendship = severed > 0,
            requests_removed = requests,
            "block created"
        );
        Ok(BlockOutcome::Blocked)
    }

    /// Remove a block. Prior friendship is not restored.
    pub fn unblock(&self, blocker: &UserId, blocked: &UserId) -> Result<bool> {
        let removed = self.conn().execute(
            "DELETE FROM blocks WHERE blocker_id = ?1 AND blocked_id = ?2",
            params![blocker.to_string(), blocked.to_string()],
        )?;
        Ok(removed > 0)
    }
}

fn pending_request(conn: &Connection, id: &RequestId) -> Result<FriendRequest> {
    conn.query_row(
        &format!(
            "SELECT {REQUEST_COLUMNS} FROM friend_requests WHERE id = ?1 AND status = 'pending'"
        ),
        params![id.to_string()],
        row_to_request,
    )
    .map_err(|e| StoreError::classify(e, "friend request"))
}

fn friendship_exists(conn: &Connection, a: &UserId, b: &UserId) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM friendships WHERE user_id = ?1 AND friend_id = ?2",
            params![a.to_string(), b.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn blocked_between(conn: &Connection, a: &UserId, b: &UserId) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM blocks
             WHERE (blocker_id = ?1 AND blocked_id = ?2) OR (blocker_id = ?2 AND blocked_id = ?1)
             LIMIT 1",
            params![a.to_string(), b.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn insert_friendship(conn: &Connection, a: &UserId, b: &UserId) -> Result<()> {
    let now = ts(&Utc::now());
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO friendships (user_id, friend_id, created_at) VALUES (?1, ?2, ?3)",
    )?;
    stmt.execute(params![a.to_string(), b.to_string(), now])?;
    stmt.execute(params![b.to_string(), a.to_string(), now])?;
    Ok(())
}

fn delete_friendship(conn: &Connection, a: &UserId, b: &UserId) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM friendships
         WHERE (user_id = ?1 AND friend_id = ?2) OR (user_id = ?2 AND friend_id = ?1)",
        params![a.to_string(), b.to_string()],
    )?;
    Ok(n)
}

fn delete_requests_between(conn: &Connection, a: &UserId, b: &UserId) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM friend_requests
         WHERE (sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1)",
        params![a.to_string(), b.to_string()],
    )?;
    Ok(n)
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<FriendRequest> {
    Ok(FriendRequest {
        id: request_id_at(row, 0)?,
        sender_id: user_id_at(row, 1)?,
        receiver_id: user_id_at(row, 2)?,
        status: enum_at(row, 3, RequestStatus::parse)?,
        created_at: timestamp_at(row, 4)?,
        updated_at: timestamp_at(row, 5)?,
    })
}

#[cfg(test)]
mod tests {
    use palaver_shared::gate::{can_exchange, Exchange};

    use super::*;
    use crate::users::NewUser;

    fn setup() -> (Database, UserId, UserId) {
        let db = Database::open_in_memory().unwrap();
        let a = db
            .create_user(&NewUser {
                username: "alice".into(),
                ..Default::default()
            })
            .unwrap()
            .id;
        let b = db
            .create_user(&NewUser {
                username: "bob".into(),
                ..Default::default()
            })
            .unwrap()
            .id;
        (db, a, b)
    }

    fn befriend(db: &Database, a: &UserId, b: &UserId) {
        let req = db.create_friend_request(a, b).unwrap();
        db.accept_friend_request(&req.id, b).unwrap();
    }

    #[test]
    fn test_accept_creates_mutual_friendship() {
        let (db, a, b) = setup();
        let req = db.create_friend_request(&a, &b).unwrap();
        let accepted = db.accept_friend_request(&req.id, &b).unwrap();
        assert_eq!(accepted.status, RequestStatus::Accepted);

        assert!(friendship_exists(db.conn(), &a, &b).unwrap());
        assert!(friendship_exists(db.conn(), &b, &a).unwrap());
        assert!(db.get_user(&a).unwrap().is_friend(&b));
        assert_eq!(db.stats().unwrap().pending_requests, 0);
    }

    #[test]
    fn test_only_receiver_may_accept() {
        let (db, a, b) = setup();
        let req = db.create_friend_request(&a, &b).unwrap();
        assert!(matches!(
            db.accept_friend_request(&req.id, &a),
            Err(StoreError::NotFound)
        ));
        assert!(!friendship_exists(db.conn(), &a, &b).unwrap());
    }

    #[test]
    fn test_one_pending_request_per_pair() {
        let (db, a, b) = setup();
        db.create_friend_request(&a, &b).unwrap();
        assert!(matches!(
            db.create_friend_request(&b, &a),
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            db.create_friend_request(&a, &b),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn test_request_refused_while_blocked() {
        let (db, a, b) = setup();
        db.block(&b, &a).unwrap();
        assert!(matches!(
            db.create_friend_request(&a, &b),
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            db.create_friend_request(&b, &a),
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(db.stats().unwrap().pending_requests, 0);
    }

    #[test]
    fn test_request_refused_between_friends() {
        let (db, a, b) = setup();
        befriend(&db, &a, &b);
        assert!(matches!(
            db.create_friend_request(&b, &a),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn test_accept_refused_once_blocked() {
        let (db, a, b) = setup();
        let req = db.create_friend_request(&a, &b).unwrap();
        // A block row written without the severing transaction leaves the
        // request behind; accepting it must still not befriend the pair.
        db.conn()
            .execute(
                "INSERT INTO blocks (blocker_id, blocked_id, created_at) VALUES (?1, ?2, ?3)",
                params![b.to_string(), a.to_string(), ts(&Utc::now())],
            )
            .unwrap();

        assert!(matches!(
            db.accept_friend_request(&req.id, &b),
            Err(StoreError::Conflict(_))
        ));
        let ua = db.get_user(&a).unwrap();
        assert!(!ua.is_friend(&b));
        assert_eq!(
            db.get_friend_request(&req.id).unwrap().status,
            RequestStatus::Pending
        );
    }

    #[test]
    fn test_self_request_rejected() {
        let (db, a, _) = setup();
        assert!(db.create_friend_request(&a, &a).is_err());
    }

    #[test]
    fn test_cancel_and_decline_delete_the_row() {
        let (db, a, b) = setup();
        let req = db.create_friend_request(&a, &b).unwrap();
        assert!(db.cancel_friend_request(&req.id, &b).is_err());
        db.cancel_friend_request(&req.id, &a).unwrap();
        assert!(matches!(
            db.get_friend_request(&req.id),
            Err(StoreError::NotFound)
        ));

        let req = db.create_friend_request(&a, &b).unwrap();
        assert!(db.decline_friend_request(&req.id, &a).is_err());
        let declined = db.decline_friend_request(&req.id, &b).unwrap();
        assert_eq!(declined.sender_id, a);
        assert_eq!(db.stats().unwrap().pending_requests, 0);
    }

    #[test]
    fn test_unfriend_allows_new_request() {
        let (db, a, b) = setup();
        befriend(&db, &a, &b);
        assert!(db.unfriend(&b, &a).unwrap());
        assert!(!friendship_exists(db.conn(), &a, &b).unwrap());
        assert!(!db.unfriend(&a, &b).unwrap());
        db.create_friend_request(&b, &a).unwrap();
    }

    #[test]
    fn test_block_severs_friendship_and_requests() {
        let (db, a, b) = setup();
        befriend(&db, &a, &b);
        assert_eq!(db.block(&a, &b).unwrap(), BlockOutcome::Blocked);

        let ua = db.get_user(&a).unwrap();
        let ub = db.get_user(&b).unwrap();
        assert!(!ua.is_friend(&b) && !ub.is_friend(&a));
        assert!(ua.has_blocked(&b) && !ub.has_blocked(&a));
        assert_eq!(db.stats().unwrap().pending_requests, 0);

        // Both directions are restricted until the blocker unblocks.
        assert_eq!(can_exchange(&ua, &ub), Exchange::Blocked);
        assert_eq!(can_exchange(&ub, &ua), Exchange::Blocked);
    }

    #[test]
    fn test_block_clears_pending_request() {
        let (db, a, b) = setup();
        let req = db.create_friend_request(&b, &a).unwrap();
        db.block(&a, &b).unwrap();
        assert!(matches!(
            db.get_friend_request(&req.id),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_repeat_block_changes_nothing() {
        let (db, a, b) = setup();
        db.block(&a, &b).unwrap();
        // Friendship cannot form while blocked through the API, but a
        // repeated block must not touch other rows either.
        assert_eq!(db.block(&a, &b).unwrap(), BlockOutcome::AlreadyBlocked);
    }

    #[test]
    fn test_unblock_restores_nothing() {
        let (db, a, b) = setup();
        befriend(&db, &a, &b);
        db.block(&b, &a).unwrap();
        assert!(db.unblock(&b, &a).unwrap());
        assert!(!db.unblock(&b, &a).unwrap());

        let ua = db.get_user(&a).unwrap();
        let ub = db.get_user(&b).unwrap();
        assert_eq!(can_exchange(&ua, &ub), Exchange::Allowed);
        assert!(!ua.is_friend(&b));
    }
}
