//! Direct messages: insert, history, edit, unsend, seen receipts and chat
//! clear.

use std::collections::HashMap;

use rusqlite::{params, Connection};

use palaver_shared::models::{Message, MessageKind, Reaction};
use palaver_shared::{MessageId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::rows::{enum_at, message_id_at, timestamp_at, ts, user_id_at};

const MESSAGE_COLUMNS: &str =
    "id, sender_id, receiver_id, text, image, kind, timestamp, seen, is_edited";

impl Database {
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO messages (id, sender_id, receiver_id, text, image, kind, timestamp, seen, is_edited)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    message.id.to_string(),
                    message.sender_id.to_string(),
                    message.receiver_id.to_string(),
                    message.text,
                    message.image,
                    message.kind.as_str(),
                    ts(&message.timestamp),
                    message.seen,
                    message.is_edited,
                ],
            )
            .map_err(|e| StoreError::classify(e, "message"))?;
        Ok(())
    }

    /// Fetch a message with its reactions.
    pub fn get_message(&self, id: &MessageId) -> Result<Message> {
        load_message(self.conn(), id)
    }

    /// The most recent `limit` messages between `a` and `b`, oldest first.
    pub fn conversation(&self, a: &UserId, b: &UserId, limit: u32) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM (
                SELECT *, rowid AS seq FROM messages
                WHERE (sender_id = ?1 AND receiver_id = ?2)
                   OR (sender_id = ?2 AND receiver_id = ?1)
                ORDER BY timestamp DESC, seq DESC
                LIMIT ?3
             )
             ORDER BY timestamp ASC, seq ASC"
        ))?;
        let rows = stmt.query_map(params![a.to_string(), b.to_string(), limit], row_to_message)?;
        let mut messages = rows.collect::<rusqlite::Result<Vec<_>>>()?;

        let mut reactions = reactions_between(self.conn(), a, b)?;
        for message in &mut messages {
            if let Some(list) = reactions.remove(&message.id) {
                message.reactions = list;
            }
        }
        Ok(messages)
    }

    /// Replace the text of a message owned by `sender` and mark it edited.
    pub fn edit_message(&self, id: &MessageId, sender: &UserId, text: &str) -> Result<Message> {
        let affected = self.conn().execute(
            "UPDATE messages SET text = ?3, is_edited = 1 WHERE id = ?1 AND sender_id = ?2",
            params![id.to_string(), sender.to_string(), text],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        self.get_message(id)
    }

    /// Hard-delete a message owned by `sender`, returning what was removed.
    /// Reactions go with it.
    pub fn delete_message(&self, id: &MessageId, sender: &UserId) -> Result<Message> {
        let tx = self.conn().unchecked_transaction()?;
        let message = load_message(&tx, id)?;
        if message.sender_id != *sender {
            return Err(StoreError::NotFound);
        }
        tx.execute("DELETE FROM messages WHERE id = ?1", params![id.to_string()])?;
        tx.commit()?;
        Ok(message)
    }

    /// Mark every unseen message from `other` to `reader` as seen. Returns
    /// how many rows changed; zero on a repeat call.
    pub fn mark_seen(&self, reader: &UserId, other: &UserId) -> Result<usize> {
        let n = self.conn().execute(
            "UPDATE messages SET seen = 1
             WHERE sender_id = ?1 AND receiver_id = ?2 AND seen = 0",
            params![other.to_string(), reader.to_string()],
        )?;
        Ok(n)
    }

    /// Delete both directions of a conversation.
    pub fn clear_conversation(&self, a: &UserId, b: &UserId) -> Result<usize> {
        let n = self.conn().execute(
            "DELETE FROM messages
             WHERE (sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1)",
            params![a.to_string(), b.to_string()],
        )?;
        tracing::debug!(a = %a, b = %b, deleted = n, "conversation cleared");
        Ok(n)
    }
}

pub(crate) fn load_message(conn: &Connection, id: &MessageId) -> Result<Message> {
    let mut message = conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            params![id.to_string()],
            row_to_message,
        )
        .map_err(|e| StoreError::classify(e, "message"))?;
    message.reactions = crate::reactions::reactions_for(conn, id)?;
    Ok(message)
}

fn reactions_between(
    conn: &Connection,
    a: &UserId,
    b: &UserId,
) -> Result<HashMap<MessageId, Vec<Reaction>>> {
    let mut stmt = conn.prepare(
        "SELECT r.message_id, r.user_id, r.emoji
         FROM reactions r JOIN messages m ON m.id = r.message_id
         WHERE (m.sender_id = ?1 AND m.receiver_id = ?2)
            OR (m.sender_id = ?2 AND m.receiver_id = ?1)
         ORDER BY r.id ASC",
    )?;
    let rows = stmt.query_map(params![a.to_string(), b.to_string()], |row| {
        Ok((
            message_id_at(row, 0)?,
            Reaction {
                user_id: user_id_at(row, 1)?,
                emoji: row.get(2)?,
            },
        ))
    })?;

    let mut map: HashMap<MessageId, Vec<Reaction>> = HashMap::new();
    for row in rows {
        let (message_id, reaction) = row?;
        map.entry(message_id).or_default().push(reaction);
    }
    Ok(map)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: message_id_at(row, 0)?,
        sender_id: user_id_at(row, 1)?,
        receiver_id: user_id_at(row, 2)?,
        text: row.get(3)?,
        image: row.get(4)?,
        kind: enum_at(row, 5, MessageKind::parse)?,
        timestamp: timestamp_at(row, 6)?,
        seen: row.get(7)?,
        is_edited: row.get(8)?,
        reactions: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::NewUser;

    fn setup() -> (Database, UserId, UserId) {
        let db = Database::open_in_memory().unwrap();
        let mut ids = ["alice", "bob"].into_iter().map(|name| {
            db.create_user(&NewUser {
                username: name.into(),
                ..Default::default()
            })
            .unwrap()
            .id
        });
        let a = ids.next().unwrap();
        let b = ids.next().unwrap();
        drop(ids);
        (db, a, b)
    }

    fn send(db: &Database, from: UserId, to: UserId, text: &str) -> Message {
        let msg = Message::new(from, to, Some(text.into()), None);
        db.insert_message(&msg).unwrap();
        msg
    }

    #[test]
    fn test_insert_and_get() {
        let (db, a, b) = setup();
        let msg = send(&db, a, b, "hi");
        let loaded = db.get_message(&msg.id).unwrap();
        assert_eq!(loaded, msg);
        assert!(!loaded.seen);
    }

    #[test]
    fn test_message_needs_text_or_image() {
        let (db, a, b) = setup();
        let msg = Message::new(a, b, None, None);
        assert!(db.insert_message(&msg).is_err());
    }

    #[test]
    fn test_conversation_is_oldest_first_and_limited() {
        let (db, a, b) = setup();
        let first = send(&db, a, b, "one");
        let second = send(&db, b, a, "two");
        let third = send(&db, a, b, "three");

        let all = db.conversation(&b, &a, 10).unwrap();
        let ids: Vec<_> = all.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first.id, second.id, third.id]);

        let recent = db.conversation(&a, &b, 2).unwrap();
        let ids: Vec<_> = recent.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![second.id, third.id]);
    }

    #[test]
    fn test_edit_only_by_sender() {
        let (db, a, b) = setup();
        let msg = send(&db, a, b, "hi");

        assert!(matches!(
            db.edit_message(&msg.id, &b, "hijacked"),
            Err(StoreError::NotFound)
        ));
        assert_eq!(db.get_message(&msg.id).unwrap().text.as_deref(), Some("hi"));

        let edited = db.edit_message(&msg.id, &a, "hello").unwrap();
        assert_eq!(edited.text.as_deref(), Some("hello"));
        assert!(edited.is_edited);
    }

    #[test]
    fn test_delete_only_by_sender() {
        let (db, a, b) = setup();
        let msg = send(&db, a, b, "oops");
        assert!(db.delete_message(&msg.id, &b).is_err());
        let deleted = db.delete_message(&msg.id, &a).unwrap();
        assert_eq!(deleted.id, msg.id);
        assert!(matches!(db.get_message(&msg.id), Err(StoreError::NotFound)));
    }

    fn unread(db: &Database, reader: &UserId, from: &UserId) -> u32 {
        db.directory_for(reader)
            .unwrap()
            .into_iter()
            .find(|e| e.id == *from)
            .map(|e| e.unread_count)
            .unwrap()
    }

    #[test]
    fn test_mark_seen_is_idempotent() {
        let (db, a, b) = setup();
        send(&db, a, b, "1");
        send(&db, a, b, "2");
        send(&db, b, a, "mine");

        assert_eq!(unread(&db, &b, &a), 2);
        assert_eq!(db.mark_seen(&b, &a).unwrap(), 2);
        assert_eq!(db.mark_seen(&b, &a).unwrap(), 0);
        assert_eq!(unread(&db, &b, &a), 0);
        // The reader's own outgoing message is untouched.
        assert_eq!(unread(&db, &a, &b), 1);
    }

    #[test]
    fn test_clear_conversation_removes_both_directions() {
        let (db, a, b) = setup();
        send(&db, a, b, "1");
        send(&db, b, a, "2");
        assert_eq!(db.clear_conversation(&b, &a).unwrap(), 2);
        assert!(db.conversation(&a, &b, 10).unwrap().is_empty());
    }
}
