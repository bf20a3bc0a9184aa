//! Per-message emoji reactions. Each participant holds at most one emoji on
//! a message: sending the same emoji again removes it, a different one
//! replaces it in place.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use palaver_shared::models::{Message, Reaction, ReactionOutcome};
use palaver_shared::{MessageId, UserId};

use crate::database::Database;
use crate::error::Result;
use crate::messages::load_message;
use crate::rows::{ts, user_id_at};

impl Database {
    /// Apply `emoji` from `user` to a message and return the outcome together
    /// with the updated message. Runs in one transaction.
    pub fn toggle_reaction(
        &self,
        message_id: &MessageId,
        user: &UserId,
        emoji: &str,
    ) -> Result<(ReactionOutcome, Message)> {
        let tx = self.conn().unchecked_transaction()?;

        // Fails with NotFound before touching reactions.
        load_message(&tx, message_id)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT emoji FROM reactions WHERE message_id = ?1 AND user_id = ?2",
                params![message_id.to_string(), user.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = ReactionOutcome::decide(existing.as_deref(), emoji);
        match outcome {
            ReactionOutcome::Added => {
                tx.execute(
                    "INSERT INTO reactions (message_id, user_id, emoji, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        message_id.to_string(),
                        user.to_string(),
                        emoji,
                        ts(&Utc::now())
                    ],
                )?;
            }
            ReactionOutcome::Replaced => {
                tx.execute(
                    "UPDATE reactions SET emoji = ?3 WHERE message_id = ?1 AND user_id = ?2",
                    params![message_id.to_string(), user.to_string(), emoji],
                )?;
            }
            ReactionOutcome::Removed => {
                tx.execute(
                    "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2",
                    params![message_id.to_string(), user.to_string()],
                )?;
            }
        }

        let message = load_message(&tx, message_id)?;
        tx.commit()?;

        tracing::trace!(msg = %message_id, user = %user, ?outcome, "reaction applied");
        Ok((outcome, message))
    }
}

pub(crate) fn reactions_for(conn: &Connection, message_id: &MessageId) -> Result<Vec<Reaction>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, emoji FROM reactions WHERE message_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![message_id.to_string()], |row| {
        Ok(Reaction {
            user_id: user_id_at(row, 0)?,
            emoji: row.get(1)?,
        })
    })?;
    let reactions = rows.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(reactions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::users::NewUser;

    fn setup() -> (Database, UserId, UserId, MessageId) {
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
        let msg = Message::new(a, b, Some("react to me".into()), None);
        db.insert_message(&msg).unwrap();
        (db, a, b, msg.id)
    }

    #[test]
    fn test_same_emoji_toggles_off() {
        let (db, _, b, id) = setup();
        let (outcome, msg) = db.toggle_reaction(&id, &b, "👍").unwrap();
        assert_eq!(outcome, ReactionOutcome::Added);
        assert_eq!(msg.reactions.len(), 1);

        let (outcome, msg) = db.toggle_reaction(&id, &b, "👍").unwrap();
        assert_eq!(outcome, ReactionOutcome::Removed);
        assert!(msg.reactions.is_empty());
    }

    #[test]
    fn test_different_emoji_replaces_in_place() {
        let (db, a, b, id) = setup();
        db.toggle_reaction(&id, &b, "👍").unwrap();
        db.toggle_reaction(&id, &a, "😂").unwrap();

        let (outcome, msg) = db.toggle_reaction(&id, &b, "❤️").unwrap();
        assert_eq!(outcome, ReactionOutcome::Replaced);
        assert_eq!(
            msg.reactions,
            vec![
                Reaction {
                    user_id: b,
                    emoji: "❤️".into()
                },
                Reaction {
                    user_id: a,
                    emoji: "😂".into()
                },
            ]
        );
        assert_eq!(db.get_message(&id).unwrap().reactions, msg.reactions);
    }

    #[test]
    fn test_unknown_message() {
        let (db, a, _, _) = setup();
        assert!(matches!(
            db.toggle_reaction(&MessageId::new(), &a, "👍"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_unsend_removes_reactions() {
        let (db, a, b, id) = setup();
        db.toggle_reaction(&id, &b, "👍").unwrap();
        db.delete_message(&id, &a).unwrap();
        assert!(reactions_for(db.conn(), &id).unwrap().is_empty());
    }
}
