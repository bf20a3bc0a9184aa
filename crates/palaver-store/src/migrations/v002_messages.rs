//! v002 -- Direct messages and reactions.
//!
//! Creates `messages` and `reactions`. Both cascade on user deletion, and
//! reactions also cascade with their message.

use rusqlite::Connection;

/// SQL executed when upgrading from version 1 to version 2.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id          TEXT PRIMARY KEY NOT NULL,         -- UUID v4
    sender_id   TEXT NOT NULL,
    receiver_id TEXT NOT NULL,
    text        TEXT,
    image       TEXT,                              -- URL
    kind        TEXT NOT NULL DEFAULT 'text' CHECK (kind IN ('text', 'image')),
    timestamp   TEXT NOT NULL,                     -- RFC-3339, fixed width
    seen        INTEGER NOT NULL DEFAULT 0,
    is_edited   INTEGER NOT NULL DEFAULT 0,

    CHECK (text IS NOT NULL OR image IS NOT NULL),
    FOREIGN KEY (sender_id)   REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (receiver_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_pair_ts
    ON messages(sender_id, receiver_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_messages_unseen
    ON messages(receiver_id, seen);

-- ----------------------------------------------------------------
-- Reactions
-- ----------------------------------------------------------------
-- One reaction per (message, reactor). The integer key keeps insertion order
-- and an in-place emoji update does not move the row.
CREATE TABLE IF NOT EXISTS reactions (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    emoji      TEXT NOT NULL,
    created_at TEXT NOT NULL,

    UNIQUE (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id)    REFERENCES users(id) ON DELETE CASCADE
);
"#;

/// Apply the messaging migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
