//! v002 -- Order messages by timestamp then id.
//!
//! Replaces the `seq`-keyed conversation indexes so pages, cursors and the
//! per-conversation inbox query all walk `(created_at, id)`.

use rusqlite::Connection;

const UP_SQL: &str = r#"
DROP INDEX IF EXISTS idx_messages_direct;
DROP INDEX IF EXISTS idx_messages_group;

CREATE INDEX IF NOT EXISTS idx_messages_direct
    ON messages(sender_id, receiver_id, created_at DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_messages_group
    ON messages(group_id, created_at DESC, id DESC);
"#;

/// Apply the ordering migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
