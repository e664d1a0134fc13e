//! v001 -- Initial schema creation.
//!
//! Creates the user directory, groups with their member table, and the
//! append-only message log.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (local view of the platform directory)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,
    role         TEXT NOT NULL,               -- admin / teacher / student
    display_name TEXT NOT NULL,
    phone        TEXT,
    avatar_url   TEXT,
    created_at   TEXT NOT NULL                -- RFC-3339, microseconds, UTC
);

CREATE INDEX IF NOT EXISTS idx_users_role ON users(role);

-- ----------------------------------------------------------------
-- Groups
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_groups (
    id         TEXT PRIMARY KEY NOT NULL,
    name       TEXT NOT NULL UNIQUE,
    admin_id   TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- One row per membership so join/leave are single-statement updates.
CREATE TABLE IF NOT EXISTS group_members (
    group_id  TEXT NOT NULL,
    user_id   TEXT NOT NULL,
    joined_at TEXT NOT NULL,

    PRIMARY KEY (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES chat_groups(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_group_members_user ON group_members(user_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,  -- append order
    id           TEXT NOT NULL UNIQUE,               -- UUID v7
    sender_id    TEXT NOT NULL,
    receiver_id  TEXT,
    group_id     TEXT,
    body         TEXT NOT NULL DEFAULT '',
    attachments  TEXT NOT NULL DEFAULT '[]',         -- JSON array
    is_read      INTEGER NOT NULL DEFAULT 0,         -- boolean 0/1
    is_broadcast INTEGER NOT NULL DEFAULT 0,         -- boolean 0/1
    created_at   TEXT NOT NULL,

    CHECK ((receiver_id IS NULL) <> (group_id IS NULL)),
    FOREIGN KEY (group_id) REFERENCES chat_groups(id)
);

CREATE INDEX IF NOT EXISTS idx_messages_direct
    ON messages(sender_id, receiver_id, created_at DESC, seq DESC);
CREATE INDEX IF NOT EXISTS idx_messages_receiver_unread
    ON messages(receiver_id, is_read);
CREATE INDEX IF NOT EXISTS idx_messages_group
    ON messages(group_id, created_at DESC, seq DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
