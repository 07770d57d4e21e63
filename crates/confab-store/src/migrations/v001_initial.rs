//! v001 -- Initial schema creation.
//!
//! Creates the five core tables: `rooms`, `chat_groups`, `group_memberships`,
//! `messages` and `group_read_cursors`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Direct rooms: one row per unordered pair, keyed by "low_high"
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS rooms (
    room_id              TEXT PRIMARY KEY NOT NULL,
    participant_a        INTEGER NOT NULL,            -- lower user id
    participant_b        INTEGER NOT NULL,            -- higher user id
    last_message_preview TEXT,
    last_message_at      TEXT,
    unread_count_a       INTEGER NOT NULL DEFAULT 0 CHECK (unread_count_a >= 0),
    unread_count_b       INTEGER NOT NULL DEFAULT 0 CHECK (unread_count_b >= 0),
    is_deleted           INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    created_at           TEXT NOT NULL,               -- RFC-3339, microseconds, UTC
    updated_at           TEXT NOT NULL,

    CHECK (participant_a > 0 AND participant_a < participant_b),
    UNIQUE (participant_a, participant_b)
);

CREATE INDEX IF NOT EXISTS idx_rooms_participant_b ON rooms(participant_b);

-- ----------------------------------------------------------------
-- Groups
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_groups (
    group_id             TEXT PRIMARY KEY NOT NULL,
    name                 TEXT NOT NULL,
    description          TEXT,
    owner                INTEGER NOT NULL,
    last_message_preview TEXT,
    last_message_at      TEXT,
    is_deleted           INTEGER NOT NULL DEFAULT 0,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Group memberships: a rejoin reuses the (group_id, user_id) row
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS group_memberships (
    group_id  TEXT NOT NULL,
    user_id   INTEGER NOT NULL,
    role      TEXT NOT NULL CHECK (role IN ('admin', 'member')),
    joined_at TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,

    PRIMARY KEY (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES chat_groups(group_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_memberships_user
    ON group_memberships(user_id, is_active);

-- ----------------------------------------------------------------
-- Messages: AUTOINCREMENT never hands out 0 and never reuses an id,
-- even after the newest rows are purged.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    message_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_kind TEXT NOT NULL CHECK (conversation_kind IN ('direct', 'group')),
    conversation_id   TEXT NOT NULL,
    sender            INTEGER NOT NULL,
    body              TEXT NOT NULL,
    kind              TEXT NOT NULL CHECK (kind IN ('text', 'image', 'file')),
    is_read           INTEGER NOT NULL DEFAULT 0,
    is_deleted        INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL,

    CHECK (message_id > 0)
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_kind, conversation_id, created_at, message_id);

-- ----------------------------------------------------------------
-- Group read cursors
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS group_read_cursors (
    group_id             TEXT NOT NULL,
    user_id              INTEGER NOT NULL,
    last_read_message_id INTEGER NOT NULL DEFAULT 0,
    updated_at           TEXT NOT NULL,

    PRIMARY KEY (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES chat_groups(group_id) ON DELETE CASCADE
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
