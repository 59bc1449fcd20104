//! v001 -- Initial schema creation.
//!
//! Creates the three core tables: `users`, `sessions`, and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    username        TEXT NOT NULL UNIQUE,
    password_hash   TEXT NOT NULL,              -- Argon2id PHC string
    interests       TEXT NOT NULL,              -- JSON array of normalized tags
    chat_preference TEXT NOT NULL,              -- 'friendship' | 'dating'
    online          INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    status          TEXT NOT NULL DEFAULT 'offline',
    last_active     TEXT NOT NULL,              -- ISO-8601 / RFC-3339
    created_at      TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Sessions (two-party chats)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sessions (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    user_a          TEXT NOT NULL,              -- FK -> users(id)
    user_b          TEXT NOT NULL,              -- FK -> users(id)
    kind            TEXT NOT NULL,              -- 'friendship' | 'dating'
    active          INTEGER NOT NULL DEFAULT 1, -- boolean 0/1
    archived        INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    last_message_id TEXT,                       -- nullable FK -> messages(id)
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,

    FOREIGN KEY (user_a) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (user_b) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_sessions_user_a ON sessions(user_a);
CREATE INDEX IF NOT EXISTS idx_sessions_user_b ON sessions(user_b);

-- At most one active session per (unordered) pair.
CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_active_pair
    ON sessions (min(user_a, user_b), max(user_a, user_b))
    WHERE active = 1;

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id         TEXT PRIMARY KEY NOT NULL,       -- UUID v4
    session_id TEXT NOT NULL,                   -- FK -> sessions(id)
    sender_id  TEXT NOT NULL,                   -- FK -> users(id)
    content    TEXT NOT NULL,
    created_at TEXT NOT NULL,                   -- ISO-8601
    edited     INTEGER NOT NULL DEFAULT 0,      -- boolean 0/1
    edited_at  TEXT,
    read_by    TEXT NOT NULL,                   -- JSON array of user ids

    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_session_ts
    ON messages(session_id, created_at DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
