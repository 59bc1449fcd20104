use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Message reactions
CREATE TABLE IF NOT EXISTS reactions (
    id         TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    message_id TEXT NOT NULL,               -- FK -> messages(id)
    user_id    TEXT NOT NULL,               -- FK -> users(id)
    emoji      TEXT NOT NULL,               -- emoji character(s)
    created_at TEXT NOT NULL,               -- ISO-8601

    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_reactions_message ON reactions(message_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_reactions_unique ON reactions(message_id, user_id, emoji);

-- User block list
CREATE TABLE IF NOT EXISTS blocks (
    user_id    TEXT NOT NULL,               -- the blocker
    blocked_id TEXT NOT NULL,               -- the blocked user
    created_at TEXT NOT NULL,

    PRIMARY KEY (user_id, blocked_id)
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
