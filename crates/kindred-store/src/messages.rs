use chrono::Utc;
use rusqlite::{params, Connection};

use kindred_shared::models::ChatMessage;
use kindred_shared::types::{MessageId, SessionId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{col_json, col_timestamp, col_uuid};

impl Database {
    /// Persist a message and bump the session's `last_message_id` /
    /// `updated_at` in a single transaction.
    ///
    /// `read_by` starts as `{sender}`. Content is stored as given; trimming
    /// and size limits are the coordinator's concern.
    pub fn insert_message(
        &mut self,
        session_id: SessionId,
        sender_id: UserId,
        content: &str,
    ) -> Result<ChatMessage> {
        let session = self.get_session(session_id)?;
        if !session.active {
            return Err(StoreError::Denied("session is not active".into()));
        }
        if !session.is_participant(sender_id) {
            return Err(StoreError::Denied("sender is not a participant".into()));
        }

        let message = ChatMessage {
            id: MessageId::new(),
            session_id,
            sender_id,
            content: content.to_string(),
            created_at: Utc::now(),
            edited: false,
            edited_at: None,
            read_by: vec![sender_id],
            reactions: Vec::new(),
        };

        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO messages (id, session_id, sender_id, content, created_at,
                                   edited, edited_at, read_by)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, ?6)",
            params![
                message.id.to_string(),
                message.session_id.to_string(),
                message.sender_id.to_string(),
                message.content,
                message.created_at.to_rfc3339(),
                serde_json::to_string(&message.read_by)?,
            ],
        )?;
        tx.execute(
            "UPDATE sessions SET last_message_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                session_id.to_string(),
                message.id.to_string(),
                message.created_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        Ok(message)
    }

    pub fn get_message(&self, id: MessageId) -> Result<ChatMessage> {
        let mut message = self
            .conn()
            .query_row(
                &format!("{MESSAGE_COLUMNS} WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(not_found)?;
        message.reactions = self.reactions_for_message(message.id)?;
        Ok(message)
    }

    /// Add `reader` to the `read_by` set of every message in the session it
    /// has not sent and not yet read. Returns the session's latest message
    /// id (the read high-water mark), if any.
    pub fn mark_read(&mut self, session_id: SessionId, reader: UserId) -> Result<Option<MessageId>> {
        let tx = self.conn_mut().transaction()?;

        let unread: Vec<(String, Vec<UserId>)> = {
            // A UUID string can never be a substring of a different UUID, so
            // instr() over the JSON array is a reliable membership test.
            let mut stmt = tx.prepare(
                "SELECT id, read_by FROM messages
                 WHERE session_id = ?1 AND sender_id != ?2 AND instr(read_by, ?2) = 0",
            )?;
            let rows = stmt.query_map(
                params![session_id.to_string(), reader.to_string()],
                |row| {
                    let id: String = row.get(0)?;
                    let read_by_json: String = row.get(1)?;
                    Ok((id, col_json::<Vec<UserId>>(1, &read_by_json)?))
                },
            )?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        for (id, mut read_by) in unread {
            read_by.push(reader);
            tx.execute(
                "UPDATE messages SET read_by = ?2 WHERE id = ?1",
                params![id, serde_json::to_string(&read_by)?],
            )?;
        }

        let last = last_message_id(&tx, session_id)?;
        tx.commit()?;
        Ok(last)
    }

    /// Sender-only edit. Sets the edited flag and timestamp.
    pub fn edit_message(
        &mut self,
        id: MessageId,
        sender: UserId,
        content: &str,
    ) -> Result<ChatMessage> {
        let message = self.get_message(id)?;
        if message.sender_id != sender {
            return Err(StoreError::Denied("only the sender may edit".into()));
        }
        let session = self.get_session(message.session_id)?;
        if !session.active {
            return Err(StoreError::Denied("session is not active".into()));
        }

        let edited_at = Utc::now();
        self.conn().execute(
            "UPDATE messages SET content = ?2, edited = 1, edited_at = ?3 WHERE id = ?1",
            params![id.to_string(), content, edited_at.to_rfc3339()],
        )?;

        self.get_message(id)
    }

    /// Sender-only delete.
    pub fn delete_message(&mut self, id: MessageId, sender: UserId) -> Result<()> {
        let message = self.get_message(id)?;
        if message.sender_id != sender {
            return Err(StoreError::Denied("only the sender may delete".into()));
        }

        self.conn()
            .execute("DELETE FROM messages WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    /// Case-insensitive substring search within one session, newest first.
    pub fn search_messages(
        &self,
        session_id: SessionId,
        query: &str,
        limit: u32,
    ) -> Result<Vec<ChatMessage>> {
        let escaped = query.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        let pattern = format!("%{escaped}%");
        let mut stmt = self.conn().prepare(&format!(
            "{MESSAGE_COLUMNS}
             WHERE session_id = ?1 AND content LIKE ?2 ESCAPE '\\'
             ORDER BY created_at DESC, id DESC
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![session_id.to_string(), pattern, limit],
            row_to_message,
        )?;
        self.with_reactions(rows)
    }

    /// Page through a session's messages, newest first. `page` is 1-based.
    pub fn paginate_messages(
        &self,
        session_id: SessionId,
        page: u32,
        limit: u32,
    ) -> Result<Vec<ChatMessage>> {
        let offset = page.saturating_sub(1).saturating_mul(limit);
        let mut stmt = self.conn().prepare(&format!(
            "{MESSAGE_COLUMNS}
             WHERE session_id = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(
            params![session_id.to_string(), limit, offset],
            row_to_message,
        )?;
        self.with_reactions(rows)
    }

    /// How many messages in the session the user has neither sent nor read.
    pub fn unread_count(&self, session_id: SessionId, user: UserId) -> Result<u64> {
        let count: u64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages
             WHERE session_id = ?1 AND sender_id != ?2 AND instr(read_by, ?2) = 0",
            params![session_id.to_string(), user.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn with_reactions(
        &self,
        rows: impl Iterator<Item = rusqlite::Result<ChatMessage>>,
    ) -> Result<Vec<ChatMessage>> {
        let mut messages = Vec::new();
        for row in rows {
            let mut message = row?;
            message.reactions = self.reactions_for_message(message.id)?;
            messages.push(message);
        }
        Ok(messages)
    }
}

const MESSAGE_COLUMNS: &str = "SELECT id, session_id, sender_id, content, created_at,
                                      edited, edited_at, read_by
                               FROM messages";

fn not_found(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Sqlite(other),
    }
}

fn last_message_id(conn: &Connection, session_id: SessionId) -> Result<Option<MessageId>> {
    let result = conn.query_row(
        "SELECT id FROM messages WHERE session_id = ?1
         ORDER BY created_at DESC, id LIMIT 1",
        params![session_id.to_string()],
        |row| row.get::<_, String>(0),
    );
    match result {
        Ok(id) => Ok(Some(MessageId(col_uuid(0, &id)?))),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StoreError::Sqlite(e)),
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let id_str: String = row.get(0)?;
    let session_str: String = row.get(1)?;
    let sender_str: String = row.get(2)?;
    let content: String = row.get(3)?;
    let created_str: String = row.get(4)?;
    let edited: bool = row.get(5)?;
    let edited_str: Option<String> = row.get(6)?;
    let read_by_json: String = row.get(7)?;

    let edited_at = edited_str.map(|s| col_timestamp(6, &s)).transpose()?;

    Ok(ChatMessage {
        id: MessageId(col_uuid(0, &id_str)?),
        session_id: SessionId(col_uuid(1, &session_str)?),
        sender_id: UserId(col_uuid(2, &sender_str)?),
        content,
        created_at: col_timestamp(4, &created_str)?,
        edited,
        edited_at,
        read_by: col_json(7, &read_by_json)?,
        reactions: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindred_shared::types::{ChatPreference, UserStatus};

    use crate::models::UserRecord;

    fn add_user(db: &Database, name: &str) -> UserId {
        let user = UserRecord {
            id: UserId::new(),
            username: name.to_string(),
            password_hash: "$argon2id$test".to_string(),
            interests: vec!["music".into()],
            chat_preference: ChatPreference::Friendship,
            online: false,
            status: UserStatus::Offline,
            last_active: Utc::now(),
            created_at: Utc::now(),
        };
        db.create_user(&user).unwrap();
        user.id
    }

    fn setup() -> (Database, UserId, UserId, SessionId) {
        let db = Database::open_in_memory().unwrap();
        let a = add_user(&db, "ada");
        let b = add_user(&db, "brendan");
        let session = db.create_session(a, b, ChatPreference::Friendship).unwrap();
        (db, a, b, session.id)
    }

    #[test]
    fn insert_updates_session_pointer() {
        let (mut db, a, _, session_id) = setup();

        let m1 = db.insert_message(session_id, a, "hello").unwrap();
        let session = db.get_session(session_id).unwrap();
        assert_eq!(session.last_message_id, Some(m1.id));
        assert_eq!(m1.read_by, vec![a]);
    }

    #[test]
    fn insert_rejects_non_participant() {
        let (mut db, _, _, session_id) = setup();
        let outsider = add_user(&db, "mallory");
        let err = db.insert_message(session_id, outsider, "hi").unwrap_err();
        assert!(matches!(err, StoreError::Denied(_)));
    }

    #[test]
    fn insert_rejects_inactive_session() {
        let (mut db, a, _, session_id) = setup();
        db.set_session_active(session_id, false).unwrap();
        let err = db.insert_message(session_id, a, "hi").unwrap_err();
        assert!(matches!(err, StoreError::Denied(_)));
    }

    #[test]
    fn mark_read_adds_reader_and_reports_high_water() {
        let (mut db, a, b, session_id) = setup();
        db.insert_message(session_id, a, "one").unwrap();
        let m2 = db.insert_message(session_id, a, "two").unwrap();

        assert_eq!(db.unread_count(session_id, b).unwrap(), 2);

        let up_to = db.mark_read(session_id, b).unwrap();
        assert_eq!(up_to, Some(m2.id));
        assert_eq!(db.unread_count(session_id, b).unwrap(), 0);

        let fetched = db.get_message(m2.id).unwrap();
        assert!(fetched.read_by.contains(&a));
        assert!(fetched.read_by.contains(&b));
    }

    #[test]
    fn mark_read_is_idempotent() {
        let (mut db, a, b, session_id) = setup();
        let m = db.insert_message(session_id, a, "one").unwrap();

        db.mark_read(session_id, b).unwrap();
        db.mark_read(session_id, b).unwrap();

        let fetched = db.get_message(m.id).unwrap();
        assert_eq!(fetched.read_by.len(), 2);
    }

    #[test]
    fn edit_is_sender_only() {
        let (mut db, a, b, session_id) = setup();
        let m = db.insert_message(session_id, a, "tpyo").unwrap();

        let err = db.edit_message(m.id, b, "typo").unwrap_err();
        assert!(matches!(err, StoreError::Denied(_)));

        let edited = db.edit_message(m.id, a, "typo").unwrap();
        assert_eq!(edited.content, "typo");
        assert!(edited.edited);
        assert!(edited.edited_at.is_some());
    }

    #[test]
    fn delete_is_sender_only() {
        let (mut db, a, b, session_id) = setup();
        let m = db.insert_message(session_id, a, "oops").unwrap();

        assert!(matches!(
            db.delete_message(m.id, b).unwrap_err(),
            StoreError::Denied(_)
        ));
        db.delete_message(m.id, a).unwrap();
        assert!(matches!(
            db.get_message(m.id).unwrap_err(),
            StoreError::NotFound
        ));
    }

    #[test]
    fn search_matches_substring() {
        let (mut db, a, _, session_id) = setup();
        db.insert_message(session_id, a, "let's talk about jazz").unwrap();
        db.insert_message(session_id, a, "or maybe football").unwrap();

        let hits = db.search_messages(session_id, "jazz", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("jazz"));

        // LIKE wildcards in the query must be treated literally.
        let hits = db.search_messages(session_id, "100%", 10).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn paginate_newest_first() {
        let (mut db, a, _, session_id) = setup();
        for i in 0..5 {
            db.insert_message(session_id, a, &format!("m{i}")).unwrap();
        }

        let page1 = db.paginate_messages(session_id, 1, 2).unwrap();
        assert_eq!(page1.len(), 2);
        let page3 = db.paginate_messages(session_id, 3, 2).unwrap();
        assert_eq!(page3.len(), 1);

        // Every message appears exactly once across pages.
        let mut seen = Vec::new();
        for page in 1..=3 {
            for m in db.paginate_messages(session_id, page, 2).unwrap() {
                seen.push(m.id);
            }
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 5);
    }
}
