use chrono::Utc;
use rusqlite::params;

use kindred_shared::models::{ChatSession, SessionSummary};
use kindred_shared::types::{ChatPreference, MessageId, SessionFilter, SessionId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{col_parse, col_timestamp, col_uuid};

impl Database {
    /// Insert a new session record. The session manager serialises
    /// find-or-create per pair; the unique `idx_sessions_active_pair`
    /// index backstops it, so a second active session for the same pair
    /// fails with a constraint error.
    pub fn create_session(
        &self,
        user_a: UserId,
        user_b: UserId,
        kind: ChatPreference,
    ) -> Result<ChatSession> {
        let now = Utc::now();
        let session = ChatSession {
            id: SessionId::new(),
            user_a,
            user_b,
            kind,
            active: true,
            archived: false,
            last_message_id: None,
            created_at: now,
            updated_at: now,
        };

        self.conn().execute(
            "INSERT INTO sessions (id, user_a, user_b, kind, active, archived,
                                   last_message_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session.id.to_string(),
                session.user_a.to_string(),
                session.user_b.to_string(),
                session.kind.as_str(),
                session.active,
                session.archived,
                Option::<String>::None,
                session.created_at.to_rfc3339(),
                session.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(session)
    }

    pub fn get_session(&self, id: SessionId) -> Result<ChatSession> {
        self.conn()
            .query_row(
                &format!("{SESSION_COLUMNS} WHERE id = ?1"),
                params![id.to_string()],
                row_to_session,
            )
            .map_err(not_found)
    }

    pub fn find_active_between(&self, a: UserId, b: UserId) -> Result<Option<ChatSession>> {
        let result = self.conn().query_row(
            &format!(
                "{SESSION_COLUMNS}
                 WHERE active = 1
                   AND ((user_a = ?1 AND user_b = ?2) OR (user_a = ?2 AND user_b = ?1))"
            ),
            params![a.to_string(), b.to_string()],
            row_to_session,
        );
        match result {
            Ok(session) => Ok(Some(session)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Sqlite(e)),
        }
    }

    pub fn set_session_active(&self, id: SessionId, active: bool) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE sessions SET active = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), active, Utc::now().to_rfc3339()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn set_session_archived(&self, id: SessionId, archived: bool) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE sessions SET archived = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), archived, Utc::now().to_rfc3339()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// All sessions the user participates in, newest activity first, each
    /// with the user's unread count.
    pub fn list_sessions_for_user(
        &self,
        user: UserId,
        filter: SessionFilter,
    ) -> Result<Vec<SessionSummary>> {
        let filter_sql = match filter {
            SessionFilter::All => "",
            SessionFilter::Active => "AND active = 1",
            SessionFilter::Archived => "AND archived = 1",
        };
        let mut stmt = self.conn().prepare(&format!(
            "{SESSION_COLUMNS}
             WHERE (user_a = ?1 OR user_b = ?1) {filter_sql}
             ORDER BY updated_at DESC"
        ))?;
        let rows = stmt.query_map(params![user.to_string()], row_to_session)?;

        let mut summaries = Vec::new();
        for row in rows {
            let session = row?;
            let unread = self.unread_count(session.id, user)?;
            summaries.push(SessionSummary { session, unread });
        }
        Ok(summaries)
    }
}

const SESSION_COLUMNS: &str = "SELECT id, user_a, user_b, kind, active, archived,
                                      last_message_id, created_at, updated_at
                               FROM sessions";

fn not_found(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Sqlite(other),
    }
}

pub(crate) fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatSession> {
    let id_str: String = row.get(0)?;
    let a_str: String = row.get(1)?;
    let b_str: String = row.get(2)?;
    let kind_str: String = row.get(3)?;
    let active: bool = row.get(4)?;
    let archived: bool = row.get(5)?;
    let last_message_str: Option<String> = row.get(6)?;
    let created_str: String = row.get(7)?;
    let updated_str: String = row.get(8)?;

    let last_message_id = last_message_str
        .map(|s| col_uuid(6, &s).map(MessageId))
        .transpose()?;

    Ok(ChatSession {
        id: SessionId(col_uuid(0, &id_str)?),
        user_a: UserId(col_uuid(1, &a_str)?),
        user_b: UserId(col_uuid(2, &b_str)?),
        kind: col_parse(3, &kind_str)?,
        active,
        archived,
        last_message_id,
        created_at: col_timestamp(7, &created_str)?,
        updated_at: col_timestamp(8, &updated_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindred_shared::types::UserStatus;

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

    #[test]
    fn create_and_get_session() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (add_user(&db, "ada"), add_user(&db, "brendan"));

        let session = db.create_session(a, b, ChatPreference::Friendship).unwrap();
        let fetched = db.get_session(session.id).unwrap();
        assert_eq!(fetched, session);
        assert!(fetched.active);
        assert!(!fetched.archived);
    }

    #[test]
    fn find_active_between_is_order_insensitive() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (add_user(&db, "ada"), add_user(&db, "brendan"));

        assert!(db.find_active_between(a, b).unwrap().is_none());
        let session = db.create_session(a, b, ChatPreference::Dating).unwrap();

        assert_eq!(db.find_active_between(a, b).unwrap().unwrap().id, session.id);
        assert_eq!(db.find_active_between(b, a).unwrap().unwrap().id, session.id);
    }

    #[test]
    fn ended_session_no_longer_found_as_active() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (add_user(&db, "ada"), add_user(&db, "brendan"));
        let session = db.create_session(a, b, ChatPreference::Friendship).unwrap();

        db.set_session_active(session.id, false).unwrap();
        assert!(db.find_active_between(a, b).unwrap().is_none());
        assert!(!db.get_session(session.id).unwrap().active);
    }

    #[test]
    fn second_active_session_for_pair_rejected() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (add_user(&db, "ada"), add_user(&db, "brendan"));
        db.create_session(a, b, ChatPreference::Friendship).unwrap();

        // Either participant order collides with the unique active index.
        assert!(db.create_session(b, a, ChatPreference::Friendship).is_err());
        assert!(db.create_session(a, b, ChatPreference::Dating).is_err());

        // Ending the session frees the pair again.
        let session = db.find_active_between(a, b).unwrap().unwrap();
        db.set_session_active(session.id, false).unwrap();
        db.create_session(a, b, ChatPreference::Friendship).unwrap();
    }

    #[test]
    fn list_respects_filter() {
        let db = Database::open_in_memory().unwrap();
        let (a, b, c) = (
            add_user(&db, "ada"),
            add_user(&db, "brendan"),
            add_user(&db, "claude"),
        );
        let s1 = db.create_session(a, b, ChatPreference::Friendship).unwrap();
        let s2 = db.create_session(a, c, ChatPreference::Friendship).unwrap();
        db.set_session_archived(s2.id, true).unwrap();

        let all = db.list_sessions_for_user(a, SessionFilter::All).unwrap();
        assert_eq!(all.len(), 2);

        let archived = db
            .list_sessions_for_user(a, SessionFilter::Archived)
            .unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].session.id, s2.id);

        let active = db.list_sessions_for_user(b, SessionFilter::Active).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session.id, s1.id);
    }
}
