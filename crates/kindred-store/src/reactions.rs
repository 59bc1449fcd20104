use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use kindred_shared::models::Reaction;
use kindred_shared::types::{MessageId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{col_timestamp, col_uuid};

impl Database {
    /// Attach an emoji reaction to a message. Repeating the same reaction
    /// is a no-op (unique index on message/user/emoji).
    pub fn add_reaction(&self, message_id: MessageId, user: UserId, emoji: &str) -> Result<Reaction> {
        // Referential check up front so a missing message surfaces as
        // NotFound rather than a foreign-key violation.
        self.get_message(message_id)?;

        let reaction = Reaction {
            user_id: user,
            emoji: emoji.to_string(),
            created_at: Utc::now(),
        };

        self.conn().execute(
            "INSERT OR IGNORE INTO reactions (id, message_id, user_id, emoji, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                message_id.to_string(),
                user.to_string(),
                reaction.emoji,
                reaction.created_at.to_rfc3339(),
            ],
        )?;

        Ok(reaction)
    }

    pub fn reactions_for_message(&self, message_id: MessageId) -> Result<Vec<Reaction>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id, emoji, created_at FROM reactions
             WHERE message_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![message_id.to_string()], row_to_reaction)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

fn row_to_reaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reaction> {
    let user_str: String = row.get(0)?;
    let emoji: String = row.get(1)?;
    let created_str: String = row.get(2)?;

    Ok(Reaction {
        user_id: UserId(col_uuid(0, &user_str)?),
        emoji,
        created_at: col_timestamp(2, &created_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindred_shared::types::{ChatPreference, SessionId, UserStatus};

    use crate::models::UserRecord;

    fn setup() -> (Database, UserId, UserId, SessionId) {
        let db = Database::open_in_memory().unwrap();
        let mut ids = Vec::new();
        for name in ["ada", "brendan"] {
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
            ids.push(user.id);
        }
        let (a, b) = (ids[0], ids[1]);
        let session = db.create_session(a, b, ChatPreference::Friendship).unwrap();
        (db, a, b, session.id)
    }

    #[test]
    fn react_and_list() {
        let (mut db, a, b, session_id) = setup();
        let m = db.insert_message(session_id, a, "hello").unwrap();

        db.add_reaction(m.id, b, "👍").unwrap();
        db.add_reaction(m.id, a, "🎉").unwrap();

        let reactions = db.reactions_for_message(m.id).unwrap();
        assert_eq!(reactions.len(), 2);

        let fetched = db.get_message(m.id).unwrap();
        assert_eq!(fetched.reactions.len(), 2);
    }

    #[test]
    fn duplicate_reaction_ignored() {
        let (mut db, a, b, session_id) = setup();
        let m = db.insert_message(session_id, a, "hello").unwrap();

        db.add_reaction(m.id, b, "👍").unwrap();
        db.add_reaction(m.id, b, "👍").unwrap();

        assert_eq!(db.reactions_for_message(m.id).unwrap().len(), 1);
    }

    #[test]
    fn reaction_on_missing_message() {
        let (db, _, b, _) = setup();
        let err = db.add_reaction(MessageId::new(), b, "👍").unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }
}
