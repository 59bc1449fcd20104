use std::collections::HashSet;

use chrono::Utc;
use rusqlite::params;

use kindred_shared::types::UserId;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::col_uuid;

impl Database {
    /// Record that `user` blocks `blocked`. Idempotent.
    pub fn block_user(&self, user: UserId, blocked: UserId) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO blocks (user_id, blocked_id, created_at)
             VALUES (?1, ?2, ?3)",
            params![
                user.to_string(),
                blocked.to_string(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn unblock_user(&self, user: UserId, blocked: UserId) -> Result<()> {
        self.conn().execute(
            "DELETE FROM blocks WHERE user_id = ?1 AND blocked_id = ?2",
            params![user.to_string(), blocked.to_string()],
        )?;
        Ok(())
    }

    /// Everyone `user` has blocked.
    pub fn blocked_by(&self, user: UserId) -> Result<HashSet<UserId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT blocked_id FROM blocks WHERE user_id = ?1")?;
        let rows = stmt.query_map(params![user.to_string()], |row| {
            let id: String = row.get(0)?;
            Ok(UserId(col_uuid(0, &id)?))
        })?;
        rows.collect::<std::result::Result<HashSet<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_unblock_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (UserId::new(), UserId::new());

        db.block_user(a, b).unwrap();
        db.block_user(a, b).unwrap(); // idempotent
        assert!(db.blocked_by(a).unwrap().contains(&b));
        assert!(db.blocked_by(b).unwrap().is_empty());

        db.unblock_user(a, b).unwrap();
        assert!(db.blocked_by(a).unwrap().is_empty());
    }
}
