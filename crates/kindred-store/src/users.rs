use chrono::{DateTime, Utc};
use rusqlite::params;

use kindred_shared::types::{ChatPreference, UserId, UserStatus};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{col_parse, col_timestamp, col_uuid, UserRecord};

impl Database {
    pub fn create_user(&self, user: &UserRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, username, password_hash, interests, chat_preference,
                                online, status, last_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                user.id.to_string(),
                user.username,
                user.password_hash,
                serde_json::to_string(&user.interests)?,
                user.chat_preference.as_str(),
                user.online,
                user.status.as_str(),
                user.last_active.to_rfc3339(),
                user.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: UserId) -> Result<UserRecord> {
        self.conn()
            .query_row(
                &format!("{USER_COLUMNS} WHERE id = ?1"),
                params![id.to_string()],
                row_to_user,
            )
            .map_err(not_found)
    }

    /// Credential lookup for the auth boundary. The caller verifies the
    /// password hash; the store never sees plaintext.
    pub fn get_user_by_username(&self, username: &str) -> Result<UserRecord> {
        self.conn()
            .query_row(
                &format!("{USER_COLUMNS} WHERE username = ?1"),
                params![username],
                row_to_user,
            )
            .map_err(not_found)
    }

    pub fn update_interests(&self, id: UserId, interests: &[String]) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE users SET interests = ?2 WHERE id = ?1",
            params![id.to_string(), serde_json::to_string(interests)?],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn update_chat_preference(&self, id: UserId, preference: ChatPreference) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE users SET chat_preference = ?2 WHERE id = ?1",
            params![id.to_string(), preference.as_str()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn update_presence(
        &self,
        id: UserId,
        online: bool,
        status: UserStatus,
        last_active: DateTime<Utc>,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE users SET online = ?2, status = ?3, last_active = ?4 WHERE id = ?1",
            params![
                id.to_string(),
                online,
                status.as_str(),
                last_active.to_rfc3339(),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

const USER_COLUMNS: &str = "SELECT id, username, password_hash, interests, chat_preference,
                                   online, status, last_active, created_at
                            FROM users";

fn not_found(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Sqlite(other),
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    let id_str: String = row.get(0)?;
    let username: String = row.get(1)?;
    let password_hash: String = row.get(2)?;
    let interests_json: String = row.get(3)?;
    let preference_str: String = row.get(4)?;
    let online: bool = row.get(5)?;
    let status_str: String = row.get(6)?;
    let last_active_str: String = row.get(7)?;
    let created_str: String = row.get(8)?;

    Ok(UserRecord {
        id: UserId(col_uuid(0, &id_str)?),
        username,
        password_hash,
        interests: crate::models::col_json(3, &interests_json)?,
        chat_preference: col_parse(4, &preference_str)?,
        online,
        status: col_parse(6, &status_str)?,
        last_active: col_timestamp(7, &last_active_str)?,
        created_at: col_timestamp(8, &created_str)?,
    })
}
