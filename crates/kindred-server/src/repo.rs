//! The repository adapter: coordinator's narrow storage contract mapped
//! onto the SQLite store.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use kindred_coordinator::{RepoError, RepoResult, Repository};
use kindred_shared::models::{ChatMessage, ChatSession, Reaction, SessionSummary};
use kindred_shared::types::{
    ChatPreference, MessageId, PublicProfile, SessionFilter, SessionId, UserId, UserStatus,
};
use kindred_store::{Database, StoreError};

fn store_err(err: StoreError) -> RepoError {
    match err {
        StoreError::NotFound => RepoError::NotFound,
        StoreError::Denied(reason) => RepoError::Denied(reason),
        other => RepoError::Storage(other.to_string()),
    }
}

/// Shared handle to the SQLite database. SQLite connections are not
/// `Sync`, so all access is serialised behind one async mutex; every store
/// call is a short, purely synchronous critical section.
#[derive(Clone)]
pub struct SqliteRepository {
    db: Arc<Mutex<Database>>,
}

impl SqliteRepository {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Direct store access for the auth boundary (credential lookups never
    /// go through the coordinator).
    pub fn db(&self) -> &Arc<Mutex<Database>> {
        &self.db
    }
}

impl Repository for SqliteRepository {
    async fn user_profile(&self, id: UserId) -> RepoResult<PublicProfile> {
        let db = self.db.lock().await;
        let user = db.get_user(id).map_err(store_err)?;
        Ok(user.public_profile())
    }

    async fn blocked_of(&self, id: UserId) -> RepoResult<HashSet<UserId>> {
        let db = self.db.lock().await;
        db.blocked_by(id).map_err(store_err)
    }

    async fn update_presence(
        &self,
        id: UserId,
        online: bool,
        status: UserStatus,
        last_active: DateTime<Utc>,
    ) -> RepoResult<()> {
        let db = self.db.lock().await;
        db.update_presence(id, online, status, last_active)
            .map_err(store_err)
    }

    async fn create_session(
        &self,
        a: UserId,
        b: UserId,
        kind: ChatPreference,
    ) -> RepoResult<ChatSession> {
        let db = self.db.lock().await;
        db.create_session(a, b, kind).map_err(store_err)
    }

    async fn get_session(&self, id: SessionId) -> RepoResult<ChatSession> {
        let db = self.db.lock().await;
        db.get_session(id).map_err(store_err)
    }

    async fn find_active_between(&self, a: UserId, b: UserId) -> RepoResult<Option<ChatSession>> {
        let db = self.db.lock().await;
        db.find_active_between(a, b).map_err(store_err)
    }

    async fn set_session_active(&self, id: SessionId, active: bool) -> RepoResult<()> {
        let db = self.db.lock().await;
        db.set_session_active(id, active).map_err(store_err)
    }

    async fn set_session_archived(&self, id: SessionId, archived: bool) -> RepoResult<()> {
        let db = self.db.lock().await;
        db.set_session_archived(id, archived).map_err(store_err)
    }

    async fn list_sessions(
        &self,
        user: UserId,
        filter: SessionFilter,
    ) -> RepoResult<Vec<SessionSummary>> {
        let db = self.db.lock().await;
        db.list_sessions_for_user(user, filter).map_err(store_err)
    }

    async fn insert_message(
        &self,
        session: SessionId,
        sender: UserId,
        content: String,
    ) -> RepoResult<ChatMessage> {
        let mut db = self.db.lock().await;
        db.insert_message(session, sender, &content).map_err(store_err)
    }

    async fn mark_read(
        &self,
        session: SessionId,
        reader: UserId,
    ) -> RepoResult<Option<MessageId>> {
        let mut db = self.db.lock().await;
        db.mark_read(session, reader).map_err(store_err)
    }

    async fn edit_message(
        &self,
        id: MessageId,
        sender: UserId,
        content: String,
    ) -> RepoResult<ChatMessage> {
        let mut db = self.db.lock().await;
        db.edit_message(id, sender, &content).map_err(store_err)
    }

    async fn delete_message(&self, id: MessageId, sender: UserId) -> RepoResult<()> {
        let mut db = self.db.lock().await;
        db.delete_message(id, sender).map_err(store_err)
    }

    async fn search_messages(
        &self,
        session: SessionId,
        query: String,
        limit: u32,
    ) -> RepoResult<Vec<ChatMessage>> {
        let db = self.db.lock().await;
        db.search_messages(session, &query, limit).map_err(store_err)
    }

    async fn paginate_messages(
        &self,
        session: SessionId,
        page: u32,
        limit: u32,
    ) -> RepoResult<Vec<ChatMessage>> {
        let db = self.db.lock().await;
        db.paginate_messages(session, page, limit).map_err(store_err)
    }

    async fn add_reaction(
        &self,
        message: MessageId,
        user: UserId,
        emoji: String,
    ) -> RepoResult<Reaction> {
        let db = self.db.lock().await;
        db.add_reaction(message, user, &emoji).map_err(store_err)
    }
}
