//! Narrow contract to the durable store.
//!
//! The coordinator never touches SQL; everything durable goes through this
//! trait. The server crate adapts it onto the SQLite store, tests use an
//! in-memory implementation.

use std::collections::HashSet;
use std::future::Future;

use chrono::{DateTime, Utc};
use thiserror::Error;

use kindred_shared::models::{ChatMessage, ChatSession, Reaction, SessionSummary};
use kindred_shared::types::{
    ChatPreference, MessageId, PublicProfile, SessionFilter, SessionId, UserId, UserStatus,
};
use kindred_shared::ChatError;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("record not found")]
    NotFound,

    #[error("not allowed: {0}")]
    Denied(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<RepoError> for ChatError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound => ChatError::SessionNotFound,
            RepoError::Denied(_) => ChatError::NotAParticipant,
            RepoError::Storage(detail) => ChatError::Storage(detail),
        }
    }
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Everything the coordinator (and the thin HTTP handlers above it) need
/// from the durable store. Mutations spanning more than one record are
/// transactional on the implementor's side.
pub trait Repository: Send + Sync + 'static {
    // -- users ------------------------------------------------------------

    fn user_profile(
        &self,
        id: UserId,
    ) -> impl Future<Output = RepoResult<PublicProfile>> + Send;

    fn blocked_of(
        &self,
        id: UserId,
    ) -> impl Future<Output = RepoResult<HashSet<UserId>>> + Send;

    fn update_presence(
        &self,
        id: UserId,
        online: bool,
        status: UserStatus,
        last_active: DateTime<Utc>,
    ) -> impl Future<Output = RepoResult<()>> + Send;

    // -- sessions ---------------------------------------------------------

    fn create_session(
        &self,
        a: UserId,
        b: UserId,
        kind: ChatPreference,
    ) -> impl Future<Output = RepoResult<ChatSession>> + Send;

    fn get_session(&self, id: SessionId) -> impl Future<Output = RepoResult<ChatSession>> + Send;

    fn find_active_between(
        &self,
        a: UserId,
        b: UserId,
    ) -> impl Future<Output = RepoResult<Option<ChatSession>>> + Send;

    fn set_session_active(
        &self,
        id: SessionId,
        active: bool,
    ) -> impl Future<Output = RepoResult<()>> + Send;

    fn set_session_archived(
        &self,
        id: SessionId,
        archived: bool,
    ) -> impl Future<Output = RepoResult<()>> + Send;

    fn list_sessions(
        &self,
        user: UserId,
        filter: SessionFilter,
    ) -> impl Future<Output = RepoResult<Vec<SessionSummary>>> + Send;

    // -- messages ---------------------------------------------------------

    /// Insert a message (with `read_by = {sender}`) and bump the session's
    /// last-message pointer in one unit of work.
    fn insert_message(
        &self,
        session: SessionId,
        sender: UserId,
        content: String,
    ) -> impl Future<Output = RepoResult<ChatMessage>> + Send;

    /// Mark everything the reader has not sent as read; returns the read
    /// high-water mark.
    fn mark_read(
        &self,
        session: SessionId,
        reader: UserId,
    ) -> impl Future<Output = RepoResult<Option<MessageId>>> + Send;

    fn edit_message(
        &self,
        id: MessageId,
        sender: UserId,
        content: String,
    ) -> impl Future<Output = RepoResult<ChatMessage>> + Send;

    fn delete_message(
        &self,
        id: MessageId,
        sender: UserId,
    ) -> impl Future<Output = RepoResult<()>> + Send;

    fn search_messages(
        &self,
        session: SessionId,
        query: String,
        limit: u32,
    ) -> impl Future<Output = RepoResult<Vec<ChatMessage>>> + Send;

    fn paginate_messages(
        &self,
        session: SessionId,
        page: u32,
        limit: u32,
    ) -> impl Future<Output = RepoResult<Vec<ChatMessage>>> + Send;

    fn add_reaction(
        &self,
        message: MessageId,
        user: UserId,
        emoji: String,
    ) -> impl Future<Output = RepoResult<Reaction>> + Send;
}
