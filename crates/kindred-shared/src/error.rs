use thiserror::Error;

use crate::protocol::ServerEvent;
use crate::types::UserStatus;

/// User-facing error kinds. Every variant carries a stable code (for
/// clients to branch on) and a human-readable message.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChatError {
    #[error("authentication required")]
    AuthRequired,

    #[error("not a participant of this session or match")]
    NotAParticipant,

    #[error("session not found")]
    SessionNotFound,

    #[error("session is no longer active")]
    SessionNotActive,

    #[error("already in an active session")]
    AlreadyInSession,

    #[error("match has expired or was already decided")]
    MatchExpired,

    #[error("operation not valid in the current state ({current})")]
    InvalidState { current: UserStatus },

    #[error("invalid content: {0}")]
    InvalidContent(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::NotAParticipant => "NOT_A_PARTICIPANT",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionNotActive => "SESSION_NOT_ACTIVE",
            Self::AlreadyInSession => "ALREADY_IN_SESSION",
            Self::MatchExpired => "MATCH_EXPIRED",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::InvalidContent(_) => "INVALID_CONTENT",
            Self::RateLimited => "RATE_LIMITED",
            Self::Storage(_) => "STORAGE_FAILURE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// The frame pushed to a client when one of its requests fails.
    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::Error {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}
