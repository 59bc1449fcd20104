use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use kindred_coordinator::RepoError;
use kindred_shared::ChatError;
use kindred_store::StoreError;

/// HTTP-facing error. Everything funnels into a [`ChatError`] so the body
/// always carries a stable code alongside the human-readable message.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self(err)
    }
}

impl From<RepoError> for ApiError {
    fn from(err: RepoError) -> Self {
        Self(ChatError::from(err))
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let chat = match err {
            StoreError::NotFound => ChatError::SessionNotFound,
            StoreError::Denied(_) => ChatError::NotAParticipant,
            other => ChatError::Storage(other.to_string()),
        };
        Self(chat)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ChatError::AuthRequired => StatusCode::UNAUTHORIZED,
            ChatError::NotAParticipant => StatusCode::FORBIDDEN,
            ChatError::SessionNotFound => StatusCode::NOT_FOUND,
            ChatError::SessionNotActive => StatusCode::CONFLICT,
            ChatError::AlreadyInSession => StatusCode::CONFLICT,
            ChatError::MatchExpired => StatusCode::GONE,
            ChatError::InvalidState { .. } => StatusCode::CONFLICT,
            ChatError::InvalidContent(_) => StatusCode::BAD_REQUEST,
            ChatError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ChatError::Storage(_) | ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Never leak backend details on 5xx.
        let message = match &self.0 {
            ChatError::Storage(_) | ChatError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        };

        let body = serde_json::json!({
            "code": self.0.code(),
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
