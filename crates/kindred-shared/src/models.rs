use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChatPreference, MessageId, SessionId, UserId};

/// A two-party chat session. `active` is true from creation until the
/// session is ended; an ended session is immutable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: SessionId,
    pub user_a: UserId,
    pub user_b: UserId,
    pub kind: ChatPreference,
    pub active: bool,
    pub archived: bool,
    pub last_message_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn participants(&self) -> [UserId; 2] {
        [self.user_a, self.user_b]
    }

    pub fn is_participant(&self, user: UserId) -> bool {
        self.user_a == user || self.user_b == user
    }

    /// The other participant, if `user` is one of the two.
    pub fn other(&self, user: UserId) -> Option<UserId> {
        if self.user_a == user {
            Some(self.user_b)
        } else if self.user_b == user {
            Some(self.user_a)
        } else {
            None
        }
    }
}

/// A session plus the caller's unread message count, for listings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    #[serde(flatten)]
    pub session: ChatSession,
    pub unread: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    /// Always contains the sender.
    pub read_by: Vec<UserId>,
    pub reactions: Vec<Reaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub user_id: UserId,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(a: UserId, b: UserId) -> ChatSession {
        ChatSession {
            id: SessionId::new(),
            user_a: a,
            user_b: b,
            kind: ChatPreference::Friendship,
            active: true,
            archived: false,
            last_message_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn other_participant() {
        let (a, b) = (UserId::new(), UserId::new());
        let s = session(a, b);
        assert_eq!(s.other(a), Some(b));
        assert_eq!(s.other(b), Some(a));
        assert_eq!(s.other(UserId::new()), None);
    }

    #[test]
    fn participancy() {
        let (a, b) = (UserId::new(), UserId::new());
        let s = session(a, b);
        assert!(s.is_participant(a));
        assert!(s.is_participant(b));
        assert!(!s.is_participant(UserId::new()));
    }
}
