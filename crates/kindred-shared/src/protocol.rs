//! JSON frames exchanged over the WebSocket connection.
//!
//! Frames are internally tagged (`"type"`) with kebab-case tags and
//! camelCase fields, so a serialized event looks like
//! `{"type":"accept-match","matchId":"..."}`.

use serde::{Deserialize, Serialize};

use crate::models::ChatMessage;
use crate::types::{MatchId, MessageId, PublicProfile, SessionId, UserId};

/// Events a client sends to the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Must be the first frame on a connection. The token is the JWT issued
    /// at login; its subject has to match `user_id`.
    Authenticate {
        user_id: UserId,
        token: Option<String>,
    },
    StartSearch,
    EndSearch,
    AcceptMatch {
        match_id: MatchId,
    },
    RejectMatch {
        match_id: MatchId,
    },
    SendMessage {
        session_id: SessionId,
        content: String,
    },
    Typing {
        session_id: SessionId,
    },
    StopTyping {
        session_id: SessionId,
    },
    ReadAll {
        session_id: SessionId,
    },
    JoinSession {
        session_id: SessionId,
    },
}

/// Events the server pushes to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    AuthOk {
        profile: PublicProfile,
    },
    AuthError {
        reason: String,
    },
    MatchFound {
        match_id: MatchId,
        partner: PublicProfile,
        prompt_user: bool,
    },
    MatchConfirmed {
        session_id: SessionId,
        partner: PublicProfile,
    },
    MatchRejected {
        match_id: MatchId,
    },
    MatchExpired {
        match_id: MatchId,
    },
    NewMessage {
        session_id: SessionId,
        message: ChatMessage,
    },
    Typing {
        session_id: SessionId,
        user_id: UserId,
    },
    StopTyping {
        session_id: SessionId,
        user_id: UserId,
    },
    ReadAll {
        session_id: SessionId,
        reader_id: UserId,
        up_to_message_id: Option<MessageId>,
    },
    SessionEnded {
        session_id: SessionId,
        by: UserId,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerEvent {
    /// Typing indicators are best-effort and may be shed under backpressure.
    /// Everything else must either be delivered in order or close the
    /// connection.
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::Typing { .. } | Self::StopTyping { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatPreference;

    #[test]
    fn client_event_wire_shape() {
        let ev = ClientEvent::AcceptMatch {
            match_id: MatchId::new(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "accept-match");
        assert!(json["matchId"].is_string());
    }

    #[test]
    fn client_event_round_trip() {
        let raw = r#"{"type":"send-message","sessionId":"7b0448e4-3c0c-4a0b-b16f-3ed0c1f6a1bb","content":"hi"}"#;
        let ev: ClientEvent = serde_json::from_str(raw).unwrap();
        match ev {
            ClientEvent::SendMessage { content, .. } => assert_eq!(content, "hi"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn server_event_wire_shape() {
        let ev = ServerEvent::MatchFound {
            match_id: MatchId::new(),
            partner: PublicProfile {
                id: UserId::new(),
                username: "ada".into(),
                interests: vec!["music".into()],
                chat_preference: ChatPreference::Friendship,
            },
            prompt_user: true,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "match-found");
        assert_eq!(json["promptUser"], true);
        assert_eq!(json["partner"]["username"], "ada");
    }

    #[test]
    fn only_typing_events_are_droppable() {
        let session_id = SessionId::new();
        let user_id = UserId::new();
        assert!(ServerEvent::Typing { session_id, user_id }.is_droppable());
        assert!(ServerEvent::StopTyping { session_id, user_id }.is_droppable());
        assert!(!ServerEvent::SessionEnded {
            session_id,
            by: user_id
        }
        .is_droppable());
    }
}
