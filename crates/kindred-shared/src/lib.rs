pub mod error;
pub mod models;
pub mod protocol;
pub mod types;

pub use error::ChatError;
pub use types::{
    normalize_interests, ChatPreference, MatchId, MessageId, PublicProfile, SessionFilter,
    SessionId, UserId, UserStatus,
};
