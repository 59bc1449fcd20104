use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Failure to parse one of the stable string forms below.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {what}: {value}")]
pub struct ParseEnumError {
    what: &'static str,
    value: String,
}

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

id_type!(UserId);
id_type!(SessionId);
id_type!(MatchId);
id_type!(MessageId);

/// The kind of chat a user is looking for. Two users are only ever paired
/// within the same preference.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChatPreference {
    Friendship,
    Dating,
}

impl ChatPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Friendship => "friendship",
            Self::Dating => "dating",
        }
    }
}

impl FromStr for ChatPreference {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "friendship" => Ok(Self::Friendship),
            "dating" => Ok(Self::Dating),
            other => Err(ParseEnumError {
                what: "chat preference",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ChatPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-user status. A user has exactly one status at any instant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum UserStatus {
    Offline,
    Online,
    Searching,
    Pending,
    InChat,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Online => "online",
            Self::Searching => "searching",
            Self::Pending => "pending",
            Self::InChat => "in-chat",
        }
    }

    /// Whether `from -> to` is a legal edge of the status state machine.
    ///
    /// Notably absent: `InChat -> Searching` (the session must end first)
    /// and `Offline -> Pending/InChat`.
    pub fn can_transition(from: UserStatus, to: UserStatus) -> bool {
        use UserStatus::*;
        matches!(
            (from, to),
            (Offline, Online)
                | (Online, Offline)
                | (Online, Searching)
                | (Searching, Online)
                | (Searching, Pending)
                | (Pending, Online)
                | (Pending, InChat)
                | (InChat, Online)
        )
    }
}

impl FromStr for UserStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offline" => Ok(Self::Offline),
            "online" => Ok(Self::Online),
            "searching" => Ok(Self::Searching),
            "pending" => Ok(Self::Pending),
            "in-chat" => Ok(Self::InChat),
            other => Err(ParseEnumError {
                what: "user status",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a raw interest list: lowercase, trim, drop empties, de-dup.
/// Order is irrelevant, so the result is a sorted set.
pub fn normalize_interests<I, S>(raw: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .map(|s| s.as_ref().trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// What a match partner (or any other user) is allowed to see.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicProfile {
    pub id: UserId,
    pub username: String,
    pub interests: Vec<String>,
    pub chat_preference: ChatPreference,
}

/// Filter for session listings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionFilter {
    #[default]
    All,
    Active,
    Archived,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interests_are_normalized() {
        let set = normalize_interests(["  Music ", "ART", "music", "", "   "]);
        assert_eq!(
            set.into_iter().collect::<Vec<_>>(),
            vec!["art".to_string(), "music".to_string()]
        );
    }

    #[test]
    fn legal_transitions() {
        use UserStatus::*;
        assert!(UserStatus::can_transition(Offline, Online));
        assert!(UserStatus::can_transition(Online, Searching));
        assert!(UserStatus::can_transition(Searching, Pending));
        assert!(UserStatus::can_transition(Pending, InChat));
        assert!(UserStatus::can_transition(Pending, Online));
        assert!(UserStatus::can_transition(InChat, Online));
    }

    #[test]
    fn forbidden_transitions() {
        use UserStatus::*;
        assert!(!UserStatus::can_transition(InChat, Searching));
        assert!(!UserStatus::can_transition(Offline, Pending));
        assert!(!UserStatus::can_transition(Offline, InChat));
        assert!(!UserStatus::can_transition(Searching, InChat));
    }

    #[test]
    fn status_string_round_trip() {
        for status in [
            UserStatus::Offline,
            UserStatus::Online,
            UserStatus::Searching,
            UserStatus::Pending,
            UserStatus::InChat,
        ] {
            assert_eq!(status.as_str().parse::<UserStatus>().unwrap(), status);
        }
    }
}
