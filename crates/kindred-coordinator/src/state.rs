//! Authoritative in-memory user status and search profiles.
//!
//! All writes go through [`UserStateIndex::transition`] or one of the
//! transactional compound operations, so observers always see a monotonic
//! history over the status state machine.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use kindred_shared::types::{ChatPreference, MatchId, PublicProfile, SessionId, UserId, UserStatus};
use kindred_shared::ChatError;

/// What the coordinator knows about a user beyond their status.
#[derive(Debug, Clone)]
pub struct Profile {
    pub username: String,
    pub interests: BTreeSet<String>,
    pub preference: ChatPreference,
    pub blocked: HashSet<UserId>,
}

impl Profile {
    pub fn public(&self, id: UserId) -> PublicProfile {
        PublicProfile {
            id,
            username: self.username.clone(),
            interests: self.interests.iter().cloned().collect(),
            chat_preference: self.preference,
        }
    }
}

#[derive(Debug)]
struct UserEntry {
    status: UserStatus,
    profile: Profile,
    session: Option<SessionId>,
    pending: Option<MatchId>,
    last_active: DateTime<Utc>,
}

#[derive(Default)]
pub struct UserStateIndex {
    users: HashMap<UserId, UserEntry>,
}

impl UserStateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or refresh) a user on authentication. Brings an offline
    /// user online; a user already online via another connection keeps
    /// their current status.
    pub fn upsert_online(&mut self, id: UserId, profile: Profile, now: DateTime<Utc>) -> UserStatus {
        let entry = self.users.entry(id).or_insert_with(|| UserEntry {
            status: UserStatus::Offline,
            profile: Profile {
                username: String::new(),
                interests: BTreeSet::new(),
                preference: ChatPreference::Friendship,
                blocked: HashSet::new(),
            },
            session: None,
            pending: None,
            last_active: now,
        });
        entry.profile = profile;
        entry.last_active = now;
        if entry.status == UserStatus::Offline {
            entry.status = UserStatus::Online;
            debug!(user = %id, from = %UserStatus::Offline, to = %UserStatus::Online, "status transition");
        }
        entry.status
    }

    pub fn status(&self, id: UserId) -> UserStatus {
        self.users
            .get(&id)
            .map(|e| e.status)
            .unwrap_or(UserStatus::Offline)
    }

    pub fn profile(&self, id: UserId) -> Option<&Profile> {
        self.users.get(&id).map(|e| &e.profile)
    }

    pub fn public_profile(&self, id: UserId) -> Option<PublicProfile> {
        self.users.get(&id).map(|e| e.profile.public(id))
    }

    pub fn session_of(&self, id: UserId) -> Option<SessionId> {
        self.users.get(&id).and_then(|e| e.session)
    }

    pub fn pending_of(&self, id: UserId) -> Option<MatchId> {
        self.users.get(&id).and_then(|e| e.pending)
    }

    pub fn touch(&mut self, id: UserId, now: DateTime<Utc>) {
        if let Some(entry) = self.users.get_mut(&id) {
            entry.last_active = now;
        }
    }

    pub fn last_active(&self, id: UserId) -> Option<DateTime<Utc>> {
        self.users.get(&id).map(|e| e.last_active)
    }

    pub fn set_blocked(&mut self, id: UserId, blocked: HashSet<UserId>) {
        if let Some(entry) = self.users.get_mut(&id) {
            entry.profile.blocked = blocked;
        }
    }

    pub fn update_profile(
        &mut self,
        id: UserId,
        interests: BTreeSet<String>,
        preference: ChatPreference,
    ) {
        if let Some(entry) = self.users.get_mut(&id) {
            entry.profile.interests = interests;
            entry.profile.preference = preference;
        }
    }

    /// Single-edge transition. Fails with `InvalidState` when the live
    /// status differs from `from` (a client/server race) or when the edge
    /// is not part of the state machine.
    pub fn transition(&mut self, id: UserId, from: UserStatus, to: UserStatus) -> Result<(), ChatError> {
        let current = self.status(id);
        if current != from {
            return Err(ChatError::InvalidState { current });
        }
        if !UserStatus::can_transition(from, to) {
            return Err(ChatError::InvalidState { current });
        }
        if let Some(entry) = self.users.get_mut(&id) {
            entry.status = to;
            if to != UserStatus::InChat {
                entry.session = None;
            }
        } else if to != UserStatus::Offline {
            // Transition on a user we have never seen: only Offline->Online
            // can get here, and upsert_online owns that path.
            return Err(ChatError::InvalidState { current });
        }
        debug!(user = %id, from = %from, to = %to, "status transition");
        Ok(())
    }

    pub fn set_session(&mut self, id: UserId, session: Option<SessionId>) {
        if let Some(entry) = self.users.get_mut(&id) {
            entry.session = session;
        }
    }

    /// Atomically move both users of a proposed pair from `Searching` to
    /// `Pending` and record their ballot. All-or-nothing, which keeps the
    /// one-ballot-per-user invariant without a rollback path.
    pub fn begin_pending(
        &mut self,
        a: UserId,
        b: UserId,
        match_id: MatchId,
    ) -> Result<(), ChatError> {
        for id in [a, b] {
            let current = self.status(id);
            if current != UserStatus::Searching {
                return Err(ChatError::InvalidState { current });
            }
            if self.pending_of(id).is_some() {
                return Err(ChatError::InvalidState { current });
            }
        }
        for id in [a, b] {
            let entry = self.users.get_mut(&id).expect("checked above");
            entry.status = UserStatus::Pending;
            entry.pending = Some(match_id);
            debug!(user = %id, from = %UserStatus::Searching, to = %UserStatus::Pending, "status transition");
        }
        Ok(())
    }

    /// Undo `begin_pending` after a failed handoff: both users return to
    /// `Searching` and re-enter the next matcher tick.
    pub fn abort_pending(&mut self, match_id: MatchId, users: [UserId; 2]) {
        for id in users {
            if let Some(entry) = self.users.get_mut(&id) {
                if entry.pending == Some(match_id) {
                    entry.pending = None;
                    entry.status = UserStatus::Searching;
                    debug!(user = %id, from = %UserStatus::Pending, to = %UserStatus::Searching, "handoff rolled back");
                }
            }
        }
    }

    /// Resolve a decided ballot: every user still pending on `match_id`
    /// moves to `next` (`InChat` on acceptance, `Online` otherwise) and the
    /// ballot reference is cleared.
    pub fn settle_pending(
        &mut self,
        match_id: MatchId,
        users: [UserId; 2],
        next: UserStatus,
        session: Option<SessionId>,
    ) {
        for id in users {
            let Some(entry) = self.users.get_mut(&id) else {
                continue;
            };
            if entry.pending != Some(match_id) {
                continue;
            }
            entry.pending = None;
            let from = entry.status;
            entry.status = next;
            entry.session = session;
            debug!(user = %id, from = %from, to = %next, "status transition");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> Profile {
        Profile {
            username: "ada".into(),
            interests: ["music".to_string()].into_iter().collect(),
            preference: ChatPreference::Friendship,
            blocked: HashSet::new(),
        }
    }

    #[test]
    fn authenticate_brings_user_online() {
        let mut index = UserStateIndex::new();
        let id = UserId::new();
        assert_eq!(index.status(id), UserStatus::Offline);

        let status = index.upsert_online(id, profile(), Utc::now());
        assert_eq!(status, UserStatus::Online);
    }

    #[test]
    fn second_connection_keeps_current_status() {
        let mut index = UserStateIndex::new();
        let id = UserId::new();
        index.upsert_online(id, profile(), Utc::now());
        index
            .transition(id, UserStatus::Online, UserStatus::Searching)
            .unwrap();

        let status = index.upsert_online(id, profile(), Utc::now());
        assert_eq!(status, UserStatus::Searching);
    }

    #[test]
    fn stale_transition_rejected() {
        let mut index = UserStateIndex::new();
        let id = UserId::new();
        index.upsert_online(id, profile(), Utc::now());

        let err = index
            .transition(id, UserStatus::Searching, UserStatus::Online)
            .unwrap_err();
        assert_eq!(
            err,
            ChatError::InvalidState {
                current: UserStatus::Online
            }
        );
    }

    #[test]
    fn illegal_edge_rejected() {
        let mut index = UserStateIndex::new();
        let id = UserId::new();
        index.upsert_online(id, profile(), Utc::now());

        // Online -> InChat is not an edge; only a ballot decision creates it.
        let err = index
            .transition(id, UserStatus::Online, UserStatus::InChat)
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidState { .. }));
    }

    #[test]
    fn begin_pending_is_all_or_nothing() {
        let mut index = UserStateIndex::new();
        let (a, b) = (UserId::new(), UserId::new());
        index.upsert_online(a, profile(), Utc::now());
        index.upsert_online(b, profile(), Utc::now());
        index
            .transition(a, UserStatus::Online, UserStatus::Searching)
            .unwrap();
        // b is Online, not Searching, so the handoff must fail...
        let err = index.begin_pending(a, b, MatchId::new()).unwrap_err();
        assert!(matches!(err, ChatError::InvalidState { .. }));
        // ...and a must be untouched.
        assert_eq!(index.status(a), UserStatus::Searching);
        assert_eq!(index.pending_of(a), None);
    }

    #[test]
    fn begin_and_settle_pending() {
        let mut index = UserStateIndex::new();
        let (a, b) = (UserId::new(), UserId::new());
        for id in [a, b] {
            index.upsert_online(id, profile(), Utc::now());
            index
                .transition(id, UserStatus::Online, UserStatus::Searching)
                .unwrap();
        }

        let match_id = MatchId::new();
        index.begin_pending(a, b, match_id).unwrap();
        assert_eq!(index.status(a), UserStatus::Pending);
        assert_eq!(index.pending_of(b), Some(match_id));

        // A user in one ballot may not enter another.
        let err = index.begin_pending(a, b, MatchId::new()).unwrap_err();
        assert!(matches!(err, ChatError::InvalidState { .. }));

        let session = SessionId::new();
        index.settle_pending(match_id, [a, b], UserStatus::InChat, Some(session));
        assert_eq!(index.status(a), UserStatus::InChat);
        assert_eq!(index.session_of(a), Some(session));
        assert_eq!(index.pending_of(a), None);
    }

    #[test]
    fn abort_pending_restores_searching() {
        let mut index = UserStateIndex::new();
        let (a, b) = (UserId::new(), UserId::new());
        for id in [a, b] {
            index.upsert_online(id, profile(), Utc::now());
            index
                .transition(id, UserStatus::Online, UserStatus::Searching)
                .unwrap();
        }
        let match_id = MatchId::new();
        index.begin_pending(a, b, match_id).unwrap();

        index.abort_pending(match_id, [a, b]);
        assert_eq!(index.status(a), UserStatus::Searching);
        assert_eq!(index.status(b), UserStatus::Searching);
        assert_eq!(index.pending_of(a), None);
    }
}
