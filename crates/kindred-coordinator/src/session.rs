//! In-memory table of active sessions and their subscribers.
//!
//! The durable record lives behind the repository; this table holds what
//! fan-out needs: participants, the subscriber set, and a per-session gate
//! that serialises persist-then-deliver so delivery order always matches
//! persisted order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;

use kindred_shared::models::ChatSession;
use kindred_shared::types::{ChatPreference, SessionId, UserId};

#[derive(Clone)]
pub struct ActiveSession {
    pub id: SessionId,
    pub users: [UserId; 2],
    pub kind: ChatPreference,
    pub subscribers: HashSet<UserId>,
    /// Critical section for the message path. Sessions are independent.
    pub gate: Arc<Mutex<()>>,
}

impl ActiveSession {
    pub fn is_participant(&self, user: UserId) -> bool {
        self.users.contains(&user)
    }

    pub fn other(&self, user: UserId) -> Option<UserId> {
        if self.users[0] == user {
            Some(self.users[1])
        } else if self.users[1] == user {
            Some(self.users[0])
        } else {
            None
        }
    }
}

#[derive(Default)]
pub struct SessionTable {
    by_id: HashMap<SessionId, ActiveSession>,
    /// Normalised pair -> active session, for the one-active-session-per-
    /// pair invariant.
    by_pair: HashMap<(UserId, UserId), SessionId>,
}

fn pair_key(a: UserId, b: UserId) -> (UserId, UserId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly created (or re-discovered) active session. Both
    /// participants start subscribed. If the pair already has a different
    /// tracked session, that one wins: the pair index never silently
    /// shadows a live session.
    pub fn insert(&mut self, session: &ChatSession) -> &ActiveSession {
        let key = pair_key(session.user_a, session.user_b);
        if let Some(existing) = self.by_pair.get(&key) {
            if *existing != session.id && self.by_id.contains_key(existing) {
                let existing = *existing;
                return self
                    .by_id
                    .get(&existing)
                    .expect("pair index points at a tracked session");
            }
        }
        let active = ActiveSession {
            id: session.id,
            users: [session.user_a, session.user_b],
            kind: session.kind,
            subscribers: [session.user_a, session.user_b].into_iter().collect(),
            gate: Arc::new(Mutex::new(())),
        };
        self.by_pair.insert(key, session.id);
        self.by_id.entry(session.id).or_insert(active)
    }

    pub fn get(&self, id: SessionId) -> Option<&ActiveSession> {
        self.by_id.get(&id)
    }

    pub fn active_between(&self, a: UserId, b: UserId) -> Option<SessionId> {
        self.by_pair.get(&pair_key(a, b)).copied()
    }

    pub fn remove(&mut self, id: SessionId) -> Option<ActiveSession> {
        let active = self.by_id.remove(&id)?;
        let key = pair_key(active.users[0], active.users[1]);
        if self.by_pair.get(&key) == Some(&id) {
            self.by_pair.remove(&key);
        }
        Some(active)
    }

    /// Add a participant's subscription (re-join after reconnect). Returns
    /// false for non-participants.
    pub fn subscribe(&mut self, id: SessionId, user: UserId) -> bool {
        match self.by_id.get_mut(&id) {
            Some(active) if active.is_participant(user) => {
                active.subscribers.insert(user);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(a: UserId, b: UserId) -> ChatSession {
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
    fn insert_subscribes_both_participants() {
        let mut table = SessionTable::new();
        let (a, b) = (UserId::new(), UserId::new());
        let session = record(a, b);
        table.insert(&session);

        let active = table.get(session.id).unwrap();
        assert!(active.subscribers.contains(&a));
        assert!(active.subscribers.contains(&b));
        assert_eq!(active.other(a), Some(b));
    }

    #[test]
    fn pair_lookup_is_order_insensitive() {
        let mut table = SessionTable::new();
        let (a, b) = (UserId::new(), UserId::new());
        let session = record(a, b);
        table.insert(&session);

        assert_eq!(table.active_between(a, b), Some(session.id));
        assert_eq!(table.active_between(b, a), Some(session.id));

        table.remove(session.id);
        assert_eq!(table.active_between(a, b), None);
    }

    #[test]
    fn pair_index_never_shadows_a_tracked_session() {
        let mut table = SessionTable::new();
        let (a, b) = (UserId::new(), UserId::new());
        let first = record(a, b);
        table.insert(&first);

        let duplicate = record(b, a);
        let kept = table.insert(&duplicate);
        assert_eq!(kept.id, first.id);
        assert!(table.get(duplicate.id).is_none());
        assert_eq!(table.active_between(a, b), Some(first.id));
    }

    #[test]
    fn subscribe_rejects_outsiders() {
        let mut table = SessionTable::new();
        let (a, b) = (UserId::new(), UserId::new());
        let session = record(a, b);
        table.insert(&session);

        assert!(table.subscribe(session.id, a));
        assert!(!table.subscribe(session.id, UserId::new()));
        assert!(!table.subscribe(SessionId::new(), a));
    }
}
