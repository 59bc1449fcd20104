//! Matchmaking & session coordination for the Kindred chat service.
//!
//! A single [`Coordinator`] owns every in-memory index: who is online, who
//! is searching, open ballots, active sessions and their subscribers. It is
//! constructed with an injected clock and repository, started with
//! [`Coordinator::start`] and torn down with [`Coordinator::stop`]; tests
//! build one coordinator per scenario.
//!
//! Locking: each index sits behind its own mutex. When an operation needs
//! more than one, locks are taken in the order user state -> search pool ->
//! pending matches -> sessions -> connections, and never held across
//! repository calls except the per-session message gate and the session
//! creation lock (which serialises check-then-insert for a pair).

pub mod clock;
pub mod config;
pub mod matcher;
pub mod pending;
pub mod pool;
pub mod registry;
pub mod repo;
pub mod session;
pub mod state;

pub use clock::{Clock, SystemClock};
pub use config::CoordinatorConfig;
pub use registry::{ConnId, SendQueue};
pub use repo::{RepoError, RepoResult, Repository};
pub use state::Profile;

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use kindred_shared::models::{ChatMessage, ChatSession, Reaction, SessionSummary};
use kindred_shared::protocol::ServerEvent;
use kindred_shared::types::{
    normalize_interests, ChatPreference, MatchId, MessageId, PublicProfile, SessionFilter,
    SessionId, UserId, UserStatus,
};
use kindred_shared::ChatError;

use crate::clock::TimerGuard;
use crate::pending::{Ballot, BallotOutcome, DecidedBallot, PendingMatchTable, VoteResult};
use crate::pool::SearchPool;
use crate::registry::ConnectionRegistry;
use crate::session::SessionTable;
use crate::state::UserStateIndex;

pub struct Coordinator<R: Repository> {
    inner: Arc<Inner<R>>,
    matcher_task: StdMutex<Option<JoinHandle<()>>>,
}

struct Inner<R> {
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
    repo: R,
    registry: ConnectionRegistry,
    users: Mutex<UserStateIndex>,
    pool: Mutex<SearchPool>,
    pending: Mutex<PendingMatchTable>,
    sessions: Mutex<SessionTable>,
    /// Serialises find-or-create of a pair's durable session record. Held
    /// across the repository round-trip; without it two concurrent creates
    /// could both miss and insert, breaking the one-active-session-per-pair
    /// invariant.
    session_open: Mutex<()>,
    /// Wakes the matcher for an immediate tick on `start-search`.
    kick: Notify,
}

impl<R: Repository> Coordinator<R> {
    pub fn new(config: CoordinatorConfig, repo: R) -> Self {
        Self::with_clock(config, repo, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CoordinatorConfig, repo: R, clock: Arc<dyn Clock>) -> Self {
        let registry = ConnectionRegistry::new(config.send_queue);
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                repo,
                registry,
                users: Mutex::new(UserStateIndex::new()),
                pool: Mutex::new(SearchPool::new()),
                pending: Mutex::new(PendingMatchTable::new()),
                sessions: Mutex::new(SessionTable::new()),
                session_open: Mutex::new(()),
                kick: Notify::new(),
            }),
            matcher_task: StdMutex::new(None),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Spawn the matcher loop. Idempotent.
    pub fn start(&self) {
        let mut guard = self.matcher_task.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.config.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first interval tick completes immediately; skip it so the
            // cadence starts one period from now.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = inner.kick.notified() => {}
                }
                Inner::run_matcher_tick(&inner).await;
            }
        });
        *guard = Some(handle);
        info!("coordinator started");
    }

    /// Stop the matcher. Ballot timers die with their ballots; pending
    /// state stays intact so `start` can resume.
    pub fn stop(&self) {
        if let Some(handle) = self.matcher_task.lock().unwrap().take() {
            handle.abort();
            info!("coordinator stopped");
        }
    }

    // -- connections ------------------------------------------------------

    pub fn attach(&self) -> (ConnId, Arc<SendQueue>) {
        self.inner.registry.attach()
    }

    pub fn user_of(&self, conn: ConnId) -> Option<UserId> {
        self.inner.registry.user_of(conn)
    }

    /// Deliver an event to one specific connection (the websocket layer
    /// uses this for request-scoped error frames).
    pub fn push_to(&self, conn: ConnId, event: ServerEvent) {
        self.inner.registry.push_to(conn, event);
    }

    /// Bind an authenticated identity to a connection, bring the user
    /// online and confirm with `auth-ok`.
    pub async fn authenticate(
        &self,
        conn: ConnId,
        user: UserId,
    ) -> Result<PublicProfile, ChatError> {
        let inner = &self.inner;
        if !inner.registry.bind(conn, user) {
            return Err(ChatError::Internal("unknown connection".into()));
        }

        let profile = inner.repo.user_profile(user).await.map_err(|e| match e {
            RepoError::NotFound => ChatError::AuthRequired,
            other => other.into(),
        })?;
        let blocked = match inner.repo.blocked_of(user).await {
            Ok(blocked) => blocked,
            Err(e) => {
                warn!(error = %e, user = %user, "block list load failed");
                HashSet::new()
            }
        };

        let status = {
            let mut users = inner.users.lock().await;
            users.upsert_online(
                user,
                Profile {
                    username: profile.username.clone(),
                    interests: normalize_interests(&profile.interests),
                    preference: profile.chat_preference,
                    blocked,
                },
                inner.clock.wall(),
            )
        };
        inner.persist_presence(user, true, status).await;
        inner.registry.push_to(
            conn,
            ServerEvent::AuthOk {
                profile: profile.clone(),
            },
        );
        info!(user = %user, conn = %conn, "authenticated");
        Ok(profile)
    }

    /// Connection closed. Cancels the user's search, implicitly rejects an
    /// open ballot and ends an active session -- but only when this was the
    /// user's last connection.
    pub async fn disconnect(&self, conn: ConnId) {
        let Some((user, last)) = self.inner.registry.detach(conn) else {
            return;
        };
        if !last {
            return;
        }
        self.inner.handle_last_disconnect(user).await;
    }

    // -- search -----------------------------------------------------------

    pub async fn start_search(&self, user: UserId) -> Result<(), ChatError> {
        self.inner.start_search(user).await
    }

    pub async fn end_search(&self, user: UserId) -> Result<(), ChatError> {
        self.inner.end_search(user).await
    }

    // -- ballots ----------------------------------------------------------

    pub async fn accept_match(&self, user: UserId, match_id: MatchId) -> Result<(), ChatError> {
        self.inner.handle_vote(user, match_id, true).await
    }

    pub async fn reject_match(&self, user: UserId, match_id: MatchId) -> Result<(), ChatError> {
        self.inner.handle_vote(user, match_id, false).await
    }

    // -- sessions & messages ----------------------------------------------

    pub async fn send_message(
        &self,
        sender: UserId,
        session_id: SessionId,
        content: &str,
    ) -> Result<ChatMessage, ChatError> {
        self.inner.send_message(sender, session_id, content).await
    }

    pub async fn typing(&self, user: UserId, session_id: SessionId) -> Result<(), ChatError> {
        self.inner.typing(user, session_id, false).await
    }

    pub async fn stop_typing(&self, user: UserId, session_id: SessionId) -> Result<(), ChatError> {
        self.inner.typing(user, session_id, true).await
    }

    pub async fn read_all(&self, reader: UserId, session_id: SessionId) -> Result<(), ChatError> {
        self.inner.read_all(reader, session_id).await
    }

    pub async fn join_session(&self, user: UserId, session_id: SessionId) -> Result<(), ChatError> {
        self.inner.join_session(user, session_id).await
    }

    pub async fn end_session(&self, actor: UserId, session_id: SessionId) -> Result<(), ChatError> {
        self.inner.end_session(actor, session_id).await
    }

    pub async fn archive_session(
        &self,
        actor: UserId,
        session_id: SessionId,
        archived: bool,
    ) -> Result<(), ChatError> {
        let record = self.inner.repo.get_session(session_id).await?;
        if !record.is_participant(actor) {
            return Err(ChatError::NotAParticipant);
        }
        self.inner
            .repo
            .set_session_archived(session_id, archived)
            .await?;
        Ok(())
    }

    pub async fn get_session(
        &self,
        actor: UserId,
        session_id: SessionId,
    ) -> Result<ChatSession, ChatError> {
        let record = self.inner.repo.get_session(session_id).await?;
        if !record.is_participant(actor) {
            return Err(ChatError::NotAParticipant);
        }
        Ok(record)
    }

    pub async fn list_sessions(
        &self,
        user: UserId,
        filter: SessionFilter,
    ) -> Result<Vec<SessionSummary>, ChatError> {
        Ok(self.inner.repo.list_sessions(user, filter).await?)
    }

    /// Explicit session creation, entirely separate from match proposal:
    /// no user status changes here. At most one active session per pair; a
    /// second create returns the existing one.
    pub async fn create_session(
        &self,
        actor: UserId,
        partner: UserId,
        kind: ChatPreference,
    ) -> Result<ChatSession, ChatError> {
        if actor == partner {
            return Err(ChatError::InvalidContent(
                "cannot open a session with yourself".into(),
            ));
        }
        let session = self.inner.open_session(actor, partner, kind).await?;
        self.inner.sessions.lock().await.insert(&session);
        info!(session = %session.id, a = %actor, b = %partner, "session opened explicitly");
        Ok(session)
    }

    pub async fn paginate_messages(
        &self,
        actor: UserId,
        session_id: SessionId,
        page: u32,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let record = self.inner.repo.get_session(session_id).await?;
        if !record.is_participant(actor) {
            return Err(ChatError::NotAParticipant);
        }
        let limit = limit.clamp(1, self.inner.config.page_size_max);
        let page = page.max(1);
        Ok(self
            .inner
            .repo
            .paginate_messages(session_id, page, limit)
            .await?)
    }

    pub async fn search_messages(
        &self,
        actor: UserId,
        session_id: SessionId,
        query: &str,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let record = self.inner.repo.get_session(session_id).await?;
        if !record.is_participant(actor) {
            return Err(ChatError::NotAParticipant);
        }
        let limit = limit.clamp(1, self.inner.config.page_size_max);
        Ok(self
            .inner
            .repo
            .search_messages(session_id, query.to_string(), limit)
            .await?)
    }

    pub async fn edit_message(
        &self,
        actor: UserId,
        message_id: MessageId,
        content: &str,
    ) -> Result<ChatMessage, ChatError> {
        let content = self.inner.validate_content(content)?;
        Ok(self
            .inner
            .repo
            .edit_message(message_id, actor, content)
            .await?)
    }

    pub async fn delete_message(
        &self,
        actor: UserId,
        message_id: MessageId,
    ) -> Result<(), ChatError> {
        Ok(self.inner.repo.delete_message(message_id, actor).await?)
    }

    pub async fn add_reaction(
        &self,
        actor: UserId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<Reaction, ChatError> {
        let emoji = emoji.trim();
        if emoji.is_empty() || emoji.len() > 32 {
            return Err(ChatError::InvalidContent("invalid emoji".into()));
        }
        Ok(self
            .inner
            .repo
            .add_reaction(message_id, actor, emoji.to_string())
            .await?)
    }

    // -- profile write-through --------------------------------------------

    /// Keep the in-memory block list in step with a durable block/unblock.
    pub async fn set_blocked(&self, user: UserId, blocked: HashSet<UserId>) {
        self.inner.users.lock().await.set_blocked(user, blocked.clone());
        let mut pool = self.inner.pool.lock().await;
        if let Some(mut entry) = pool.remove(user) {
            entry.blocked = blocked;
            pool.restore(entry);
        }
    }

    /// Keep in-memory interests/preference in step with a profile update.
    pub async fn update_profile(
        &self,
        user: UserId,
        interests: BTreeSet<String>,
        preference: ChatPreference,
    ) {
        self.inner
            .users
            .lock()
            .await
            .update_profile(user, interests.clone(), preference);
        let mut pool = self.inner.pool.lock().await;
        if let Some(mut entry) = pool.remove(user) {
            entry.interests = interests;
            entry.preference = preference;
            pool.restore(entry);
        }
    }

    // -- observability (tests, admin) -------------------------------------

    pub async fn status_of(&self, user: UserId) -> UserStatus {
        self.inner.users.lock().await.status(user)
    }

    pub async fn is_searching(&self, user: UserId) -> bool {
        self.inner.pool.lock().await.contains(user)
    }

    pub async fn open_ballots(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    pub async fn active_sessions(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }
}

impl<R: Repository> Drop for Coordinator<R> {
    fn drop(&mut self) {
        if let Some(handle) = self.matcher_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl<R: Repository> Inner<R> {
    async fn persist_presence(&self, user: UserId, online: bool, status: UserStatus) {
        let wall = self.clock.wall();
        if let Err(e) = self.repo.update_presence(user, online, status, wall).await {
            warn!(error = %e, user = %user, "presence write failed");
        }
    }

    fn validate_content(&self, content: &str) -> Result<String, ChatError> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(ChatError::InvalidContent("message is empty".into()));
        }
        if trimmed.len() > self.config.max_content_bytes {
            return Err(ChatError::InvalidContent(format!(
                "message exceeds {} bytes",
                self.config.max_content_bytes
            )));
        }
        Ok(trimmed.to_string())
    }

    // -- search -----------------------------------------------------------

    async fn start_search(&self, user: UserId) -> Result<(), ChatError> {
        let wall = self.clock.wall();
        let profile = {
            let mut users = self.users.lock().await;
            match users.status(user) {
                UserStatus::Offline => return Err(ChatError::AuthRequired),
                UserStatus::InChat => return Err(ChatError::AlreadyInSession),
                UserStatus::Searching => return Ok(()),
                current @ UserStatus::Pending => {
                    return Err(ChatError::InvalidState { current })
                }
                UserStatus::Online => {}
            }
            users.transition(user, UserStatus::Online, UserStatus::Searching)?;
            users.touch(user, wall);
            users.profile(user).expect("entry exists when online").clone()
        };

        self.pool.lock().await.add(
            user,
            profile.interests,
            profile.preference,
            profile.blocked,
            self.clock.now(),
        );

        if let Err(e) = self
            .repo
            .update_presence(user, true, UserStatus::Searching, wall)
            .await
        {
            warn!(error = %e, user = %user, "presence write failed, rolling back search");
            self.pool.lock().await.remove(user);
            let mut users = self.users.lock().await;
            let _ = users.transition(user, UserStatus::Searching, UserStatus::Online);
            return Err(e.into());
        }

        debug!(user = %user, "searching");
        self.kick.notify_one();
        Ok(())
    }

    async fn end_search(&self, user: UserId) -> Result<(), ChatError> {
        {
            let mut users = self.users.lock().await;
            match users.status(user) {
                // Nothing to cancel: treat as success so a racing
                // end-search after a match proposal is not an error.
                UserStatus::Online => return Ok(()),
                UserStatus::Searching => {
                    users.transition(user, UserStatus::Searching, UserStatus::Online)?;
                }
                current => return Err(ChatError::InvalidState { current }),
            }
        }
        self.pool.lock().await.remove(user);
        self.persist_presence(user, true, UserStatus::Online).await;
        debug!(user = %user, "search cancelled");
        Ok(())
    }

    // -- matcher ----------------------------------------------------------

    async fn run_matcher_tick(inner: &Arc<Self>) {
        let pairs = {
            let pool = inner.pool.lock().await;
            matcher::plan_pairs(&pool)
        };
        if pairs.is_empty() {
            return;
        }
        debug!(pairs = pairs.len(), "matcher tick");
        for (a, b) in pairs {
            if let Err(e) = Inner::propose_match(inner, a, b).await {
                // The tick never aborts; both users simply re-enter the
                // next tick.
                debug!(error = %e, user_a = %a, user_b = %b, "match handoff failed");
            }
        }
    }

    async fn propose_match(inner: &Arc<Self>, a: UserId, b: UserId) -> Result<(), ChatError> {
        let match_id = MatchId::new();

        // Searching -> Pending for both users, all-or-nothing; this is the
        // atomic step that guarantees one ballot per user.
        let (profile_a, profile_b) = {
            let mut users = inner.users.lock().await;
            users.begin_pending(a, b, match_id)?;
            (
                users.public_profile(a).expect("pending user has a profile"),
                users.public_profile(b).expect("pending user has a profile"),
            )
        };
        let preference = profile_a.chat_preference;

        // Keep the removed entries so a failed handoff can restore their
        // queue positions.
        let (entry_a, entry_b) = {
            let mut pool = inner.pool.lock().await;
            (pool.remove(a), pool.remove(b))
        };

        let deadline = inner.clock.now() + inner.config.ballot_ttl;
        let timer = {
            let weak = Arc::downgrade(inner);
            TimerGuard::spawn_at(deadline, async move {
                if let Some(inner) = weak.upgrade() {
                    inner.expire_ballot(match_id).await;
                }
            })
        };
        inner.pending.lock().await.insert(Ballot::new(
            match_id,
            a,
            b,
            preference,
            inner.clock.wall(),
            deadline,
            Some(timer),
        ));

        let wall = inner.clock.wall();
        let mut write_failed = false;
        for user in [a, b] {
            if let Err(e) = inner
                .repo
                .update_presence(user, true, UserStatus::Pending, wall)
                .await
            {
                warn!(error = %e, user = %user, "presence write failed during handoff");
                write_failed = true;
                break;
            }
        }
        if write_failed {
            // Dropping the ballot aborts its timer.
            inner.pending.lock().await.remove(match_id);
            inner.users.lock().await.abort_pending(match_id, [a, b]);
            let mut pool = inner.pool.lock().await;
            if let Some(entry) = entry_a {
                pool.restore(entry);
            }
            if let Some(entry) = entry_b {
                pool.restore(entry);
            }
            return Err(ChatError::Storage("match handoff".into()));
        }

        inner.registry.send(
            a,
            ServerEvent::MatchFound {
                match_id,
                partner: profile_b,
                prompt_user: true,
            },
        );
        inner.registry.send(
            b,
            ServerEvent::MatchFound {
                match_id,
                partner: profile_a,
                prompt_user: true,
            },
        );
        info!(match_id = %match_id, user_a = %a, user_b = %b, "match proposed");
        Ok(())
    }

    // -- ballots ----------------------------------------------------------

    async fn handle_vote(
        &self,
        user: UserId,
        match_id: MatchId,
        accept: bool,
    ) -> Result<(), ChatError> {
        let result = {
            let mut pending = self.pending.lock().await;
            pending.vote(match_id, user, accept, self.clock.now())?
        };
        match result {
            VoteResult::Pending => Ok(()),
            VoteResult::Decided(decided) => {
                let expired = decided.outcome == BallotOutcome::Expired;
                self.settle_ballot(decided).await;
                if expired {
                    Err(ChatError::MatchExpired)
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn expire_ballot(&self, match_id: MatchId) {
        let decided = self.pending.lock().await.expire(match_id);
        if let Some(decided) = decided {
            info!(match_id = %match_id, "ballot expired");
            self.settle_ballot(decided).await;
        }
    }

    async fn settle_ballot(&self, decided: DecidedBallot) {
        let [a, b] = decided.users;
        match decided.outcome {
            BallotOutcome::Accepted => {
                let session = match self.open_session(a, b, decided.preference).await {
                    Ok(session) => session,
                    Err(e) => {
                        error!(error = %e, match_id = %decided.id, "session creation failed after accept");
                        self.release_pair(
                            decided.id,
                            [a, b],
                            ServerEvent::MatchExpired {
                                match_id: decided.id,
                            },
                        )
                        .await;
                        return;
                    }
                };
                self.sessions.lock().await.insert(&session);
                self.users.lock().await.settle_pending(
                    decided.id,
                    [a, b],
                    UserStatus::InChat,
                    Some(session.id),
                );
                for user in [a, b] {
                    self.persist_presence(user, true, UserStatus::InChat).await;
                }

                let (profile_a, profile_b) = {
                    let users = self.users.lock().await;
                    (users.public_profile(a), users.public_profile(b))
                };
                if let Some(partner) = profile_b {
                    self.registry.send(
                        a,
                        ServerEvent::MatchConfirmed {
                            session_id: session.id,
                            partner,
                        },
                    );
                }
                if let Some(partner) = profile_a {
                    self.registry.send(
                        b,
                        ServerEvent::MatchConfirmed {
                            session_id: session.id,
                            partner,
                        },
                    );
                }
                info!(match_id = %decided.id, session = %session.id, "match confirmed");
            }
            BallotOutcome::Rejected { by } => {
                debug!(match_id = %decided.id, by = %by, "match rejected");
                self.release_pair(
                    decided.id,
                    [a, b],
                    ServerEvent::MatchRejected {
                        match_id: decided.id,
                    },
                )
                .await;
            }
            BallotOutcome::Expired => {
                self.release_pair(
                    decided.id,
                    [a, b],
                    ServerEvent::MatchExpired {
                        match_id: decided.id,
                    },
                )
                .await;
            }
        }
    }

    /// Rejected or expired ballot: both users return to `Online` (or
    /// `Offline` when their connections are gone) and every still-connected
    /// user hears about it.
    async fn release_pair(&self, match_id: MatchId, pair: [UserId; 2], event: ServerEvent) {
        self.users
            .lock()
            .await
            .settle_pending(match_id, pair, UserStatus::Online, None);
        for user in pair {
            if self.registry.has_connections(user) {
                self.persist_presence(user, true, UserStatus::Online).await;
                self.registry.send(user, event.clone());
            } else {
                {
                    let mut users = self.users.lock().await;
                    let _ = users.transition(user, UserStatus::Online, UserStatus::Offline);
                }
                self.persist_presence(user, false, UserStatus::Offline).await;
            }
        }
    }

    /// Find or create the durable record backing a pair's session. Used by
    /// both the ballot path and explicit creation; the creation lock is
    /// held across the round-trip so a second concurrent create for the
    /// same pair always returns the existing session instead of inserting
    /// a duplicate.
    async fn open_session(
        &self,
        a: UserId,
        b: UserId,
        kind: ChatPreference,
    ) -> Result<ChatSession, ChatError> {
        let _create = self.session_open.lock().await;
        if let Some(existing) = self.repo.find_active_between(a, b).await? {
            return Ok(existing);
        }
        match self.repo.create_session(a, b, kind).await {
            Ok(session) => Ok(session),
            Err(e) => {
                // The store's unique active-pair index backstops writers
                // this lock cannot see; a collision means the session
                // already exists.
                if let Some(existing) = self.repo.find_active_between(a, b).await? {
                    return Ok(existing);
                }
                Err(e.into())
            }
        }
    }

    // -- messages ---------------------------------------------------------

    /// The in-memory view of a session, loading it from the repository if
    /// this coordinator is not tracking it yet (sessions created over HTTP
    /// or before a restart).
    async fn tracked_session(
        &self,
        session_id: SessionId,
    ) -> Result<session::ActiveSession, ChatError> {
        if let Some(active) = self.sessions.lock().await.get(session_id).cloned() {
            return Ok(active);
        }
        let record = self.repo.get_session(session_id).await?;
        if !record.active {
            return Err(ChatError::SessionNotActive);
        }
        let mut sessions = self.sessions.lock().await;
        Ok(sessions.insert(&record).clone())
    }

    async fn send_message(
        &self,
        sender: UserId,
        session_id: SessionId,
        content: &str,
    ) -> Result<ChatMessage, ChatError> {
        let content = self.validate_content(content)?;

        let gate = {
            let active = self.tracked_session(session_id).await?;
            if !active.is_participant(sender) {
                return Err(ChatError::NotAParticipant);
            }
            active.gate
        };
        // Serialise persist + fan-out per session so every subscriber sees
        // messages in persisted order.
        let _serial = gate.lock().await;

        let message = self
            .repo
            .insert_message(session_id, sender, content)
            .await
            .map_err(|e| match e {
                RepoError::Denied(_) => ChatError::SessionNotActive,
                other => other.into(),
            })?;

        let subscribers: Vec<UserId> = {
            let sessions = self.sessions.lock().await;
            match sessions.get(session_id) {
                Some(active) => active.subscribers.iter().copied().collect(),
                // Ended while we were persisting; nothing left to notify.
                None => Vec::new(),
            }
        };
        for user in subscribers {
            self.registry.broadcast(
                user,
                ServerEvent::NewMessage {
                    session_id,
                    message: message.clone(),
                },
            );
        }
        Ok(message)
    }

    async fn typing(&self, user: UserId, session_id: SessionId, stop: bool) -> Result<(), ChatError> {
        let other = {
            let active = self.tracked_session(session_id).await?;
            active.other(user).ok_or(ChatError::NotAParticipant)?
        };
        let event = if stop {
            ServerEvent::StopTyping {
                session_id,
                user_id: user,
            }
        } else {
            ServerEvent::Typing {
                session_id,
                user_id: user,
            }
        };
        self.registry.send(other, event);
        Ok(())
    }

    async fn read_all(&self, reader: UserId, session_id: SessionId) -> Result<(), ChatError> {
        let other = {
            let active = self.tracked_session(session_id).await?;
            active.other(reader).ok_or(ChatError::NotAParticipant)?
        };
        // Persist first; the receipt must never precede the durable state.
        let up_to = self.repo.mark_read(session_id, reader).await?;
        self.registry.send(
            other,
            ServerEvent::ReadAll {
                session_id,
                reader_id: reader,
                up_to_message_id: up_to,
            },
        );
        Ok(())
    }

    async fn join_session(&self, user: UserId, session_id: SessionId) -> Result<(), ChatError> {
        if self.sessions.lock().await.subscribe(session_id, user) {
            return Ok(());
        }
        // Not tracked in memory (e.g. created over HTTP): validate against
        // the durable record and start tracking it.
        let record = self.repo.get_session(session_id).await?;
        if !record.is_participant(user) {
            return Err(ChatError::NotAParticipant);
        }
        if !record.active {
            return Err(ChatError::SessionNotActive);
        }
        let mut sessions = self.sessions.lock().await;
        sessions.insert(&record);
        sessions.subscribe(session_id, user);
        Ok(())
    }

    async fn end_session(&self, actor: UserId, session_id: SessionId) -> Result<(), ChatError> {
        let tracked = self.sessions.lock().await.get(session_id).cloned();
        let (pair, other) = match tracked {
            Some(active) => {
                if !active.is_participant(actor) {
                    return Err(ChatError::NotAParticipant);
                }
                (active.users, active.other(actor))
            }
            None => {
                let record = self.repo.get_session(session_id).await?;
                if !record.is_participant(actor) {
                    return Err(ChatError::NotAParticipant);
                }
                if !record.active {
                    return Err(ChatError::SessionNotActive);
                }
                ([record.user_a, record.user_b], record.other(actor))
            }
        };

        self.repo.set_session_active(session_id, false).await?;
        self.sessions.lock().await.remove(session_id);

        // Only users the ballot path actually put in-chat change status.
        let mut left_chat = Vec::new();
        {
            let mut users = self.users.lock().await;
            for user in pair {
                if users.status(user) == UserStatus::InChat
                    && users.session_of(user) == Some(session_id)
                {
                    let _ = users.transition(user, UserStatus::InChat, UserStatus::Online);
                    left_chat.push(user);
                }
            }
        }
        for user in left_chat {
            if self.registry.has_connections(user) {
                self.persist_presence(user, true, UserStatus::Online).await;
            } else {
                {
                    let mut users = self.users.lock().await;
                    let _ = users.transition(user, UserStatus::Online, UserStatus::Offline);
                }
                self.persist_presence(user, false, UserStatus::Offline).await;
            }
        }

        if let Some(other) = other {
            self.registry.send(
                other,
                ServerEvent::SessionEnded {
                    session_id,
                    by: actor,
                },
            );
        }
        info!(session = %session_id, by = %actor, "session ended");
        Ok(())
    }

    // -- disconnect -------------------------------------------------------

    async fn handle_last_disconnect(&self, user: UserId) {
        let status = self.users.lock().await.status(user);
        match status {
            UserStatus::Searching => {
                if let Err(e) = self.end_search(user).await {
                    warn!(error = %e, user = %user, "search cleanup on disconnect failed");
                }
            }
            UserStatus::Pending => {
                // Disconnect mid-ballot counts as a reject.
                let match_id = self.users.lock().await.pending_of(user);
                if let Some(match_id) = match_id {
                    if let Err(e) = self.handle_vote(user, match_id, false).await {
                        debug!(error = %e, user = %user, "ballot cleanup on disconnect");
                    }
                }
            }
            UserStatus::InChat => {
                let session_id = self.users.lock().await.session_of(user);
                if let Some(session_id) = session_id {
                    if let Err(e) = self.end_session(user, session_id).await {
                        warn!(error = %e, user = %user, "session cleanup on disconnect failed");
                    }
                }
            }
            UserStatus::Online | UserStatus::Offline => {}
        }

        // Whatever the cleanup path left us in, the final state for a fully
        // disconnected user is Offline.
        let went_offline = {
            let mut users = self.users.lock().await;
            if users.status(user) == UserStatus::Online {
                users
                    .transition(user, UserStatus::Online, UserStatus::Offline)
                    .is_ok()
            } else {
                false
            }
        };
        if went_offline {
            self.persist_presence(user, false, UserStatus::Offline).await;
        }
        info!(user = %user, "disconnected");
    }
}
