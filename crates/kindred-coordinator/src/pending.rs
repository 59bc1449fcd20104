//! Two-party accept/reject ballots with a hard deadline.
//!
//! Votes on the same ballot are serialised by the table lock; ballots are
//! independent of each other. Decision rule: any reject is immediately
//! terminal, acceptance requires unanimity, and an undecided ballot expires
//! at its deadline. A ballot is removed exactly once, on decision or
//! expiry.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use kindred_shared::types::{ChatPreference, MatchId, UserId};
use kindred_shared::ChatError;

use crate::clock::TimerGuard;

#[derive(Debug)]
pub struct Ballot {
    pub id: MatchId,
    pub user_a: UserId,
    pub user_b: UserId,
    pub preference: ChatPreference,
    pub created_at: DateTime<Utc>,
    pub deadline: Instant,
    accepts: HashSet<UserId>,
    rejects: HashSet<UserId>,
    /// Expiry timer; aborted when the ballot is dropped.
    _timer: Option<TimerGuard>,
}

impl Ballot {
    pub fn new(
        id: MatchId,
        user_a: UserId,
        user_b: UserId,
        preference: ChatPreference,
        created_at: DateTime<Utc>,
        deadline: Instant,
        timer: Option<TimerGuard>,
    ) -> Self {
        Self {
            id,
            user_a,
            user_b,
            preference,
            created_at,
            deadline,
            accepts: HashSet::new(),
            rejects: HashSet::new(),
            _timer: timer,
        }
    }

    pub fn users(&self) -> [UserId; 2] {
        [self.user_a, self.user_b]
    }

    pub fn is_participant(&self, user: UserId) -> bool {
        self.user_a == user || self.user_b == user
    }

    fn has_voted(&self, user: UserId) -> bool {
        self.accepts.contains(&user) || self.rejects.contains(&user)
    }

    fn disarm_timer(&mut self) {
        if let Some(timer) = &mut self._timer {
            timer.disarm();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BallotOutcome {
    Accepted,
    Rejected { by: UserId },
    Expired,
}

/// A ballot that has just been removed from the table, with everything the
/// coordinator needs to settle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecidedBallot {
    pub id: MatchId,
    pub users: [UserId; 2],
    pub preference: ChatPreference,
    pub outcome: BallotOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteResult {
    /// Vote recorded (or repeated); still waiting on the other user.
    Pending,
    Decided(DecidedBallot),
}

#[derive(Default)]
pub struct PendingMatchTable {
    ballots: HashMap<MatchId, Ballot>,
}

impl PendingMatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ballot: Ballot) {
        self.ballots.insert(ballot.id, ballot);
    }

    pub fn contains(&self, id: MatchId) -> bool {
        self.ballots.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.ballots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ballots.is_empty()
    }

    pub fn remove(&mut self, id: MatchId) -> Option<Ballot> {
        self.ballots.remove(&id)
    }

    /// Record a vote. A vote on an unknown ballot (already decided or
    /// expired) fails with `MatchExpired`; a vote past the deadline expires
    /// the ballot.
    pub fn vote(
        &mut self,
        id: MatchId,
        user: UserId,
        accept: bool,
        now: Instant,
    ) -> Result<VoteResult, ChatError> {
        let ballot = self.ballots.get_mut(&id).ok_or(ChatError::MatchExpired)?;
        if !ballot.is_participant(user) {
            return Err(ChatError::NotAParticipant);
        }

        if now > ballot.deadline {
            let ballot = self.ballots.remove(&id).expect("present above");
            return Ok(VoteResult::Decided(DecidedBallot {
                id,
                users: ballot.users(),
                preference: ballot.preference,
                outcome: BallotOutcome::Expired,
            }));
        }

        // Repeat votes are idempotent: the first recorded choice stands.
        if ballot.has_voted(user) {
            return Ok(VoteResult::Pending);
        }

        if !accept {
            ballot.rejects.insert(user);
            let ballot = self.ballots.remove(&id).expect("present above");
            return Ok(VoteResult::Decided(DecidedBallot {
                id,
                users: ballot.users(),
                preference: ballot.preference,
                outcome: BallotOutcome::Rejected { by: user },
            }));
        }

        ballot.accepts.insert(user);
        if ballot.accepts.len() == 2 {
            let ballot = self.ballots.remove(&id).expect("present above");
            return Ok(VoteResult::Decided(DecidedBallot {
                id,
                users: ballot.users(),
                preference: ballot.preference,
                outcome: BallotOutcome::Accepted,
            }));
        }
        Ok(VoteResult::Pending)
    }

    /// Deadline hook. Returns the decided ballot if it was still open.
    /// The caller is the timer task itself, so the timer is disarmed
    /// rather than aborted.
    pub fn expire(&mut self, id: MatchId) -> Option<DecidedBallot> {
        let mut ballot = self.ballots.remove(&id)?;
        ballot.disarm_timer();
        Some(DecidedBallot {
            id,
            users: ballot.users(),
            preference: ballot.preference,
            outcome: BallotOutcome::Expired,
        })
    }
}
