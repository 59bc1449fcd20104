//! The set of currently searching users, indexed for fast compatibility
//! scans.

use std::collections::{BTreeSet, HashMap, HashSet};

use tokio::time::Instant;

use kindred_shared::types::{ChatPreference, UserId};

#[derive(Debug, Clone)]
pub struct SearchEntry {
    pub user: UserId,
    pub interests: BTreeSet<String>,
    pub preference: ChatPreference,
    pub blocked: HashSet<UserId>,
    pub enqueued_at: Instant,
    /// Tie-breaker for entries enqueued at the same instant (paused-time
    /// tests hit this constantly).
    pub seq: u64,
}

impl SearchEntry {
    pub fn common_interests(&self, other: &SearchEntry) -> usize {
        self.interests.intersection(&other.interests).count()
    }

    /// Same preference, at least one shared interest, no block in either
    /// direction.
    pub fn compatible_with(&self, other: &SearchEntry) -> bool {
        self.preference == other.preference
            && self.common_interests(other) >= 1
            && !self.blocked.contains(&other.user)
            && !other.blocked.contains(&self.user)
    }
}

/// Entries plus an inverted index interest-tag -> user set. The index is
/// kept consistent with the entry set on every add/remove.
#[derive(Default)]
pub struct SearchPool {
    entries: HashMap<UserId, SearchEntry>,
    by_interest: HashMap<String, HashSet<UserId>>,
    next_seq: u64,
}

impl SearchPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a searcher. `seq` is assigned here; an existing entry for the
    /// same user is replaced (keeping its original enqueue position would
    /// let a re-search jump the queue).
    pub fn add(
        &mut self,
        user: UserId,
        interests: BTreeSet<String>,
        preference: ChatPreference,
        blocked: HashSet<UserId>,
        enqueued_at: Instant,
    ) {
        self.remove(user);
        let seq = self.next_seq;
        self.next_seq += 1;
        for tag in &interests {
            self.by_interest.entry(tag.clone()).or_default().insert(user);
        }
        self.entries.insert(
            user,
            SearchEntry {
                user,
                interests,
                preference,
                blocked,
                enqueued_at,
                seq,
            },
        );
    }

    /// Re-insert a previously removed entry, preserving its enqueue
    /// position (used by the matcher's handoff rollback).
    pub fn restore(&mut self, entry: SearchEntry) {
        self.remove(entry.user);
        for tag in &entry.interests {
            self.by_interest
                .entry(tag.clone())
                .or_default()
                .insert(entry.user);
        }
        self.entries.insert(entry.user, entry);
    }

    pub fn remove(&mut self, user: UserId) -> Option<SearchEntry> {
        let entry = self.entries.remove(&user)?;
        for tag in &entry.interests {
            if let Some(set) = self.by_interest.get_mut(tag) {
                set.remove(&user);
                if set.is_empty() {
                    self.by_interest.remove(tag);
                }
            }
        }
        Some(entry)
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.entries.contains_key(&user)
    }

    pub fn get(&self, user: UserId) -> Option<&SearchEntry> {
        self.entries.get(&user)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Users sharing at least one interest with `entry`, with the same
    /// preference and no block either way. Uses the inverted index so the
    /// scan touches only overlapping searchers.
    pub fn candidates_for(&self, entry: &SearchEntry) -> Vec<UserId> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for tag in &entry.interests {
            let Some(users) = self.by_interest.get(tag) else {
                continue;
            };
            for candidate in users {
                if *candidate == entry.user || !seen.insert(*candidate) {
                    continue;
                }
                let other = &self.entries[candidate];
                if entry.compatible_with(other) {
                    out.push(*candidate);
                }
            }
        }
        out
    }

    /// All entries, oldest first.
    pub fn snapshot_sorted(&self) -> Vec<SearchEntry> {
        let mut all: Vec<SearchEntry> = self.entries.values().cloned().collect();
        all.sort_by_key(|e| (e.enqueued_at, e.seq));
        all
    }
}
