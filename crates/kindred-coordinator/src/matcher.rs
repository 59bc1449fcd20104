//! Pairing pass over the search pool.
//!
//! One logical tick covers every searcher: oldest searcher first (so nobody
//! starves), candidates ranked by shared-interest count, with deterministic
//! tie-breaks for reproducible behaviour. The driver loop and the ballot
//! handoff live on the coordinator; this module is the pure planning step.

use std::collections::HashSet;

use kindred_shared::types::UserId;

use crate::pool::SearchPool;

/// Compute the pairs one tick would propose. Does not mutate the pool;
/// the handoff re-validates each user's status before committing.
pub fn plan_pairs(pool: &SearchPool) -> Vec<(UserId, UserId)> {
    let mut paired: HashSet<UserId> = HashSet::new();
    let mut pairs = Vec::new();

    // Oldest searcher first. Preference grouping is implicit: candidates
    // only ever share the searcher's preference.
    for entry in pool.snapshot_sorted() {
        if paired.contains(&entry.user) {
            continue;
        }

        let best = pool
            .candidates_for(&entry)
            .into_iter()
            .filter(|c| !paired.contains(c))
            .map(|c| {
                let other = pool.get(c).expect("candidate comes from the pool");
                (entry.common_interests(other), other.enqueued_at, c.to_string(), c)
            })
            // Most shared interests first, then oldest enqueue, then id
            // lexicographic.
            .min_by(|x, y| {
                y.0.cmp(&x.0)
                    .then(x.1.cmp(&y.1))
                    .then(x.2.cmp(&y.2))
            })
            .map(|(_, _, _, c)| c);

        if let Some(candidate) = best {
            paired.insert(entry.user);
            paired.insert(candidate);
            pairs.push((entry.user, candidate));
        }
    }

    pairs
}
