//! Bounded dedupe window over op-ids (spec.md §4.5).
//!
//! Every write carries a client- or coordinator-assigned op-id. Replays of
//! the same op-id (retried PUTs, WAL records re-applied during recovery,
//! duplicate deliveries from hedged coordination) must not be applied twice.
//! [`Dedupe`] answers "have I seen this op-id before, within its TTL?" with a
//! capacity bound so memory use can never grow unboundedly even under a
//! flood of distinct op-ids.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

/// Bounded work performed per call to expire stale entries opportunistically,
/// rather than all at once or on a background thread.
const MAX_OPPORTUNISTIC_EVICTIONS: usize = 8;

struct Inner {
    /// op_id -> millis at which the entry may be evicted.
    expiry: HashMap<String, u64>,
    /// Insertion order, oldest first; a superset of `expiry`'s keys used to
    /// find eviction candidates without scanning the whole map.
    order: VecDeque<String>,
    ttl_millis: u64,
}

/// A fixed-capacity map from op-id to expiration time, with bounded
/// opportunistic expulsion on every insert.
pub struct Dedupe {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl Dedupe {
    #[must_use]
    pub fn new(capacity: usize, ttl_millis: u64) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                expiry: HashMap::new(),
                order: VecDeque::new(),
                ttl_millis,
            }),
        }
    }

    /// Change the TTL applied to entries inserted from now on. Does not
    /// retroactively change already-stored entries.
    pub fn set_ttl(&self, ttl_millis: u64) {
        self.inner.lock().ttl_millis = ttl_millis;
    }

    /// Record `op_id` as seen as of `now_millis`, returning `true` if this
    /// is the first time it has been seen (or its previous sighting has
    /// expired), `false` if it is a live duplicate.
    ///
    /// A bounded number of expired entries are reclaimed opportunistically
    /// on every call; if the map is still over capacity afterward, the
    /// oldest live entry is evicted regardless of its expiry.
    pub fn first_time(&self, op_id: &str, now_millis: u64) -> bool {
        let mut inner = self.inner.lock();

        evict_expired(&mut inner, now_millis);

        if let Some(&expires_at) = inner.expiry.get(op_id) {
            if expires_at > now_millis {
                return false;
            }
            // Stale entry for this exact op_id; drop its old `order` slot
            // before requeuing so `order` never holds two live slots for the
            // same id (a capacity eviction popping the old slot would then
            // remove the fresh entry from `expiry` by its string key).
            inner.order.retain(|id| id != op_id);
        }

        let ttl = inner.ttl_millis;
        inner.expiry.insert(op_id.to_owned(), now_millis + ttl);
        inner.order.push_back(op_id.to_owned());

        while inner.expiry.len() > self.capacity {
            let Some(victim) = inner.order.pop_front() else {
                break;
            };
            if inner.expiry.remove(&victim).is_some() {
                tracing::debug!(op_id = %victim, "dedupe window full, evicting oldest entry");
            }
        }

        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expiry.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The op-ids currently tracked as live (unexpired as of `now_millis`).
    /// Consumers that durably record "what has been applied so far"
    /// (the store's snapshot writer) read this rather than this crate
    /// exposing a background expiry thread.
    #[must_use]
    pub fn known_op_ids(&self, now_millis: u64) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .expiry
            .iter()
            .filter(|&(_, &expires_at)| expires_at > now_millis)
            .map(|(op_id, _)| op_id.clone())
            .collect()
    }
}

fn evict_expired(inner: &mut Inner, now_millis: u64) {
    let mut evicted = 0;
    while evicted < MAX_OPPORTUNISTIC_EVICTIONS {
        let Some(front) = inner.order.front() else {
            break;
        };
        let Some(&expires_at) = inner.expiry.get(front) else {
            // Already removed (e.g. by a capacity eviction); drop the stale
            // order entry and keep scanning.
            inner.order.pop_front();
            continue;
        };
        if expires_at > now_millis {
            break;
        }
        let victim = inner.order.pop_front().expect("front just peeked");
        inner.expiry.remove(&victim);
        evicted += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_is_new_second_is_duplicate() {
        let dedupe = Dedupe::new(16, 1_000);
        assert!(dedupe.first_time("op-1", 0));
        assert!(!dedupe.first_time("op-1", 100));
    }

    #[test]
    fn entry_reopens_as_new_after_ttl_expires() {
        let dedupe = Dedupe::new(16, 1_000);
        assert!(dedupe.first_time("op-1", 0));
        assert!(!dedupe.first_time("op-1", 999));
        assert!(dedupe.first_time("op-1", 1_001));
    }

    #[test]
    fn distinct_op_ids_are_each_new() {
        let dedupe = Dedupe::new(16, 1_000);
        assert!(dedupe.first_time("op-1", 0));
        assert!(dedupe.first_time("op-2", 0));
        assert!(dedupe.first_time("op-3", 0));
        assert_eq!(dedupe.len(), 3);
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let dedupe = Dedupe::new(4, 1_000_000);
        for i in 0..100 {
            dedupe.first_time(&format!("op-{i}"), 0);
            assert!(dedupe.len() <= 4);
        }
    }

    #[test]
    fn evicted_entries_are_treated_as_new_again() {
        let dedupe = Dedupe::new(2, 1_000_000);
        assert!(dedupe.first_time("op-1", 0));
        assert!(dedupe.first_time("op-2", 0));
        assert!(dedupe.first_time("op-3", 0)); // evicts op-1
        assert!(dedupe.first_time("op-1", 0)); // treated as new: was evicted
    }

    #[test]
    fn known_op_ids_excludes_expired_entries() {
        let dedupe = Dedupe::new(16, 100);
        dedupe.first_time("op-1", 0);
        dedupe.first_time("op-2", 0);
        let mut known = dedupe.known_op_ids(50);
        known.sort();
        assert_eq!(known, vec!["op-1".to_owned(), "op-2".to_owned()]);
        assert!(dedupe.known_op_ids(200).is_empty());
    }

    #[test]
    fn stale_refresh_leaves_no_duplicate_order_slot() {
        let dedupe = Dedupe::new(16, 1_000);
        assert!(dedupe.first_time("op-1", 0));
        // Refreshing after expiry must not leave the pre-refresh slot behind.
        assert!(dedupe.first_time("op-1", 2_000));
        let inner = dedupe.inner.lock();
        assert_eq!(inner.order.iter().filter(|id| *id == "op-1").count(), 1);
    }

    #[test]
    fn stale_refresh_survives_a_later_capacity_eviction() {
        // More pre-entries than MAX_OPPORTUNISTIC_EVICTIONS so op-1's stale
        // entry outlives the bounded opportunistic sweep and must be
        // refreshed through the explicit stale-entry branch.
        let dedupe = Dedupe::new(2, 1_000);
        for i in 0..9 {
            dedupe.first_time(&format!("pre-{i}"), 0);
        }
        assert!(dedupe.first_time("op-1", 0));

        // Past op-1's original expiry: opportunistic eviction reclaims the
        // 8 pre-* entries but stops before reaching op-1 (the 9th), so this
        // exercises the stale-refresh branch rather than a fresh insert.
        assert!(dedupe.first_time("op-1", 2_000));

        // Drive enough further inserts to force capacity eviction. If the
        // refreshed op-1 still had its old pre-refresh slot sitting in
        // `order`, a capacity eviction popping that slot would wrongly
        // purge the live, just-refreshed `expiry` entry by key.
        dedupe.first_time("filler-x", 2_000);
        dedupe.first_time("filler-y", 2_000);

        // Still within the refreshed TTL window: must be recognized as a
        // live duplicate, not double-applied as if it were brand new.
        assert!(!dedupe.first_time("op-1", 2_500));
    }

    #[test]
    fn set_ttl_affects_subsequent_inserts_only() {
        let dedupe = Dedupe::new(16, 1_000);
        assert!(dedupe.first_time("op-1", 0));
        dedupe.set_ttl(10);
        assert!(dedupe.first_time("op-2", 0));
        // op-1 still governed by the original (longer) TTL.
        assert!(!dedupe.first_time("op-1", 500));
        // op-2 governed by the new (shorter) TTL.
        assert!(!dedupe.first_time("op-2", 5));
        assert!(dedupe.first_time("op-2", 11));
    }
}
