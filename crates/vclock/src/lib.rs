//! Vector clocks, causal comparison, and sibling-set merge.
//!
//! This crate is the partial-order core of glint: every other component
//! that needs to know whether one version of a key causally precedes,
//! follows, or conflicts with another goes through [`VectorClock::compare`]
//! and [`merge`].

use std::cmp::Ordering as StdOrdering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A mapping from node identifier to a monotonically increasing counter.
/// A missing entry is equivalent to zero. Immutable: [`VectorClock::bump`]
/// returns a new clock rather than mutating in place.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: BTreeMap<String, u64>,
}

/// Result of comparing two vector clocks under the partial order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    LeftDominates,
    RightDominates,
    Concurrent,
}

impl Comparison {
    /// `compare(A, B).swap() == compare(B, A)` (testable property 1 in spec.md §8).
    #[must_use]
    pub const fn swap(self) -> Self {
        match self {
            Self::Equal => Self::Equal,
            Self::LeftDominates => Self::RightDominates,
            Self::RightDominates => Self::LeftDominates,
            Self::Concurrent => Self::Concurrent,
        }
    }
}

impl VectorClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_entries<I: IntoIterator<Item = (String, u64)>>(entries: I) -> Self {
        Self {
            counters: entries.into_iter().collect(),
        }
    }

    /// Counter for `node`, or zero if absent.
    #[must_use]
    pub fn get(&self, node: &str) -> u64 {
        self.counters.get(node).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn entries(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counters.iter().map(|(k, v)| (k.as_str(), *v))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// A new clock with `node`'s entry incremented by one. Does not mutate `self`.
    #[must_use]
    pub fn bump(&self, node: &str) -> Self {
        let mut counters = self.counters.clone();
        *counters.entry(node.to_owned()).or_insert(0) += 1;
        Self { counters }
    }

    /// Elementwise max of `self` and `other`, a.k.a. the clock that dominates
    /// both (or ties both, if they are equal).
    #[must_use]
    pub fn elementwise_max(&self, other: &Self) -> Self {
        let mut counters = self.counters.clone();
        for (node, count) in &other.counters {
            let entry = counters.entry(node.clone()).or_insert(0);
            if *count > *entry {
                *entry = *count;
            }
        }
        Self { counters }
    }

    /// Compare two clocks under the causal partial order.
    ///
    /// Walks the union of known node ids, tracking whether `self` ever
    /// exceeds `other` and vice versa; the moment both have been observed
    /// we can stop early, since the result is already `Concurrent`.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Comparison {
        let mut self_ahead = false;
        let mut other_ahead = false;

        let nodes = self.counters.keys().chain(other.counters.keys());
        for node in nodes {
            match self.get(node).cmp(&other.get(node)) {
                StdOrdering::Greater => self_ahead = true,
                StdOrdering::Less => other_ahead = true,
                StdOrdering::Equal => {}
            }
            if self_ahead && other_ahead {
                return Comparison::Concurrent;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => Comparison::Equal,
            (true, false) => Comparison::LeftDominates,
            (false, true) => Comparison::RightDominates,
            (true, true) => Comparison::Concurrent,
        }
    }

    /// `self <= other` under the partial order.
    #[must_use]
    pub fn le(&self, other: &Self) -> bool {
        matches!(
            self.compare(other),
            Comparison::Equal | Comparison::RightDominates
        )
    }

    /// `self < other` under the partial order.
    #[must_use]
    pub fn lt(&self, other: &Self) -> bool {
        self.compare(other) == Comparison::RightDominates
    }

    /// `self` is strictly dominated by `other`.
    #[must_use]
    pub fn dominated_by(&self, other: &Self) -> bool {
        self.lt(other)
    }
}

/// An immutable record: value bytes (absent iff tombstone), the clock at
/// the time it was written, and a wall-clock timestamp used only to break
/// ties at display time, never for causal ordering.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    value: Option<Vec<u8>>,
    tombstone: bool,
    clock: VectorClock,
    lww_millis: u64,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VclockError {
    #[error("value and tombstone flag are inconsistent: value present = {value_present}, tombstone = {tombstone}")]
    InconsistentTombstone { value_present: bool, tombstone: bool },

    #[error("merge called with an empty candidate set")]
    CandidatesEmpty,
}

impl VersionedValue {
    /// Construct a live value. Fails the `value=null <-> tombstone=true`
    /// invariant check only on the tombstone constructor path; this path
    /// always carries a value.
    pub fn live(value: Vec<u8>, clock: VectorClock, lww_millis: u64) -> Self {
        Self {
            value: Some(value),
            tombstone: false,
            clock,
            lww_millis,
        }
    }

    #[must_use]
    pub fn tombstone(clock: VectorClock, lww_millis: u64) -> Self {
        Self {
            value: None,
            tombstone: true,
            clock,
            lww_millis,
        }
    }

    /// Construct from raw parts, validating the tombstone invariant.
    pub fn from_parts(
        value: Option<Vec<u8>>,
        tombstone: bool,
        clock: VectorClock,
        lww_millis: u64,
    ) -> Result<Self, VclockError> {
        if value.is_some() == tombstone {
            return Err(VclockError::InconsistentTombstone {
                value_present: value.is_some(),
                tombstone,
            });
        }
        Ok(Self {
            value,
            tombstone,
            clock,
            lww_millis,
        })
    }

    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        self.tombstone
    }

    #[must_use]
    pub const fn clock(&self) -> &VectorClock {
        &self.clock
    }

    #[must_use]
    pub const fn lww_millis(&self) -> u64 {
        self.lww_millis
    }
}

/// Outcome of merging a set of candidate versions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeResult {
    Winner(VersionedValue),
    Siblings(Vec<VersionedValue>),
}

/// Merge a set of candidate versions (e.g. the existing sibling set plus one
/// freshly written value) into the maximal set under the partial order.
///
/// A candidate is maximal iff no other candidate's clock strictly
/// dominates it. Deterministic with respect to the input set: order of
/// `candidates` does not affect which elements survive (testable property
/// 10: idempotent, commutative, equals the maximal elements of the union).
pub fn merge(candidates: &[VersionedValue]) -> Result<MergeResult, VclockError> {
    if candidates.is_empty() {
        return Err(VclockError::CandidatesEmpty);
    }

    let mut maximal: Vec<VersionedValue> = Vec::new();
    'candidate: for candidate in candidates {
        let mut i = 0;
        while i < maximal.len() {
            let existing = &maximal[i];
            if existing.clock.dominated_by(&candidate.clock) {
                maximal.remove(i);
                continue;
            }
            if candidate.clock.dominated_by(&existing.clock) {
                continue 'candidate;
            }
            i += 1;
        }
        maximal.push(candidate.clone());
    }

    if maximal.len() == 1 {
        Ok(MergeResult::Winner(maximal.into_iter().next().unwrap()))
    } else {
        Ok(MergeResult::Siblings(maximal))
    }
}

/// Resolver policy used only to present a single value at read time; never
/// consulted for causal correctness.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DisplayPolicy {
    /// Largest `lww_millis` wins; ties broken by lexicographically smallest
    /// node id present in the sibling's clock.
    #[default]
    LargestLwwThenNodeId,
}

/// Pick the sibling to display for a set that could not be merged to a
/// single winner. `siblings` must be non-empty.
pub fn pick_display(siblings: &[VersionedValue], policy: DisplayPolicy) -> &VersionedValue {
    assert!(!siblings.is_empty(), "pick_display requires a non-empty sibling set");
    match policy {
        DisplayPolicy::LargestLwwThenNodeId => siblings
            .iter()
            .min_by(|a, b| {
                // Reverse lww_millis so the largest sorts first under min_by.
                b.lww_millis
                    .cmp(&a.lww_millis)
                    .then_with(|| smallest_node_id(a.clock()).cmp(&smallest_node_id(b.clock())))
            })
            .expect("non-empty slice"),
    }
}

fn smallest_node_id(clock: &VectorClock) -> String {
    clock
        .entries()
        .map(|(id, _)| id.to_owned())
        .min()
        .unwrap_or_default()
}
