//! Hotness/divergence-scored repair prioritization: the layer that decides
//! *which* differing tokens an anti-entropy round actually spends its
//! bandwidth budget on (spec.md §4.12).
//!
//! None of these structs are process-wide singletons (spec.md §9); a node
//! owns one of each and threads them through its anti-entropy daemon.

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

/// Per-token EWMA of access frequency. Seeded at `1.0` on first observation;
/// there is no background decay, so a token's hotness only moves on access.
pub struct HotnessTracker {
    alpha: f64,
    ewma: RwLock<HashMap<u64, f64>>,
}

impl HotnessTracker {
    #[must_use]
    pub fn new(alpha: f64) -> Self {
        assert!(alpha > 0.0 && alpha <= 1.0, "alpha must be in (0, 1]");
        Self {
            alpha,
            ewma: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_access(&self, token: u64, _now_millis: u64) {
        let mut map = self.ewma.write();
        let entry = map.entry(token).or_insert(1.0);
        *entry = self.alpha * 1.0 + (1.0 - self.alpha) * *entry;
    }

    #[must_use]
    pub fn hotness(&self, token: u64) -> f64 {
        self.ewma.read().get(&token).copied().unwrap_or(0.0)
    }
}

/// Per-token first-seen-divergent timestamp.
pub struct DivergenceTracker {
    first_seen: RwLock<HashMap<u64, u64>>,
}

impl DivergenceTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            first_seen: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_divergence(&self, token: u64, now: u64) {
        let mut map = self.first_seen.write();
        let entry = map.entry(token).or_insert(now);
        *entry = (*entry).min(now);
    }

    pub fn clear_converged(&self, token: u64) {
        self.first_seen.write().remove(&token);
    }

    #[must_use]
    pub fn age_millis(&self, token: u64, now: u64) -> u64 {
        match self.first_seen.read().get(&token) {
            Some(first_seen) => now.saturating_sub(*first_seen),
            None => 0,
        }
    }

    #[must_use]
    pub fn is_divergent(&self, token: u64) -> bool {
        self.first_seen.read().contains_key(&token)
    }
}

impl Default for DivergenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// `score(token, now) = hotness * ageMillis`. Zero hotness or zero age is
/// zero urgency, never a positive baseline.
#[must_use]
pub fn score(hotness: &HotnessTracker, divergence: &DivergenceTracker, token: u64, now: u64) -> f64 {
    hotness.hotness(token) * divergence.age_millis(token, now) as f64
}

/// Global token-bucket rate limiter. Refill is lazy: computed from elapsed
/// real time on the next acquire call, not a background tick.
pub struct RateLimiter {
    capacity: f64,
    refill_per_second: f64,
    state: Mutex<RateLimiterState>,
}

struct RateLimiterState {
    available: f64,
    last_refill_millis: u64,
}

impl RateLimiter {
    #[must_use]
    pub fn new(capacity: u64, refill_per_second: u64, now_millis: u64) -> Self {
        assert!(capacity > 0, "capacity must be positive");
        assert!(refill_per_second > 0, "refill rate must be positive");
        Self {
            capacity: capacity as f64,
            refill_per_second: refill_per_second as f64,
            state: Mutex::new(RateLimiterState {
                available: capacity as f64,
                last_refill_millis: now_millis,
            }),
        }
    }

    /// Grants `min(requested, floor(available))` tokens and deducts them.
    /// `shard` is accepted for call-site symmetry with the scheduler but
    /// this limiter is global, not per-shard (spec.md §4.12).
    pub fn try_acquire_tokens(&self, _shard: &str, requested: u64, now_millis: u64) -> u64 {
        let mut state = self.state.lock();
        let elapsed_secs = now_millis.saturating_sub(state.last_refill_millis) as f64 / 1000.0;
        state.available = (state.available + elapsed_secs * self.refill_per_second).min(self.capacity);
        state.last_refill_millis = now_millis;

        let grantable = requested.min(state.available.floor() as u64);
        state.available -= grantable as f64;
        grantable
    }
}

/// A token queued for repair, ordered by descending score then ascending
/// insertion order (earliest first).
#[derive(Debug, Clone, PartialEq)]
struct QueuedToken {
    shard: String,
    token: u64,
    score: f64,
    inserted_at: u64,
}

impl Eq for QueuedToken {}

impl PartialOrd for QueuedToken {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedToken {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| other.inserted_at.cmp(&self.inserted_at))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepairItem {
    pub shard: String,
    pub token: u64,
    pub score: f64,
}

/// Node-global max-heap of pending repairs, ordered by descending score
/// with ties broken by earliest insertion.
pub struct PriorityScheduler {
    heap: Mutex<BinaryHeap<QueuedToken>>,
    sequence: AtomicU64,
}

impl PriorityScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn push(&self, shard: impl Into<String>, token: u64, score: f64) {
        let inserted_at = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.heap.lock().push(QueuedToken {
            shard: shard.into(),
            token,
            score,
            inserted_at,
        });
    }

    /// Pops up to `min(desired, size)` items in priority order. The caller
    /// is responsible for further clamping against a bandwidth cap.
    pub fn drain(&self, desired: usize) -> Vec<RepairItem> {
        let mut heap = self.heap.lock();
        let mut out = Vec::with_capacity(desired.min(heap.len()));
        for _ in 0..desired {
            let Some(item) = heap.pop() else { break };
            out.push(RepairItem {
                shard: item.shard,
                token: item.token,
                score: item.score,
            });
        }
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Which tokens an anti-entropy round should actually spend repair
/// bandwidth on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairMode {
    /// Preserve Merkle-diff order, clip to the rate-limiter budget.
    Fifo,
    /// Score differing tokens and drain the priority scheduler in
    /// descending-score order.
    Raae,
}

/// Ties a hotness/divergence/rate-limiter/scheduler quartet together into
/// the bookkeeping sequence spec.md §4.12 describes: record divergence for
/// every differing token, select up to budget, then clear the selected
/// tokens as converged (the higher layer is expected to actually repair
/// them; a failed repair must re-diverge on the next round).
pub struct RepairPlanner {
    hotness: HotnessTracker,
    divergence: DivergenceTracker,
    limiter: RateLimiter,
    scheduler: PriorityScheduler,
    mode: RepairMode,
    max_tokens_per_run: usize,
}

impl RepairPlanner {
    #[must_use]
    pub fn new(
        hotness: HotnessTracker,
        divergence: DivergenceTracker,
        limiter: RateLimiter,
        mode: RepairMode,
        max_tokens_per_run: usize,
    ) -> Self {
        Self {
            hotness,
            divergence,
            limiter,
            scheduler: PriorityScheduler::new(),
            mode,
            max_tokens_per_run,
        }
    }

    #[must_use]
    pub fn hotness(&self) -> &HotnessTracker {
        &self.hotness
    }

    #[must_use]
    pub fn divergence(&self) -> &DivergenceTracker {
        &self.divergence
    }

    /// Select which of `diverging_tokens` (in Merkle-diff order) to repair
    /// this round, recording divergence for all of them first and clearing
    /// the selected subset as converged.
    pub fn plan(&self, shard: &str, diverging_tokens: &[u64], now_millis: u64) -> Vec<u64> {
        for &token in diverging_tokens {
            self.divergence.record_divergence(token, now_millis);
        }

        let budget = self
            .limiter
            .try_acquire_tokens(shard, diverging_tokens.len() as u64, now_millis);
        if budget == 0 {
            return Vec::new();
        }

        let selected: Vec<u64> = match self.mode {
            RepairMode::Fifo => diverging_tokens
                .iter()
                .take(budget as usize)
                .copied()
                .collect(),
            RepairMode::Raae => {
                for &token in diverging_tokens {
                    let s = score(&self.hotness, &self.divergence, token, now_millis);
                    self.scheduler.push(shard.to_owned(), token, s);
                }
                let drain_count = (budget as usize).min(self.max_tokens_per_run);
                self.scheduler
                    .drain(drain_count)
                    .into_iter()
                    .map(|item| item.token)
                    .collect()
            }
        };

        for &token in &selected {
            self.divergence.clear_converged(token);
        }
        selected
    }
}
