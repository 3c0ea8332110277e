//! Per-replica latency tracking, staleness budget, and adaptive read/write
//! quorum planning (spec.md §4.10, §4.10b).
//!
//! None of these structs are process-wide singletons (spec.md §9): whoever
//! assembles a node constructs one of each and threads it through the
//! coordinator explicitly, so tests can build isolated instances per
//! scenario.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Samples retained per replica for percentile computation. The EWMA is
/// updated on every sample regardless of window size.
const DEFAULT_WINDOW_CAPACITY: usize = 128;

struct ReplicaState {
    ewma: f64,
    window: VecDeque<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyStats {
    pub ewma: f64,
    pub p95: f64,
    pub p99: f64,
    pub sample_count: usize,
}

/// Per-replica sliding window of latency samples plus an EWMA.
pub struct ReplicaLatencyTracker {
    alpha: f64,
    window_capacity: usize,
    state: RwLock<HashMap<String, ReplicaState>>,
}

impl ReplicaLatencyTracker {
    /// `alpha` is the EWMA smoothing factor in `(0, 1]`; larger weighs
    /// recent samples more heavily.
    #[must_use]
    pub fn new(alpha: f64) -> Self {
        assert!(alpha > 0.0 && alpha <= 1.0, "alpha must be in (0, 1]");
        Self {
            alpha,
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            state: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_sample(&self, node_id: &str, millis: f64) {
        let mut state = self.state.write();
        let entry = state.entry(node_id.to_owned()).or_insert_with(|| ReplicaState {
            ewma: millis,
            window: VecDeque::new(),
        });
        entry.ewma = if entry.window.is_empty() {
            millis
        } else {
            self.alpha * millis + (1.0 - self.alpha) * entry.ewma
        };
        entry.window.push_back(millis);
        if entry.window.len() > self.window_capacity {
            entry.window.pop_front();
        }
    }

    #[must_use]
    pub fn stats(&self, node_id: &str) -> Option<LatencyStats> {
        let state = self.state.read();
        let entry = state.get(node_id)?;
        let mut sorted: Vec<f64> = entry.window.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        Some(LatencyStats {
            ewma: entry.ewma,
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
            sample_count: sorted.len(),
        })
    }

    #[must_use]
    pub fn ewma(&self, node_id: &str) -> Option<f64> {
        self.state.read().get(node_id).map(|e| e.ewma)
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let idx = p * (sorted.len() - 1) as f64;
    let lower = idx.floor() as usize;
    let upper = idx.ceil() as usize;
    let frac = idx - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

/// Per-request consistency preference. Advisory: the coordinator may
/// downgrade a budgeted read to safe when the staleness budget is
/// exhausted (spec.md §4.10b).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyHint {
    pub deadline_millis: Option<u64>,
    pub allow_staleness: bool,
    pub max_budgeted_fraction: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintMode {
    None,
    DeadlineOnly,
    Budgeted,
}

impl ConsistencyHint {
    #[must_use]
    pub fn mode(&self) -> HintMode {
        if self.allow_staleness {
            HintMode::Budgeted
        } else if self.deadline_millis.is_some() {
            HintMode::DeadlineOnly
        } else {
            HintMode::None
        }
    }
}

/// Fixed-capacity circular buffer of "was this read budgeted?" booleans.
pub struct StalenessBudgetTracker {
    capacity: usize,
    window: RwLock<VecDeque<bool>>,
    budgeted_count: AtomicU64,
}

impl StalenessBudgetTracker {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be positive");
        Self {
            capacity,
            window: RwLock::new(VecDeque::with_capacity(capacity)),
            budgeted_count: AtomicU64::new(0),
        }
    }

    pub fn record_read(&self, budgeted: bool) {
        let mut window = self.window.write();
        window.push_back(budgeted);
        if budgeted {
            self.budgeted_count.fetch_add(1, Ordering::Relaxed);
        }
        if window.len() > self.capacity {
            if let Some(evicted) = window.pop_front() {
                if evicted {
                    self.budgeted_count.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
    }

    #[must_use]
    pub fn current_fraction(&self) -> f64 {
        let window = self.window.read();
        if window.is_empty() {
            return 0.0;
        }
        self.budgeted_count.load(Ordering::Relaxed) as f64 / window.len() as f64
    }

    #[must_use]
    pub fn within_budget(&self, budget: f64) -> bool {
        self.current_fraction() <= budget
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadPlan {
    pub ordered_replicas: Vec<String>,
    pub effective_r: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WritePlan {
    pub ordered_replicas: Vec<String>,
    pub effective_w: usize,
}

/// Chooses effective quorum size and replica order for a request.
///
/// The current contract preserves `base_r`/`base_w` unconditionally (spec.md
/// §4.10's note that a future refinement may shrink `R` under a healthy
/// staleness budget is explicitly not implemented here — see DESIGN.md).
pub struct AdaptiveQuorumPlanner;

impl AdaptiveQuorumPlanner {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Replicas ordered ascending by EWMA latency; replicas with no samples
    /// yet sort last (treated as positive infinity).
    #[must_use]
    pub fn plan_read(
        &self,
        replicas: &[String],
        latency: &ReplicaLatencyTracker,
        base_r: usize,
    ) -> ReadPlan {
        let mut ordered = replicas.to_vec();
        ordered.sort_by(|a, b| {
            let ewma_a = latency.ewma(a).unwrap_or(f64::INFINITY);
            let ewma_b = latency.ewma(b).unwrap_or(f64::INFINITY);
            ewma_a.partial_cmp(&ewma_b).unwrap_or(std::cmp::Ordering::Equal)
        });
        ReadPlan {
            effective_r: base_r.min(ordered.len()),
            ordered_replicas: ordered,
        }
    }

    /// Ring order preserved.
    #[must_use]
    pub fn plan_write(&self, replicas: &[String], base_w: usize) -> WritePlan {
        WritePlan {
            effective_w: base_w.min(replicas.len()),
            ordered_replicas: replicas.to_vec(),
        }
    }
}

impl Default for AdaptiveQuorumPlanner {
    fn default() -> Self {
        Self::new()
    }
}

/// SLO hit/miss and safe-vs-budgeted read counters. `staleObserved` for a
/// read is computed by the coordinator (spec.md §4.10) and passed in here.
#[derive(Default)]
pub struct SloMetrics {
    slo_hits: AtomicU64,
    slo_misses: AtomicU64,
    safe_reads: AtomicU64,
    safe_reads_stale: AtomicU64,
    budgeted_reads: AtomicU64,
    budgeted_reads_stale: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SloSnapshot {
    pub slo_hits: u64,
    pub slo_misses: u64,
    pub safe_reads: u64,
    pub safe_reads_stale: u64,
    pub budgeted_reads: u64,
    pub budgeted_reads_stale: u64,
}

impl SloMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read_outcome(&self, used_budget: bool, stale_observed: bool) {
        if used_budget {
            self.budgeted_reads.fetch_add(1, Ordering::Relaxed);
            if stale_observed {
                self.budgeted_reads_stale.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            self.safe_reads.fetch_add(1, Ordering::Relaxed);
            if stale_observed {
                self.safe_reads_stale.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_latency_outcome(&self, hint: &ConsistencyHint, elapsed_millis: u64) {
        let Some(deadline) = hint.deadline_millis else {
            return;
        };
        if elapsed_millis <= deadline {
            self.slo_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.slo_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> SloSnapshot {
        SloSnapshot {
            slo_hits: self.slo_hits.load(Ordering::Relaxed),
            slo_misses: self.slo_misses.load(Ordering::Relaxed),
            safe_reads: self.safe_reads.load(Ordering::Relaxed),
            safe_reads_stale: self.safe_reads_stale.load(Ordering::Relaxed),
            budgeted_reads: self.budgeted_reads.load(Ordering::Relaxed),
            budgeted_reads_stale: self.budgeted_reads_stale.load(Ordering::Relaxed),
        }
    }
}
