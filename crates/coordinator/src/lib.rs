//! Quorum write/read coordinator (spec.md §4.9): fans a client operation out
//! to the ring's replicas for a key, applies the adaptive quorum plan
//! (`glint-quorum`), reconciles sibling sets on read, and issues best-effort
//! read-repair.
//!
//! The vector-clock bump discipline lives in the durable store, not here —
//! a replica's `write` call is expected to bump its own clock at
//! `coord_node_id` before acking. This crate only counts acks and merges
//! what replicas return.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use glint_quorum::{
    AdaptiveQuorumPlanner, ConsistencyHint, ReplicaLatencyTracker, SloMetrics,
    StalenessBudgetTracker,
};
use glint_ring::HashRing;
use glint_vclock::{DisplayPolicy, MergeResult, VclockError, VectorClock, VersionedValue};
use thiserror::Error;

/// Hedge trigger used when a replica has no latency samples yet.
const DEFAULT_HEDGE_MILLIS: f64 = 50.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    pub tombstone: bool,
    pub lww_millis: u64,
    pub clock: VectorClock,
}

#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ReplicaError {
    #[error("replica unreachable")]
    Unreachable,
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
}

/// One node's replica endpoint, from the coordinator's point of view.
/// `glint-node` supplies the concrete implementations (`Local` over an
/// in-process [`glint_store::Store`], and a `Channel` stand-in for
/// "remote" in tests/demos); this crate only depends on the trait.
#[async_trait]
pub trait ReplicaClient: Send + Sync {
    fn node_id(&self) -> &str;

    async fn write(
        &self,
        key: &str,
        value: Option<Vec<u8>>,
        coord_node_id: &str,
        op_id: &str,
        lww_millis: u64,
        now_millis: u64,
    ) -> Result<WriteAck, ReplicaError>;

    /// The replica's full local sibling set for `key` (empty iff absent).
    async fn read(&self, key: &str) -> Result<Vec<VersionedValue>, ReplicaError>;

    /// Merge an already-versioned value in verbatim, with no clock bump.
    /// Used for read-repair.
    async fn apply_foreign(
        &self,
        key: &str,
        version: VersionedValue,
        op_id: &str,
        now_millis: u64,
    ) -> Result<(), ReplicaError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumKind {
    Read,
    Write,
}

impl std::fmt::Display for QuorumKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// The boundary error taxonomy (spec.md §6/§7) the coordinator's public
/// surface returns. `Unauthorized` has no trigger inside this crate: bearer
/// auth is a transport concern, and the wire layer is out of scope (see
/// DESIGN.md); it is kept in the enum so the taxonomy is a complete
/// superset of the spec's.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error("{kind} quorum not met: needed {required}, got {got}")]
    QuorumNotMet {
        kind: QuorumKind,
        required: usize,
        got: usize,
    },

    #[error("unauthorized")]
    Unauthorized,

    #[error("payload too large: {size} bytes exceeds max {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    pub tombstone: bool,
    pub lww_millis: u64,
    pub clock: VectorClock,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetResult {
    pub found: bool,
    pub value: Option<Vec<u8>>,
    pub clock: VectorClock,
}

struct ReplicaReadResult {
    node_id: String,
    siblings: Vec<VersionedValue>,
}

pub struct Coordinator {
    local_node_id: String,
    ring: Arc<HashRing>,
    replicas: HashMap<String, Arc<dyn ReplicaClient>>,
    replication_factor: usize,
    base_read_quorum: usize,
    base_write_quorum: usize,
    max_value_bytes: usize,
    planner: AdaptiveQuorumPlanner,
    latency: ReplicaLatencyTracker,
    staleness_budget: StalenessBudgetTracker,
    slo_metrics: SloMetrics,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        local_node_id: impl Into<String>,
        ring: Arc<HashRing>,
        replicas: HashMap<String, Arc<dyn ReplicaClient>>,
        replication_factor: usize,
        base_read_quorum: usize,
        base_write_quorum: usize,
        max_value_bytes: usize,
        latency_alpha: f64,
        staleness_window_capacity: usize,
    ) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            ring,
            replicas,
            replication_factor,
            base_read_quorum,
            base_write_quorum,
            max_value_bytes,
            planner: AdaptiveQuorumPlanner::new(),
            latency: ReplicaLatencyTracker::new(latency_alpha),
            staleness_budget: StalenessBudgetTracker::new(staleness_window_capacity),
            slo_metrics: SloMetrics::new(),
        }
    }

    #[must_use]
    pub fn slo_metrics(&self) -> &SloMetrics {
        &self.slo_metrics
    }

    #[must_use]
    pub fn latency_tracker(&self) -> &ReplicaLatencyTracker {
        &self.latency
    }

    #[must_use]
    pub fn staleness_budget(&self) -> &StalenessBudgetTracker {
        &self.staleness_budget
    }

    #[must_use]
    pub const fn health(&self) -> bool {
        true
    }

    pub async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        coord_node_id: Option<&str>,
        op_id: Option<String>,
        lww_millis: u64,
        now_millis: u64,
    ) -> Result<WriteResult, ClientError> {
        self.write(key, Some(value), coord_node_id, op_id, lww_millis, now_millis)
            .await
    }

    pub async fn delete(
        &self,
        key: &str,
        coord_node_id: Option<&str>,
        op_id: Option<String>,
        lww_millis: u64,
        now_millis: u64,
    ) -> Result<WriteResult, ClientError> {
        self.write(key, None, coord_node_id, op_id, lww_millis, now_millis)
            .await
    }

    async fn write(
        &self,
        key: &str,
        value: Option<Vec<u8>>,
        coord_node_id: Option<&str>,
        op_id: Option<String>,
        lww_millis: u64,
        now_millis: u64,
    ) -> Result<WriteResult, ClientError> {
        if key.is_empty() {
            return Err(ClientError::BadRequest("key must not be empty".to_owned()));
        }
        if let Some(v) = &value {
            if v.len() > self.max_value_bytes {
                return Err(ClientError::PayloadTooLarge {
                    size: v.len(),
                    max: self.max_value_bytes,
                });
            }
        }

        let coord_node_id = coord_node_id.unwrap_or(&self.local_node_id).to_owned();
        let op_id = op_id.unwrap_or_else(|| generate_op_id(&self.local_node_id));

        let replicas = self.ring.owners_for_key(key, self.replication_factor);
        let plan = self.planner.plan_write(&replicas, self.base_write_quorum);

        let mut successes = 0usize;
        let mut max_lww = lww_millis;
        let mut clock = VectorClock::new();
        let mut tombstone = value.is_none();

        for node_id in &plan.ordered_replicas {
            let Some(client) = self.replicas.get(node_id) else {
                continue;
            };
            let started = Instant::now();
            let result = client
                .write(key, value.clone(), &coord_node_id, &op_id, lww_millis, now_millis)
                .await;
            self.latency
                .record_sample(node_id, started.elapsed().as_secs_f64() * 1000.0);
            match result {
                Ok(ack) => {
                    successes += 1;
                    max_lww = max_lww.max(ack.lww_millis);
                    clock = clock.elementwise_max(&ack.clock);
                    tombstone = ack.tombstone;
                }
                Err(ReplicaError::IllegalArgument(msg)) => return Err(ClientError::BadRequest(msg)),
                Err(ReplicaError::Unreachable) => {
                    tracing::warn!(node = %node_id, "replica unreachable during write");
                }
            }
        }

        if successes < plan.effective_w {
            return Err(ClientError::QuorumNotMet {
                kind: QuorumKind::Write,
                required: plan.effective_w,
                got: successes,
            });
        }

        Ok(WriteResult {
            tombstone,
            lww_millis: max_lww,
            clock,
        })
    }

    pub async fn get(
        &self,
        key: &str,
        hint: Option<ConsistencyHint>,
        now_millis: u64,
    ) -> Result<GetResult, ClientError> {
        if key.is_empty() {
            return Err(ClientError::BadRequest("key must not be empty".to_owned()));
        }
        let started = Instant::now();
        let hint = hint.unwrap_or(ConsistencyHint {
            deadline_millis: None,
            allow_staleness: false,
            max_budgeted_fraction: 0.0,
        });

        let mut used_budget = hint.allow_staleness;
        if used_budget && !self.staleness_budget.within_budget(hint.max_budgeted_fraction) {
            // Budget exhausted: silently downgrade for this call only
            // (spec.md §4.10b step 1).
            used_budget = false;
        }

        let replicas = self.ring.owners_for_key(key, self.replication_factor);
        let plan = self.planner.plan_read(&replicas, &self.latency, self.base_read_quorum);

        let (get_result, stale_observed) = if plan.effective_r == 1 {
            let response = self.hedged_read(key, &plan.ordered_replicas).await?;
            self.reconcile_and_repair(key, &[response], now_millis).await?
        } else {
            let (responses, successes) = self
                .quorum_read(key, &plan.ordered_replicas, plan.effective_r)
                .await?;
            if successes < plan.effective_r {
                return Err(ClientError::QuorumNotMet {
                    kind: QuorumKind::Read,
                    required: plan.effective_r,
                    got: successes,
                });
            }
            let any_value_found = responses
                .iter()
                .any(|r| r.siblings.iter().any(|v| !v.is_tombstone()));
            if !any_value_found {
                (
                    GetResult {
                        found: false,
                        value: None,
                        clock: VectorClock::new(),
                    },
                    false,
                )
            } else {
                self.reconcile_and_repair(key, &responses, now_millis).await?
            }
        };

        self.staleness_budget.record_read(used_budget);
        self.slo_metrics.record_read_outcome(used_budget, stale_observed);
        if hint.deadline_millis.is_some() {
            self.slo_metrics
                .record_latency_outcome(&hint, started.elapsed().as_millis() as u64);
        }

        Ok(get_result)
    }

    /// Convenience wrapper that turns an absent value into [`ClientError::NotFound`]
    /// for callers that want GET to fail rather than report `found: false`.
    pub async fn get_required(
        &self,
        key: &str,
        hint: Option<ConsistencyHint>,
        now_millis: u64,
    ) -> Result<GetResult, ClientError> {
        let result = self.get(key, hint, now_millis).await?;
        if result.found {
            Ok(result)
        } else {
            Err(ClientError::NotFound)
        }
    }

    async fn reconcile_and_repair(
        &self,
        key: &str,
        responses: &[ReplicaReadResult],
        now_millis: u64,
    ) -> Result<(GetResult, bool), ClientError> {
        let (get_result, stale_observed, repair_targets) = reconcile(responses)?;
        self.best_effort_repair(key, repair_targets, now_millis).await;
        Ok((get_result, stale_observed))
    }

    async fn best_effort_repair(
        &self,
        key: &str,
        targets: Vec<(String, VersionedValue)>,
        now_millis: u64,
    ) {
        for (node_id, version) in targets {
            let Some(client) = self.replicas.get(&node_id) else {
                continue;
            };
            let op_id = generate_op_id(&self.local_node_id);
            if let Err(error) = client.apply_foreign(key, version, &op_id, now_millis).await {
                tracing::warn!(node = %node_id, %error, "read-repair failed");
            }
        }
    }

    /// `R == 1`: dispatch to the first ordered replica; if it has not
    /// completed within its estimated p95 latency, race a second dispatch
    /// to the next replica and take whichever finishes first.
    async fn hedged_read(
        &self,
        key: &str,
        ordered: &[String],
    ) -> Result<ReplicaReadResult, ClientError> {
        let no_replica_err = || ClientError::QuorumNotMet {
            kind: QuorumKind::Read,
            required: 1,
            got: 0,
        };

        let primary_id = ordered.first().ok_or_else(no_replica_err)?;
        let primary_client = self.replicas.get(primary_id).ok_or_else(no_replica_err)?;
        let hedge_after = Duration::from_millis(
            self.latency
                .stats(primary_id)
                .map(|s| s.p95)
                .unwrap_or(DEFAULT_HEDGE_MILLIS)
                .max(0.0) as u64,
        );

        let primary_call = async {
            let started = Instant::now();
            let result = primary_client.read(key).await;
            (primary_id.clone(), result, started.elapsed())
        };
        tokio::pin!(primary_call);

        let first = tokio::select! {
            biased;
            out = &mut primary_call => Some(out),
            () = tokio::time::sleep(hedge_after) => None,
        };

        let (node_id, result, elapsed) = match first {
            Some(out) => out,
            None => match ordered.get(1).and_then(|id| self.replicas.get(id).map(|c| (id, c))) {
                Some((secondary_id, secondary_client)) => {
                    let secondary_call = async {
                        let started = Instant::now();
                        let result = secondary_client.read(key).await;
                        (secondary_id.clone(), result, started.elapsed())
                    };
                    tokio::pin!(secondary_call);
                    tokio::select! {
                        out = &mut primary_call => out,
                        out = &mut secondary_call => out,
                    }
                }
                None => primary_call.await,
            },
        };

        self.latency.record_sample(&node_id, elapsed.as_secs_f64() * 1000.0);
        match result {
            Ok(siblings) => Ok(ReplicaReadResult { node_id, siblings }),
            Err(ReplicaError::IllegalArgument(msg)) => Err(ClientError::BadRequest(msg)),
            Err(ReplicaError::Unreachable) => Err(no_replica_err()),
        }
    }

    /// `R > 1`: contact the first `effective_r` ordered replicas in turn;
    /// a not-found response still counts as a success.
    async fn quorum_read(
        &self,
        key: &str,
        ordered: &[String],
        effective_r: usize,
    ) -> Result<(Vec<ReplicaReadResult>, usize), ClientError> {
        let mut responses = Vec::new();
        let mut successes = 0usize;

        for node_id in ordered.iter().take(effective_r) {
            let Some(client) = self.replicas.get(node_id) else {
                continue;
            };
            let started = Instant::now();
            let result = client.read(key).await;
            self.latency
                .record_sample(node_id, started.elapsed().as_secs_f64() * 1000.0);
            match result {
                Ok(siblings) => {
                    successes += 1;
                    responses.push(ReplicaReadResult {
                        node_id: node_id.clone(),
                        siblings,
                    });
                }
                Err(ReplicaError::IllegalArgument(msg)) => return Err(ClientError::BadRequest(msg)),
                Err(ReplicaError::Unreachable) => {
                    tracing::warn!(node = %node_id, "replica unreachable during read");
                }
            }
        }

        Ok((responses, successes))
    }
}

fn generate_op_id(local_node_id: &str) -> String {
    format!("{local_node_id}-{:016x}", rand::random::<u64>())
}

fn elementwise_max_of(siblings: &[VersionedValue]) -> VectorClock {
    siblings
        .iter()
        .fold(VectorClock::new(), |acc, v| acc.elementwise_max(v.clock()))
}

/// Merge every contacted replica's sibling set into the maximal set,
/// pick a display winner, and work out which contacted replicas are
/// strictly behind it (spec.md §4.9 steps 4-5).
fn reconcile(
    responses: &[ReplicaReadResult],
) -> Result<(GetResult, bool, Vec<(String, VersionedValue)>), ClientError> {
    let mut candidates: Vec<VersionedValue> = Vec::new();
    for response in responses {
        candidates.extend(response.siblings.iter().cloned());
    }
    if candidates.is_empty() {
        return Ok((
            GetResult {
                found: false,
                value: None,
                clock: VectorClock::new(),
            },
            false,
            Vec::new(),
        ));
    }

    let merged: MergeResult =
        glint_vclock::merge(&candidates).map_err(|e: VclockError| ClientError::Internal(e.to_string()))?;
    let (winner, siblings_present) = match merged {
        MergeResult::Winner(w) => (w, false),
        MergeResult::Siblings(s) => {
            let picked = glint_vclock::pick_display(&s, DisplayPolicy::LargestLwwThenNodeId).clone();
            (picked, true)
        }
    };

    let mut repair_targets = Vec::new();
    let mut any_dominated = false;
    for response in responses {
        let replica_clock = elementwise_max_of(&response.siblings);
        if replica_clock.dominated_by(winner.clock()) {
            any_dominated = true;
            repair_targets.push((response.node_id.clone(), winner.clone()));
        }
    }

    let stale_observed = any_dominated || siblings_present;
    let get_result = GetResult {
        found: !winner.is_tombstone(),
        value: winner.value().map(<[u8]>::to_vec),
        clock: winner.clock().clone(),
    };
    Ok((get_result, stale_observed, repair_targets))
}
