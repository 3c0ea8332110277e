//! Per-peer, per-shard Merkle anti-entropy session, plus the fixed-interval
//! daemon that drives it (spec.md §4.11).
//!
//! The actual key-level data movement a repair requires is outside this
//! crate's contract — a [`RepairExecutor`] receives classified *tokens*;
//! translating those back to keys and moving bytes is a higher layer's job
//! (`glint-node`, via the coordinator).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use glint_merkle::{Digest, MerkleError, MerkleTree};
use glint_ring::HashRing;
use glint_vclock::VersionedValue;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AntiEntropyError {
    #[error(transparent)]
    Merkle(#[from] MerkleError),

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("repair execution failed: {0}")]
    RepairFailed(String),
}

/// A token-range shard. Inclusive of `start_token`, exclusive of
/// `end_token`; wraps around the ring when `start_token > end_token`.
/// `start_token == end_token` is the degenerate case meaning "the whole
/// ring" (the demo's single full-range shard), since a single-point range
/// is never otherwise useful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub start_token: u64,
    pub end_token: u64,
}

impl Shard {
    #[must_use]
    pub const fn full_range() -> Self {
        Self {
            start_token: 0,
            end_token: 0,
        }
    }

    #[must_use]
    pub fn contains(&self, token: u64) -> bool {
        if self.start_token == self.end_token {
            return true;
        }
        if self.start_token < self.end_token {
            token >= self.start_token && token < self.end_token
        } else {
            token >= self.start_token || token < self.end_token
        }
    }
}

/// Abstracts "the durable store's current state, filtered to a shard" so
/// this crate never depends on `glint-store` directly. `glint-node` wires
/// the real implementation over [`glint_store::Store::snapshot_all`].
pub trait ShardSnapshotProvider: Send + Sync {
    fn snapshot_shard<'a>(
        &'a self,
        shard: &Shard,
    ) -> Box<dyn Iterator<Item = (String, Vec<VersionedValue>)> + 'a>;
}

/// The peer's Merkle snapshot response: root hash, leaf count, and the
/// per-leaf digests needed to rebuild its tree locally for diffing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub root: Digest,
    pub leaf_count: usize,
    pub digests: Vec<(u64, Digest)>,
}

/// A remote node's anti-entropy endpoint.
#[async_trait]
pub trait AntiEntropyPeer: Send + Sync {
    fn peer_id(&self) -> &str;

    async fn merkle_snapshot(
        &self,
        shard: &Shard,
        leaf_count: usize,
    ) -> Result<PeerSnapshot, AntiEntropyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RepairOutcome {
    pub pulled: usize,
    pub pushed: usize,
}

/// Performs the actual (out of spec) key-level repair for a set of
/// classified tokens.
#[async_trait]
pub trait RepairExecutor: Send + Sync {
    async fn execute(
        &self,
        peer_id: &str,
        shard: &Shard,
        pull: &[u64],
        push: &[u64],
    ) -> Result<RepairOutcome, AntiEntropyError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub peer_id: String,
    pub shard: Shard,
    pub in_sync: bool,
    pub pull_tokens: usize,
    pub push_tokens: usize,
}

/// Build a local Merkle tree over the keys a provider yields for `shard`.
pub fn build_local_tree(
    provider: &dyn ShardSnapshotProvider,
    shard: &Shard,
    leaf_count: usize,
) -> Result<MerkleTree, AntiEntropyError> {
    let entries = provider
        .snapshot_shard(shard)
        .map(|(key, siblings)| (HashRing::token_for_key(&key), key_digest(&key, &siblings)));
    Ok(MerkleTree::build(leaf_count, entries)?)
}

/// Run one anti-entropy round against one peer over one shard (spec.md
/// §4.11's "Session").
pub async fn run_session(
    provider: &dyn ShardSnapshotProvider,
    peer: &dyn AntiEntropyPeer,
    executor: &dyn RepairExecutor,
    shard: Shard,
    leaf_count: usize,
) -> Result<SessionReport, AntiEntropyError> {
    let local_tree = build_local_tree(provider, &shard, leaf_count)?;
    let peer_snapshot = peer.merkle_snapshot(&shard, leaf_count).await?;

    if local_tree.root() == peer_snapshot.root {
        return Ok(SessionReport {
            peer_id: peer.peer_id().to_owned(),
            shard,
            in_sync: true,
            pull_tokens: 0,
            push_tokens: 0,
        });
    }

    let remote_tree = MerkleTree::build(peer_snapshot.leaf_count, peer_snapshot.digests.clone())?;
    let leaf_diffs = glint_merkle::diff(&local_tree, &remote_tree)?;

    let mut pull = Vec::new();
    let mut push = Vec::new();
    for leaf in &leaf_diffs {
        let local_map: HashMap<u64, Digest> = leaf.local.iter().copied().collect();
        let remote_map: HashMap<u64, Digest> = leaf.remote.iter().copied().collect();

        for (token, remote_digest) in &remote_map {
            let locally_identical = local_map.get(token) == Some(remote_digest);
            if !locally_identical {
                pull.push(*token);
            }
        }
        for (token, local_digest) in &local_map {
            let remotely_identical = remote_map.get(token) == Some(local_digest);
            if !remotely_identical {
                push.push(*token);
            }
        }
    }

    let outcome = executor
        .execute(peer.peer_id(), &shard, &pull, &push)
        .await?;

    Ok(SessionReport {
        peer_id: peer.peer_id().to_owned(),
        shard,
        in_sync: false,
        pull_tokens: outcome.pulled,
        push_tokens: outcome.pushed,
    })
}

fn key_digest(key: &str, siblings: &[VersionedValue]) -> Digest {
    let mut encoded: Vec<Vec<u8>> = siblings.iter().map(encode_sibling).collect();
    encoded.sort();

    let mut buf = Vec::new();
    glint_codec::raw::write_str(&mut buf, key);
    for sibling in &encoded {
        buf.extend_from_slice(sibling);
    }
    glint_merkle::hash(&buf)
}

/// Canonical per-sibling encoding: identical across nodes for identical
/// state, so two replicas holding the same sibling set always hash the
/// same regardless of the order it was merged in.
fn encode_sibling(value: &VersionedValue) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(u8::from(value.is_tombstone()));
    buf.extend_from_slice(&value.lww_millis().to_le_bytes());
    glint_codec::raw::write_clock(&mut buf, value.clock());
    match value.value() {
        None => buf.extend_from_slice(&0u32.to_le_bytes()),
        Some(bytes) => {
            buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(bytes);
        }
    }
    buf
}

/// Counters for the one `tracing::info!`/`tracing::error!` line the daemon
/// emits per tick (spec.md's §9 design note: owned, not a process-wide
/// static).
#[derive(Default)]
pub struct AntiEntropyMetrics {
    rounds_completed: AtomicU64,
    rounds_failed: AtomicU64,
    rounds_in_sync: AtomicU64,
    tokens_pulled: AtomicU64,
    tokens_pushed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntiEntropySnapshot {
    pub rounds_completed: u64,
    pub rounds_failed: u64,
    pub rounds_in_sync: u64,
    pub tokens_pulled: u64,
    pub tokens_pushed: u64,
}

impl AntiEntropyMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_round(&self, report: &SessionReport) {
        self.rounds_completed.fetch_add(1, Ordering::Relaxed);
        if report.in_sync {
            self.rounds_in_sync.fetch_add(1, Ordering::Relaxed);
        }
        self.tokens_pulled
            .fetch_add(report.pull_tokens as u64, Ordering::Relaxed);
        self.tokens_pushed
            .fetch_add(report.push_tokens as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.rounds_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> AntiEntropySnapshot {
        AntiEntropySnapshot {
            rounds_completed: self.rounds_completed.load(Ordering::Relaxed),
            rounds_failed: self.rounds_failed.load(Ordering::Relaxed),
            rounds_in_sync: self.rounds_in_sync.load(Ordering::Relaxed),
            tokens_pulled: self.tokens_pulled.load(Ordering::Relaxed),
            tokens_pushed: self.tokens_pushed.load(Ordering::Relaxed),
        }
    }
}

/// Fixed-interval, single-threaded cooperative scheduler: one session per
/// tick against a randomly chosen peer, never fatal on a failed tick.
pub struct Daemon {
    peers: Vec<Arc<dyn AntiEntropyPeer>>,
    provider: Arc<dyn ShardSnapshotProvider>,
    executor: Arc<dyn RepairExecutor>,
    shard: Shard,
    leaf_count: usize,
    interval: Duration,
    metrics: AntiEntropyMetrics,
}

impl Daemon {
    #[must_use]
    pub fn new(
        peers: Vec<Arc<dyn AntiEntropyPeer>>,
        provider: Arc<dyn ShardSnapshotProvider>,
        executor: Arc<dyn RepairExecutor>,
        shard: Shard,
        leaf_count: usize,
        interval: Duration,
    ) -> Self {
        Self {
            peers,
            provider,
            executor,
            shard,
            leaf_count,
            interval,
            metrics: AntiEntropyMetrics::new(),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &AntiEntropyMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn peers(&self) -> &[Arc<dyn AntiEntropyPeer>] {
        &self.peers
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<dyn ShardSnapshotProvider> {
        &self.provider
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<dyn RepairExecutor> {
        &self.executor
    }

    #[must_use]
    pub const fn shard(&self) -> Shard {
        self.shard
    }

    #[must_use]
    pub const fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Run one session immediately against `peer_id`, bypassing the tick
    /// interval. Exposed for tests and ad hoc "sync now" tooling.
    pub async fn sync_once(&self, peer_id: &str) -> Result<SessionReport, AntiEntropyError> {
        let peer = self
            .peers
            .iter()
            .find(|p| p.peer_id() == peer_id)
            .ok_or_else(|| AntiEntropyError::PeerUnreachable(peer_id.to_owned()))?;
        run_session(
            self.provider.as_ref(),
            peer.as_ref(),
            self.executor.as_ref(),
            self.shard,
            self.leaf_count,
        )
        .await
    }

    /// Ticks until `shutdown` reports `true`. A tick with no peers is
    /// skipped, not an error (spec.md §4.11's "cluster has only the local
    /// node").
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if *shutdown.borrow() {
                break;
            }
            if self.peers.is_empty() {
                continue;
            }

            let peer = Arc::clone(&self.peers[rand::random::<usize>() % self.peers.len()]);

            match run_session(
                self.provider.as_ref(),
                peer.as_ref(),
                self.executor.as_ref(),
                self.shard,
                self.leaf_count,
            )
            .await
            {
                Ok(report) => {
                    self.metrics.record_round(&report);
                    tracing::info!(
                        peer = %report.peer_id,
                        in_sync = report.in_sync,
                        pulled = report.pull_tokens,
                        pushed = report.push_tokens,
                        "anti-entropy round complete"
                    );
                }
                Err(error) => {
                    self.metrics.record_failure();
                    tracing::error!(%error, "anti-entropy round failed");
                }
            }
        }
    }
}
