//! Assembles the pieces into a running node (or an in-process demo cluster
//! of several): per-node [`Store`](glint_store::Store), the shared
//! [`HashRing`], a [`Coordinator`] wired to every node's
//! [`StoreReplicaClient`], and an anti-entropy [`Daemon`] wired to
//! in-process [`AntiEntropyPeer`]/[`RepairExecutor`] implementations.
//!
//! Wire transport is out of scope, so "remote" replicas and peers here are
//! just another node's [`Store`] reached directly. A real deployment would
//! swap these for network clients without touching `glint-coordinator` or
//! `glint-antientropy`, which only see the traits.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use camino::Utf8Path;
use eyre::{Result as EyreResult, WrapErr};
use glint_antientropy::{
    AntiEntropyError, AntiEntropyPeer, Daemon, PeerSnapshot, RepairExecutor, RepairOutcome, Shard,
    ShardSnapshotProvider, build_local_tree,
};
use glint_coordinator::{Coordinator, ReplicaClient};
use glint_repair::{DivergenceTracker, HotnessTracker, RateLimiter, RepairMode, RepairPlanner};
use glint_ring::HashRing;
use glint_store::Store;
use glint_vclock::VersionedValue;

use crate::config::{AntiEntropyMode, GlintConfig};
use crate::replica::StoreReplicaClient;

#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as u64
}

struct StoreShardSnapshotProvider {
    store: Arc<Store>,
}

impl ShardSnapshotProvider for StoreShardSnapshotProvider {
    fn snapshot_shard<'a>(
        &'a self,
        shard: &Shard,
    ) -> Box<dyn Iterator<Item = (String, Vec<VersionedValue>)> + 'a> {
        let shard = *shard;
        Box::new(
            self.store
                .snapshot_all()
                .into_iter()
                .filter(move |(key, _)| shard.contains(HashRing::token_for_key(key))),
        )
    }
}

struct InProcessAntiEntropyPeer {
    peer_id: String,
    store: Arc<Store>,
}

#[async_trait]
impl AntiEntropyPeer for InProcessAntiEntropyPeer {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn merkle_snapshot(
        &self,
        shard: &Shard,
        leaf_count: usize,
    ) -> Result<PeerSnapshot, AntiEntropyError> {
        let provider = StoreShardSnapshotProvider {
            store: self.store.clone(),
        };
        let tree = build_local_tree(&provider, shard, leaf_count)?;
        let digests = (0..tree.leaf_count())
            .flat_map(|leaf_id| tree.leaf_manifest(leaf_id).clone())
            .collect();
        Ok(PeerSnapshot {
            root: tree.root(),
            leaf_count,
            digests,
        })
    }
}

/// Translates the token lists a Merkle diff produces back into keys (by
/// re-scanning both stores' snapshots and checking ring membership) and
/// moves the corresponding sibling sets with [`Store::apply_foreign`].
/// Paces itself through a [`RepairPlanner`] so one divergent shard cannot
/// monopolize a round.
struct StoreRepairExecutor {
    local_node_id: String,
    local_store: Arc<Store>,
    peer_stores: HashMap<String, Arc<Store>>,
    planner: RepairPlanner,
}

impl StoreRepairExecutor {
    fn move_matching(
        &self,
        from: &Store,
        to: &Store,
        tokens: &HashSet<u64>,
    ) -> Result<usize, AntiEntropyError> {
        let mut moved = 0usize;
        for (key, siblings) in from.snapshot_all() {
            if !tokens.contains(&HashRing::token_for_key(&key)) {
                continue;
            }
            for version in siblings {
                let op_id = format!("{}-repair-{:016x}", self.local_node_id, rand::random::<u64>());
                to.apply_foreign(&key, version, &op_id, now_millis())
                    .map_err(|e| AntiEntropyError::RepairFailed(e.to_string()))?;
                moved += 1;
            }
        }
        Ok(moved)
    }
}

#[async_trait]
impl RepairExecutor for StoreRepairExecutor {
    async fn execute(
        &self,
        peer_id: &str,
        shard: &Shard,
        pull: &[u64],
        push: &[u64],
    ) -> Result<RepairOutcome, AntiEntropyError> {
        let peer_store = self
            .peer_stores
            .get(peer_id)
            .ok_or_else(|| AntiEntropyError::PeerUnreachable(peer_id.to_owned()))?;

        let now = now_millis();
        let shard_label = format!("{}:{}", shard.start_token, shard.end_token);
        for &token in pull.iter().chain(push) {
            self.planner.hotness().record_access(token, now);
        }

        let pull_tokens: HashSet<u64> = self.planner.plan(&shard_label, pull, now).into_iter().collect();
        let push_tokens: HashSet<u64> = self.planner.plan(&shard_label, push, now).into_iter().collect();

        let pulled = self.move_matching(peer_store, &self.local_store, &pull_tokens)?;
        let pushed = self.move_matching(&self.local_store, peer_store, &push_tokens)?;

        Ok(RepairOutcome { pulled, pushed })
    }
}

/// One node's assembled runtime state.
pub struct Node {
    pub id: String,
    pub store: Arc<Store>,
    pub coordinator: Arc<Coordinator>,
}

/// A shared ring plus every node's assembled state; the in-process stand-in
/// for a deployed fleet (spec.md's `--peers N` demo mode and the single-node
/// case alike, since a cluster of one is just `peer_count == 1`).
pub struct Cluster {
    pub ring: Arc<HashRing>,
    pub nodes: Vec<Node>,
    daemons: Vec<Arc<Daemon>>,
}

impl Cluster {
    /// Bring up `peer_count` nodes named `{config.node_id}-0`, `-1`, ... under
    /// `base_dir`, each with its own WAL/snapshot directories but sharing one
    /// `config` (replication factor, quorum sizes, anti-entropy cadence).
    pub fn bootstrap(config: &GlintConfig, peer_count: usize, base_dir: &Utf8Path) -> EyreResult<Self> {
        let peer_count = peer_count.max(1);
        let boot_time = now_millis();
        let node_ids: Vec<String> = (0..peer_count).map(|i| format!("{}-{i}", config.node_id)).collect();
        let ring = Arc::new(HashRing::new(&node_ids, config.vnodes_per_node));

        let mut stores: HashMap<String, Arc<Store>> = HashMap::new();
        for id in &node_ids {
            let node_dir = base_dir.join(id);
            let wal_dir = node_dir.join(&config.wal_dir);
            let snapshot_dir = node_dir.join(&config.snapshot_dir);
            let (store, stats) = Store::open(
                wal_dir,
                snapshot_dir,
                config.wal_rotate_bytes,
                4096,
                config.dedupe_ttl_seconds * 1000,
                config.snapshot_every_ops,
                boot_time,
            )
            .wrap_err_with(|| format!("failed to open store for node {id}"))?;
            tracing::info!(
                node = %id,
                keys_recovered = stats.keys_recovered,
                "node store opened"
            );
            stores.insert(id.clone(), Arc::new(store));
        }

        let mut nodes = Vec::with_capacity(peer_count);
        let mut daemons = Vec::with_capacity(peer_count);

        for id in &node_ids {
            let local_store = stores[id].clone();

            let mut replicas: HashMap<String, Arc<dyn ReplicaClient>> = HashMap::new();
            for peer_id in &node_ids {
                let client = StoreReplicaClient::new(peer_id.clone(), stores[peer_id].clone());
                replicas.insert(peer_id.clone(), Arc::new(client));
            }

            let coordinator = Arc::new(Coordinator::new(
                id.clone(),
                ring.clone(),
                replicas,
                config.replication_factor,
                config.read_quorum,
                config.write_quorum,
                config.max_value_bytes,
                0.3,
                64,
            ));

            let peers: Vec<Arc<dyn AntiEntropyPeer>> = node_ids
                .iter()
                .filter(|peer_id| *peer_id != id)
                .map(|peer_id| {
                    Arc::new(InProcessAntiEntropyPeer {
                        peer_id: peer_id.clone(),
                        store: stores[peer_id].clone(),
                    }) as Arc<dyn AntiEntropyPeer>
                })
                .collect();

            let peer_stores: HashMap<String, Arc<Store>> = node_ids
                .iter()
                .filter(|peer_id| *peer_id != id)
                .map(|peer_id| (peer_id.clone(), stores[peer_id].clone()))
                .collect();

            let mode = match config.anti_entropy_mode {
                AntiEntropyMode::Fifo => RepairMode::Fifo,
                AntiEntropyMode::Raae => RepairMode::Raae,
            };
            let planner = RepairPlanner::new(
                HotnessTracker::new(0.3),
                DivergenceTracker::new(),
                RateLimiter::new(config.repair_rate.capacity, config.repair_rate.refill_per_second, boot_time),
                mode,
                config.merkle_leaf_count,
            );
            let executor: Arc<dyn RepairExecutor> = Arc::new(StoreRepairExecutor {
                local_node_id: id.clone(),
                local_store: local_store.clone(),
                peer_stores,
                planner,
            });
            let provider: Arc<dyn ShardSnapshotProvider> = Arc::new(StoreShardSnapshotProvider {
                store: local_store.clone(),
            });

            let daemon = Arc::new(Daemon::new(
                peers,
                provider,
                executor,
                Shard::full_range(),
                config.merkle_leaf_count,
                Duration::from_secs(config.gossip_interval_seconds),
            ));
            daemons.push(daemon);

            nodes.push(Node {
                id: id.clone(),
                store: local_store,
                coordinator,
            });
        }

        Ok(Self { ring, nodes, daemons })
    }

    #[must_use]
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The anti-entropy daemon assembled for `id`, for tests and ad hoc
    /// "sync now" tooling that want to drive a round without waiting for
    /// the tick interval.
    #[must_use]
    pub fn daemon_for(&self, id: &str) -> Option<Arc<Daemon>> {
        self.nodes
            .iter()
            .position(|n| n.id == id)
            .map(|i| self.daemons[i].clone())
    }

    /// Spawn every node's anti-entropy daemon, all sharing one shutdown
    /// signal. Returns the join handles so the caller can await them.
    pub fn spawn_anti_entropy(
        &self,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        self.daemons
            .iter()
            .map(|daemon| {
                let daemon = daemon.clone();
                let rx = shutdown.clone();
                tokio::spawn(async move { daemon.run(rx).await })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config() -> GlintConfig {
        let mut config = GlintConfig::default();
        config.node_id = "node".to_owned();
        config.replication_factor = 2;
        config.read_quorum = 1;
        config.write_quorum = 1;
        config.merkle_leaf_count = 8;
        config
    }

    #[tokio::test]
    async fn single_node_cluster_serves_writes_and_reads() {
        let dir = tempdir().unwrap();
        let base = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let cluster = Cluster::bootstrap(&config(), 1, &base).unwrap();

        let node = cluster.node("node-0").unwrap();
        node.coordinator
            .put("k", b"v".to_vec(), None, None, 10, now_millis())
            .await
            .unwrap();
        let result = node.coordinator.get("k", None, now_millis()).await.unwrap();
        assert_eq!(result.value.as_deref(), Some(b"v".as_slice()));
    }

    #[tokio::test]
    async fn three_node_cluster_replicates_a_write_across_replicas() {
        let dir = tempdir().unwrap();
        let base = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let cfg = {
            let mut c = config();
            c.replication_factor = 3;
            c.read_quorum = 2;
            c.write_quorum = 2;
            c
        };
        let cluster = Cluster::bootstrap(&cfg, 3, &base).unwrap();

        let writer = cluster.node("node-0").unwrap();
        writer
            .coordinator
            .put("k", b"v".to_vec(), None, None, 10, now_millis())
            .await
            .unwrap();

        for node in &cluster.nodes {
            let result = node.coordinator.get("k", None, now_millis()).await.unwrap();
            assert_eq!(result.value.as_deref(), Some(b"v".as_slice()));
        }
    }

    #[tokio::test]
    async fn anti_entropy_round_pulls_a_divergent_key_into_sync() {
        let dir = tempdir().unwrap();
        let base = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let cfg = {
            let mut c = config();
            c.replication_factor = 1;
            c.read_quorum = 1;
            c.write_quorum = 1;
            c
        };
        let cluster = Cluster::bootstrap(&cfg, 2, &base).unwrap();

        // Write directly to node-1's store, bypassing the coordinator, to
        // simulate a replica that fell out of sync.
        let peer_store = cluster.node("node-1").unwrap().store.clone();
        peer_store
            .put("orphan", Some(b"v".to_vec()), "node-1", "op-x", 5, now_millis())
            .unwrap();

        let executor_input = cluster.node("node-0").unwrap();
        let peers: Vec<Arc<dyn AntiEntropyPeer>> = vec![Arc::new(InProcessAntiEntropyPeer {
            peer_id: "node-1".to_owned(),
            store: peer_store.clone(),
        })];
        let provider: Arc<dyn ShardSnapshotProvider> = Arc::new(StoreShardSnapshotProvider {
            store: executor_input.store.clone(),
        });
        let planner = RepairPlanner::new(
            HotnessTracker::new(0.3),
            DivergenceTracker::new(),
            RateLimiter::new(1000, 1000, now_millis()),
            RepairMode::Fifo,
            1000,
        );
        let mut peer_stores = HashMap::new();
        peer_stores.insert("node-1".to_owned(), peer_store.clone());
        let executor: Arc<dyn RepairExecutor> = Arc::new(StoreRepairExecutor {
            local_node_id: "node-0".to_owned(),
            local_store: executor_input.store.clone(),
            peer_stores,
            planner,
        });

        let report = glint_antientropy::run_session(
            provider.as_ref(),
            peers[0].as_ref(),
            executor.as_ref(),
            Shard::full_range(),
            8,
        )
        .await
        .unwrap();

        assert!(!report.in_sync);
        assert!(executor_input.store.get("orphan").is_some());
    }
}
