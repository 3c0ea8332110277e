//! End-to-end scenarios against an in-process [`Cluster`], one per named
//! scenario in the write-up this crate's CLI demonstrates.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use glint_coordinator::{Coordinator, ReplicaClient, ReplicaError, WriteAck};
use glint_node::{Cluster, GlintConfig};
use glint_ring::HashRing;
use glint_vclock::{VectorClock, VersionedValue};
use std::collections::HashMap;
use tempfile::tempdir;

fn base_config() -> GlintConfig {
    let mut config = GlintConfig::default();
    config.node_id = "replica".to_owned();
    config.merkle_leaf_count = 8;
    config
}

fn base_dir() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, path)
}

/// S1: write then same-node read on a single-node, N=R=W=1 cluster.
#[tokio::test]
async fn s1_write_then_same_node_read() {
    let (_dir, base) = base_dir();
    let mut config = base_config();
    config.replication_factor = 1;
    config.read_quorum = 1;
    config.write_quorum = 1;
    let cluster = Cluster::bootstrap(&config, 1, &base).unwrap();
    let node = cluster.node("replica-0").unwrap();

    let write = node
        .coordinator
        .put("k", vec![0x48, 0x69], Some("replica-0"), None, 10, 0)
        .await
        .unwrap();
    assert_eq!(write.clock.get("replica-0"), 1);

    let read = node.coordinator.get("k", None, 0).await.unwrap();
    assert!(read.found);
    assert_eq!(read.value, Some(vec![0x48, 0x69]));
    assert_eq!(read.clock.get("replica-0"), 1);
}

/// S2: a second write from the same coordinator bumps the clock on top of
/// the first, and the store holds exactly one sibling (no concurrency yet).
#[tokio::test]
async fn s2_causal_update_bumps_the_clock() {
    let (_dir, base) = base_dir();
    let mut config = base_config();
    config.replication_factor = 1;
    config.read_quorum = 1;
    config.write_quorum = 1;
    let cluster = Cluster::bootstrap(&config, 1, &base).unwrap();
    let node = cluster.node("replica-0").unwrap();

    node.coordinator
        .put("k", vec![0x48, 0x69], Some("replica-0"), None, 10, 0)
        .await
        .unwrap();
    let second = node
        .coordinator
        .put("k", vec![0x42, 0x79], Some("replica-0"), Some("u1".to_owned()), 20, 0)
        .await
        .unwrap();
    assert_eq!(second.clock.get("replica-0"), 2);

    let siblings = node.store.get_siblings("k").unwrap();
    assert_eq!(siblings.len(), 1);
    assert_eq!(siblings[0].clock().get("replica-0"), 2);
    assert_eq!(siblings[0].value(), Some([0x42, 0x79].as_slice()));
}

/// S3: two replicas receive concurrent, unreplicated writes; after an
/// anti-entropy round reconciles them, every replica's sibling set is the
/// two maximal versions, and `GET` resolves the tie (equal lww) to the
/// smallest owning node id.
#[tokio::test]
async fn s3_concurrent_updates_reconcile_to_two_siblings() {
    let (_dir, base) = base_dir();
    let mut config = base_config();
    config.replication_factor = 3;
    config.read_quorum = 1;
    config.write_quorum = 1;
    let cluster = Cluster::bootstrap(&config, 3, &base).unwrap();

    let a = VersionedValue::live(b"from-a".to_vec(), VectorClock::new().bump("A"), 100);
    let b = VersionedValue::live(b"from-b".to_vec(), VectorClock::new().bump("B"), 100);

    cluster
        .node("replica-0")
        .unwrap()
        .store
        .apply_foreign("k", a.clone(), "op-a", 0)
        .unwrap();
    cluster
        .node("replica-1")
        .unwrap()
        .store
        .apply_foreign("k", b.clone(), "op-b", 0)
        .unwrap();

    let ids = ["replica-0", "replica-1", "replica-2"];
    for id in ids {
        let daemon = cluster.daemon_for(id).unwrap();
        for peer in daemon.peers() {
            daemon.sync_once(peer.peer_id()).await.unwrap();
        }
    }

    for id in ids {
        let siblings = cluster.node(id).unwrap().store.get_siblings("k").unwrap();
        let mut clocks: Vec<(String, u64)> = siblings
            .iter()
            .flat_map(|s| s.clock().entries().map(|(n, c)| (n.to_owned(), c)))
            .collect();
        clocks.sort();
        assert_eq!(siblings.len(), 2, "replica {id} should hold both siblings");
        assert_eq!(clocks, vec![("A".to_owned(), 1), ("B".to_owned(), 1)]);
    }

    let result = cluster
        .node("replica-0")
        .unwrap()
        .coordinator
        .get("k", None, 0)
        .await
        .unwrap();
    assert_eq!(result.value, Some(b"from-a".to_vec()));
}

/// S4: three-node cluster, N=3 R=3 W=1. Replica A is behind, B is ahead, C
/// is empty; `GET` returns B's value and write-repairs A.
#[tokio::test]
async fn s4_read_repair_fixes_the_lagging_replica() {
    let (_dir, base) = base_dir();
    let mut config = base_config();
    config.replication_factor = 3;
    config.read_quorum = 3;
    config.write_quorum = 1;
    let cluster = Cluster::bootstrap(&config, 3, &base).unwrap();

    let old = VersionedValue::live(vec![0x6F, 0x6C, 0x64], VectorClock::new().bump("N"), 1);
    let new = VersionedValue::live(vec![0x6E, 0x65, 0x77], VectorClock::new().bump("N").bump("N"), 2);

    cluster
        .node("replica-0")
        .unwrap()
        .store
        .apply_foreign("k", old, "op-a", 0)
        .unwrap();
    cluster
        .node("replica-1")
        .unwrap()
        .store
        .apply_foreign("k", new.clone(), "op-b", 0)
        .unwrap();
    // replica-2 holds nothing.

    let result = cluster
        .node("replica-0")
        .unwrap()
        .coordinator
        .get("k", None, 0)
        .await
        .unwrap();
    assert!(result.found);
    assert_eq!(result.value, Some(vec![0x6E, 0x65, 0x77]));
    assert_eq!(result.clock.get("N"), 2);

    let repaired = cluster.node("replica-0").unwrap().store.get("k").unwrap();
    assert_eq!(repaired.value(), Some([0x6E, 0x65, 0x77].as_slice()));
}

/// S5: a WAL torn tail at the end of the third record recovers the first
/// two keys and loses the third.
#[tokio::test]
async fn s5_crash_recovery_stops_at_the_torn_record() {
    let (_dir, base) = base_dir();
    let wal_dir = base.join("wal");
    let snap_dir = base.join("snap");

    {
        let (store, _) = glint_store::Store::open(wal_dir.clone(), snap_dir.clone(), 1024 * 1024, 1024, 60_000, 1_000_000, 0).unwrap();
        store.put("k1", Some(b"v1".to_vec()), "n", "op-1", 1, 0).unwrap();
        store.put("k2", Some(b"v2".to_vec()), "n", "op-2", 2, 0).unwrap();
        store.put("k3", Some(b"v3".to_vec()), "n", "op-3", 3, 0).unwrap();
    }

    // Truncate the active segment to cut into the third record, simulating
    // a crash mid-append.
    let seg_path = wal_dir.join("00000001.log");
    let full = std::fs::read(&seg_path).unwrap();
    std::fs::write(&seg_path, &full[..full.len() - 3]).unwrap();

    let (store, stats) = glint_store::Store::open(wal_dir, snap_dir, 1024 * 1024, 1024, 60_000, 1_000_000, 0).unwrap();
    assert_eq!(stats.wal_records_replayed, 2);
    assert_eq!(store.get("k1").unwrap().value(), Some(b"v1".as_slice()));
    assert_eq!(store.get("k2").unwrap().value(), Some(b"v2".as_slice()));
    assert_eq!(store.get("k3"), None);
}

struct DelayedReplicaClient {
    inner: Arc<dyn ReplicaClient>,
    read_delay: Duration,
}

#[async_trait]
impl ReplicaClient for DelayedReplicaClient {
    fn node_id(&self) -> &str {
        self.inner.node_id()
    }

    async fn write(
        &self,
        key: &str,
        value: Option<Vec<u8>>,
        coord_node_id: &str,
        op_id: &str,
        lww_millis: u64,
        now_millis: u64,
    ) -> Result<WriteAck, ReplicaError> {
        self.inner
            .write(key, value, coord_node_id, op_id, lww_millis, now_millis)
            .await
    }

    async fn read(&self, key: &str) -> Result<Vec<VersionedValue>, ReplicaError> {
        tokio::time::sleep(self.read_delay).await;
        self.inner.read(key).await
    }

    async fn apply_foreign(
        &self,
        key: &str,
        version: VersionedValue,
        op_id: &str,
        now_millis: u64,
    ) -> Result<(), ReplicaError> {
        self.inner.apply_foreign(key, version, op_id, now_millis).await
    }
}

/// S6: two-replica read path with R=1. Replica #1's recorded p95 latency
/// (the coordinator's hedge trigger) is 50ms after a single sample; it is
/// then delayed 200ms while replica #2 answers in 10ms, so the hedged read
/// should return replica #2's value well under 200ms.
#[tokio::test]
async fn s6_hedged_read_prefers_the_faster_secondary() {
    let (_dir, base) = base_dir();
    let wal_dir_a = base.join("a-wal");
    let snap_dir_a = base.join("a-snap");
    let wal_dir_b = base.join("b-wal");
    let snap_dir_b = base.join("b-snap");

    let (store_a, _) = glint_store::Store::open(wal_dir_a, snap_dir_a, 1024 * 1024, 1024, 60_000, 1_000_000, 0).unwrap();
    let (store_b, _) = glint_store::Store::open(wal_dir_b, snap_dir_b, 1024 * 1024, 1024, 60_000, 1_000_000, 0).unwrap();
    store_a.put("k", Some(b"slow".to_vec()), "a", "op-a", 5, 0).unwrap();
    store_b.put("k", Some(b"fast".to_vec()), "b", "op-b", 5, 0).unwrap();

    let client_a: Arc<dyn ReplicaClient> = Arc::new(DelayedReplicaClient {
        inner: Arc::new(glint_node::StoreReplicaClient::new("a", Arc::new(store_a))),
        read_delay: Duration::from_millis(200),
    });
    let client_b: Arc<dyn ReplicaClient> = Arc::new(DelayedReplicaClient {
        inner: Arc::new(glint_node::StoreReplicaClient::new("b", Arc::new(store_b))),
        read_delay: Duration::from_millis(10),
    });

    let mut replicas: HashMap<String, Arc<dyn ReplicaClient>> = HashMap::new();
    replicas.insert("a".to_owned(), client_a);
    replicas.insert("b".to_owned(), client_b);

    let ring = Arc::new(HashRing::new(&["a".to_owned(), "b".to_owned()], 32));
    let coordinator = Coordinator::new("a", ring, replicas, 2, 1, 1, 1024, 0.5, 16);
    coordinator.latency_tracker().record_sample("a", 50.0);

    let started = std::time::Instant::now();
    let result = coordinator.get("k", None, 0).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.value, Some(b"fast".to_vec()));
    assert!(elapsed < Duration::from_millis(150), "elapsed = {elapsed:?}");
}
