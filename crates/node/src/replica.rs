//! `ReplicaClient` implementations. `glint-coordinator` only depends on the
//! trait; this module supplies the "local" in-process variant described in
//! spec.md §9's polymorphism note. A genuine "remote" variant would differ
//! only in doing network I/O instead of a direct call, so one struct serves
//! both roles in this demo harness (wire transport is out of scope, per
//! SPEC_FULL.md §1).

use std::sync::Arc;

use async_trait::async_trait;
use glint_coordinator::{ReplicaClient, ReplicaError, WriteAck};
use glint_store::Store;
use glint_vclock::VersionedValue;

pub struct StoreReplicaClient {
    node_id: String,
    store: Arc<Store>,
}

impl StoreReplicaClient {
    #[must_use]
    pub fn new(node_id: impl Into<String>, store: Arc<Store>) -> Self {
        Self {
            node_id: node_id.into(),
            store,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}

#[async_trait]
impl ReplicaClient for StoreReplicaClient {
    fn node_id(&self) -> &str {
        &self.node_id
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
        let published = self
            .store
            .put(key, value.clone(), coord_node_id, op_id, lww_millis, now_millis)
            .map_err(|error| ReplicaError::IllegalArgument(error.to_string()))?;

        // `put` returns the full post-merge sibling set, not just the
        // version this call wrote; find it back by its lww timestamp and
        // value, which `Store::put` assigns verbatim from our arguments.
        let written = published
            .iter()
            .find(|v| v.lww_millis() == lww_millis && v.value() == value.as_deref())
            .cloned()
            .ok_or_else(|| {
                ReplicaError::IllegalArgument("write did not appear in the published sibling set".to_owned())
            })?;

        Ok(WriteAck {
            tombstone: written.is_tombstone(),
            lww_millis: written.lww_millis(),
            clock: written.clock().clone(),
        })
    }

    async fn read(&self, key: &str) -> Result<Vec<VersionedValue>, ReplicaError> {
        Ok(self
            .store
            .get_siblings(key)
            .map(|siblings| (*siblings).clone())
            .unwrap_or_default())
    }

    async fn apply_foreign(
        &self,
        key: &str,
        version: VersionedValue,
        op_id: &str,
        now_millis: u64,
    ) -> Result<(), ReplicaError> {
        self.store
            .apply_foreign(key, version, op_id, now_millis)
            .map(|_| ())
            .map_err(|error| ReplicaError::IllegalArgument(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use glint_vclock::VectorClock;
    use tempfile::tempdir;

    fn open_store(dir: &std::path::Path) -> Arc<Store> {
        let wal_dir = Utf8PathBuf::from_path_buf(dir.join("wal")).unwrap();
        let snap_dir = Utf8PathBuf::from_path_buf(dir.join("snap")).unwrap();
        let (store, _) = Store::open(wal_dir, snap_dir, 1024 * 1024, 1024, 60_000, 1_000_000, 0).unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn write_ack_reports_the_resulting_clock() {
        let dir = tempdir().unwrap();
        let client = StoreReplicaClient::new("node-a", open_store(dir.path()));

        let ack = client
            .write("k", Some(b"v".to_vec()), "node-a", "op-1", 10, 0)
            .await
            .unwrap();

        assert!(!ack.tombstone);
        assert_eq!(ack.clock.get("node-a"), 1);
    }

    #[tokio::test]
    async fn read_then_apply_foreign_round_trips() {
        let dir = tempdir().unwrap();
        let client = StoreReplicaClient::new("node-a", open_store(dir.path()));

        assert!(client.read("k").await.unwrap().is_empty());

        let foreign = VersionedValue::live(b"peer".to_vec(), VectorClock::new().bump("B"), 5);
        client.apply_foreign("k", foreign.clone(), "op-x", 0).await.unwrap();

        let siblings = client.read("k").await.unwrap();
        assert_eq!(siblings, vec![foreign]);
    }
}
