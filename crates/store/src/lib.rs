//! The durable per-node store (spec.md §4.6): a concurrent map from key to
//! sibling list, backed by the WAL for durability and periodic snapshots for
//! bounded recovery time, with the op-id deduper making replay idempotent.
//!
//! Per-key writes are serialized by a single store-wide write lock (the
//! spec's "a single per-store mutex suffices; per-key striping is a
//! permitted optimization" — we take the simple option). Reads go through a
//! [`DashMap`] and never block behind that lock; publication of a new
//! sibling set is a single atomic map insert (swap-a-reference semantics).

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use glint_codec::Record;
use glint_dedupe::Dedupe;
use glint_snapshot::Snapshotter;
use glint_vclock::{DisplayPolicy, MergeResult, VclockError, VectorClock, VersionedValue};
use glint_wal::Wal;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("storage unavailable: WAL append failed")]
    StorageUnavailable {
        #[source]
        source: glint_wal::WalError,
    },

    #[error(transparent)]
    Wal(#[from] glint_wal::WalError),

    #[error(transparent)]
    Snapshot(#[from] glint_snapshot::SnapshotError),

    #[error(transparent)]
    Clock(#[from] VclockError),
}

/// Counts surfaced in the one `tracing::info!` line emitted when recovery
/// completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryStats {
    pub keys_recovered: usize,
    pub wal_records_replayed: usize,
    pub wal_records_skipped_as_duplicate: usize,
}

pub struct Store {
    map: DashMap<String, Arc<Vec<VersionedValue>>>,
    wal: Mutex<Wal>,
    snapshotter: Snapshotter,
    dedupe: Dedupe,
    write_lock: Mutex<()>,
    snapshot_every_ops: u64,
    ops_since_snapshot: AtomicU64,
}

impl Store {
    /// Open the store, replaying the latest snapshot and any WAL records
    /// written since it was taken. `now_millis` seeds both the dedupe
    /// window (for op-ids recorded in the snapshot) and replay (for op-ids
    /// seen in the WAL); the store never reads the wall clock itself, so
    /// callers control time for determinism in tests.
    pub fn open(
        wal_dir: impl Into<camino::Utf8PathBuf>,
        snapshot_dir: impl Into<camino::Utf8PathBuf>,
        wal_rotate_bytes: u64,
        dedupe_capacity: usize,
        dedupe_ttl_millis: u64,
        snapshot_every_ops: u64,
        now_millis: u64,
    ) -> Result<(Self, RecoveryStats), StoreError> {
        let wal = Wal::open(wal_dir, wal_rotate_bytes)?;
        let snapshotter = Snapshotter::new(snapshot_dir)?;
        let dedupe = Dedupe::new(dedupe_capacity, dedupe_ttl_millis);
        let map: DashMap<String, Arc<Vec<VersionedValue>>> = DashMap::new();

        if let Some(loaded) = snapshotter.load_latest()? {
            for (key, siblings) in loaded.map {
                map.insert(key, Arc::new(siblings));
            }
            for op_id in &loaded.applied_op_ids {
                dedupe.first_time(op_id, now_millis);
            }
        }

        let mut replayed = 0usize;
        let mut skipped = 0usize;
        for record in wal.open_reader()? {
            if dedupe.first_time(&record.op_id, now_millis) {
                apply_record(&map, record)?;
                replayed += 1;
            } else {
                skipped += 1;
            }
        }

        let stats = RecoveryStats {
            keys_recovered: map.len(),
            wal_records_replayed: replayed,
            wal_records_skipped_as_duplicate: skipped,
        };
        tracing::info!(
            keys_recovered = stats.keys_recovered,
            wal_records_replayed = stats.wal_records_replayed,
            wal_records_skipped_as_duplicate = stats.wal_records_skipped_as_duplicate,
            "store recovery complete"
        );

        Ok((
            Self {
                map,
                wal: Mutex::new(wal),
                snapshotter,
                dedupe,
                write_lock: Mutex::new(()),
                snapshot_every_ops,
                ops_since_snapshot: AtomicU64::new(0),
            },
            stats,
        ))
    }

    /// Apply a write or delete (`value = None` is a delete) under op-id
    /// `op_id`. The new entry's clock is the elementwise max of the current
    /// sibling clocks, bumped at `coord_node_id` — the "vector-clock bump
    /// discipline" lives here, not at the coordinator.
    pub fn put(
        &self,
        key: &str,
        value: Option<Vec<u8>>,
        coord_node_id: &str,
        op_id: &str,
        lww_millis: u64,
        now_millis: u64,
    ) -> Result<Arc<Vec<VersionedValue>>, StoreError> {
        let _guard = self.write_lock.lock();

        let existing = self.map.get(key).map(|e| e.value().clone());
        let base_clock = existing
            .as_deref()
            .map(elementwise_max_of)
            .unwrap_or_default();
        let new_clock = base_clock.bump(coord_node_id);
        let tombstone = value.is_none();
        let new_version = VersionedValue::from_parts(value, tombstone, new_clock, lww_millis)?;

        let record = glint_codec::encode(op_id, key, &new_version);
        self.wal
            .lock()
            .append(&record)
            .map_err(|source| StoreError::StorageUnavailable { source })?;

        let published = if self.dedupe.first_time(op_id, now_millis) {
            merge_and_publish(&self.map, key, existing.as_deref(), new_version)?
        } else {
            // Idempotent replay of an already-applied op-id; return current
            // state as a no-op.
            existing.unwrap_or_else(|| Arc::new(Vec::new()))
        };

        if let Err(e) = self.wal.lock().rotate_if_needed() {
            return Err(StoreError::Wal(e));
        }

        if self.ops_since_snapshot.fetch_add(1, Ordering::Relaxed) + 1 >= self.snapshot_every_ops {
            self.ops_since_snapshot.store(0, Ordering::Relaxed);
            if let Err(e) = self.try_snapshot(now_millis) {
                tracing::warn!(error = %e, "periodic snapshot write failed; writes remain durable via WAL");
            }
        }

        Ok(published)
    }

    /// Merge an already-versioned value (a peer's sibling, fetched during
    /// anti-entropy or read-repair) into this store's state as-is, with no
    /// clock bump. Still goes through the WAL and the deduper, so it is
    /// durable and idempotent exactly like [`Store::put`]; the only
    /// difference is whose clock survives the merge.
    pub fn apply_foreign(
        &self,
        key: &str,
        version: VersionedValue,
        op_id: &str,
        now_millis: u64,
    ) -> Result<Arc<Vec<VersionedValue>>, StoreError> {
        let _guard = self.write_lock.lock();

        let record = glint_codec::encode(op_id, key, &version);
        self.wal
            .lock()
            .append(&record)
            .map_err(|source| StoreError::StorageUnavailable { source })?;

        let existing = self.map.get(key).map(|e| e.value().clone());
        let published = if self.dedupe.first_time(op_id, now_millis) {
            merge_and_publish(&self.map, key, existing.as_deref(), version)?
        } else {
            existing.unwrap_or_else(|| Arc::new(Vec::new()))
        };

        if let Err(e) = self.wal.lock().rotate_if_needed() {
            return Err(StoreError::Wal(e));
        }

        Ok(published)
    }

    /// Dump the current map plus the deduper's live op-id set to a new
    /// snapshot file. The op-ids are what let the next recovery seed the
    /// deduper without needing the full WAL to re-establish "already
    /// applied" state for every record still sitting in uncollected
    /// segments.
    fn try_snapshot(&self, now_millis: u64) -> Result<(), StoreError> {
        let map = self.snapshot_all();
        let applied_op_ids: std::collections::HashSet<String> =
            self.dedupe.known_op_ids(now_millis).into_iter().collect();
        self.snapshotter
            .write_snapshot(&map, &applied_op_ids, now_millis)?;
        Ok(())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<VersionedValue> {
        let siblings = self.map.get(key)?.value().clone();
        resolve_read(&siblings)
    }

    #[must_use]
    pub fn get_siblings(&self, key: &str) -> Option<Arc<Vec<VersionedValue>>> {
        self.map.get(key).map(|e| e.value().clone())
    }

    /// An immutable shallow view of the current map, for Merkle-tree
    /// construction and anti-entropy.
    #[must_use]
    pub fn snapshot_all(&self) -> HashMap<String, Vec<VersionedValue>> {
        self.map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().as_ref().clone()))
            .collect()
    }
}

fn elementwise_max_of(siblings: &[VersionedValue]) -> VectorClock {
    siblings
        .iter()
        .fold(VectorClock::new(), |acc, v| acc.elementwise_max(v.clock()))
}

fn merge_into_vec(result: MergeResult) -> Vec<VersionedValue> {
    match result {
        MergeResult::Winner(v) => vec![v],
        MergeResult::Siblings(s) => s,
    }
}

fn resolve_read(siblings: &[VersionedValue]) -> Option<VersionedValue> {
    if siblings.len() == 1 {
        let only = &siblings[0];
        return if only.is_tombstone() {
            None
        } else {
            Some(only.clone())
        };
    }
    if siblings.iter().all(VersionedValue::is_tombstone) {
        return None;
    }
    let resolved = glint_vclock::pick_display(siblings, DisplayPolicy::LargestLwwThenNodeId);
    if resolved.is_tombstone() {
        None
    } else {
        Some(resolved.clone())
    }
}

/// Merge `new_version` into `existing` and publish the result for `key` with
/// a single atomic map insert. Shared by the live write path, foreign-merge
/// path, and WAL replay, which differ only in how `new_version`'s clock was
/// produced, not in how it gets merged in.
fn merge_and_publish(
    map: &DashMap<String, Arc<Vec<VersionedValue>>>,
    key: &str,
    existing: Option<&Vec<VersionedValue>>,
    new_version: VersionedValue,
) -> Result<Arc<Vec<VersionedValue>>, StoreError> {
    let mut candidates: Vec<VersionedValue> = existing.cloned().unwrap_or_default();
    candidates.push(new_version);
    let merged = Arc::new(merge_into_vec(glint_vclock::merge(&candidates)?));
    map.insert(key.to_owned(), merged.clone());
    Ok(merged)
}

fn apply_record(
    map: &DashMap<String, Arc<Vec<VersionedValue>>>,
    record: Record,
) -> Result<(), StoreError> {
    let existing = map.get(&record.key).map(|e| e.value().clone());
    merge_and_publish(map, &record.key, existing.as_deref(), record.value)?;
    Ok(())
}
