//! Atomic full-map snapshots (spec.md §3, §4.4).
//!
//! A snapshot is written to a `*.tmp` path under the snapshot directory and
//! atomically renamed to `snapshot-<unix-ms>.bin`; the rename is the commit
//! point, so a crash mid-write leaves only an ignorable temp file behind.
//!
//! Per the Open Question in spec.md §9, the snapshot also records the set
//! of op-ids that produced the snapshotted state, so that on recovery the
//! deduper can be seeded and the WAL replay never re-applies anything the
//! snapshot already reflects.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use glint_codec::raw::{
    need, read_bytes, read_clock, read_i32, read_str, read_u32, read_u64, read_u8, write_clock,
    write_str,
};
use glint_codec::CodecError;
use glint_vclock::VersionedValue;
use thiserror::Error;

const FILE_PREFIX: &str = "snapshot-";
const FILE_SUFFIX: &str = ".bin";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SnapshotError {
    #[error("I/O error on snapshot path {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed snapshot file: {0}")]
    Malformed(#[from] CodecError),
}

fn io_err(path: &Utf8Path, source: std::io::Error) -> SnapshotError {
    SnapshotError::Io {
        path: path.to_owned(),
        source,
    }
}

/// A loaded snapshot: the full multi-version map, and the set of op-ids
/// that are already reflected in it (so the deduper can be seeded without
/// replaying them from the WAL).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedSnapshot {
    pub map: HashMap<String, Vec<VersionedValue>>,
    pub applied_op_ids: std::collections::HashSet<String>,
}

pub struct Snapshotter {
    dir: Utf8PathBuf,
}

impl Snapshotter {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Result<Self, SnapshotError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        Ok(Self { dir })
    }

    /// Serialize the full map to a temp file and atomically rename it into
    /// place. `unix_millis` names the file; callers pass the current wall
    /// clock so this crate never touches `SystemTime` itself (kept a pure
    /// function of its inputs for testability).
    pub fn write_snapshot(
        &self,
        map: &HashMap<String, Vec<VersionedValue>>,
        applied_op_ids: &std::collections::HashSet<String>,
        unix_millis: u64,
    ) -> Result<Utf8PathBuf, SnapshotError> {
        let bytes = encode_snapshot(map, applied_op_ids);

        let final_path = self.dir.join(format!("{FILE_PREFIX}{unix_millis}{FILE_SUFFIX}"));
        let tmp_path = self.dir.join(format!("{FILE_PREFIX}{unix_millis}{FILE_SUFFIX}.tmp"));

        let mut file = File::create(&tmp_path).map_err(|e| io_err(&tmp_path, e))?;
        file.write_all(&bytes).map_err(|e| io_err(&tmp_path, e))?;
        file.sync_all().map_err(|e| io_err(&tmp_path, e))?;
        drop(file);

        fs::rename(&tmp_path, &final_path).map_err(|e| io_err(&final_path, e))?;

        tracing::debug!(
            path = %final_path,
            keys = map.len(),
            op_ids = applied_op_ids.len(),
            "wrote snapshot"
        );

        Ok(final_path)
    }

    /// Load the newest snapshot, or `None` if no snapshot exists yet.
    /// Partial `*.tmp` files are never selected.
    pub fn load_latest(&self) -> Result<Option<LoadedSnapshot>, SnapshotError> {
        let Some(path) = self.latest_path()? else {
            return Ok(None);
        };
        let mut file = File::open(&path).map_err(|e| io_err(&path, e))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(|e| io_err(&path, e))?;
        Ok(Some(decode_snapshot(&bytes)?))
    }

    fn latest_path(&self) -> Result<Option<Utf8PathBuf>, SnapshotError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&self.dir, e)),
        };

        let mut best: Option<(u64, Utf8PathBuf)> = None;
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&self.dir, e))?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let Some(stem) = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|s| s.strip_suffix(FILE_SUFFIX))
            else {
                continue;
            };
            let Ok(ts) = stem.parse::<u64>() else {
                continue;
            };
            if best.as_ref().map_or(true, |(best_ts, _)| ts > *best_ts) {
                best = Some((ts, self.dir.join(&name)));
            }
        }
        Ok(best.map(|(_, path)| path))
    }
}

fn encode_snapshot(
    map: &HashMap<String, Vec<VersionedValue>>,
    applied_op_ids: &std::collections::HashSet<String>,
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(map.len() as u32).to_le_bytes());

    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    for key in keys {
        let siblings = &map[key];
        write_str(&mut out, key);
        out.extend_from_slice(&(siblings.len() as u32).to_le_bytes());
        for sibling in siblings {
            out.push(u8::from(sibling.is_tombstone()));
            out.extend_from_slice(&sibling.lww_millis().to_le_bytes());
            match sibling.value() {
                None => out.extend_from_slice(&(-1i32).to_le_bytes()),
                Some(bytes) => {
                    out.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
                    out.extend_from_slice(bytes);
                }
            }
            write_clock(&mut out, sibling.clock());
        }
    }

    let mut op_ids: Vec<&String> = applied_op_ids.iter().collect();
    op_ids.sort();
    out.extend_from_slice(&(op_ids.len() as u32).to_le_bytes());
    for op_id in op_ids {
        write_str(&mut out, op_id);
    }

    out
}

fn decode_snapshot(buf: &[u8]) -> Result<LoadedSnapshot, SnapshotError> {
    let mut cursor = 0usize;
    let key_count = read_u32(buf, &mut cursor)? as usize;

    let mut map = HashMap::with_capacity(key_count);
    for _ in 0..key_count {
        let key = read_str(buf, &mut cursor)?;
        let sibling_count = read_u32(buf, &mut cursor)? as usize;
        let mut siblings = Vec::with_capacity(sibling_count);
        for _ in 0..sibling_count {
            let tombstone = read_u8(buf, &mut cursor)? != 0;
            let lww_millis = read_u64(buf, &mut cursor)?;
            let value_len = read_i32(buf, &mut cursor)?;
            let value = if value_len < 0 {
                None
            } else {
                Some(read_bytes(buf, &mut cursor, value_len as usize)?.to_vec())
            };
            let clock = read_clock(buf, &mut cursor)?;
            siblings.push(VersionedValue::from_parts(value, tombstone, clock, lww_millis)?);
        }
        map.insert(key, siblings);
    }

    let op_id_count = read_u32(buf, &mut cursor)? as usize;
    let mut applied_op_ids = std::collections::HashSet::with_capacity(op_id_count);
    for _ in 0..op_id_count {
        applied_op_ids.insert(read_str(buf, &mut cursor)?);
    }

    need(buf, cursor, 0)?; // ensure cursor never ran past buf without erroring earlier
    Ok(LoadedSnapshot {
        map,
        applied_op_ids,
    })
}
