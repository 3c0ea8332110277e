//! Write-ahead log: append + fsync, segment rotation, and a sequential
//! reader that stops cleanly at the first torn tail (spec.md §4.3).

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

const SEGMENT_SUFFIX: &str = ".log";
const SEGMENT_DIGITS: usize = 8;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    #[error("I/O error on WAL segment {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("WAL directory contains a segment name that is not a valid sequence number: {0}")]
    BadSegmentName(String),
}

fn io_err(path: &Utf8Path, source: std::io::Error) -> WalError {
    WalError::Io {
        path: path.to_owned(),
        source,
    }
}

fn segment_name(number: u32) -> String {
    format!("{number:0width$}{SEGMENT_SUFFIX}", width = SEGMENT_DIGITS)
}

fn segment_number(file_name: &str) -> Option<u32> {
    let stem = file_name.strip_suffix(SEGMENT_SUFFIX)?;
    stem.parse().ok()
}

fn list_segments(dir: &Utf8Path) -> Result<Vec<u32>, WalError> {
    let mut numbers = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(numbers),
        Err(e) => return Err(io_err(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some(n) = segment_number(name) {
                numbers.push(n);
            }
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}

struct OpenSegment {
    number: u32,
    file: File,
    written: u64,
}

/// A single-writer, append-only log split across rotated segment files.
pub struct Wal {
    dir: Utf8PathBuf,
    rotate_bytes: u64,
    current: OpenSegment,
}

impl Wal {
    /// Open (or create) the WAL in `dir`. If segments already exist, the
    /// newest is reopened for append at end-of-file; otherwise segment
    /// number 1 is created.
    pub fn open(dir: impl Into<Utf8PathBuf>, rotate_bytes: u64) -> Result<Self, WalError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

        let segments = list_segments(&dir)?;
        let number = segments.last().copied().unwrap_or(1);
        let path = dir.join(segment_name(number));

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        let written = file.metadata().map_err(|e| io_err(&path, e))?.len();

        Ok(Self {
            dir,
            rotate_bytes,
            current: OpenSegment {
                number,
                file,
                written,
            },
        })
    }

    /// Append a complete framed record and force it to disk (data +
    /// metadata) before returning. If this returns `Ok`, a crash
    /// immediately after is guaranteed to have the record durable on
    /// recovery.
    pub fn append(&mut self, record: &[u8]) -> Result<(), WalError> {
        let path = self.current_path();
        self.current
            .file
            .write_all(record)
            .map_err(|e| io_err(&path, e))?;
        self.current.file.sync_all().map_err(|e| io_err(&path, e))?;
        self.current.written += record.len() as u64;
        Ok(())
    }

    /// Roll to the next segment if the current one has reached the
    /// rotation threshold. Never called mid-record; only between appends.
    pub fn rotate_if_needed(&mut self) -> Result<(), WalError> {
        if self.current.written < self.rotate_bytes {
            return Ok(());
        }

        let next_number = self.current.number + 1;
        let next_path = self.dir.join(segment_name(next_number));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&next_path)
            .map_err(|e| io_err(&next_path, e))?;

        tracing::debug!(
            from = self.current.number,
            to = next_number,
            bytes = self.current.written,
            "rotating WAL segment"
        );

        self.current = OpenSegment {
            number: next_number,
            file,
            written: 0,
        };
        Ok(())
    }

    fn current_path(&self) -> Utf8PathBuf {
        self.dir.join(segment_name(self.current.number))
    }

    /// Open a sequential reader over every segment, oldest first.
    pub fn open_reader(&self) -> Result<WalReader, WalError> {
        let segments = list_segments(&self.dir)?;
        Ok(WalReader {
            dir: self.dir.clone(),
            segments: segments.into_iter(),
            buf: Vec::new(),
            cursor: 0,
            done_with_segment: true,
        })
    }
}

/// Sequential, single-pass, non-restartable iterator over every record in
/// every segment. Stops a segment (and moves to the next) the moment a
/// torn tail is observed; never returns an error, since a torn tail is the
/// expected shape of a crash mid-append, not a failure to surface.
pub struct WalReader {
    dir: Utf8PathBuf,
    segments: std::vec::IntoIter<u32>,
    buf: Vec<u8>,
    cursor: usize,
    done_with_segment: bool,
}

impl WalReader {
    fn load_next_segment(&mut self) -> Result<bool, WalError> {
        loop {
            let Some(number) = self.segments.next() else {
                return Ok(false);
            };
            let path = self.dir.join(segment_name(number));
            let mut file = File::open(&path).map_err(|e| io_err(&path, e))?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf).map_err(|e| io_err(&path, e))?;
            self.buf = buf;
            self.cursor = 0;
            self.done_with_segment = false;
            return Ok(true);
        }
    }
}

impl Iterator for WalReader {
    /// Torn records never reach the caller as `Err` — they just end the
    /// iterator (see module docs) — so `Record` is the only item type.
    type Item = glint_codec::Record;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done_with_segment {
                match self.load_next_segment() {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to open next WAL segment; stopping replay");
                        return None;
                    }
                }
            }

            let remaining = &self.buf[self.cursor..];
            if remaining.is_empty() {
                self.done_with_segment = true;
                continue;
            }

            match glint_codec::decode(remaining) {
                Ok((record, consumed)) => {
                    self.cursor += consumed;
                    return Some(record);
                }
                Err(_) => {
                    tracing::warn!(
                        segment_offset = self.cursor,
                        "torn tail detected in WAL segment; stopping this segment's replay"
                    );
                    self.done_with_segment = true;
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glint_vclock::{VectorClock, VersionedValue};
    use tempfile::tempdir;

    fn rec(op_id: &str, key: &str, v: u64) -> Vec<u8> {
        let value = VersionedValue::live(format!("v{v}").into_bytes(), VectorClock::new(), v);
        glint_codec::encode(op_id, key, &value)
    }

    #[test]
    fn append_then_replay_round_trips() {
        let dir = tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();

        let mut wal = Wal::open(&path, 1024 * 1024).unwrap();
        wal.append(&rec("op1", "k1", 1)).unwrap();
        wal.append(&rec("op2", "k2", 2)).unwrap();

        let records: Vec<_> = wal
            .open_reader()
            .unwrap()
            .map(|r| r.key)
            .collect();
        assert_eq!(records, vec!["k1".to_owned(), "k2".to_owned()]);
    }

    #[test]
    fn rotation_creates_a_new_zero_padded_segment() {
        let dir = tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();

        let mut wal = Wal::open(&path, 10).unwrap();
        wal.append(&rec("op1", "k1", 1)).unwrap();
        wal.rotate_if_needed().unwrap();
        wal.append(&rec("op2", "k2", 2)).unwrap();

        let mut names: Vec<String> = fs::read_dir(&path)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["00000001.log".to_owned(), "00000002.log".to_owned()]);
    }

    #[test]
    fn torn_tail_stops_replay_of_that_segment() {
        let dir = tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();

        let mut wal = Wal::open(&path, 1024 * 1024).unwrap();
        wal.append(&rec("op1", "k1", 1)).unwrap();
        wal.append(&rec("op2", "k2", 2)).unwrap();

        // Simulate a crash mid-append: truncate the segment file to cut
        // into the middle of the second record.
        let seg_path = path.join("00000001.log");
        let full = fs::read(&seg_path).unwrap();
        let full_first_record_len = {
            let (_, consumed) = glint_codec::decode(&full).unwrap();
            consumed
        };
        let truncated = full.len() - 3;
        assert!(truncated > full_first_record_len, "test must cut into record 2");
        fs::write(&seg_path, &full[..truncated]).unwrap();

        let records: Vec<_> = wal
            .open_reader()
            .unwrap()
            .map(|r| r.key)
            .collect();
        assert_eq!(records, vec!["k1".to_owned()]);
    }

    #[test]
    fn reopen_appends_at_end_of_newest_segment() {
        let dir = tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();

        {
            let mut wal = Wal::open(&path, 1024 * 1024).unwrap();
            wal.append(&rec("op1", "k1", 1)).unwrap();
        }
        {
            let mut wal = Wal::open(&path, 1024 * 1024).unwrap();
            wal.append(&rec("op2", "k2", 2)).unwrap();
        }

        let records: Vec<_> = Wal::open(&path, 1024 * 1024)
            .unwrap()
            .open_reader()
            .unwrap()
            .map(|r| r.key)
            .collect();
        assert_eq!(records, vec!["k1".to_owned(), "k2".to_owned()]);
    }
}
