//! Bit-exact framing for glint log records.
//!
//! On-disk layout (spec.md §3, §6):
//!
//! ```text
//! header: magic(2) | version(1) | payload_len(4, LE) | crc32(4, LE)
//! payload: op_id(str) | key(str) | tombstone(1) | lww_millis(8, LE)
//!          | value(len-prefixed, -1 sentinel for null) | clock
//! clock: count(4, LE) | count * (id(str) | counter(8, LE))
//! str: len(4, LE) | utf8 bytes
//! ```
//!
//! All multi-byte integers are little-endian. CRC-32 is the standard
//! reflected IEEE polynomial (0xEDB88320), computed over the payload only.

use glint_vclock::{VclockError, VectorClock, VersionedValue};
use thiserror::Error;

pub const MAGIC: [u8; 2] = *b"GL";
pub const VERSION: u8 = 1;
/// Size of the fixed record header: magic + version + payload_len + crc32.
pub const HEADER_LEN: usize = 2 + 1 + 4 + 4;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    #[error("buffer too short: need at least {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("bad magic bytes: {0:?}")]
    BadMagic([u8; 2]),

    #[error("unsupported record version: {0}")]
    BadVersion(u8),

    #[error("declared payload length {0} is invalid")]
    BadLength(i64),

    #[error("CRC-32 mismatch: expected {expected:08x}, computed {computed:08x}")]
    CrcMismatch { expected: u32, computed: u32 },

    #[error("string payload was not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error(transparent)]
    Clock(#[from] VclockError),
}

/// A fully decoded log record: the logical mutation identifier, the key it
/// applies to, and the version written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub op_id: String,
    pub key: String,
    pub value: VersionedValue,
}

/// Encode `(op_id, key, value)` into a complete framed record.
#[must_use]
pub fn encode(op_id: &str, key: &str, value: &VersionedValue) -> Vec<u8> {
    let mut payload = Vec::new();
    write_str(&mut payload, op_id);
    write_str(&mut payload, key);
    payload.push(u8::from(value.is_tombstone()));
    payload.extend_from_slice(&value.lww_millis().to_le_bytes());
    match value.value() {
        None => payload.extend_from_slice(&(-1i32).to_le_bytes()),
        Some(bytes) => {
            payload.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
            payload.extend_from_slice(bytes);
        }
    }
    write_clock(&mut payload, value.clock());

    let crc = crc32fast::hash(&payload);

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC);
    out.push(VERSION);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&payload);
    out
}

/// Decode a single framed record from the start of `buf`. Returns the
/// record and the number of bytes consumed. Any inconsistency (bad magic,
/// bad version, bad length, CRC mismatch, malformed payload) is reported as
/// [`CodecError`]; the caller (the WAL reader) treats all of these as a
/// torn tail rather than propagating them.
pub fn decode(buf: &[u8]) -> Result<(Record, usize), CodecError> {
    if buf.len() < HEADER_LEN {
        return Err(CodecError::Truncated {
            need: HEADER_LEN,
            have: buf.len(),
        });
    }

    let magic = [buf[0], buf[1]];
    if magic != MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    let version = buf[2];
    if version != VERSION {
        return Err(CodecError::BadVersion(version));
    }
    let payload_len = u32::from_le_bytes([buf[3], buf[4], buf[5], buf[6]]) as usize;
    let expected_crc = u32::from_le_bytes([buf[7], buf[8], buf[9], buf[10]]);

    let total = HEADER_LEN + payload_len;
    if buf.len() < total {
        return Err(CodecError::Truncated {
            need: total,
            have: buf.len(),
        });
    }

    let payload = &buf[HEADER_LEN..total];
    let computed_crc = crc32fast::hash(payload);
    if computed_crc != expected_crc {
        return Err(CodecError::CrcMismatch {
            expected: expected_crc,
            computed: computed_crc,
        });
    }

    let mut cursor = 0usize;
    let op_id = read_str(payload, &mut cursor)?;
    let key = read_str(payload, &mut cursor)?;
    let tombstone = read_u8(payload, &mut cursor)? != 0;
    let lww_millis = read_u64(payload, &mut cursor)?;
    let value_len = read_i32(payload, &mut cursor)?;
    let value = if value_len < 0 {
        None
    } else {
        Some(read_bytes(payload, &mut cursor, value_len as usize)?.to_vec())
    };
    let clock = read_clock(payload, &mut cursor)?;

    let versioned = VersionedValue::from_parts(value, tombstone, clock, lww_millis)?;

    Ok((
        Record {
            op_id,
            key,
            value: versioned,
        },
        total,
    ))
}

use raw::*;

fn write_str(out: &mut Vec<u8>, s: &str) {
    raw::write_str(out, s);
}

fn write_clock(out: &mut Vec<u8>, clock: &VectorClock) {
    raw::write_clock(out, clock);
}

fn read_str(buf: &[u8], cursor: &mut usize) -> Result<String, CodecError> {
    raw::read_str(buf, cursor)
}

fn read_clock(buf: &[u8], cursor: &mut usize) -> Result<VectorClock, CodecError> {
    raw::read_clock(buf, cursor)
}

/// Low-level little-endian primitive readers/writers shared by this crate,
/// `glint-snapshot` (the snapshot file format is this same primitive
/// grammar, just wrapped differently), and `glint-antientropy` (the
/// canonical per-key digest input uses the same string/clock encoding so
/// every node produces byte-identical digests for identical state).
pub mod raw {
    use super::{CodecError, VectorClock};

    pub fn write_str(out: &mut Vec<u8>, s: &str) {
        out.extend_from_slice(&(s.len() as u32).to_le_bytes());
        out.extend_from_slice(s.as_bytes());
    }

    pub fn write_clock(out: &mut Vec<u8>, clock: &VectorClock) {
        let entries: Vec<(&str, u64)> = clock.entries().collect();
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for (id, counter) in entries {
            write_str(out, id);
            out.extend_from_slice(&counter.to_le_bytes());
        }
    }

    pub fn need(buf: &[u8], cursor: usize, len: usize) -> Result<(), CodecError> {
        if buf.len() < cursor + len {
            return Err(CodecError::Truncated {
                need: cursor + len,
                have: buf.len(),
            });
        }
        Ok(())
    }

    pub fn read_bytes<'a>(
        buf: &'a [u8],
        cursor: &mut usize,
        len: usize,
    ) -> Result<&'a [u8], CodecError> {
        need(buf, *cursor, len)?;
        let slice = &buf[*cursor..*cursor + len];
        *cursor += len;
        Ok(slice)
    }

    pub fn read_u8(buf: &[u8], cursor: &mut usize) -> Result<u8, CodecError> {
        Ok(read_bytes(buf, cursor, 1)?[0])
    }

    pub fn read_u32(buf: &[u8], cursor: &mut usize) -> Result<u32, CodecError> {
        let b = read_bytes(buf, cursor, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(buf: &[u8], cursor: &mut usize) -> Result<i32, CodecError> {
        Ok(read_u32(buf, cursor)? as i32)
    }

    pub fn read_u64(buf: &[u8], cursor: &mut usize) -> Result<u64, CodecError> {
        let b = read_bytes(buf, cursor, 8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_str(buf: &[u8], cursor: &mut usize) -> Result<String, CodecError> {
        let len = read_u32(buf, cursor)? as usize;
        let bytes = read_bytes(buf, cursor, len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    pub fn read_clock(buf: &[u8], cursor: &mut usize) -> Result<VectorClock, CodecError> {
        let count = read_u32(buf, cursor)? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let id = read_str(buf, cursor)?;
            let counter = read_u64(buf, cursor)?;
            entries.push((id, counter));
        }
        Ok(VectorClock::from_entries(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> VectorClock {
        VectorClock::from_entries([("node-a".to_owned(), 2), ("node-b".to_owned(), 1)])
    }

    #[test]
    fn round_trips_a_live_value() {
        let value = VersionedValue::live(b"hello".to_vec(), clock(), 12345);
        let bytes = encode("op-1", "key-1", &value);
        let (record, consumed) = decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(record.op_id, "op-1");
        assert_eq!(record.key, "key-1");
        assert_eq!(record.value, value);
    }

    #[test]
    fn round_trips_a_tombstone() {
        let value = VersionedValue::tombstone(clock(), 99);
        let bytes = encode("op-2", "key-2", &value);
        let (record, _) = decode(&bytes).unwrap();
        assert!(record.value.is_tombstone());
        assert_eq!(record.value.value(), None);
    }

    #[test]
    fn decode_reports_extra_trailing_bytes_as_consumed_length() {
        let value = VersionedValue::live(b"x".to_vec(), VectorClock::new(), 1);
        let mut bytes = encode("op", "k", &value);
        bytes.extend_from_slice(b"garbage-next-record");
        let (_, consumed) = decode(&bytes).unwrap();
        assert!(consumed < bytes.len());
    }

    #[test]
    fn rejects_bad_magic() {
        let value = VersionedValue::live(b"x".to_vec(), VectorClock::new(), 1);
        let mut bytes = encode("op", "k", &value);
        bytes[0] = b'X';
        assert!(matches!(decode(&bytes), Err(CodecError::BadMagic(_))));
    }

    #[test]
    fn rejects_corrupted_payload_via_crc() {
        let value = VersionedValue::live(b"x".to_vec(), VectorClock::new(), 1);
        let mut bytes = encode("op", "k", &value);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(decode(&bytes), Err(CodecError::CrcMismatch { .. })));
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(matches!(
            decode(&[0u8; 3]),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_truncated_payload() {
        let value = VersionedValue::live(b"hello world".to_vec(), clock(), 1);
        let bytes = encode("op", "k", &value);
        let short = &bytes[..bytes.len() - 3];
        assert!(matches!(decode(short), Err(CodecError::Truncated { .. })));
    }
}
