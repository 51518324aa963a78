//! Versioned binary encoding for update, snapshot, and pack files.
//!
//! Every log file is one record wrapped in a self-describing envelope:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ magic: u32 LE        = 0x474C4B4E ("NKLG")               │
//! │ version: u8          = 1                                 │
//! │ kind: u8             = (1 update | 2 snapshot | 3 pack)  │
//! │ reserved: u16 LE     = 0                                 │
//! │ payload_len: u32 LE                                      │
//! ├──────────────────────────────────────────────────────────┤
//! │ payload: bincode-encoded record body                     │
//! ├──────────────────────────────────────────────────────────┤
//! │ checksum: u32 LE     = CRC32 of header + payload         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The checksum is verified before the body is handed to bincode, so a file
//! truncated or bit-rotted by the replication substrate fails fast with a
//! [`FormatError`] instead of producing a half-decoded record. Every decode
//! failure is scoped to its file; scanners log and skip.

use crate::clock::VectorClock;
use crate::writer::WriterId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Log file magic: "NKLG" read as little-endian u32
const MAGIC: u32 = 0x474C4B4E;

/// Current on-disk format version
pub const FORMAT_VERSION: u8 = 1;

/// Envelope bytes before the payload
const HEADER_SIZE: usize = 12;

/// Envelope bytes after the payload
const TRAILER_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("file too short to be a log record ({0} bytes)")]
    TooShort(usize),

    #[error("bad magic: {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown record kind: {0}")]
    UnknownKind(u8),

    #[error("expected {expected:?} record, found {found:?}")]
    WrongKind {
        expected: RecordKind,
        found: RecordKind,
    },

    #[error("truncated payload: header claims {claimed} bytes, {available} available")]
    Truncated { claimed: u32, available: usize },

    #[error("checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("malformed record body: {0}")]
    Body(String),

    #[error("invalid pack: {0}")]
    InvalidPack(String),
}

pub type Result<T> = std::result::Result<T, FormatError>;

/// Kind byte of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Update = 1,
    Snapshot = 2,
    Pack = 3,
}

impl RecordKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Update),
            2 => Some(Self::Snapshot),
            3 => Some(Self::Pack),
            _ => None,
        }
    }
}

/// One immutable CRDT delta from one writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub writer: WriterId,
    /// Per-writer sequence, starting at 1
    pub seq: u64,
    /// Wall-clock milliseconds; diagnostic only, never an ordering key
    pub timestamp_ms: u64,
    /// Opaque CRDT update bytes
    pub payload: Vec<u8>,
}

/// Full materialized state at a vector clock: a fast-forward base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub clock: VectorClock,
    pub timestamp_ms: u64,
    /// Opaque CRDT snapshot bytes
    pub payload: Vec<u8>,
}

/// One member of a pack: an update without the (shared) writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedUpdate {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub payload: Vec<u8>,
}

/// Ordered bundle of one writer's consecutive updates.
///
/// Logically equal to the concatenation of its members; a pack atomically
/// replaces the raw files it subsumes, so its invariants (single writer,
/// contiguous sequences) are hard errors rather than skip-and-continue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackRecord {
    pub writer: WriterId,
    pub updates: Vec<PackedUpdate>,
}

impl PackRecord {
    /// Bundle a run of update records, checking the pack invariants.
    pub fn from_updates(updates: &[UpdateRecord]) -> Result<Self> {
        let first = updates
            .first()
            .ok_or_else(|| FormatError::InvalidPack("empty pack".into()))?;
        let writer = first.writer;
        for u in updates {
            if u.writer != writer {
                return Err(FormatError::InvalidPack(format!(
                    "mixed writers: {} and {}",
                    writer, u.writer
                )));
            }
        }
        let pack = Self {
            writer,
            updates: updates
                .iter()
                .map(|u| PackedUpdate {
                    seq: u.seq,
                    timestamp_ms: u.timestamp_ms,
                    payload: u.payload.clone(),
                })
                .collect(),
        };
        validate_pack(&pack)?;
        Ok(pack)
    }

    pub fn start_seq(&self) -> u64 {
        self.updates.first().map(|u| u.seq).unwrap_or(0)
    }

    pub fn end_seq(&self) -> u64 {
        self.updates.last().map(|u| u.seq).unwrap_or(0)
    }
}

/// Check pack invariants: at least one member, sequence-contiguous.
pub fn validate_pack(pack: &PackRecord) -> Result<()> {
    let first = pack
        .updates
        .first()
        .ok_or_else(|| FormatError::InvalidPack("empty pack".into()))?;
    if first.seq == 0 {
        return Err(FormatError::InvalidPack("sequences start at 1".into()));
    }
    let mut expected = first.seq;
    for u in &pack.updates {
        if u.seq != expected {
            return Err(FormatError::InvalidPack(format!(
                "sequence gap: expected {}, found {}",
                expected, u.seq
            )));
        }
        expected += 1;
    }
    Ok(())
}

pub fn encode_update_file(record: &UpdateRecord) -> Vec<u8> {
    encode_file(RecordKind::Update, record)
}

pub fn decode_update_file(data: &[u8]) -> Result<UpdateRecord> {
    decode_file(RecordKind::Update, data)
}

pub fn encode_snapshot_file(record: &SnapshotRecord) -> Vec<u8> {
    encode_file(RecordKind::Snapshot, record)
}

pub fn decode_snapshot_file(data: &[u8]) -> Result<SnapshotRecord> {
    decode_file(RecordKind::Snapshot, data)
}

pub fn encode_pack_file(record: &PackRecord) -> Vec<u8> {
    encode_file(RecordKind::Pack, record)
}

pub fn decode_pack_file(data: &[u8]) -> Result<PackRecord> {
    let pack: PackRecord = decode_file(RecordKind::Pack, data)?;
    validate_pack(&pack)?;
    Ok(pack)
}

/// Peek at the kind byte without decoding the body.
pub fn peek_kind(data: &[u8]) -> Result<RecordKind> {
    check_envelope(data).map(|(kind, _)| kind)
}

fn encode_file<T: Serialize>(kind: RecordKind, body: &T) -> Vec<u8> {
    let payload = bincode::serialize(body).expect("record body serialization should not fail");

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + TRAILER_SIZE);
    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.push(FORMAT_VERSION);
    buf.push(kind as u8);
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);

    let checksum = crc32(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    buf
}

fn decode_file<T: for<'de> Deserialize<'de>>(expected: RecordKind, data: &[u8]) -> Result<T> {
    let (kind, payload) = check_envelope(data)?;
    if kind != expected {
        return Err(FormatError::WrongKind {
            expected,
            found: kind,
        });
    }
    bincode::deserialize(payload).map_err(|e| FormatError::Body(e.to_string()))
}

/// Verify magic, version, length and checksum; return (kind, payload).
fn check_envelope(data: &[u8]) -> Result<(RecordKind, &[u8])> {
    if data.len() < HEADER_SIZE + TRAILER_SIZE {
        return Err(FormatError::TooShort(data.len()));
    }

    let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(FormatError::BadMagic(magic));
    }

    let version = data[4];
    if version != FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }

    let kind = RecordKind::from_u8(data[5]).ok_or(FormatError::UnknownKind(data[5]))?;

    let claimed = u32::from_le_bytes(data[8..12].try_into().unwrap());
    let available = data.len() - HEADER_SIZE - TRAILER_SIZE;
    if claimed as usize != available {
        return Err(FormatError::Truncated { claimed, available });
    }

    let body_end = HEADER_SIZE + claimed as usize;
    let stored = u32::from_le_bytes(data[body_end..body_end + 4].try_into().unwrap());
    let computed = crc32(&data[..body_end]);
    if stored != computed {
        return Err(FormatError::ChecksumMismatch { stored, computed });
    }

    Ok((kind, &data[HEADER_SIZE..body_end]))
}

/// CRC32, ISO polynomial, computed in-crate.
fn crc32(data: &[u8]) -> u32 {
    const POLYNOMIAL: u32 = 0xEDB88320;

    let mut crc = 0xFFFFFFFF_u32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLYNOMIAL;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}
