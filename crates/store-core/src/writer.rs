//! WriterId: stable identifier for one application instance writing a log.
//!
//! Every device (or window) that appends to a shared sync directory owns a
//! WriterId; per-writer sequence numbers hang off it. Wraps a u64 (installed
//! as the Loro peer id) but displays as a 16-character hex string in
//! filenames and logs.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WriterIdError {
    #[error("Invalid writer ID format: expected 16 hex chars or legacy UUID")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// Identifier for one writer instance sharing a sync directory.
///
/// Ordered so it can key a `BTreeMap` (the vector clock) and so merge
/// application order `(writer, seq)` is deterministic across instances.
///
/// # Examples
/// ```
/// use store_core::WriterId;
///
/// let writer = WriterId::generate();
/// let parsed: WriterId = "a1b2c3d4e5f67890".parse().unwrap();
/// assert_eq!(parsed.as_u64(), 0xa1b2c3d4e5f67890);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WriterId(u64);

impl WriterId {
    /// Generate a new random writer ID. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    /// Derive a writer ID from a legacy instance UUID.
    ///
    /// The pre-log storage layout named instances by UUID; migration maps
    /// those names onto writer IDs with a hash that is stable across Rust
    /// versions and instances, so two instances migrating the same directory
    /// agree on the attribution.
    pub fn from_legacy_uuid(uuid: &str) -> Self {
        Self(fnv1a_hash(&uuid.to_ascii_lowercase()))
    }

    /// Get the underlying u64 value (for the Loro peer id).
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for WriterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for WriterId {
    type Err = WriterIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Current format: 16 hex chars
        if s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            let id = u64::from_str_radix(&s.to_ascii_lowercase(), 16)
                .map_err(WriterIdError::InvalidHex)?;
            return Ok(Self(id));
        }

        // Legacy format: UUID (36 chars with dashes at positions 8, 13, 18, 23)
        if is_uuid_shaped(s) {
            return Ok(Self::from_legacy_uuid(s));
        }

        Err(WriterIdError::InvalidFormat)
    }
}

impl From<u64> for WriterId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<WriterId> for u64 {
    fn from(writer: WriterId) -> u64 {
        writer.0
    }
}

// Serialize as hex string for consistency in filenames, logs, JSON
impl serde::Serialize for WriterId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for WriterId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Check the dash layout of a UUID without pulling in a parser.
pub(crate) fn is_uuid_shaped(s: &str) -> bool {
    if s.len() != 36 {
        return false;
    }
    let bytes = s.as_bytes();
    if bytes[8] != b'-' || bytes[13] != b'-' || bytes[18] != b'-' || bytes[23] != b'-' {
        return false;
    }
    s.bytes()
        .enumerate()
        .all(|(i, b)| matches!(i, 8 | 13 | 18 | 23) || b.is_ascii_hexdigit())
}

/// FNV-1a hash for legacy UUID mapping.
/// Stable across Rust versions (unlike DefaultHasher).
fn fnv1a_hash(s: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
