//! On-disk layout of a sync directory and the log filename convention.
//!
//! Every log file encodes its metadata in its name so that a directory
//! listing alone reconstructs merge order without opening a single file:
//!
//! - update:   `<writer>-<seq>-<ts>.crdtlog`
//! - snapshot: `snapshot-<writer>-<seq>-<ts>.snap`
//! - pack:     `pack-<writer>-<rangeStart>-<rangeEnd>.pack`
//!
//! `<writer>` is the 16-hex WriterId, `<ts>` milliseconds since epoch.
//! Parsing is total: any name that doesn't match yields `None`, so scans of
//! a folder shared with cloud-storage clients silently drop whatever else
//! lands there (conflict copies, `.DS_Store`, half-synced temp names).

use crate::writer::{is_uuid_shaped, WriterId};

/// Extension for update log segments
pub const UPDATE_EXT: &str = "crdtlog";
/// Extension for full-state snapshots
pub const SNAPSHOT_EXT: &str = "snap";
/// Extension for compacted packs
pub const PACK_EXT: &str = "pack";
/// Extension for legacy one-file-per-update records
pub const LEGACY_EXT: &str = "yjson";

const SNAPSHOT_PREFIX: &str = "snapshot-";
const PACK_PREFIX: &str = "pack-";

/// Logical document inside a sync directory.
///
/// A note carries its own id; the folder tree is a singleton per directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocumentId {
    Note(String),
    FolderTree,
}

impl DocumentId {
    /// Directory holding the append-only log for this document.
    pub fn log_dir(&self) -> String {
        match self {
            DocumentId::Note(id) => format!("notes/{}/logs", id),
            DocumentId::FolderTree => "folders/logs".to_string(),
        }
    }

    /// Directory holding legacy one-file-per-update records, if any.
    pub fn legacy_dir(&self) -> String {
        match self {
            DocumentId::Note(id) => format!("notes/{}/updates", id),
            DocumentId::FolderTree => "folders/updates".to_string(),
        }
    }

    /// Validate a note id before it is spliced into a path.
    ///
    /// Rejects separators, traversal, control characters and absurd lengths;
    /// the id otherwise remains opaque (UUIDs in practice).
    pub fn note(id: impl Into<String>) -> Option<DocumentId> {
        let id = id.into();
        if id.is_empty() || id.len() > 128 {
            return None;
        }
        if id.contains('/') || id.contains('\\') || id.contains("..") {
            return None;
        }
        if id.chars().any(|c| c.is_control()) {
            return None;
        }
        Some(DocumentId::Note(id))
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentId::Note(id) => write!(f, "note:{}", id),
            DocumentId::FolderTree => write!(f, "folders"),
        }
    }
}

/// Metadata reconstructed from a log filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLogName {
    Update {
        writer: WriterId,
        seq: u64,
        timestamp_ms: u64,
    },
    Snapshot {
        writer: WriterId,
        seq: u64,
        timestamp_ms: u64,
    },
    Pack {
        writer: WriterId,
        start_seq: u64,
        end_seq: u64,
    },
}

impl ParsedLogName {
    pub fn writer(&self) -> WriterId {
        match self {
            ParsedLogName::Update { writer, .. }
            | ParsedLogName::Snapshot { writer, .. }
            | ParsedLogName::Pack { writer, .. } => *writer,
        }
    }
}

/// Filename for an update log segment.
pub fn update_filename(writer: WriterId, seq: u64, timestamp_ms: u64) -> String {
    format!("{}-{}-{}.{}", writer, seq, timestamp_ms, UPDATE_EXT)
}

/// Filename for a full-state snapshot.
///
/// `seq` is the writing instance's own incorporated sequence at snapshot
/// time; selection always decodes the embedded clock, the name is
/// diagnostic.
pub fn snapshot_filename(writer: WriterId, seq: u64, timestamp_ms: u64) -> String {
    format!(
        "{}{}-{}-{}.{}",
        SNAPSHOT_PREFIX, writer, seq, timestamp_ms, SNAPSHOT_EXT
    )
}

/// Filename for a compacted pack covering `[start_seq, end_seq]`.
pub fn pack_filename(writer: WriterId, start_seq: u64, end_seq: u64) -> String {
    format!(
        "{}{}-{}-{}.{}",
        PACK_PREFIX, writer, start_seq, end_seq, PACK_EXT
    )
}

/// Parse a log filename back into its metadata.
///
/// Total: returns `None` on anything that is not exactly a well-formed log
/// name. Never panics.
pub fn parse_log_filename(name: &str) -> Option<ParsedLogName> {
    if let Some(rest) = name.strip_prefix(SNAPSHOT_PREFIX) {
        let rest = rest.strip_suffix(&format!(".{}", SNAPSHOT_EXT))?;
        let (writer, a, b) = split_triple(rest)?;
        return Some(ParsedLogName::Snapshot {
            writer,
            seq: a,
            timestamp_ms: b,
        });
    }

    if let Some(rest) = name.strip_prefix(PACK_PREFIX) {
        let rest = rest.strip_suffix(&format!(".{}", PACK_EXT))?;
        let (writer, start_seq, end_seq) = split_triple(rest)?;
        if start_seq == 0 || end_seq < start_seq {
            return None;
        }
        return Some(ParsedLogName::Pack {
            writer,
            start_seq,
            end_seq,
        });
    }

    let rest = name.strip_suffix(&format!(".{}", UPDATE_EXT))?;
    let (writer, seq, timestamp_ms) = split_triple(rest)?;
    if seq == 0 {
        return None;
    }
    Some(ParsedLogName::Update {
        writer,
        seq,
        timestamp_ms,
    })
}

/// Split `<writer>-<u64>-<u64>` where writer is exactly 16 hex chars.
fn split_triple(s: &str) -> Option<(WriterId, u64, u64)> {
    let mut parts = s.split('-');
    let writer = parts.next()?;
    let a = parts.next()?;
    let b = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    if writer.len() != 16 {
        return None;
    }
    let writer: WriterId = writer.parse().ok()?;
    let a: u64 = a.parse().ok()?;
    let b: u64 = b.parse().ok()?;
    Some((writer, a, b))
}

/// Metadata from a legacy `.yjson` filename: `<instanceUuid>-<ts>-<seq>.yjson`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLegacyName {
    pub writer: WriterId,
    pub timestamp_ms: u64,
    pub seq: u64,
}

/// Parse a legacy filename. Total, like [`parse_log_filename`].
pub fn parse_legacy_filename(name: &str) -> Option<ParsedLegacyName> {
    let rest = name.strip_suffix(&format!(".{}", LEGACY_EXT))?;

    // The UUID itself contains dashes, so peel ts and seq off the right.
    let (rest, seq) = rest.rsplit_once('-')?;
    let (uuid, ts) = rest.rsplit_once('-')?;
    if !is_uuid_shaped(uuid) {
        return None;
    }
    let seq: u64 = seq.parse().ok()?;
    let timestamp_ms: u64 = ts.parse().ok()?;
    if seq == 0 {
        return None;
    }
    Some(ParsedLegacyName {
        writer: WriterId::from_legacy_uuid(&uuid.to_ascii_lowercase()),
        timestamp_ms,
        seq,
    })
}
