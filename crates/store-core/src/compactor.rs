//! Snapshot and pack compaction: bounds log growth without ever making the
//! write path unsafe.
//!
//! Compaction only ever *adds* files and reports which raw files the new
//! file subsumes. Deletion is the garbage collector's job and happens only
//! after the snapshot/pack write has returned, so a crash mid-compaction
//! leaves a directory that is merely larger than necessary, never lossy.

use crate::clock::VectorClock;
use crate::fs::FileSystem;
use crate::layout::{self, DocumentId, ParsedLogName};
use crate::manager::{OpenDocument, Result, StoreError};
use crate::record::{self, PackRecord, SnapshotRecord, UpdateRecord};
use crate::writer::WriterId;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Policy knobs for when and how aggressively to compact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionPolicy {
    /// Snapshot once this many updates accumulated since the last one
    pub snapshot_after_updates: usize,
    /// Snapshot when the last one is older than this, regardless of count
    pub min_snapshot_interval_ms: u64,
    /// Minimum contiguous run of one writer's raw updates worth packing
    pub pack_min_run: usize,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            snapshot_after_updates: 20,
            min_snapshot_interval_ms: 5 * 60 * 1000,
            pack_min_run: 8,
        }
    }
}

impl CompactionPolicy {
    /// Whether a new snapshot is due.
    pub fn should_snapshot(
        &self,
        updates_since_snapshot: usize,
        last_snapshot_ms: u64,
        now_ms: u64,
    ) -> bool {
        if updates_since_snapshot == 0 {
            return false;
        }
        if updates_since_snapshot >= self.snapshot_after_updates {
            return true;
        }
        last_snapshot_ms > 0
            && now_ms.saturating_sub(last_snapshot_ms) >= self.min_snapshot_interval_ms
    }
}

/// Result of writing a snapshot or pack.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    /// Filename of the newly written snapshot/pack
    pub written: String,
    /// Raw files now fully subsumed and *eligible* for deletion.
    /// The compactor never deletes; see [`crate::gc`].
    pub superseded: Vec<String>,
}

/// Pick the most advanced snapshot that is still `<=` the target clock.
///
/// A snapshot "from the future" relative to the reader's view (its clock not
/// dominated by the target) is never chosen. Among the eligible, the
/// greatest total sequence sum wins; name breaks exact ties so every
/// instance picks the same file.
pub fn select_best_snapshot<'a>(
    candidates: &'a [(String, SnapshotRecord)],
    target: &VectorClock,
) -> Option<&'a (String, SnapshotRecord)> {
    candidates
        .iter()
        .filter(|(_, snapshot)| target.dominates(&snapshot.clock))
        .max_by(|(name_a, a), (name_b, b)| {
            a.clock
                .total()
                .cmp(&b.clock.total())
                .then_with(|| name_a.cmp(name_b))
        })
}

/// Materialize the document's full state as a new snapshot file.
///
/// Returns the raw update/pack files the snapshot subsumes; they become
/// deletion-eligible only because the snapshot write already succeeded.
pub async fn write_snapshot<F: FileSystem>(
    fs: &F,
    doc: &OpenDocument,
) -> Result<CompactionOutcome> {
    let snapshot = SnapshotRecord {
        clock: doc.clock().clone(),
        timestamp_ms: crate::now_ms(),
        payload: doc.document()?.export_snapshot(),
    };

    let dir = doc.id().log_dir();
    let name = layout::snapshot_filename(
        doc.writer(),
        doc.clock().get(doc.writer()),
        snapshot.timestamp_ms,
    );
    fs.write_atomic(
        &format!("{}/{}", dir, name),
        &record::encode_snapshot_file(&snapshot),
    )
    .await?;

    let superseded = subsumed_raw_files(fs, &dir, &snapshot.clock, &name).await?;
    info!(doc = %doc.id(), file = %name, superseded = superseded.len(), "wrote snapshot");

    Ok(CompactionOutcome {
        written: name,
        superseded,
    })
}

/// Rewrite one writer's longest contiguous run of raw updates as a pack.
///
/// Returns `Ok(None)` when no run of at least `min_run` files exists. A
/// corrupt file terminates the run at the last clean member; it stays on
/// disk for the scanner to report.
pub async fn write_pack<F: FileSystem>(
    fs: &F,
    id: &DocumentId,
    writer: WriterId,
    min_run: usize,
) -> Result<Option<CompactionOutcome>> {
    let dir = id.log_dir();

    let mut raw: Vec<(String, u64)> = Vec::new();
    for entry in fs.list(&dir).await? {
        if entry.is_dir {
            continue;
        }
        if let Some(ParsedLogName::Update { writer: w, seq, .. }) =
            layout::parse_log_filename(&entry.name)
        {
            if w == writer {
                raw.push((entry.name, seq));
            }
        }
    }
    raw.sort_by_key(|(_, seq)| *seq);

    // Longest contiguous run anywhere in the sequence space
    let mut best: &[(String, u64)] = &[];
    let mut start = 0;
    for i in 1..=raw.len() {
        let run_broke = i == raw.len() || raw[i].1 != raw[i - 1].1 + 1;
        if run_broke {
            if i - start > best.len() {
                best = &raw[start..i];
            }
            start = i;
        }
    }

    if best.len() < min_run.max(2) {
        return Ok(None);
    }

    let mut updates: Vec<UpdateRecord> = Vec::new();
    let mut sources: Vec<String> = Vec::new();
    for (name, _) in best {
        let bytes = fs.read(&format!("{}/{}", dir, name)).await?;
        match record::decode_update_file(&bytes) {
            Ok(update) => {
                updates.push(update);
                sources.push(name.clone());
            }
            Err(e) => {
                // A pack must equal the concatenation of clean records;
                // stop the run here and leave the bad file for the scanner.
                warn!(file = %name, error = %e, "corrupt update terminates pack run");
                break;
            }
        }
    }
    if updates.len() < min_run.max(2) {
        return Ok(None);
    }

    let pack = PackRecord::from_updates(&updates).map_err(StoreError::Format)?;
    let name = layout::pack_filename(writer, pack.start_seq(), pack.end_seq());
    fs.write_atomic(&format!("{}/{}", dir, name), &record::encode_pack_file(&pack))
        .await?;

    info!(doc = %id, file = %name, members = sources.len(), "wrote pack");
    Ok(Some(CompactionOutcome {
        written: name,
        superseded: sources,
    }))
}

/// Raw update/pack files fully dominated by `clock`.
async fn subsumed_raw_files<F: FileSystem>(
    fs: &F,
    dir: &str,
    clock: &VectorClock,
    exclude: &str,
) -> Result<Vec<String>> {
    let mut subsumed = Vec::new();
    for entry in fs.list(dir).await? {
        if entry.is_dir || entry.name == exclude {
            continue;
        }
        match layout::parse_log_filename(&entry.name) {
            Some(ParsedLogName::Update { writer, seq, .. }) if seq <= clock.get(writer) => {
                subsumed.push(entry.name);
            }
            Some(ParsedLogName::Pack {
                writer, end_seq, ..
            }) if end_seq <= clock.get(writer) => {
                subsumed.push(entry.name);
            }
            _ => {}
        }
    }
    Ok(subsumed)
}
