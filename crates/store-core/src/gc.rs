//! Garbage collection of log files provably subsumed by a retained snapshot.
//!
//! Planning is a pure function of the scanned directory state and the
//! config; applying the plan is the only side effect. The planner never
//! deletes the most advanced usable snapshot, never deletes an update or
//! pack the retained snapshot does not dominate, and keeps anything it
//! cannot prove subsumed (including undecodable snapshots). Running GC twice
//! with no intervening writes is a no-op.

use crate::clock::VectorClock;
use crate::fs::FileSystem;
use crate::layout::{self, DocumentId, ParsedLogName};
use crate::manager::Result;
use crate::record;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Retention policy for the collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// How many usable snapshots to retain per document (min 1)
    pub keep_snapshots: usize,
    /// Never delete files younger than this
    pub min_age_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            keep_snapshots: 2,
            min_age_ms: 10 * 60 * 1000,
        }
    }
}

/// What one GC run reclaimed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GcStats {
    pub documents_scanned: usize,
    pub files_deleted: usize,
    pub bytes_reclaimed: u64,
    pub files_kept: usize,
}

impl GcStats {
    fn absorb(&mut self, other: &GcStats) {
        self.documents_scanned += other.documents_scanned;
        self.files_deleted += other.files_deleted;
        self.bytes_reclaimed += other.bytes_reclaimed;
        self.files_kept += other.files_kept;
    }
}

/// One log file as seen by the GC scanner.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub name: String,
    pub parsed: ParsedLogName,
    pub size: u64,
    pub mtime_ms: u64,
    /// Decoded clock for snapshot files; `None` means undecodable
    pub snapshot_clock: Option<VectorClock>,
}

/// The planner's verdict for one directory.
#[derive(Debug, Clone, Default)]
pub struct GcPlan {
    pub delete: Vec<String>,
    pub bytes: u64,
    pub kept: usize,
}

/// Decide which files of one document are safe to delete.
///
/// Pure function of `(files, config, now_ms)`.
pub fn plan_gc(files: &[ScannedFile], config: &GcConfig, now_ms: u64) -> GcPlan {
    let mut plan = GcPlan::default();

    // Rank usable snapshots: most history first, name breaks ties
    let mut snapshots: Vec<&ScannedFile> = files
        .iter()
        .filter(|f| f.snapshot_clock.is_some())
        .collect();
    snapshots.sort_by(|a, b| {
        let ta = a.snapshot_clock.as_ref().unwrap().total();
        let tb = b.snapshot_clock.as_ref().unwrap().total();
        tb.cmp(&ta).then_with(|| b.name.cmp(&a.name))
    });

    let keep = config.keep_snapshots.max(1);
    let Some(best) = snapshots.first() else {
        // Nothing proves subsumption; keep everything
        plan.kept = files.len();
        return plan;
    };
    let retained_clock = best.snapshot_clock.clone().unwrap();
    let retained: Vec<&str> = snapshots
        .iter()
        .take(keep)
        .map(|f| f.name.as_str())
        .collect();

    let aged = |f: &ScannedFile| now_ms.saturating_sub(f.mtime_ms) >= config.min_age_ms;

    for file in files {
        let deletable = match &file.parsed {
            ParsedLogName::Update { writer, seq, .. } => {
                *seq <= retained_clock.get(*writer) && aged(file)
            }
            ParsedLogName::Pack {
                writer, end_seq, ..
            } => *end_seq <= retained_clock.get(*writer) && aged(file),
            ParsedLogName::Snapshot { .. } => {
                !retained.contains(&file.name.as_str())
                    && file
                        .snapshot_clock
                        .as_ref()
                        .is_some_and(|clock| retained_clock.dominates(clock))
                    && aged(file)
            }
        };

        if deletable {
            plan.bytes += file.size;
            plan.delete.push(file.name.clone());
        } else {
            plan.kept += 1;
        }
    }
    plan
}

/// Scan one document's log directory into the planner's input.
pub async fn scan_doc_dir<F: FileSystem>(fs: &F, dir: &str) -> Result<Vec<ScannedFile>> {
    let mut files = Vec::new();
    for entry in fs.list(dir).await? {
        if entry.is_dir {
            continue;
        }
        let Some(parsed) = layout::parse_log_filename(&entry.name) else {
            continue;
        };

        let path = format!("{}/{}", dir, entry.name);
        let stat = fs.stat(&path).await?;

        let snapshot_clock = if matches!(parsed, ParsedLogName::Snapshot { .. }) {
            match fs.read(&path).await {
                Ok(bytes) => match record::decode_snapshot_file(&bytes) {
                    Ok(snapshot) => Some(snapshot.clock),
                    Err(e) => {
                        warn!(file = %entry.name, error = %e, "undecodable snapshot kept");
                        None
                    }
                },
                Err(e) => {
                    warn!(file = %entry.name, error = %e, "unreadable snapshot kept");
                    None
                }
            }
        } else {
            None
        };

        files.push(ScannedFile {
            name: entry.name,
            parsed,
            size: stat.size,
            mtime_ms: stat.mtime_millis,
            snapshot_clock,
        });
    }
    Ok(files)
}

/// Collect one document directory.
pub async fn gc_doc_dir<F: FileSystem>(fs: &F, dir: &str, config: &GcConfig) -> Result<GcStats> {
    let files = scan_doc_dir(fs, dir).await?;
    let plan = plan_gc(&files, config, crate::now_ms());

    let mut stats = GcStats {
        documents_scanned: 1,
        files_kept: plan.kept,
        ..Default::default()
    };
    for name in &plan.delete {
        match fs.delete(&format!("{}/{}", dir, name)).await {
            Ok(()) => stats.files_deleted += 1,
            Err(e) => {
                // Another instance may have collected it first
                debug!(file = %name, error = %e, "gc delete skipped");
            }
        }
    }
    stats.bytes_reclaimed = plan.bytes;
    if stats.files_deleted > 0 {
        info!(dir, deleted = stats.files_deleted, bytes = stats.bytes_reclaimed, "gc reclaimed");
    }
    Ok(stats)
}

/// Run garbage collection across every document in a sync directory.
pub async fn run_gc<F: FileSystem>(fs: &F, config: &GcConfig) -> Result<GcStats> {
    let mut stats = GcStats::default();

    for id in list_documents(fs).await? {
        let dir = id.log_dir();
        if !fs.exists(&dir).await? {
            continue;
        }
        stats.absorb(&gc_doc_dir(fs, &dir, config).await?);
    }
    Ok(stats)
}

/// Every document with a log directory in this sync directory.
pub async fn list_documents<F: FileSystem>(fs: &F) -> Result<Vec<DocumentId>> {
    let mut ids = vec![DocumentId::FolderTree];
    if fs.exists("notes").await? {
        for entry in fs.list("notes").await? {
            if !entry.is_dir {
                continue;
            }
            if let Some(id) = DocumentId::note(entry.name) {
                ids.push(id);
            }
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::WriterId;

    fn w(n: u64) -> WriterId {
        WriterId::from(n)
    }

    fn update_file(writer: u64, seq: u64) -> ScannedFile {
        ScannedFile {
            name: layout::update_filename(w(writer), seq, seq),
            parsed: ParsedLogName::Update {
                writer: w(writer),
                seq,
                timestamp_ms: seq,
            },
            size: 100,
            mtime_ms: 0,
            snapshot_clock: None,
        }
    }

    fn snapshot_file(name: &str, entries: &[(u64, u64)]) -> ScannedFile {
        ScannedFile {
            name: name.to_string(),
            parsed: ParsedLogName::Snapshot {
                writer: w(1),
                seq: 0,
                timestamp_ms: 0,
            },
            size: 500,
            mtime_ms: 0,
            snapshot_clock: Some(entries.iter().map(|(a, b)| (w(*a), *b)).collect()),
        }
    }

    fn config() -> GcConfig {
        GcConfig {
            keep_snapshots: 1,
            min_age_ms: 0,
        }
    }

    #[test]
    fn test_plan_without_snapshot_deletes_nothing() {
        let files = vec![update_file(1, 1), update_file(1, 2)];
        let plan = plan_gc(&files, &config(), 1000);
        assert!(plan.delete.is_empty());
        assert_eq!(plan.kept, 2);
    }

    #[test]
    fn test_plan_deletes_only_subsumed_updates() {
        let files = vec![
            snapshot_file("s1.snap", &[(1, 2)]),
            update_file(1, 1),
            update_file(1, 2),
            update_file(1, 3), // beyond the snapshot
            update_file(2, 1), // other writer, not covered
        ];
        let plan = plan_gc(&files, &config(), 1000);
        assert_eq!(plan.delete.len(), 2);
        assert!(plan.delete.contains(&update_file(1, 1).name));
        assert!(plan.delete.contains(&update_file(1, 2).name));
    }

    #[test]
    fn test_plan_never_deletes_best_snapshot() {
        let files = vec![
            snapshot_file("old.snap", &[(1, 2)]),
            snapshot_file("new.snap", &[(1, 5)]),
        ];
        let plan = plan_gc(&files, &config(), 1000);
        assert_eq!(plan.delete, vec!["old.snap".to_string()]);
    }

    #[test]
    fn test_plan_keeps_configured_snapshot_count() {
        let files = vec![
            snapshot_file("a.snap", &[(1, 2)]),
            snapshot_file("b.snap", &[(1, 5)]),
            snapshot_file("c.snap", &[(1, 9)]),
        ];
        let cfg = GcConfig {
            keep_snapshots: 2,
            min_age_ms: 0,
        };
        let plan = plan_gc(&files, &cfg, 1000);
        assert_eq!(plan.delete, vec!["a.snap".to_string()]);
    }

    #[test]
    fn test_plan_keeps_incomparable_snapshot() {
        // A concurrent snapshot the best one does not dominate must survive.
        let files = vec![
            snapshot_file("best.snap", &[(1, 9)]),
            snapshot_file("sideways.snap", &[(2, 4)]),
        ];
        let plan = plan_gc(&files, &config(), 1000);
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn test_plan_keeps_undecodable_snapshot() {
        let mut corrupt = snapshot_file("corrupt.snap", &[]);
        corrupt.snapshot_clock = None;
        let files = vec![snapshot_file("best.snap", &[(1, 9)]), corrupt];
        let plan = plan_gc(&files, &config(), 1000);
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn test_plan_respects_min_age() {
        let mut fresh = update_file(1, 1);
        fresh.mtime_ms = 900;
        let files = vec![snapshot_file("s.snap", &[(1, 5)]), fresh];

        let cfg = GcConfig {
            keep_snapshots: 1,
            min_age_ms: 500,
        };
        // Only 100ms old: kept
        let plan = plan_gc(&files, &cfg, 1000);
        assert!(plan.delete.is_empty());
        // 600ms old: collected
        let plan = plan_gc(&files, &cfg, 1500);
        assert_eq!(plan.delete.len(), 1);
    }

    #[test]
    fn test_plan_deletes_subsumed_pack() {
        let pack = ScannedFile {
            name: layout::pack_filename(w(1), 1, 4),
            parsed: ParsedLogName::Pack {
                writer: w(1),
                start_seq: 1,
                end_seq: 4,
            },
            size: 300,
            mtime_ms: 0,
            snapshot_clock: None,
        };
        let files = vec![snapshot_file("s.snap", &[(1, 5)]), pack];
        let plan = plan_gc(&files, &config(), 1000);
        assert_eq!(plan.delete.len(), 1);
        assert_eq!(plan.bytes, 300);
    }

    #[test]
    fn test_plan_is_reentrant() {
        let files = vec![
            snapshot_file("s.snap", &[(1, 2)]),
            update_file(1, 1),
            update_file(1, 2),
        ];
        let plan = plan_gc(&files, &config(), 1000);
        assert_eq!(plan.delete.len(), 2);

        // Second run over the surviving files deletes nothing
        let survivors: Vec<ScannedFile> = files
            .into_iter()
            .filter(|f| !plan.delete.contains(&f.name))
            .collect();
        let second = plan_gc(&survivors, &config(), 2000);
        assert!(second.delete.is_empty());
    }
}
