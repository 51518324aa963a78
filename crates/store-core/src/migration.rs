//! Migration from the legacy one-file-per-update layout to the log format.
//!
//! The legacy layout kept each update as `updates/<uuid>-<ts>-<seq>.yjson`,
//! where the payload is a JSON number array of the raw CRDT bytes and the
//! UUID names the writing instance. Migration rewrites those as v1 update
//! records under `logs/`.
//!
//! Safety properties, because a not-yet-upgraded instance may still be
//! writing the legacy layout into the same shared folder:
//! - re-runnable: an already-converted file is recognized and skipped, so
//!   two instances migrating concurrently converge on identical log files
//!   (writer attribution and filenames are derived deterministically);
//! - per-file errors accumulate into the report instead of aborting;
//! - legacy files are never deleted here. [`cleanup_legacy_files`] is a
//!   separate, explicit step that removes only files whose converted
//!   counterpart exists and decodes.

use crate::fs::FileSystem;
use crate::gc::list_documents;
use crate::layout::{self, DocumentId, ParsedLegacyName};
use crate::manager::Result;
use crate::record::{self, UpdateRecord};
use serde::Serialize;
use tracing::{info, warn};

/// One legacy file that could not be migrated.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationFileError {
    pub file: String,
    pub message: String,
}

/// Outcome of migrating one document directory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    /// Legacy files examined
    pub files_processed: usize,
    /// Legacy files newly converted this run
    pub files_migrated: usize,
    pub errors: Vec<MigrationFileError>,
}

/// Outcome of the explicit legacy cleanup step.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub files_deleted: usize,
    pub files_kept: usize,
}

/// Migration of one document, named for the aggregate report.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentMigration {
    pub document: String,
    pub report: MigrationReport,
}

/// Aggregate over a whole sync directory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageMigrationReport {
    pub documents: Vec<DocumentMigration>,
}

impl StorageMigrationReport {
    pub fn files_migrated(&self) -> usize {
        self.documents.iter().map(|d| d.report.files_migrated).sum()
    }

    pub fn error_count(&self) -> usize {
        self.documents.iter().map(|d| d.report.errors.len()).sum()
    }
}

/// Whether this document still has legacy files to migrate.
pub async fn check_migration_needed<F: FileSystem>(fs: &F, id: &DocumentId) -> Result<bool> {
    let dir = id.legacy_dir();
    if !fs.exists(&dir).await? {
        return Ok(false);
    }
    let suffix = format!(".{}", layout::LEGACY_EXT);
    Ok(fs
        .list(&dir)
        .await?
        .iter()
        .any(|e| !e.is_dir && e.name.ends_with(&suffix)))
}

/// Rewrite this document's legacy files as v1 update records.
pub async fn migrate_updates<F: FileSystem>(fs: &F, id: &DocumentId) -> Result<MigrationReport> {
    let mut report = MigrationReport::default();
    let legacy_dir = id.legacy_dir();
    if !fs.exists(&legacy_dir).await? {
        return Ok(report);
    }

    let suffix = format!(".{}", layout::LEGACY_EXT);
    let mut files: Vec<(String, Option<ParsedLegacyName>)> = fs
        .list(&legacy_dir)
        .await?
        .into_iter()
        .filter(|e| !e.is_dir && e.name.ends_with(&suffix))
        .map(|e| {
            let parsed = layout::parse_legacy_filename(&e.name);
            (e.name, parsed)
        })
        .collect();

    // Replay order for the rewrite; the new filenames carry the same
    // metadata, so later readers do not depend on this.
    files.sort_by_key(|(name, parsed)| match parsed {
        Some(p) => (p.timestamp_ms, p.seq, name.clone()),
        None => (u64::MAX, u64::MAX, name.clone()),
    });

    let log_dir = id.log_dir();
    fs.mkdir(&log_dir).await?;

    for (name, parsed) in files {
        report.files_processed += 1;

        let Some(parsed) = parsed else {
            report.errors.push(MigrationFileError {
                file: name,
                message: "unrecognized legacy filename".into(),
            });
            continue;
        };

        let target = layout::update_filename(parsed.writer, parsed.seq, parsed.timestamp_ms);
        let target_path = format!("{}/{}", log_dir, target);
        if fs.exists(&target_path).await? {
            // Already converted, by us or by another instance
            continue;
        }

        let bytes = match fs.read(&format!("{}/{}", legacy_dir, name)).await {
            Ok(bytes) => bytes,
            Err(e) => {
                report.errors.push(MigrationFileError {
                    file: name,
                    message: e.to_string(),
                });
                continue;
            }
        };

        // Legacy payloads are JSON number arrays of the raw CRDT bytes
        let payload: Vec<u8> = match serde_json::from_slice(&bytes) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(file = %name, error = %e, "legacy payload unreadable");
                report.errors.push(MigrationFileError {
                    file: name,
                    message: format!("invalid legacy payload: {}", e),
                });
                continue;
            }
        };

        let update = UpdateRecord {
            writer: parsed.writer,
            seq: parsed.seq,
            timestamp_ms: parsed.timestamp_ms,
            payload,
        };
        if let Err(e) = fs
            .write_atomic(&target_path, &record::encode_update_file(&update))
            .await
        {
            report.errors.push(MigrationFileError {
                file: name,
                message: e.to_string(),
            });
            continue;
        }
        report.files_migrated += 1;
    }

    if report.files_migrated > 0 || !report.errors.is_empty() {
        info!(
            doc = %id,
            migrated = report.files_migrated,
            errors = report.errors.len(),
            "migrated legacy updates"
        );
    }
    Ok(report)
}

/// Delete legacy files whose converted counterpart exists and decodes.
///
/// Explicit and never automatic: run it only once every instance sharing
/// the directory has been upgraded. Files this run cannot prove converted
/// stay behind.
pub async fn cleanup_legacy_files<F: FileSystem>(fs: &F, id: &DocumentId) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();
    let legacy_dir = id.legacy_dir();
    if !fs.exists(&legacy_dir).await? {
        return Ok(report);
    }

    let suffix = format!(".{}", layout::LEGACY_EXT);
    let log_dir = id.log_dir();

    for entry in fs.list(&legacy_dir).await? {
        if entry.is_dir || !entry.name.ends_with(&suffix) {
            continue;
        }

        let converted = match layout::parse_legacy_filename(&entry.name) {
            Some(parsed) => {
                let target = format!(
                    "{}/{}",
                    log_dir,
                    layout::update_filename(parsed.writer, parsed.seq, parsed.timestamp_ms)
                );
                match fs.read(&target).await {
                    Ok(bytes) => record::decode_update_file(&bytes).is_ok(),
                    Err(_) => false,
                }
            }
            None => false,
        };

        if converted {
            fs.delete(&format!("{}/{}", legacy_dir, entry.name)).await?;
            report.files_deleted += 1;
        } else {
            report.files_kept += 1;
        }
    }
    Ok(report)
}

/// Migrate every document in the sync directory that still needs it.
pub async fn migrate_storage_directory<F: FileSystem>(fs: &F) -> Result<StorageMigrationReport> {
    let mut report = StorageMigrationReport::default();
    for id in list_documents(fs).await? {
        if !check_migration_needed(fs, &id).await? {
            continue;
        }
        let doc_report = migrate_updates(fs, &id).await?;
        report.documents.push(DocumentMigration {
            document: id.to_string(),
            report: doc_report,
        });
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::NoteDoc;
    use crate::fs::InMemoryFs;
    use crate::manager::OpenDocument;
    use crate::writer::WriterId;

    const LEGACY_UUID: &str = "550e8400-e29b-41d4-a716-446655440000";

    fn note_id() -> DocumentId {
        DocumentId::note("note-1").unwrap()
    }

    /// Write a legacy update file the way the old storage layer did:
    /// JSON number array of the CRDT bytes.
    async fn write_legacy(fs: &InMemoryFs, id: &DocumentId, seq: u64, text: &str) -> String {
        let mut editor = NoteDoc::create("note-1", WriterId::from(0x400 + seq));
        editor.set_paragraphs(&[text]).unwrap();
        let payload = editor.encode_state_as_update();

        let name = format!("{}-{}-{}.yjson", LEGACY_UUID, 1690000000000u64 + seq, seq);
        let json = serde_json::to_vec(&payload).unwrap();
        fs.write_atomic(&format!("{}/{}", id.legacy_dir(), name), &json)
            .await
            .unwrap();
        name
    }

    #[tokio::test]
    async fn test_check_migration_needed() {
        let fs = InMemoryFs::new();
        assert!(!check_migration_needed(&fs, &note_id()).await.unwrap());

        write_legacy(&fs, &note_id(), 1, "old").await;
        assert!(check_migration_needed(&fs, &note_id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_migrate_then_open() {
        let fs = InMemoryFs::new();
        for (seq, text) in [(1, "first"), (2, "second"), (3, "third")] {
            write_legacy(&fs, &note_id(), seq, text).await;
        }

        let report = migrate_updates(&fs, &note_id()).await.unwrap();
        assert_eq!(report.files_processed, 3);
        assert_eq!(report.files_migrated, 3);
        assert!(report.errors.is_empty());

        let doc = OpenDocument::open(&fs, WriterId::from(0xC), note_id())
            .await
            .unwrap();
        let legacy_writer = WriterId::from_legacy_uuid(LEGACY_UUID);
        assert_eq!(doc.clock().get(legacy_writer), 3);
        let text = doc.document().unwrap().extract_text();
        assert!(text.contains("first") && text.contains("third"));
    }

    #[tokio::test]
    async fn test_migration_is_idempotent() {
        let fs = InMemoryFs::new();
        for seq in 1..=3 {
            write_legacy(&fs, &note_id(), seq, "content").await;
        }

        let first = migrate_updates(&fs, &note_id()).await.unwrap();
        assert_eq!(first.files_migrated, 3);

        let log_dir = note_id().log_dir();
        let mut before: Vec<String> = fs
            .list(&log_dir)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        before.sort();

        // Second run converts nothing and leaves the log untouched
        let second = migrate_updates(&fs, &note_id()).await.unwrap();
        assert_eq!(second.files_processed, 3);
        assert_eq!(second.files_migrated, 0);
        assert!(second.errors.is_empty());

        let mut after: Vec<String> = fs
            .list(&log_dir)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        after.sort();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_bad_legacy_file_is_recorded_not_fatal() {
        let fs = InMemoryFs::new();
        write_legacy(&fs, &note_id(), 1, "good").await;

        // Not JSON at all
        let bad = format!("{}-1690000000005-2.yjson", LEGACY_UUID);
        fs.write_atomic(&format!("{}/{}", note_id().legacy_dir(), bad), b"\x00\x01")
            .await
            .unwrap();
        // Name the parser cannot place
        fs.write_atomic(
            &format!("{}/strange.yjson", note_id().legacy_dir()),
            b"[]",
        )
        .await
        .unwrap();

        let report = migrate_updates(&fs, &note_id()).await.unwrap();
        assert_eq!(report.files_processed, 3);
        assert_eq!(report.files_migrated, 1);
        assert_eq!(report.errors.len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_deletes_only_converted() {
        let fs = InMemoryFs::new();
        let good = write_legacy(&fs, &note_id(), 1, "good").await;

        let bad = format!("{}-1690000000005-2.yjson", LEGACY_UUID);
        fs.write_atomic(&format!("{}/{}", note_id().legacy_dir(), bad), b"not json")
            .await
            .unwrap();

        migrate_updates(&fs, &note_id()).await.unwrap();
        let report = cleanup_legacy_files(&fs, &note_id()).await.unwrap();

        assert_eq!(report.files_deleted, 1);
        assert_eq!(report.files_kept, 1);
        let legacy_dir = note_id().legacy_dir();
        assert!(!fs
            .exists(&format!("{}/{}", legacy_dir, good))
            .await
            .unwrap());
        assert!(fs.exists(&format!("{}/{}", legacy_dir, bad)).await.unwrap());
    }

    #[tokio::test]
    async fn test_migrate_storage_directory_walks_all_docs() {
        let fs = InMemoryFs::new();
        write_legacy(&fs, &note_id(), 1, "note content").await;
        write_legacy(&fs, &DocumentId::FolderTree, 1, "tree content").await;

        let report = migrate_storage_directory(&fs).await.unwrap();
        assert_eq!(report.documents.len(), 2);
        assert_eq!(report.files_migrated(), 2);
        assert_eq!(report.error_count(), 0);

        // Second run: nothing left to do
        let report = migrate_storage_directory(&fs).await.unwrap();
        assert_eq!(report.files_migrated(), 0);
    }
}
