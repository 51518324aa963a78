//! DocStore: the facade the embedding app holds for one sync directory.
//!
//! Owns the filesystem adapter, the local writer identity, the compaction
//! policy, and the registry of open documents. The registry is an explicit
//! object owned by the app's session (created at startup, dropped at
//! shutdown), never ambient static state.
//!
//! Concurrency contract: all mutation goes through `&mut self`; the app
//! serializes calls per store. Directory scans and merges can run on a
//! background task while edits queue behind the borrow.

use crate::compactor::{self, CompactionOutcome, CompactionPolicy};
use crate::document::FolderEntry;
use crate::events::{EventBus, StoreEvent};
use crate::fs::FileSystem;
use crate::gc::{self, GcConfig, GcStats};
use crate::layout::DocumentId;
use crate::manager::{AppendOutcome, OpenDocument, Result, StoreError};
use crate::migration::{self, StorageMigrationReport};
use crate::writer::WriterId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Handle naming one open document in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocHandle(DocumentId);

impl DocHandle {
    pub fn id(&self) -> &DocumentId {
        &self.0
    }
}

struct OpenEntry {
    doc: OpenDocument,
    appended_since_snapshot: usize,
    last_snapshot_ms: u64,
}

/// The document store for one sync directory.
pub struct DocStore<F: FileSystem> {
    fs: F,
    writer: WriterId,
    policy: CompactionPolicy,
    open: HashMap<DocumentId, OpenEntry>,
    events: Arc<EventBus>,
}

impl<F: FileSystem> DocStore<F> {
    pub fn new(fs: F, writer: WriterId) -> Self {
        Self::with_policy(fs, writer, CompactionPolicy::default())
    }

    pub fn with_policy(fs: F, writer: WriterId, policy: CompactionPolicy) -> Self {
        Self {
            fs,
            writer,
            policy,
            open: HashMap::new(),
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn writer(&self) -> WriterId {
        self.writer
    }

    pub fn policy(&self) -> &CompactionPolicy {
        &self.policy
    }

    /// The bus this store publishes [`StoreEvent`]s on.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Open a note document.
    pub async fn open_note(&mut self, note_id: &str) -> Result<DocHandle> {
        let id = DocumentId::note(note_id)
            .ok_or_else(|| StoreError::InvalidId(note_id.to_string()))?;
        self.open_document(id).await
    }

    /// Open the folder-tree document of this sync directory.
    pub async fn open_folder_tree(&mut self) -> Result<DocHandle> {
        self.open_document(DocumentId::FolderTree).await
    }

    /// Open a document, or hand back the existing registry entry.
    pub async fn open_document(&mut self, id: DocumentId) -> Result<DocHandle> {
        if self.open.contains_key(&id) {
            return Ok(DocHandle(id));
        }

        let doc = OpenDocument::open(&self.fs, self.writer, id.clone()).await?;

        self.events.emit(StoreEvent::DocumentOpened {
            document: id.to_string(),
            skipped: doc.skipped_files().len(),
        });
        if doc.is_degraded() {
            self.events.emit(StoreEvent::DocumentDegraded {
                document: id.to_string(),
                skipped: doc.skipped_files().len(),
            });
        }

        let last_snapshot_ms = doc.last_snapshot_ms();
        self.open.insert(
            id.clone(),
            OpenEntry {
                doc,
                appended_since_snapshot: 0,
                last_snapshot_ms,
            },
        );
        Ok(DocHandle(id))
    }

    /// Append a local CRDT delta and compact if the policy says so.
    pub async fn append_local_update(
        &mut self,
        handle: &DocHandle,
        bytes: &[u8],
    ) -> Result<AppendOutcome> {
        let entry = Self::entry_mut(&mut self.open, handle)?;
        let outcome = entry.doc.append_local_update(&self.fs, bytes).await?;
        entry.appended_since_snapshot += 1;

        self.events.emit(StoreEvent::UpdateAppended {
            document: handle.0.to_string(),
            seq: outcome.seq,
            file: outcome.filename.clone(),
        });

        if self.policy.should_snapshot(
            entry.appended_since_snapshot,
            entry.last_snapshot_ms,
            crate::now_ms(),
        ) {
            self.compact_document(handle).await?;
        }

        Ok(outcome)
    }

    /// Merge one remote file discovered by the host file-watcher.
    pub async fn apply_remote_update(&mut self, handle: &DocHandle, filename: &str) -> Result<bool> {
        let entry = Self::entry_mut(&mut self.open, handle)?;
        let applied = entry.doc.apply_remote_file(&self.fs, filename).await?;
        if applied {
            self.events.emit(StoreEvent::RemoteApplied {
                document: handle.0.to_string(),
                file: filename.to_string(),
            });
        }
        Ok(applied)
    }

    /// Full merged state as one importable update.
    pub fn get_state_as_update(&self, handle: &DocHandle) -> Result<Vec<u8>> {
        self.entry(handle)?.doc.state_as_update()
    }

    /// Title projection of a note.
    pub fn extract_title(&self, handle: &DocHandle) -> Result<String> {
        Ok(self.entry(handle)?.doc.document()?.extract_title())
    }

    /// Plain-text projection of a note.
    pub fn extract_text(&self, handle: &DocHandle) -> Result<String> {
        Ok(self.entry(handle)?.doc.document()?.extract_text())
    }

    /// Folders in the defined listing order. Valid on the folder tree only.
    pub fn list_folders(&self, handle: &DocHandle) -> Result<Vec<FolderEntry>> {
        let doc = self.entry(handle)?.doc.document()?;
        match doc.as_folder_tree() {
            Some(tree) => Ok(tree.list_folders()),
            None => Err(StoreError::InvalidId(
                "folder listing requires the folder-tree document".into(),
            )),
        }
    }

    /// Whether the document came up without any usable state.
    pub fn is_degraded(&self, handle: &DocHandle) -> Result<bool> {
        Ok(self.entry(handle)?.doc.is_degraded())
    }

    /// Convert the degraded flag into [`StoreError::Degraded`].
    pub fn check_health(&self, handle: &DocHandle) -> Result<()> {
        self.entry(handle)?.doc.check_usable()
    }

    /// Log files skipped as corrupt while this document has been open.
    pub fn skipped_files(&self, handle: &DocHandle) -> Result<Vec<String>> {
        Ok(self.entry(handle)?.doc.skipped_files().to_vec())
    }

    /// Vector clock of the merged state.
    pub fn clock(&self, handle: &DocHandle) -> Result<crate::VectorClock> {
        Ok(self.entry(handle)?.doc.clock().clone())
    }

    /// Write a snapshot now, regardless of policy.
    pub async fn compact_document(&mut self, handle: &DocHandle) -> Result<CompactionOutcome> {
        let entry = Self::entry_mut(&mut self.open, handle)?;
        let outcome = compactor::write_snapshot(&self.fs, &entry.doc).await?;
        entry.appended_since_snapshot = 0;
        entry.last_snapshot_ms = crate::now_ms();

        self.events.emit(StoreEvent::SnapshotWritten {
            document: handle.0.to_string(),
            file: outcome.written.clone(),
            superseded: outcome.superseded.len(),
        });
        Ok(outcome)
    }

    /// Rewrite this writer's raw update run as a pack, if long enough.
    pub async fn pack_document(&mut self, handle: &DocHandle) -> Result<Option<CompactionOutcome>> {
        // Validate the handle before touching the directory
        let _ = self.entry(handle)?;
        let outcome =
            compactor::write_pack(&self.fs, &handle.0, self.writer, self.policy.pack_min_run)
                .await?;
        if let Some(outcome) = &outcome {
            self.events.emit(StoreEvent::PackWritten {
                document: handle.0.to_string(),
                file: outcome.written.clone(),
                superseded: outcome.superseded.len(),
            });
        }
        Ok(outcome)
    }

    /// Close a document and drop it from the registry.
    ///
    /// The handle (and any clone of it) goes stale; further use returns
    /// `StoreError::NotOpen`.
    pub fn close_document(&mut self, handle: DocHandle) -> Result<()> {
        let mut entry = self
            .open
            .remove(&handle.0)
            .ok_or_else(|| StoreError::NotOpen(handle.0.to_string()))?;
        entry.doc.close();
        debug!(doc = %handle.0, "closed document");
        Ok(())
    }

    /// Garbage-collect every document in the sync directory.
    pub async fn run_garbage_collection(&self, config: &GcConfig) -> Result<GcStats> {
        let stats = gc::run_gc(&self.fs, config).await?;
        self.events.emit(StoreEvent::GcCompleted {
            files_deleted: stats.files_deleted,
            bytes_reclaimed: stats.bytes_reclaimed,
        });
        Ok(stats)
    }

    /// Migrate every document still carrying the legacy layout.
    pub async fn migrate_storage_directory(&self) -> Result<StorageMigrationReport> {
        let report = migration::migrate_storage_directory(&self.fs).await?;
        self.events.emit(StoreEvent::MigrationCompleted {
            files_migrated: report.files_migrated(),
            errors: report.error_count(),
        });
        Ok(report)
    }

    /// Note ids that have a log directory in this sync directory.
    pub async fn list_note_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for id in gc::list_documents(&self.fs).await? {
            if let DocumentId::Note(note_id) = id {
                ids.push(note_id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn entry(&self, handle: &DocHandle) -> Result<&OpenEntry> {
        self.open
            .get(&handle.0)
            .ok_or_else(|| StoreError::NotOpen(handle.0.to_string()))
    }

    fn entry_mut<'a>(
        open: &'a mut HashMap<DocumentId, OpenEntry>,
        handle: &DocHandle,
    ) -> Result<&'a mut OpenEntry> {
        open.get_mut(&handle.0)
            .ok_or_else(|| StoreError::NotOpen(handle.0.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{FolderTreeDoc, NoteDoc};
    use crate::fs::InMemoryFs;
    use crate::layout;
    use std::sync::Mutex;

    fn writer_a() -> WriterId {
        WriterId::from(0xA)
    }

    fn delta_with_text(peer: u64, paragraphs: &[&str]) -> Vec<u8> {
        let mut editor = NoteDoc::create("note-1", WriterId::from(peer));
        editor.set_paragraphs(paragraphs).unwrap();
        editor.encode_state_as_update()
    }

    #[tokio::test]
    async fn test_open_append_extract_close() {
        let fs = InMemoryFs::new();
        let mut store = DocStore::new(fs, writer_a());

        let handle = store.open_note("note-1").await.unwrap();
        store
            .append_local_update(&handle, &delta_with_text(0x500, &["Title line", "body"]))
            .await
            .unwrap();

        assert_eq!(store.extract_title(&handle).unwrap(), "Title line");
        assert_eq!(store.extract_text(&handle).unwrap(), "Title line body");
        assert!(!store.is_degraded(&handle).unwrap());
        store.check_health(&handle).unwrap();

        store.close_document(handle.clone()).unwrap();
        assert!(matches!(
            store.extract_title(&handle),
            Err(StoreError::NotOpen(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_note_id_rejected() {
        let fs = InMemoryFs::new();
        let mut store = DocStore::new(fs, writer_a());
        assert!(matches!(
            store.open_note("../evil").await,
            Err(StoreError::InvalidId(_))
        ));
    }

    #[tokio::test]
    async fn test_reopening_reuses_registry_entry() {
        let fs = InMemoryFs::new();
        let mut store = DocStore::new(fs, writer_a());

        let first = store.open_note("note-1").await.unwrap();
        store
            .append_local_update(&first, &delta_with_text(0x501, &["hello"]))
            .await
            .unwrap();

        // Second open returns a handle to the same live entry
        let second = store.open_note("note-1").await.unwrap();
        assert_eq!(store.extract_text(&second).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_policy_triggers_snapshot() {
        let fs = InMemoryFs::new();
        let policy = CompactionPolicy {
            snapshot_after_updates: 3,
            min_snapshot_interval_ms: u64::MAX,
            pack_min_run: 8,
        };
        let mut store = DocStore::with_policy(fs, writer_a(), policy);

        let handle = store.open_note("note-1").await.unwrap();
        for i in 0..3u64 {
            store
                .append_local_update(&handle, &delta_with_text(0x510 + i, &["x"]))
                .await
                .unwrap();
        }

        let dir = handle.id().log_dir();
        let snapshots = store
            .fs
            .list(&dir)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| {
                matches!(
                    layout::parse_log_filename(&e.name),
                    Some(layout::ParsedLogName::Snapshot { .. })
                )
            })
            .count();
        assert_eq!(snapshots, 1);
    }

    #[tokio::test]
    async fn test_folder_tree_listing_through_store() {
        let fs = InMemoryFs::new();
        let mut store = DocStore::new(fs, writer_a());

        let tree = store.open_folder_tree().await.unwrap();

        // An editor-side tree produces the delta, as the app would
        let mut editor = FolderTreeDoc::create(WriterId::from(0x520));
        editor
            .upsert_folder(&FolderEntry {
                id: "f1".into(),
                name: "Inbox".into(),
                parent_id: None,
                sd_id: "sd1".into(),
                order: 1.0,
                deleted: false,
            })
            .unwrap();
        store
            .append_local_update(&tree, &editor.encode_state_as_update())
            .await
            .unwrap();

        let folders = store.list_folders(&tree).unwrap();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].name, "Inbox");

        // Notes refuse folder listing
        let note = store.open_note("note-1").await.unwrap();
        assert!(store.list_folders(&note).is_err());
    }

    #[tokio::test]
    async fn test_gc_through_store_is_reentrant() {
        let fs = InMemoryFs::new();
        let mut store = DocStore::new(fs, writer_a());

        let handle = store.open_note("note-1").await.unwrap();
        for i in 0..4u64 {
            store
                .append_local_update(&handle, &delta_with_text(0x530 + i, &["x"]))
                .await
                .unwrap();
        }
        store.compact_document(&handle).await.unwrap();

        let config = GcConfig {
            keep_snapshots: 1,
            min_age_ms: 0,
        };
        let stats = store.run_garbage_collection(&config).await.unwrap();
        assert_eq!(stats.files_deleted, 4);
        assert!(stats.bytes_reclaimed > 0);

        // No intervening writes: second run reclaims nothing
        let stats = store.run_garbage_collection(&config).await.unwrap();
        assert_eq!(stats.files_deleted, 0);

        // The document still reconstructs from the snapshot alone
        store.close_document(handle).unwrap();
        let reopened = store.open_note("note-1").await.unwrap();
        assert!(!store.is_degraded(&reopened).unwrap());
        assert_eq!(store.clock(&reopened).unwrap().get(writer_a()), 4);
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let fs = InMemoryFs::new();
        let mut store = DocStore::new(fs, writer_a());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = store.events().subscribe(move |event| {
            let label = match event {
                StoreEvent::DocumentOpened { .. } => "opened",
                StoreEvent::UpdateAppended { .. } => "appended",
                StoreEvent::SnapshotWritten { .. } => "snapshot",
                _ => "other",
            };
            seen_clone.lock().unwrap().push(label);
        });

        let handle = store.open_note("note-1").await.unwrap();
        store
            .append_local_update(&handle, &delta_with_text(0x540, &["x"]))
            .await
            .unwrap();
        store.compact_document(&handle).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec!["opened", "appended", "snapshot"]);
    }

    #[tokio::test]
    async fn test_list_note_ids() {
        let fs = InMemoryFs::new();
        let mut store = DocStore::new(fs, writer_a());

        store.open_note("beta").await.unwrap();
        store.open_note("alpha").await.unwrap();
        store.open_folder_tree().await.unwrap();

        let ids = store.list_note_ids().await.unwrap();
        assert_eq!(ids, vec!["alpha".to_string(), "beta".to_string()]);
    }
}
