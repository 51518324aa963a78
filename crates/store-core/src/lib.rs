//! store-core: local-first CRDT document storage over a shared sync folder.
//!
//! This crate provides the core functionality for:
//! - Representing document history as an append-only, replicable log
//! - Merging update/snapshot/pack files into Loro documents
//! - Compacting history and collecting subsumed files
//! - Migrating the legacy one-file-per-update layout without data loss
//! - The FileSystem trait abstraction all I/O goes through

pub mod clock;
pub mod compactor;
pub mod document;
pub mod events;
pub mod fs;
pub mod gc;
pub mod layout;
pub mod manager;
pub mod migration;
pub mod record;
pub mod store;
pub mod writer;

pub use clock::VectorClock;
pub use compactor::{CompactionOutcome, CompactionPolicy};
pub use document::{ContentNode, ContentVisitor, Document, FolderEntry, FolderTreeDoc, NoteDoc};
pub use events::{EventBus, StoreEvent, Subscription};
pub use fs::{FileEntry, FileStat, FileSystem, FsError, InMemoryFs};
pub use gc::{GcConfig, GcStats};
pub use layout::{DocumentId, ParsedLogName};
pub use manager::{AppendOutcome, DocState, OpenDocument, StoreError};
pub use migration::{CleanupReport, MigrationReport, StorageMigrationReport};
pub use record::{FormatError, PackRecord, RecordKind, SnapshotRecord, UpdateRecord};
pub use store::{DocHandle, DocStore};
pub use writer::{WriterId, WriterIdError};

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    use web_time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
