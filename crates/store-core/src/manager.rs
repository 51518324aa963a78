//! Update manager: reconstructs one document from its on-disk log, appends
//! local changes, and merges remote files discovered by the host watcher.
//!
//! Lifecycle: **Closed -> Loading -> Ready -> Closed**. A single
//! `OpenDocument` is single-writer within a process; the embedding app
//! serializes calls per document (all mutation goes through `&mut self`),
//! the engine does not queue internally.
//!
//! Failure semantics: any single corrupt or unreadable log file is logged,
//! recorded in `skipped_files`, and skipped; only the total absence of
//! usable state marks the document degraded. Scans are cancellable between
//! file reads (drop the future), never mid-decode; once an append has
//! started writing it runs to completion so the writer's sequence never
//! gaps.

use crate::clock::VectorClock;
use crate::compactor::select_best_snapshot;
use crate::document::{Document, DocumentError};
use crate::fs::{FileSystem, FsError};
use crate::layout::{self, DocumentId, ParsedLogName};
use crate::record::{self, FormatError, SnapshotRecord, UpdateRecord};
use crate::writer::WriterId;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("format error: {0}")]
    Format(#[from] FormatError),

    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    #[error("document {id} is {state:?}, expected Ready")]
    BadState { id: String, state: DocState },

    #[error("document not open: {0}")]
    NotOpen(String),

    #[error("document {0} is degraded: none of its {1} log files were usable")]
    Degraded(String, usize),

    #[error("invalid document id: {0}")]
    InvalidId(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Lifecycle state of an open document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocState {
    Closed,
    Loading,
    Ready,
}

/// Result of appending a local update.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// Sequence assigned to the update
    pub seq: u64,
    /// Log filename the update was written to
    pub filename: String,
}

/// One document reconstructed from its log directory.
pub struct OpenDocument {
    id: DocumentId,
    writer: WriterId,
    state: DocState,
    document: Option<Document>,
    clock: VectorClock,
    degraded: bool,
    skipped_files: Vec<String>,
    /// Timestamp of the snapshot applied at open (0 if none)
    last_snapshot_ms: u64,
}

impl OpenDocument {
    /// Open a document: scan its log directory, fast-forward from the best
    /// snapshot, then merge every non-dominated update in `(writer, seq)`
    /// order. Timestamps are never an ordering key; device clocks skew.
    pub async fn open<F: FileSystem>(fs: &F, writer: WriterId, id: DocumentId) -> Result<Self> {
        let mut this = Self {
            id,
            writer,
            state: DocState::Loading,
            document: None,
            clock: VectorClock::new(),
            degraded: false,
            skipped_files: Vec::new(),
            last_snapshot_ms: 0,
        };

        let dir = this.id.log_dir();
        fs.mkdir(&dir).await?;

        let mut names: Vec<(String, ParsedLogName)> = Vec::new();
        for entry in fs.list(&dir).await? {
            if entry.is_dir {
                continue;
            }
            match layout::parse_log_filename(&entry.name) {
                Some(parsed) => names.push((entry.name, parsed)),
                None => debug!(file = %entry.name, "ignoring non-log file in {}", dir),
            }
        }
        let total_log_files = names.len();

        // The selection target is the union of everything available: update
        // and pack name metadata plus decoded snapshot clocks. Snapshot
        // clocks must participate or a fully compacted document (raw files
        // gone) would reject its own snapshot as "from the future".
        let mut target = VectorClock::new();
        for (_, parsed) in &names {
            match parsed {
                ParsedLogName::Update { writer, seq, .. } => target.record(*writer, *seq),
                ParsedLogName::Pack {
                    writer, end_seq, ..
                } => target.record(*writer, *end_seq),
                ParsedLogName::Snapshot { .. } => {}
            }
        }

        let mut snapshots: Vec<(String, SnapshotRecord)> = Vec::new();
        for (name, parsed) in &names {
            if !matches!(parsed, ParsedLogName::Snapshot { .. }) {
                continue;
            }
            match this.read_record(fs, &dir, name, record::decode_snapshot_file).await {
                Some(snapshot) => {
                    target.merge(&snapshot.clock);
                    snapshots.push((name.clone(), snapshot));
                }
                None => {}
            }
        }

        let mut document = Document::create_for(&this.id, writer);
        let mut applied_any = false;

        // Fast-forward from the best snapshot; if its payload turns out to
        // be corrupt despite a valid envelope, fall back to the next best.
        while let Some(best) = select_best_snapshot(&snapshots, &target) {
            let (name, snapshot) = best;
            match document.apply_update(&snapshot.payload) {
                Ok(()) => {
                    debug!(file = %name, total = snapshot.clock.total(), "applied snapshot");
                    this.clock = snapshot.clock.clone();
                    this.last_snapshot_ms = snapshot.timestamp_ms;
                    applied_any = true;
                    break;
                }
                Err(e) => {
                    warn!(file = %name, error = %e, "snapshot payload unusable, trying next");
                    let name = name.clone();
                    this.skip(&name);
                    snapshots.retain(|(n, _)| *n != name);
                }
            }
        }

        // Collect non-dominated updates without reading dominated files.
        let mut pending: Vec<(String, UpdateRecord)> = Vec::new();
        for (name, parsed) in &names {
            match parsed {
                ParsedLogName::Update { writer, seq, .. }
                    if this.clock.should_apply(*writer, *seq) =>
                {
                    if let Some(update) =
                        this.read_record(fs, &dir, name, record::decode_update_file).await
                    {
                        pending.push((name.clone(), update));
                    }
                }
                ParsedLogName::Pack {
                    writer, end_seq, ..
                } if this.clock.get(*writer) < *end_seq => {
                    if let Some(pack) =
                        this.read_record(fs, &dir, name, record::decode_pack_file).await
                    {
                        for member in pack.updates {
                            if this.clock.should_apply(pack.writer, member.seq) {
                                pending.push((
                                    name.clone(),
                                    UpdateRecord {
                                        writer: pack.writer,
                                        seq: member.seq,
                                        timestamp_ms: member.timestamp_ms,
                                        payload: member.payload,
                                    },
                                ));
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        pending.sort_by_key(|(_, update)| (update.writer, update.seq));
        for (source, update) in pending {
            // A raw file and a pack can carry the same (writer, seq)
            if !this.clock.should_apply(update.writer, update.seq) {
                continue;
            }
            match document.apply_update(&update.payload) {
                Ok(()) => {
                    this.clock.record(update.writer, update.seq);
                    applied_any = true;
                }
                Err(e) => {
                    warn!(file = %source, error = %e, "skipping corrupt update payload");
                    this.skip(&source);
                }
            }
        }

        if total_log_files > 0 && !applied_any {
            warn!(doc = %this.id, files = total_log_files, "no usable state; document degraded");
            this.degraded = true;
        }

        debug!(doc = %this.id, clock = ?this.clock, "document ready");
        this.document = Some(document);
        this.state = DocState::Ready;
        Ok(this)
    }

    /// Append a local CRDT delta: assign the next sequence, write the file
    /// atomically, then merge into memory. Write-then-merge means a crash
    /// between the two is healed by dedup on the next open.
    pub async fn append_local_update<F: FileSystem>(
        &mut self,
        fs: &F,
        payload: &[u8],
    ) -> Result<AppendOutcome> {
        self.ensure_ready()?;

        let seq = self.clock.get(self.writer) + 1;
        let timestamp_ms = crate::now_ms();
        let update = UpdateRecord {
            writer: self.writer,
            seq,
            timestamp_ms,
            payload: payload.to_vec(),
        };

        let filename = layout::update_filename(self.writer, seq, timestamp_ms);
        let path = format!("{}/{}", self.id.log_dir(), filename);
        fs.write_atomic(&path, &record::encode_update_file(&update))
            .await?;

        self.document_mut()?.apply_update(payload)?;
        self.clock.record(self.writer, seq);

        debug!(doc = %self.id, seq, file = %filename, "appended local update");
        Ok(AppendOutcome { seq, filename })
    }

    /// Merge one remote file discovered by the host file-watcher.
    ///
    /// Returns whether anything new was incorporated. Unparseable names and
    /// corrupt files are skipped, never fatal.
    pub async fn apply_remote_file<F: FileSystem>(
        &mut self,
        fs: &F,
        filename: &str,
    ) -> Result<bool> {
        self.ensure_ready()?;
        let dir = self.id.log_dir();

        let Some(parsed) = layout::parse_log_filename(filename) else {
            debug!(file = %filename, "ignoring non-log file from watcher");
            return Ok(false);
        };

        match parsed {
            ParsedLogName::Update { writer, seq, .. } => {
                if !self.clock.should_apply(writer, seq) {
                    return Ok(false);
                }
                let Some(update) =
                    self.read_record(fs, &dir, filename, record::decode_update_file).await
                else {
                    return Ok(false);
                };
                match self.document_mut()?.apply_update(&update.payload) {
                    Ok(()) => {
                        self.clock.record(update.writer, update.seq);
                        Ok(true)
                    }
                    Err(e) => {
                        warn!(file = %filename, error = %e, "skipping corrupt remote update");
                        self.skip(filename);
                        Ok(false)
                    }
                }
            }
            ParsedLogName::Pack {
                writer, end_seq, ..
            } => {
                if self.clock.get(writer) >= end_seq {
                    return Ok(false);
                }
                let Some(pack) =
                    self.read_record(fs, &dir, filename, record::decode_pack_file).await
                else {
                    return Ok(false);
                };
                let mut applied = false;
                for member in pack.updates {
                    if !self.clock.should_apply(pack.writer, member.seq) {
                        continue;
                    }
                    match self.document_mut()?.apply_update(&member.payload) {
                        Ok(()) => {
                            self.clock.record(pack.writer, member.seq);
                            applied = true;
                        }
                        Err(e) => {
                            warn!(file = %filename, seq = member.seq, error = %e,
                                  "skipping corrupt pack member");
                            self.skip(filename);
                        }
                    }
                }
                Ok(applied)
            }
            ParsedLogName::Snapshot { .. } => {
                let Some(snapshot) =
                    self.read_record(fs, &dir, filename, record::decode_snapshot_file).await
                else {
                    return Ok(false);
                };
                if self.clock.dominates(&snapshot.clock) {
                    return Ok(false);
                }
                match self.document_mut()?.apply_update(&snapshot.payload) {
                    Ok(()) => {
                        self.clock.merge(&snapshot.clock);
                        self.last_snapshot_ms = self.last_snapshot_ms.max(snapshot.timestamp_ms);
                        Ok(true)
                    }
                    Err(e) => {
                        warn!(file = %filename, error = %e, "skipping corrupt remote snapshot");
                        self.skip(filename);
                        Ok(false)
                    }
                }
            }
        }
    }

    /// Full merged state as one importable update.
    pub fn state_as_update(&self) -> Result<Vec<u8>> {
        self.ensure_ready()?;
        Ok(self.document()?.encode_state_as_update())
    }

    /// The merged in-memory document.
    pub fn document(&self) -> Result<&Document> {
        self.document.as_ref().ok_or_else(|| StoreError::BadState {
            id: self.id.to_string(),
            state: self.state,
        })
    }

    fn document_mut(&mut self) -> Result<&mut Document> {
        let state = self.state;
        let id = &self.id;
        match self.document.as_mut() {
            Some(doc) => Ok(doc),
            None => Err(StoreError::BadState {
                id: id.to_string(),
                state,
            }),
        }
    }

    /// Close and free the in-memory document. The instance must not be
    /// reused; every further call returns `StoreError::BadState`.
    pub fn close(&mut self) {
        self.document = None;
        self.state = DocState::Closed;
    }

    /// Error if the document came up without any usable state.
    ///
    /// `open` itself never fails for corrupt content so the app can decide
    /// what to surface; this converts the degraded flag into the error.
    pub fn check_usable(&self) -> Result<()> {
        if self.degraded {
            return Err(StoreError::Degraded(
                self.id.to_string(),
                self.skipped_files.len(),
            ));
        }
        Ok(())
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn writer(&self) -> WriterId {
        self.writer
    }

    pub fn state(&self) -> DocState {
        self.state
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Files skipped as corrupt or unreadable during this session.
    pub fn skipped_files(&self) -> &[String] {
        &self.skipped_files
    }

    /// Timestamp of the newest snapshot incorporated (0 if none).
    pub fn last_snapshot_ms(&self) -> u64 {
        self.last_snapshot_ms
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state != DocState::Ready {
            return Err(StoreError::BadState {
                id: self.id.to_string(),
                state: self.state,
            });
        }
        Ok(())
    }

    fn skip(&mut self, name: &str) {
        if !self.skipped_files.iter().any(|n| n == name) {
            self.skipped_files.push(name.to_string());
        }
    }

    /// Read and decode one record file; failures are recorded and skipped.
    async fn read_record<F, T, D>(
        &mut self,
        fs: &F,
        dir: &str,
        name: &str,
        decode: D,
    ) -> Option<T>
    where
        F: FileSystem,
        D: Fn(&[u8]) -> record::Result<T>,
    {
        let path = format!("{}/{}", dir, name);
        let bytes = match fs.read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(file = %name, error = %e, "skipping unreadable log file");
                self.skip(name);
                return None;
            }
        };
        match decode(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(file = %name, error = %e, "skipping corrupt log file");
                self.skip(name);
                None
            }
        }
    }
}
