//! Document model: Loro wrappers for a single note and the folder tree.
//!
//! Each logical document wraps a `LoroDoc`:
//! - `NoteDoc`: `_meta` map (doc lineage, soft-delete flag) plus the
//!   `content` root list of block nodes (leaves are text nodes). The block
//!   list is a root container on purpose: root containers merge by name, so
//!   two instances that edit the same note blind to each other interleave
//!   blocks instead of one side's subtree shadowing the other's.
//! - `FolderTreeDoc`: `folders` map of folder id -> per-field entry map.
//!
//! The engine never interprets update payloads beyond handing them to Loro's
//! import, which is commutative, associative and idempotent; everything else
//! here is either a local-edit helper or a read-only projection.

use crate::layout::DocumentId;
use crate::writer::WriterId;
use loro::{ExportMode, LoroDoc, LoroList, LoroMap, LoroValue, VersionVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("CRDT error: {0}")]
    Crdt(String),

    #[error("corrupt update payload: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

/// A single note as a Loro document.
pub struct NoteDoc {
    doc: LoroDoc,
    id: String,
}

impl NoteDoc {
    /// Allocate empty state for a note. No I/O, no operations: a document
    /// freshly created on two instances stays byte-identical until edited.
    pub fn create(id: &str, writer: WriterId) -> Self {
        let doc = LoroDoc::new();
        doc.set_peer_id(writer.as_u64()).ok();
        Self {
            doc,
            id: id.to_string(),
        }
    }

    /// The note id this document belongs to.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Merge a CRDT delta (update or snapshot encoding) into this document.
    ///
    /// Well-formed CRDT bytes never fail; malformed bytes are a corruption
    /// error scoped to the incoming payload, the document stays usable.
    pub fn apply_update(&mut self, bytes: &[u8]) -> Result<()> {
        self.doc
            .import(bytes)
            .map_err(|e| DocumentError::Corrupt(e.to_string()))?;
        Ok(())
    }

    /// Encode the full state as one importable update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        self.doc
            .export(ExportMode::updates(&VersionVector::default()))
            .expect("full-state update export should not fail")
    }

    /// Export the Loro snapshot encoding, used as snapshot record payload.
    pub fn export_snapshot(&self) -> Vec<u8> {
        self.doc
            .export(ExportMode::Snapshot)
            .expect("snapshot export should not fail")
    }

    /// Export the operations this document has that `from` has not seen.
    pub fn updates_since(&self, from: &VersionVector) -> Vec<u8> {
        self.doc
            .export(ExportMode::updates(from))
            .expect("update export should not fail")
    }

    /// Current Loro version vector (op-level, distinct from the file-level
    /// [`crate::VectorClock`]).
    pub fn version(&self) -> VersionVector {
        self.doc.state_vv()
    }

    /// Title projection: the text of the first block, first line only.
    pub fn extract_title(&self) -> String {
        let nodes = self.content_nodes();
        let mut collector = TextCollector::default();
        if let Some(first) = nodes.first() {
            first.visit(&mut collector);
        }
        let text = collector.finish();
        text.lines().next().unwrap_or("").trim().to_string()
    }

    /// Plain-text projection: every text leaf concatenated, with a single
    /// space inserted at block boundaries.
    pub fn extract_text(&self) -> String {
        let mut collector = TextCollector::default();
        for node in self.content_nodes() {
            node.visit(&mut collector);
        }
        collector.finish()
    }

    /// Decode the content block list into the closed node set.
    pub fn content_nodes(&self) -> Vec<ContentNode> {
        let value = self.doc.get_list("content").get_deep_value();
        let LoroValue::List(blocks) = value else {
            return Vec::new();
        };
        blocks.iter().filter_map(ContentNode::from_value).collect()
    }

    /// Replace this instance's content with one paragraph per string.
    ///
    /// Local-edit helper for the editor binding and tests; the resulting
    /// delta is retrieved with [`NoteDoc::updates_since`]. Only blocks this
    /// instance can see are replaced; concurrent blocks from other writers
    /// survive the merge.
    pub fn set_paragraphs(&mut self, paragraphs: &[&str]) -> Result<()> {
        self.ensure_meta()?;

        let blocks = self.doc.get_list("content");
        let len = blocks.len();
        if len > 0 {
            blocks
                .delete(0, len)
                .map_err(|e| DocumentError::Crdt(e.to_string()))?;
        }

        for (i, text) in paragraphs.iter().enumerate() {
            let para = blocks
                .insert_container(i, LoroMap::new())
                .map_err(|e| DocumentError::Crdt(e.to_string()))?;
            para.insert("type", "paragraph")
                .map_err(|e| DocumentError::Crdt(e.to_string()))?;
            let para_children = para
                .insert_container("children", LoroList::new())
                .map_err(|e| DocumentError::Crdt(e.to_string()))?;
            let leaf = para_children
                .insert_container(0, LoroMap::new())
                .map_err(|e| DocumentError::Crdt(e.to_string()))?;
            leaf.insert("type", "text")
                .map_err(|e| DocumentError::Crdt(e.to_string()))?;
            leaf.insert("text", *text)
                .map_err(|e| DocumentError::Crdt(e.to_string()))?;
        }

        self.doc.commit();
        Ok(())
    }

    /// Soft-delete: notes are never removed from the CRDT state.
    pub fn mark_deleted(&mut self) -> Result<()> {
        let meta = self.doc.get_map("_meta");
        meta.insert("deleted", true)
            .map_err(|e| DocumentError::Crdt(e.to_string()))?;
        self.doc.commit();
        Ok(())
    }

    pub fn is_deleted(&self) -> bool {
        let meta = self.doc.get_map("_meta");
        matches!(
            meta.get_deep_value(),
            LoroValue::Map(map) if matches!(map.get("deleted"), Some(LoroValue::Bool(true)))
        )
    }

    /// Lineage id, present once the note has been edited anywhere.
    pub fn doc_id(&self) -> Option<String> {
        let meta = self.doc.get_map("_meta");
        if let LoroValue::Map(map) = meta.get_deep_value() {
            if let Some(LoroValue::String(s)) = map.get("doc_id") {
                return Some(s.to_string());
            }
        }
        None
    }

    /// Write lineage metadata on first local edit.
    fn ensure_meta(&mut self) -> Result<()> {
        if self.doc_id().is_some() {
            return Ok(());
        }
        let meta = self.doc.get_map("_meta");
        meta.insert("doc_id", Uuid::new_v4().to_string())
            .map_err(|e| DocumentError::Crdt(e.to_string()))?;
        meta.insert("created_at", crate::now_ms() as i64)
            .map_err(|e| DocumentError::Crdt(e.to_string()))?;
        Ok(())
    }
}

/// Closed set of content-node variants.
///
/// Rich-text extraction is a tree walk over exactly these two shapes; any
/// richer mark/attribute structure in the payload collapses into them.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentNode {
    /// A text leaf.
    Text(String),
    /// An element with children (paragraph, heading, list item, ...).
    Element {
        kind: String,
        children: Vec<ContentNode>,
    },
}

impl ContentNode {
    /// Build a node from a deep value. Unknown shapes are dropped, not errors.
    pub fn from_value(value: &LoroValue) -> Option<ContentNode> {
        let LoroValue::Map(map) = value else {
            return None;
        };

        let kind = match map.get("type") {
            Some(LoroValue::String(s)) => s.to_string(),
            _ => return None,
        };

        if kind == "text" {
            let text = match map.get("text") {
                Some(LoroValue::String(s)) => s.to_string(),
                _ => String::new(),
            };
            return Some(ContentNode::Text(text));
        }

        let children = match map.get("children") {
            Some(LoroValue::List(list)) => {
                list.iter().filter_map(ContentNode::from_value).collect()
            }
            _ => Vec::new(),
        };
        Some(ContentNode::Element { kind, children })
    }

    /// Walk this node with a visitor.
    pub fn visit<V: ContentVisitor>(&self, visitor: &mut V) {
        match self {
            ContentNode::Text(text) => visitor.visit_text(text),
            ContentNode::Element { kind, children } => {
                visitor.enter_element(kind);
                for child in children {
                    child.visit(visitor);
                }
                visitor.leave_element(kind);
            }
        }
    }
}

/// Visitor over the closed content-node set.
pub trait ContentVisitor {
    fn visit_text(&mut self, text: &str);
    fn enter_element(&mut self, _kind: &str) {}
    fn leave_element(&mut self, _kind: &str) {}
}

/// Collects plain text, separating blocks with a single space.
#[derive(Default)]
struct TextCollector {
    out: String,
    pending_boundary: bool,
}

impl TextCollector {
    fn finish(self) -> String {
        self.out
    }
}

impl ContentVisitor for TextCollector {
    fn visit_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if self.pending_boundary && !self.out.is_empty() {
            self.out.push(' ');
        }
        self.pending_boundary = false;
        self.out.push_str(text);
    }

    fn leave_element(&mut self, _kind: &str) {
        self.pending_boundary = true;
    }
}

/// One folder in the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderEntry {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    /// Sync directory this folder belongs to
    pub sd_id: String,
    /// Manual sort position within the parent
    pub order: f64,
    pub deleted: bool,
}

/// The folder hierarchy of one sync directory as a Loro document.
pub struct FolderTreeDoc {
    doc: LoroDoc,
}

impl FolderTreeDoc {
    /// Allocate empty state. No I/O, no operations.
    pub fn create(writer: WriterId) -> Self {
        let doc = LoroDoc::new();
        doc.set_peer_id(writer.as_u64()).ok();
        Self { doc }
    }

    pub fn apply_update(&mut self, bytes: &[u8]) -> Result<()> {
        self.doc
            .import(bytes)
            .map_err(|e| DocumentError::Corrupt(e.to_string()))?;
        Ok(())
    }

    pub fn encode_state_as_update(&self) -> Vec<u8> {
        self.doc
            .export(ExportMode::updates(&VersionVector::default()))
            .expect("full-state update export should not fail")
    }

    pub fn export_snapshot(&self) -> Vec<u8> {
        self.doc
            .export(ExportMode::Snapshot)
            .expect("snapshot export should not fail")
    }

    pub fn updates_since(&self, from: &VersionVector) -> Vec<u8> {
        self.doc
            .export(ExportMode::updates(from))
            .expect("update export should not fail")
    }

    pub fn version(&self) -> VersionVector {
        self.doc.state_vv()
    }

    /// Insert or update a folder; each field merges independently.
    ///
    /// Only fields that actually changed are written, so a concurrent rename
    /// on one instance and re-order on another both survive the merge.
    pub fn upsert_folder(&mut self, entry: &FolderEntry) -> Result<()> {
        let folders = self.doc.get_map("folders");
        let existing = self.get_folder(&entry.id);
        let map = match folders
            .get(&entry.id)
            .and_then(|v| v.into_container().ok())
            .and_then(|c| c.into_map().ok())
        {
            Some(map) => map,
            None => folders
                .insert_container(&entry.id, LoroMap::new())
                .map_err(|e| DocumentError::Crdt(e.to_string()))?,
        };

        let crdt = |e: loro::LoroError| DocumentError::Crdt(e.to_string());
        let old = existing.as_ref();

        if old.map(|o| o.id.as_str()) != Some(entry.id.as_str()) {
            map.insert("id", entry.id.as_str()).map_err(crdt)?;
        }
        if old.map(|o| o.name.as_str()) != Some(entry.name.as_str()) {
            map.insert("name", entry.name.as_str()).map_err(crdt)?;
        }
        if old.map(|o| &o.parent_id) != Some(&entry.parent_id) {
            match &entry.parent_id {
                Some(parent) => map.insert("parent_id", parent.as_str()),
                None => map.insert("parent_id", LoroValue::Null),
            }
            .map_err(crdt)?;
        }
        if old.map(|o| o.sd_id.as_str()) != Some(entry.sd_id.as_str()) {
            map.insert("sd_id", entry.sd_id.as_str()).map_err(crdt)?;
        }
        if old.map(|o| o.order) != Some(entry.order) {
            map.insert("order", entry.order).map_err(crdt)?;
        }
        if old.map(|o| o.deleted) != Some(entry.deleted) {
            map.insert("deleted", entry.deleted).map_err(crdt)?;
        }

        self.doc.commit();
        Ok(())
    }

    /// Soft-delete a folder. Unknown ids are a no-op.
    pub fn mark_folder_deleted(&mut self, id: &str) -> Result<()> {
        let folders = self.doc.get_map("folders");
        if let Some(map) = folders
            .get(id)
            .and_then(|v| v.into_container().ok())
            .and_then(|c| c.into_map().ok())
        {
            map.insert("deleted", true)
                .map_err(|e| DocumentError::Crdt(e.to_string()))?;
            self.doc.commit();
        }
        Ok(())
    }

    /// Non-deleted folders in the defined listing order: ascending `order`,
    /// ties by case-insensitive name, final tie by id.
    ///
    /// The ordering lives in the model so every instance sharing the
    /// directory lists identically.
    pub fn list_folders(&self) -> Vec<FolderEntry> {
        let folders = self.doc.get_map("folders");
        let LoroValue::Map(map) = folders.get_deep_value() else {
            return Vec::new();
        };

        let mut entries: Vec<FolderEntry> = map
            .iter()
            .filter_map(|(_, value)| folder_from_value(value))
            .filter(|entry| !entry.deleted)
            .collect();

        entries.sort_by(|a, b| {
            a.order
                .total_cmp(&b.order)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
                .then_with(|| a.id.cmp(&b.id))
        });
        entries
    }

    /// Look up one folder regardless of deletion state.
    pub fn get_folder(&self, id: &str) -> Option<FolderEntry> {
        let folders = self.doc.get_map("folders");
        let LoroValue::Map(map) = folders.get_deep_value() else {
            return None;
        };
        map.get(id).and_then(folder_from_value)
    }
}

fn folder_from_value(value: &LoroValue) -> Option<FolderEntry> {
    let LoroValue::Map(map) = value else {
        return None;
    };

    let get_str = |key: &str| -> Option<String> {
        match map.get(key) {
            Some(LoroValue::String(s)) => Some(s.to_string()),
            _ => None,
        }
    };

    let order = match map.get("order") {
        Some(LoroValue::Double(n)) => *n,
        Some(LoroValue::I64(n)) => *n as f64,
        _ => 0.0,
    };
    let deleted = matches!(map.get("deleted"), Some(LoroValue::Bool(true)));

    Some(FolderEntry {
        id: get_str("id")?,
        name: get_str("name").unwrap_or_default(),
        parent_id: get_str("parent_id"),
        sd_id: get_str("sd_id").unwrap_or_default(),
        order,
        deleted,
    })
}

/// The two document flavors the engine stores, as a closed enum.
pub enum Document {
    Note(NoteDoc),
    FolderTree(FolderTreeDoc),
}

impl Document {
    /// Allocate empty state for the given document id.
    pub fn create_for(id: &DocumentId, writer: WriterId) -> Self {
        match id {
            DocumentId::Note(note_id) => Document::Note(NoteDoc::create(note_id, writer)),
            DocumentId::FolderTree => Document::FolderTree(FolderTreeDoc::create(writer)),
        }
    }

    pub fn apply_update(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            Document::Note(doc) => doc.apply_update(bytes),
            Document::FolderTree(doc) => doc.apply_update(bytes),
        }
    }

    pub fn encode_state_as_update(&self) -> Vec<u8> {
        match self {
            Document::Note(doc) => doc.encode_state_as_update(),
            Document::FolderTree(doc) => doc.encode_state_as_update(),
        }
    }

    pub fn export_snapshot(&self) -> Vec<u8> {
        match self {
            Document::Note(doc) => doc.export_snapshot(),
            Document::FolderTree(doc) => doc.export_snapshot(),
        }
    }

    pub fn extract_title(&self) -> String {
        match self {
            Document::Note(doc) => doc.extract_title(),
            Document::FolderTree(_) => String::new(),
        }
    }

    pub fn extract_text(&self) -> String {
        match self {
            Document::Note(doc) => doc.extract_text(),
            Document::FolderTree(_) => String::new(),
        }
    }

    pub fn as_note(&self) -> Option<&NoteDoc> {
        match self {
            Document::Note(doc) => Some(doc),
            Document::FolderTree(_) => None,
        }
    }

    pub fn as_folder_tree(&self) -> Option<&FolderTreeDoc> {
        match self {
            Document::FolderTree(doc) => Some(doc),
            Document::Note(_) => None,
        }
    }
}
