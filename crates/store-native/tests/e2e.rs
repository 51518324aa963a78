//! End-to-end tests over a real temp directory with NativeFs.
//!
//! Two writer instances share one sync directory the way two devices share
//! a cloud-synced folder; here the "replication" is simply both pointing at
//! the same path.

use std::path::Path;
use store_core::{
    migration, CompactionPolicy, DocStore, FolderEntry, FolderTreeDoc, GcConfig, NoteDoc, WriterId,
};
use store_native::NativeFs;
use tempfile::TempDir;

fn store_at(path: &Path, writer: u64) -> DocStore<NativeFs> {
    DocStore::new(NativeFs::new(path.to_path_buf()), WriterId::from(writer))
}

fn note_delta(peer: u64, paragraphs: &[&str]) -> Vec<u8> {
    let mut editor = NoteDoc::create("note-1", WriterId::from(peer));
    editor.set_paragraphs(paragraphs).unwrap();
    editor.encode_state_as_update()
}

#[tokio::test]
async fn test_two_instances_converge_through_the_directory() {
    let dir = TempDir::new().unwrap();

    let mut store_a = store_at(dir.path(), 0xA);
    let mut store_b = store_at(dir.path(), 0xB);

    let handle_a = store_a.open_note("note-1").await.unwrap();
    let handle_b = store_b.open_note("note-1").await.unwrap();

    // A writes; B picks the file up the way the watcher would deliver it
    let outcome = store_a
        .append_local_update(&handle_a, &note_delta(0x700, &["from A"]))
        .await
        .unwrap();
    let applied = store_b
        .apply_remote_update(&handle_b, &outcome.filename)
        .await
        .unwrap();
    assert!(applied);
    assert_eq!(store_b.extract_text(&handle_b).unwrap(), "from A");

    // B writes back; a third instance opening cold sees both
    store_b
        .append_local_update(&handle_b, &note_delta(0x701, &["from B"]))
        .await
        .unwrap();

    let mut store_c = store_at(dir.path(), 0xC);
    let handle_c = store_c.open_note("note-1").await.unwrap();
    let text = store_c.extract_text(&handle_c).unwrap();
    assert!(text.contains("from A") && text.contains("from B"));

    let clock = store_c.clock(&handle_c).unwrap();
    assert_eq!(clock.get(WriterId::from(0xA)), 1);
    assert_eq!(clock.get(WriterId::from(0xB)), 1);
}

#[tokio::test]
async fn test_compact_gc_reopen_cycle() {
    let dir = TempDir::new().unwrap();

    let policy = CompactionPolicy {
        snapshot_after_updates: 100,
        min_snapshot_interval_ms: u64::MAX,
        pack_min_run: 3,
    };
    let mut store =
        DocStore::with_policy(NativeFs::new(dir.path().to_path_buf()), WriterId::from(0xA), policy);

    let handle = store.open_note("note-1").await.unwrap();
    for i in 0..6u64 {
        store
            .append_local_update(&handle, &note_delta(0x710 + i, &[&format!("p{}", i)]))
            .await
            .unwrap();
    }

    // Pack the raw run, then snapshot, then collect
    let pack = store.pack_document(&handle).await.unwrap().unwrap();
    assert_eq!(pack.superseded.len(), 6);

    store.compact_document(&handle).await.unwrap();
    let stats = store
        .run_garbage_collection(&GcConfig {
            keep_snapshots: 1,
            min_age_ms: 0,
        })
        .await
        .unwrap();
    // 6 raw updates + 1 pack are subsumed by the snapshot
    assert_eq!(stats.files_deleted, 7);

    store.close_document(handle).unwrap();
    let handle = store.open_note("note-1").await.unwrap();
    assert!(!store.is_degraded(&handle).unwrap());
    assert_eq!(store.clock(&handle).unwrap().get(WriterId::from(0xA)), 6);
    let text = store.extract_text(&handle).unwrap();
    for i in 0..6 {
        assert!(text.contains(&format!("p{}", i)));
    }
}

#[tokio::test]
async fn test_legacy_migration_on_disk() {
    let dir = TempDir::new().unwrap();
    let uuid = "550e8400-e29b-41d4-a716-446655440000";

    // Lay down a legacy directory by hand, as the pre-log app would have
    let legacy_dir = dir.path().join("notes/note-1/updates");
    std::fs::create_dir_all(&legacy_dir).unwrap();
    for (seq, text) in [(1u64, "legacy one"), (2, "legacy two")] {
        let mut editor = NoteDoc::create("note-1", WriterId::from(0x720 + seq));
        editor.set_paragraphs(&[text]).unwrap();
        let payload = serde_json::to_vec(&editor.encode_state_as_update()).unwrap();
        let name = format!("{}-{}-{}.yjson", uuid, 1690000000000u64 + seq, seq);
        std::fs::write(legacy_dir.join(name), payload).unwrap();
    }

    let store = store_at(dir.path(), 0xA);
    let report = store.migrate_storage_directory().await.unwrap();
    assert_eq!(report.files_migrated(), 2);
    assert_eq!(report.error_count(), 0);

    // Migrated content is readable through the normal open path
    let mut store = store_at(dir.path(), 0xA);
    let handle = store.open_note("note-1").await.unwrap();
    let text = store.extract_text(&handle).unwrap();
    assert!(text.contains("legacy one") && text.contains("legacy two"));

    let legacy_writer = WriterId::from_legacy_uuid(uuid);
    assert_eq!(store.clock(&handle).unwrap().get(legacy_writer), 2);

    // Second migration run is a no-op; cleanup then clears the legacy dir
    let report = store.migrate_storage_directory().await.unwrap();
    assert_eq!(report.files_migrated(), 0);

    let id = store_core::DocumentId::note("note-1").unwrap();
    let cleaned = migration::cleanup_legacy_files(&NativeFs::new(dir.path().to_path_buf()), &id)
        .await
        .unwrap();
    assert_eq!(cleaned.files_deleted, 2);
    assert_eq!(std::fs::read_dir(&legacy_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn test_foreign_files_in_log_dir_are_ignored() {
    let dir = TempDir::new().unwrap();

    let mut store = store_at(dir.path(), 0xA);
    let handle = store.open_note("note-1").await.unwrap();
    store
        .append_local_update(&handle, &note_delta(0x730, &["real content"]))
        .await
        .unwrap();
    store.close_document(handle).unwrap();

    // Cloud clients drop things like this into synced folders
    let log_dir = dir.path().join("notes/note-1/logs");
    std::fs::write(log_dir.join(".DS_Store"), b"junk").unwrap();
    std::fs::write(log_dir.join("notes (conflicted copy).crdtlog"), b"junk").unwrap();

    let mut store = store_at(dir.path(), 0xB);
    let handle = store.open_note("note-1").await.unwrap();
    assert_eq!(store.extract_text(&handle).unwrap(), "real content");
    assert!(store.skipped_files(&handle).unwrap().is_empty());
    assert!(!store.is_degraded(&handle).unwrap());
}

#[tokio::test]
async fn test_folder_tree_shared_between_instances() {
    let dir = TempDir::new().unwrap();

    let mut store_a = store_at(dir.path(), 0xA);
    let tree_a = store_a.open_folder_tree().await.unwrap();

    let mut editor = FolderTreeDoc::create(WriterId::from(0x740));
    for (id, name, order) in [("f1", "Projects", 2.0), ("f2", "Inbox", 1.0)] {
        editor
            .upsert_folder(&FolderEntry {
                id: id.into(),
                name: name.into(),
                parent_id: None,
                sd_id: "sd1".into(),
                order,
                deleted: false,
            })
            .unwrap();
    }
    store_a
        .append_local_update(&tree_a, &editor.encode_state_as_update())
        .await
        .unwrap();

    let mut store_b = store_at(dir.path(), 0xB);
    let tree_b = store_b.open_folder_tree().await.unwrap();
    let names: Vec<String> = store_b
        .list_folders(&tree_b)
        .unwrap()
        .into_iter()
        .map(|f| f.name)
        .collect();
    assert_eq!(names, vec!["Inbox".to_string(), "Projects".to_string()]);
}
