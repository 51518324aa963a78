//! Native filesystem implementation using tokio::fs.
//!
//! `write_atomic` is temp-then-rename in the destination directory, so a
//! reader (or the cloud-storage client replicating the folder) never
//! observes a partially written log record.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use store_core::fs::{FileEntry, FileStat, FileSystem, FsError, Result};
use tokio::fs;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Native filesystem rooted at a sync directory
pub struct NativeFs {
    base_path: PathBuf,
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path);
        fs::read(&full_path)
            .await
            .map_err(|e| FsError::Io(e.to_string()))
    }

    async fn write_atomic(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);

        // Create parent directories if needed
        let parent = full_path.parent().map(|p| p.to_path_buf());
        if let Some(parent) = &parent {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| FsError::Io(e.to_string()))?;
        }

        // Stage in the destination directory so the rename stays on one
        // filesystem and is atomic. The tmp name never parses as a log
        // filename, so other scanners ignore it if we crash before renaming.
        let nonce = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let file_name = full_path
            .file_name()
            .ok_or_else(|| FsError::Io(format!("no filename in path: {}", path)))?
            .to_string_lossy()
            .to_string();
        let tmp_path = full_path.with_file_name(format!(
            ".{}.tmp-{}-{}",
            file_name,
            std::process::id(),
            nonce
        ));

        fs::write(&tmp_path, content)
            .await
            .map_err(|e| FsError::Io(e.to_string()))?;
        if let Err(e) = fs::rename(&tmp_path, &full_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(FsError::Io(e.to_string()));
        }
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let full_path = self.full_path(path);
        let mut entries = Vec::new();

        let mut dir = fs::read_dir(&full_path)
            .await
            .map_err(|e| FsError::Io(e.to_string()))?;

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| FsError::Io(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| FsError::Io(e.to_string()))?;

            entries.push(FileEntry {
                name,
                is_dir: metadata.is_dir(),
            });
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| FsError::NotFound(e.to_string()))?;

        if metadata.is_dir() {
            fs::remove_dir(&full_path)
                .await
                .map_err(|e| FsError::Io(e.to_string()))
        } else {
            fs::remove_file(&full_path)
                .await
                .map_err(|e| FsError::Io(e.to_string()))
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path);
        Ok(full_path.exists())
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let full_path = self.full_path(path);
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| FsError::NotFound(e.to_string()))?;

        let mtime_millis = metadata
            .modified()
            .map(|t| {
                t.duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0)
            })
            .unwrap_or(0);

        Ok(FileStat {
            mtime_millis,
            size: metadata.len(),
            is_dir: metadata.is_dir(),
        })
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        fs::create_dir_all(&full_path)
            .await
            .map_err(|e| FsError::Io(e.to_string()))
    }
}
