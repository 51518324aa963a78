//! FileSystem trait abstraction for platform-independent file operations.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in store-native) - Direct tokio::fs I/O
//! - `HostFs` (in store-native) - Host-callback I/O for embedded runtimes
//!
//! The engine performs no direct I/O: every byte it reads or writes goes
//! through this trait. `write_atomic` must be all-or-nothing (temp file plus
//! rename on a real filesystem) so a concurrent reader never observes a
//! partially written log record. I/O retry and timeout policy belong to the
//! adapter, not the engine.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// File metadata
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Modification time in milliseconds since epoch
    pub mtime_millis: u64,
    /// File size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Directory entry
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Platform-independent filesystem abstraction.
///
/// Implementations must be `Send + Sync` for use across threads.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents atomically (creates parent directories if needed).
    ///
    /// After this returns, a reader sees either the previous contents or the
    /// new contents in full, never a prefix.
    async fn write_atomic(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete file or empty directory
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file metadata
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;
}

/// In-memory filesystem for testing.
///
/// Writes are atomic by construction (a map insert), which makes this a
/// faithful stand-in for the temp-then-rename contract of `NativeFs`.
pub struct InMemoryFs {
    files: RwLock<HashMap<String, Vec<u8>>>,
    dirs: RwLock<HashMap<String, ()>>,
    /// Tracks file modification times (path -> mtime in ms)
    mtimes: RwLock<HashMap<String, u64>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut dirs = HashMap::new();
        dirs.insert(String::new(), ()); // Root directory
        Self {
            files: RwLock::new(HashMap::new()),
            dirs: RwLock::new(dirs),
            mtimes: RwLock::new(HashMap::new()),
        }
    }

    /// Set a specific mtime, for testing age-based GC retention
    pub fn set_mtime(&self, path: &str, mtime: u64) {
        let path = Self::normalize_path(path);
        let mut mtimes = self.mtimes.write().unwrap();
        mtimes.insert(path, mtime);
    }

    /// Truncate a stored file in place, for corrupt-file tests
    pub fn truncate(&self, path: &str, len: usize) {
        let path = Self::normalize_path(path);
        let mut files = self.files.write().unwrap();
        if let Some(content) = files.get_mut(&path) {
            content.truncate(len);
        }
    }

    fn current_time_ms() -> u64 {
        use web_time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn parent_path(path: &str) -> Option<String> {
        let normalized = Self::normalize_path(path);
        if normalized.is_empty() {
            None
        } else {
            match normalized.rfind('/') {
                Some(pos) => Some(normalized[..pos].to_string()),
                None => Some(String::new()),
            }
        }
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap();
        files
            .get(&path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path))
    }

    async fn write_atomic(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);

        // Create parent directories
        if let Some(parent) = Self::parent_path(&path) {
            self.mkdir(&parent).await?;
        }

        let mut files = self.files.write().unwrap();
        files.insert(path.clone(), content.to_vec());
        drop(files);

        let mut mtimes = self.mtimes.write().unwrap();
        mtimes.insert(path, Self::current_time_ms());
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = Self::normalize_path(path);
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };

        let dirs = self.dirs.read().unwrap();
        if !path.is_empty() && !dirs.contains_key(&path) {
            return Err(FsError::NotFound(path));
        }

        let mut entries = Vec::new();
        let mut seen = std::collections::HashSet::new();

        let files = self.files.read().unwrap();
        for file_path in files.keys() {
            if let Some(rest) = file_path.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') && seen.insert(rest.to_string()) {
                    entries.push(FileEntry {
                        name: rest.to_string(),
                        is_dir: false,
                    });
                }
            }
        }

        for dir_path in dirs.keys() {
            if let Some(rest) = dir_path.strip_prefix(&prefix) {
                let name = rest.split('/').next().unwrap();
                if !name.is_empty() && seen.insert(name.to_string()) {
                    entries.push(FileEntry {
                        name: name.to_string(),
                        is_dir: true,
                    });
                }
            }
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);

        {
            let mut files = self.files.write().unwrap();
            if files.remove(&path).is_some() {
                self.mtimes.write().unwrap().remove(&path);
                return Ok(());
            }
        }

        {
            let mut dirs = self.dirs.write().unwrap();
            if dirs.remove(&path).is_some() {
                return Ok(());
            }
        }

        Err(FsError::NotFound(path))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap();
        let dirs = self.dirs.read().unwrap();
        Ok(files.contains_key(&path) || dirs.contains_key(&path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = Self::normalize_path(path);

        let files = self.files.read().unwrap();
        if let Some(content) = files.get(&path) {
            let mtimes = self.mtimes.read().unwrap();
            let mtime = mtimes.get(&path).copied().unwrap_or(0);
            return Ok(FileStat {
                mtime_millis: mtime,
                size: content.len() as u64,
                is_dir: false,
            });
        }

        let dirs = self.dirs.read().unwrap();
        if dirs.contains_key(&path) {
            return Ok(FileStat {
                mtime_millis: 0,
                size: 0,
                is_dir: true,
            });
        }

        Err(FsError::NotFound(path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if path.is_empty() {
            return Ok(()); // Root always exists
        }

        if let Some(parent) = Self::parent_path(&path) {
            Box::pin(self.mkdir(&parent)).await?;
        }

        let mut dirs = self.dirs.write().unwrap();
        dirs.insert(path, ());
        Ok(())
    }
}

// Implement FileSystem for Arc<T> where T: FileSystem
// This allows sharing a filesystem between multiple stores in tests
#[async_trait]
impl<T: FileSystem + Send + Sync> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write_atomic(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write_atomic(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_fs_basic_operations() {
        let fs = InMemoryFs::new();

        fs.write_atomic("test.bin", b"hello world").await.unwrap();

        let content = fs.read("test.bin").await.unwrap();
        assert_eq!(content, b"hello world");

        assert!(fs.exists("test.bin").await.unwrap());
        assert!(!fs.exists("nonexistent.bin").await.unwrap());

        fs.delete("test.bin").await.unwrap();
        assert!(!fs.exists("test.bin").await.unwrap());
    }

    #[tokio::test]
    async fn test_inmemory_fs_directories() {
        let fs = InMemoryFs::new();

        // Write creates parent directories
        fs.write_atomic("a/b/c.bin", b"content").await.unwrap();

        assert!(fs.exists("a").await.unwrap());
        assert!(fs.exists("a/b").await.unwrap());

        let entries = fs.list("a").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b");
        assert!(entries[0].is_dir);

        let entries = fs.list("a/b").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "c.bin");
        assert!(!entries[0].is_dir);
    }

    #[tokio::test]
    async fn test_inmemory_fs_list_missing_dir() {
        let fs = InMemoryFs::new();
        assert!(matches!(
            fs.list("no/such/dir").await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_inmemory_fs_stat_and_truncate() {
        let fs = InMemoryFs::new();

        fs.write_atomic("x/file.bin", &[0u8; 64]).await.unwrap();
        let stat = fs.stat("x/file.bin").await.unwrap();
        assert_eq!(stat.size, 64);
        assert!(!stat.is_dir);

        fs.truncate("x/file.bin", 10);
        let stat = fs.stat("x/file.bin").await.unwrap();
        assert_eq!(stat.size, 10);
    }

    #[tokio::test]
    async fn test_inmemory_fs_overwrite_replaces_whole_file() {
        let fs = InMemoryFs::new();

        fs.write_atomic("f.bin", b"first version").await.unwrap();
        fs.write_atomic("f.bin", b"v2").await.unwrap();

        assert_eq!(fs.read("f.bin").await.unwrap(), b"v2");
    }
}
