//! Host-callback filesystem for embedded runtimes.
//!
//! Implements the `FileSystem` trait by calling async callbacks supplied by
//! the embedding host at composition time. The mobile runtime wires these to
//! its platform file APIs; the core never learns which platform it runs on.
//!
//! The host's write callback must be atomic (all-or-nothing), the same
//! contract `NativeFs` fulfills with temp-then-rename.

use async_trait::async_trait;
use futures::future::BoxFuture;
use store_core::fs::{FileEntry, FileStat, FileSystem, Result};

type ReadFn = dyn Fn(String) -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync;
type WriteFn = dyn Fn(String, Vec<u8>) -> BoxFuture<'static, Result<()>> + Send + Sync;
type ListFn = dyn Fn(String) -> BoxFuture<'static, Result<Vec<FileEntry>>> + Send + Sync;
type DeleteFn = dyn Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync;
type ExistsFn = dyn Fn(String) -> BoxFuture<'static, Result<bool>> + Send + Sync;
type StatFn = dyn Fn(String) -> BoxFuture<'static, Result<FileStat>> + Send + Sync;
type MkdirFn = dyn Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// Host-callback filesystem bridge.
///
/// Holds one async callback per operation. Built with [`HostFsBuilder`]:
///
/// ```ignore
/// let fs = HostFs::builder()
///     .read(|path| Box::pin(host.read(path)))
///     .write_atomic(|path, bytes| Box::pin(host.write(path, bytes)))
///     /* ... */
///     .build()?;
/// ```
pub struct HostFs {
    read_fn: Box<ReadFn>,
    write_fn: Box<WriteFn>,
    list_fn: Box<ListFn>,
    delete_fn: Box<DeleteFn>,
    exists_fn: Box<ExistsFn>,
    stat_fn: Box<StatFn>,
    mkdir_fn: Box<MkdirFn>,
}

impl HostFs {
    pub fn builder() -> HostFsBuilder {
        HostFsBuilder::default()
    }
}

/// Builder collecting the per-operation callbacks.
#[derive(Default)]
pub struct HostFsBuilder {
    read_fn: Option<Box<ReadFn>>,
    write_fn: Option<Box<WriteFn>>,
    list_fn: Option<Box<ListFn>>,
    delete_fn: Option<Box<DeleteFn>>,
    exists_fn: Option<Box<ExistsFn>>,
    stat_fn: Option<Box<StatFn>>,
    mkdir_fn: Option<Box<MkdirFn>>,
}

impl HostFsBuilder {
    pub fn read(
        mut self,
        f: impl Fn(String) -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync + 'static,
    ) -> Self {
        self.read_fn = Some(Box::new(f));
        self
    }

    pub fn write_atomic(
        mut self,
        f: impl Fn(String, Vec<u8>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    ) -> Self {
        self.write_fn = Some(Box::new(f));
        self
    }

    pub fn list(
        mut self,
        f: impl Fn(String) -> BoxFuture<'static, Result<Vec<FileEntry>>> + Send + Sync + 'static,
    ) -> Self {
        self.list_fn = Some(Box::new(f));
        self
    }

    pub fn delete(
        mut self,
        f: impl Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    ) -> Self {
        self.delete_fn = Some(Box::new(f));
        self
    }

    pub fn exists(
        mut self,
        f: impl Fn(String) -> BoxFuture<'static, Result<bool>> + Send + Sync + 'static,
    ) -> Self {
        self.exists_fn = Some(Box::new(f));
        self
    }

    pub fn stat(
        mut self,
        f: impl Fn(String) -> BoxFuture<'static, Result<FileStat>> + Send + Sync + 'static,
    ) -> Self {
        self.stat_fn = Some(Box::new(f));
        self
    }

    pub fn mkdir(
        mut self,
        f: impl Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    ) -> Self {
        self.mkdir_fn = Some(Box::new(f));
        self
    }

    /// Finish the bridge; every callback must have been provided.
    pub fn build(self) -> std::result::Result<HostFs, MissingCallback> {
        Ok(HostFs {
            read_fn: self.read_fn.ok_or(MissingCallback("read"))?,
            write_fn: self.write_fn.ok_or(MissingCallback("write_atomic"))?,
            list_fn: self.list_fn.ok_or(MissingCallback("list"))?,
            delete_fn: self.delete_fn.ok_or(MissingCallback("delete"))?,
            exists_fn: self.exists_fn.ok_or(MissingCallback("exists"))?,
            stat_fn: self.stat_fn.ok_or(MissingCallback("stat"))?,
            mkdir_fn: self.mkdir_fn.ok_or(MissingCallback("mkdir"))?,
        })
    }
}

/// A required callback was not supplied to the builder.
#[derive(Debug, thiserror::Error)]
#[error("missing host callback: {0}")]
pub struct MissingCallback(pub &'static str);

#[async_trait]
impl FileSystem for HostFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (self.read_fn)(path.to_string()).await
    }

    async fn write_atomic(&self, path: &str, content: &[u8]) -> Result<()> {
        (self.write_fn)(path.to_string(), content.to_vec()).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (self.list_fn)(path.to_string()).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (self.delete_fn)(path.to_string()).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (self.exists_fn)(path.to_string()).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (self.stat_fn)(path.to_string()).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (self.mkdir_fn)(path.to_string()).await
    }
}
