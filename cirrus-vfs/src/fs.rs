//! Filesystem capability traits.
//!
//! A backend implements [`ObjectFileSystem`] and hands out file handles as
//! trait objects. Three handle kinds exist: random-access readers, writable
//! files, and read-only memory regions. All operations are async and may
//! perform network I/O.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};

/// Metadata for a single path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStatistics {
    /// Object length in bytes; 0 for directories.
    pub length: u64,
    pub is_directory: bool,
    /// Last-modified time in nanoseconds since the epoch; 0 when unknown.
    pub mtime_nsec: i64,
}

/// A stateless reader over a byte range of an object.
#[async_trait]
pub trait RandomAccessFile: Send + Sync {
    /// Read up to `n` bytes starting at `offset`.
    ///
    /// The returned buffer may be shorter than `n`; callers must cope.
    /// Reading at or past the end of the object returns
    /// [`Error::OutOfRange`].
    async fn read(&self, offset: u64, n: usize) -> Result<Bytes>;
}

/// A sequential writer. Bytes become durable only on `sync`/`flush`/`close`.
#[async_trait]
pub trait WritableFile: Send {
    async fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Make all previously appended bytes the durable current object.
    async fn sync(&mut self) -> Result<()>;

    async fn flush(&mut self) -> Result<()>;

    /// Final sync plus release of local resources. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// An owned, immutable in-memory copy of an entire object.
pub trait ReadOnlyMemoryRegion: Send + Sync {
    fn data(&self) -> &[u8];
    fn length(&self) -> u64;
}

/// A filesystem over a flat object-store namespace.
#[async_trait]
pub trait ObjectFileSystem: Send + Sync {
    async fn new_random_access_file(&self, path: &str) -> Result<Box<dyn RandomAccessFile>>;

    /// Open `path` for writing, replacing any existing object on sync.
    async fn new_writable_file(&self, path: &str) -> Result<Box<dyn WritableFile>>;

    /// Open `path` for appending: the returned writer is seeded with the
    /// existing object contents.
    async fn new_appendable_file(&self, path: &str) -> Result<Box<dyn WritableFile>>;

    async fn new_read_only_memory_region(
        &self,
        path: &str,
    ) -> Result<Box<dyn ReadOnlyMemoryRegion>>;

    async fn file_exists(&self, path: &str) -> Result<()>;

    /// List the immediate children of a directory-like prefix.
    async fn get_children(&self, dir: &str) -> Result<Vec<String>>;

    async fn stat(&self, path: &str) -> Result<FileStatistics>;

    async fn delete_file(&self, path: &str) -> Result<()>;

    async fn create_dir(&self, dirname: &str) -> Result<()>;

    /// Delete an empty directory. A non-empty directory fails with a
    /// retriable error, since stale listings may report deleted objects
    /// for a while.
    async fn delete_dir(&self, dirname: &str) -> Result<()>;

    async fn get_file_size(&self, path: &str) -> Result<u64>;

    /// Rename `src` to `target`, recursing over the prefix when `src`
    /// names a directory.
    async fn rename_file(&self, src: &str, target: &str) -> Result<()>;

    /// Succeeds iff `path` exists and is a directory.
    async fn is_directory(&self, path: &str) -> Result<()> {
        let stats = self.stat(path).await?;
        if stats.is_directory {
            Ok(())
        } else {
            Err(Error::FailedPrecondition(format!(
                "{path} is not a directory"
            )))
        }
    }
}
