//! File-system capability for CanopyDB.
//!
//! The store performs every directory and file operation through the [`Vfs`]
//! and [`VfsFile`] traits so that the same store code runs against the real
//! file system ([`DiskVfs`]) and an in-memory substitute ([`MemVfs`]) used by
//! recovery tests.

pub mod disk;
pub mod memory;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use canopy_common::Result;

pub use disk::DiskVfs;
pub use memory::MemVfs;

/// Metadata returned by [`Vfs::lstat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Length in bytes (0 for directories).
    pub len: u64,
    pub is_file: bool,
    pub is_dir: bool,
}

/// Directory-level file-system operations.
#[async_trait]
pub trait Vfs: Send + Sync {
    /// Creates `path` and any missing ancestors with the given mode.
    async fn mkdirp(&self, path: &Path, mode: u32) -> Result<()>;

    /// Entry names of a directory, unsorted.
    async fn readdir(&self, path: &Path) -> Result<Vec<String>>;

    async fn lstat(&self, path: &Path) -> Result<FileStat>;

    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Removes a file.
    async fn unlink(&self, path: &Path) -> Result<()>;

    /// Removes a directory. Fails when the directory is not empty.
    async fn rmdir(&self, path: &Path) -> Result<()>;

    /// Opens a file read-write, creating it when `create` is set.
    async fn open(&self, path: &Path, create: bool) -> Result<Arc<dyn VfsFile>>;

    /// Synchronous variant of [`Vfs::open`] for read paths that must not
    /// suspend.
    fn open_sync(&self, path: &Path, create: bool) -> Result<Arc<dyn VfsFile>>;
}

/// Operations on one open file.
#[async_trait]
pub trait VfsFile: Send + Sync {
    /// Reads exactly `buf.len()` bytes starting at `offset`.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Synchronous exact read.
    fn read_at_sync(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes all of `data` starting at `offset`.
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Flushes file contents and metadata to stable storage.
    async fn sync(&self) -> Result<()>;

    async fn truncate(&self, len: u64) -> Result<()>;

    /// Current length in bytes.
    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Releases the handle. Outstanding clones of the handle stay usable;
    /// the last drop closes the underlying descriptor.
    async fn close(&self) -> Result<()>;
}
