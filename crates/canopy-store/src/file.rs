//! Segment files: the append handles of the log.

use bytes::Bytes;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use canopy_common::Result;
use canopy_vfs::VfsFile;

use crate::constants::FILE_NAME_WIDTH;

/// 1-based index of a segment file. Zero means "no segment".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SegmentId(pub u16);

impl SegmentId {
    /// The reserved "no segment" index.
    pub const NONE: SegmentId = SegmentId(0);

    /// First real segment.
    pub const FIRST: SegmentId = SegmentId(1);

    pub fn next(&self) -> Self {
        SegmentId(self.0 + 1)
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    /// Generates the on-disk file name for this segment.
    pub fn filename(&self) -> String {
        format!("{:0width$}", self.0, width = FILE_NAME_WIDTH)
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An open segment file.
///
/// Tracks the on-disk length for append positioning and a count of
/// outstanding reads; a handle with readers in flight must not be evicted
/// from the handle cache.
pub struct SegmentFile {
    id: SegmentId,
    file: Arc<dyn VfsFile>,
    /// Current on-disk byte length.
    size: AtomicU64,
    /// Outstanding read operations.
    reads: AtomicU32,
}

/// Decrements the read count when a read completes, including reads that
/// are cancelled mid-flight.
struct ReadGuard<'a>(&'a AtomicU32);

impl<'a> ReadGuard<'a> {
    fn enter(reads: &'a AtomicU32) -> Self {
        reads.fetch_add(1, Ordering::AcqRel);
        Self(reads)
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SegmentFile {
    pub fn new(id: SegmentId, file: Arc<dyn VfsFile>, size: u64) -> Self {
        Self {
            id,
            file,
            size: AtomicU64::new(size),
            reads: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Current on-disk byte length.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Number of reads currently in flight.
    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::Acquire)
    }

    /// Reads `size` bytes starting at `pos`.
    pub async fn read(&self, pos: u32, size: usize) -> Result<Bytes> {
        let _guard = ReadGuard::enter(&self.reads);
        let mut buf = vec![0u8; size];
        self.file.read_at(pos as u64, &mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Synchronous read for traversals that must not suspend.
    pub fn read_sync(&self, pos: u32, size: usize) -> Result<Bytes> {
        let _guard = ReadGuard::enter(&self.reads);
        let mut buf = vec![0u8; size];
        self.file.read_at_sync(pos as u64, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    /// Reads into a caller-provided slab, avoiding an allocation per window.
    pub async fn read_into(&self, pos: u32, buf: &mut [u8]) -> Result<()> {
        let _guard = ReadGuard::enter(&self.reads);
        self.file.read_at(pos as u64, buf).await
    }

    /// Appends `data`, returning the offset at which it starts.
    pub async fn write(&self, data: &[u8]) -> Result<u32> {
        let pos = self.size.load(Ordering::Acquire);
        self.file.write_at(pos, data).await?;
        self.size.store(pos + data.len() as u64, Ordering::Release);
        Ok(pos as u32)
    }

    pub async fn sync(&self) -> Result<()> {
        self.file.sync().await
    }

    /// Discards everything past `len`. Only recovery truncates.
    pub async fn truncate(&self, len: u64) -> Result<()> {
        self.file.truncate(len).await?;
        self.size.store(len, Ordering::Release);
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.file.close().await
    }
}
