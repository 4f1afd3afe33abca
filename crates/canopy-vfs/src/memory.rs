//! In-memory [`Vfs`] implementation.
//!
//! A drop-in substitute for [`DiskVfs`](crate::DiskVfs) used by store and
//! recovery tests. Contents live in process memory and vanish with the
//! process; crash-recovery tests simulate torn writes by truncating or
//! appending to the backing buffer through a second handle.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use canopy_common::Result;

use crate::{FileStat, Vfs, VfsFile};

#[derive(Clone)]
enum MemEntry {
    Dir,
    File(Arc<MemFileData>),
}

struct MemFileData {
    bytes: Mutex<Vec<u8>>,
}

/// An in-memory file system.
#[derive(Default)]
pub struct MemVfs {
    entries: Mutex<HashMap<PathBuf, MemEntry>>,
}

impl MemVfs {
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(path: &Path) -> io::Error {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no such entry: {}", path.display()),
        )
    }

    fn do_open(&self, path: &Path, create: bool) -> Result<Arc<dyn VfsFile>> {
        let mut entries = self.entries.lock();
        match entries.get(path) {
            Some(MemEntry::File(data)) => Ok(Arc::new(MemFile {
                data: Arc::clone(data),
            })),
            Some(MemEntry::Dir) => Err(io::Error::other(format!(
                "is a directory: {}",
                path.display()
            ))
            .into()),
            None => {
                if !create {
                    return Err(Self::not_found(path).into());
                }
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() && !entries.contains_key(parent) {
                        return Err(Self::not_found(parent).into());
                    }
                }
                let data = Arc::new(MemFileData {
                    bytes: Mutex::new(Vec::new()),
                });
                entries.insert(path.to_path_buf(), MemEntry::File(Arc::clone(&data)));
                Ok(Arc::new(MemFile { data }))
            }
        }
    }
}

#[async_trait]
impl Vfs for MemVfs {
    async fn mkdirp(&self, path: &Path, _mode: u32) -> Result<()> {
        let mut entries = self.entries.lock();
        let mut ancestors: Vec<&Path> = path.ancestors().collect();
        ancestors.reverse();
        for dir in ancestors {
            if dir.as_os_str().is_empty() {
                continue;
            }
            match entries.get(dir) {
                Some(MemEntry::Dir) => {}
                Some(MemEntry::File(_)) => {
                    return Err(io::Error::other(format!(
                        "not a directory: {}",
                        dir.display()
                    ))
                    .into());
                }
                None => {
                    entries.insert(dir.to_path_buf(), MemEntry::Dir);
                }
            }
        }
        Ok(())
    }

    async fn readdir(&self, path: &Path) -> Result<Vec<String>> {
        let entries = self.entries.lock();
        match entries.get(path) {
            Some(MemEntry::Dir) => {}
            Some(MemEntry::File(_)) => {
                return Err(io::Error::other(format!(
                    "not a directory: {}",
                    path.display()
                ))
                .into());
            }
            None => return Err(Self::not_found(path).into()),
        }
        let names = entries
            .keys()
            .filter(|p| p.parent() == Some(path))
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        Ok(names)
    }

    async fn lstat(&self, path: &Path) -> Result<FileStat> {
        let entries = self.entries.lock();
        match entries.get(path) {
            Some(MemEntry::Dir) => Ok(FileStat {
                len: 0,
                is_file: false,
                is_dir: true,
            }),
            Some(MemEntry::File(data)) => Ok(FileStat {
                len: data.bytes.lock().len() as u64,
                is_file: true,
                is_dir: false,
            }),
            None => Err(Self::not_found(path).into()),
        }
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut entries = self.entries.lock();
        if !entries.contains_key(from) {
            return Err(Self::not_found(from).into());
        }
        // Move the entry and, for directories, everything beneath it.
        let moved: Vec<(PathBuf, MemEntry)> = entries
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, e)| (p.clone(), e.clone()))
            .collect();
        for (p, _) in &moved {
            entries.remove(p);
        }
        for (p, e) in moved {
            let suffix = p.strip_prefix(from).expect("prefix-filtered path");
            entries.insert(to.join(suffix), e);
        }
        Ok(())
    }

    async fn unlink(&self, path: &Path) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries.get(path) {
            Some(MemEntry::File(_)) => {
                entries.remove(path);
                Ok(())
            }
            Some(MemEntry::Dir) => Err(io::Error::other(format!(
                "is a directory: {}",
                path.display()
            ))
            .into()),
            None => Err(Self::not_found(path).into()),
        }
    }

    async fn rmdir(&self, path: &Path) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries.get(path) {
            Some(MemEntry::Dir) => {}
            Some(MemEntry::File(_)) => {
                return Err(io::Error::other(format!(
                    "not a directory: {}",
                    path.display()
                ))
                .into());
            }
            None => return Err(Self::not_found(path).into()),
        }
        if entries.keys().any(|p| p.parent() == Some(path)) {
            return Err(io::Error::other(format!(
                "directory not empty: {}",
                path.display()
            ))
            .into());
        }
        entries.remove(path);
        Ok(())
    }

    async fn open(&self, path: &Path, create: bool) -> Result<Arc<dyn VfsFile>> {
        self.do_open(path, create)
    }

    fn open_sync(&self, path: &Path, create: bool) -> Result<Arc<dyn VfsFile>> {
        self.do_open(path, create)
    }
}

/// One open handle to an in-memory file. Handles opened on the same path
/// share the backing buffer.
pub struct MemFile {
    data: Arc<MemFileData>,
}

impl MemFile {
    fn read_exact(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.data.bytes.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if end > bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read past end of file: {end} > {}", bytes.len()),
            )
            .into());
        }
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }
}

#[async_trait]
impl VfsFile for MemFile {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.read_exact(offset, buf)
    }

    fn read_at_sync(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.read_exact(offset, buf)
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut bytes = self.data.bytes.lock();
        let start = offset as usize;
        let end = start + data.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn truncate(&self, len: u64) -> Result<()> {
        let mut bytes = self.data.bytes.lock();
        bytes.resize(len as usize, 0);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.bytes.lock().len() as u64)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mkdirp_and_readdir() {
        let vfs = MemVfs::new();
        let dir = Path::new("/db/tree");
        vfs.mkdirp(dir, 0o750).await.unwrap();
        assert!(vfs.lstat(dir).await.unwrap().is_dir);
        assert!(vfs.lstat(Path::new("/db")).await.unwrap().is_dir);
        assert!(vfs.readdir(dir).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_create_and_shared_buffer() {
        let vfs = MemVfs::new();
        vfs.mkdirp(Path::new("/db"), 0o750).await.unwrap();
        let path = Path::new("/db/0000000001");

        let a = vfs.open(path, true).await.unwrap();
        a.write_at(0, b"hello").await.unwrap();

        // A second handle on the same path sees the same bytes.
        let b = vfs.open(path, false).await.unwrap();
        let mut buf = [0u8; 5];
        b.read_at(0, &mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        // Truncation through one handle is visible through the other.
        b.truncate(2).await.unwrap();
        assert_eq!(a.len().unwrap(), 2);
        assert!(a.read_at(0, &mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_open_missing_without_create() {
        let vfs = MemVfs::new();
        vfs.mkdirp(Path::new("/db"), 0o750).await.unwrap();
        assert!(vfs.open(Path::new("/db/missing"), false).await.is_err());
    }

    #[tokio::test]
    async fn test_write_past_end_zero_fills() {
        let vfs = MemVfs::new();
        vfs.mkdirp(Path::new("/db"), 0o750).await.unwrap();
        let file = vfs.open(Path::new("/db/f"), true).await.unwrap();

        file.write_at(4, b"xy").await.unwrap();
        let mut buf = [0u8; 6];
        file.read_at(0, &mut buf).await.unwrap();
        assert_eq!(&buf, &[0, 0, 0, 0, b'x', b'y']);
    }

    #[tokio::test]
    async fn test_unlink_and_rmdir() {
        let vfs = MemVfs::new();
        let dir = Path::new("/db");
        vfs.mkdirp(dir, 0o750).await.unwrap();
        vfs.open(&dir.join("f"), true).await.unwrap();

        // Non-empty directory cannot be removed.
        assert!(vfs.rmdir(dir).await.is_err());

        vfs.unlink(&dir.join("f")).await.unwrap();
        vfs.rmdir(dir).await.unwrap();
        assert!(vfs.lstat(dir).await.is_err());
    }

    #[tokio::test]
    async fn test_rename_moves_directory_tree() {
        let vfs = MemVfs::new();
        let dir = Path::new("/db/tree");
        vfs.mkdirp(dir, 0o750).await.unwrap();
        let file = vfs.open(&dir.join("0000000001"), true).await.unwrap();
        file.write_at(0, b"data").await.unwrap();

        let target = Path::new("/db/tree.renamed");
        vfs.rename(dir, target).await.unwrap();

        assert!(vfs.lstat(dir).await.is_err());
        let moved = vfs.open(&target.join("0000000001"), false).await.unwrap();
        assert_eq!(moved.len().unwrap(), 4);
    }
}
