//! Disk-backed [`Vfs`] implementation.
//!
//! Directory operations go through `tokio::fs`. File handles hold a shared
//! `std::fs::File` so reads and writes are positional and never contend on a
//! seek cursor; the async variants run the blocking syscall on the runtime's
//! blocking pool.

use async_trait::async_trait;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use canopy_common::Result;

use crate::{FileStat, Vfs, VfsFile};

/// The real file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskVfs;

impl DiskVfs {
    pub fn new() -> Self {
        Self
    }
}

fn join_error(err: tokio::task::JoinError) -> io::Error {
    io::Error::other(err)
}

#[async_trait]
impl Vfs for DiskVfs {
    async fn mkdirp(&self, path: &Path, mode: u32) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
        }
        Ok(())
    }

    async fn readdir(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(path).await?;
        while let Some(entry) = dir.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    async fn lstat(&self, path: &Path) -> Result<FileStat> {
        let meta = tokio::fs::symlink_metadata(path).await?;
        Ok(FileStat {
            len: meta.len(),
            is_file: meta.is_file(),
            is_dir: meta.is_dir(),
        })
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        tokio::fs::rename(from, to).await?;
        Ok(())
    }

    async fn unlink(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_file(path).await?;
        Ok(())
    }

    async fn rmdir(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_dir(path).await?;
        Ok(())
    }

    async fn open(&self, path: &Path, create: bool) -> Result<Arc<dyn VfsFile>> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)
            .await?;
        Ok(Arc::new(DiskFile {
            file: Arc::new(file.into_std().await),
        }))
    }

    fn open_sync(&self, path: &Path, create: bool) -> Result<Arc<dyn VfsFile>> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)?;
        Ok(Arc::new(DiskFile {
            file: Arc::new(file),
        }))
    }
}

/// One open file on disk.
pub struct DiskFile {
    file: Arc<std::fs::File>,
}

#[async_trait]
impl VfsFile for DiskFile {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let file = Arc::clone(&self.file);
        let len = buf.len();
        let data = tokio::task::spawn_blocking(move || -> io::Result<Vec<u8>> {
            let mut tmp = vec![0u8; len];
            file.read_exact_at(&mut tmp, offset)?;
            Ok(tmp)
        })
        .await
        .map_err(join_error)??;
        buf.copy_from_slice(&data);
        Ok(())
    }

    fn read_at_sync(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let file = Arc::clone(&self.file);
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || file.write_all_at(&data, offset))
            .await
            .map_err(join_error)??;
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.sync_all())
            .await
            .map_err(join_error)??;
        Ok(())
    }

    async fn truncate(&self, len: u64) -> Result<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.set_len(len))
            .await
            .map_err(join_error)??;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    async fn close(&self) -> Result<()> {
        // The descriptor closes when the last Arc drops.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_open_create_write_read() {
        let dir = tempdir().unwrap();
        let vfs = DiskVfs::new();
        let path = dir.path().join("0000000001");

        let file = vfs.open(&path, true).await.unwrap();
        file.write_at(0, b"canopy").await.unwrap();
        file.sync().await.unwrap();
        assert_eq!(file.len().unwrap(), 6);

        let mut buf = [0u8; 6];
        file.read_at(0, &mut buf).await.unwrap();
        assert_eq!(&buf, b"canopy");

        let mut tail = [0u8; 3];
        file.read_at_sync(3, &mut tail).unwrap();
        assert_eq!(&tail, b"opy");
    }

    #[tokio::test]
    async fn test_open_missing_fails_without_create() {
        let dir = tempdir().unwrap();
        let vfs = DiskVfs::new();
        let path = dir.path().join("missing");
        assert!(vfs.open(&path, false).await.is_err());
        assert!(vfs.open_sync(&path, false).is_err());
    }

    #[tokio::test]
    async fn test_truncate_discards_tail() {
        let dir = tempdir().unwrap();
        let vfs = DiskVfs::new();
        let path = dir.path().join("0000000001");

        let file = vfs.open(&path, true).await.unwrap();
        file.write_at(0, &[7u8; 100]).await.unwrap();
        file.truncate(36).await.unwrap();
        assert_eq!(file.len().unwrap(), 36);

        let mut buf = [0u8; 36];
        file.read_at(0, &mut buf).await.unwrap();
        assert!(buf.iter().all(|b| *b == 7));
    }

    #[tokio::test]
    async fn test_readdir_and_unlink() {
        let dir = tempdir().unwrap();
        let vfs = DiskVfs::new();
        let sub = dir.path().join("store");
        vfs.mkdirp(&sub, 0o750).await.unwrap();

        for name in ["0000000001", "0000000002"] {
            vfs.open(&sub.join(name), true).await.unwrap();
        }

        let mut names = vfs.readdir(&sub).await.unwrap();
        names.sort();
        assert_eq!(names, vec!["0000000001", "0000000002"]);

        vfs.unlink(&sub.join("0000000002")).await.unwrap();
        assert_eq!(vfs.readdir(&sub).await.unwrap().len(), 1);

        let stat = vfs.lstat(&sub).await.unwrap();
        assert!(stat.is_dir);
    }
}
