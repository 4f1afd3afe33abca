//! Crash recovery: the backward meta scan.
//!
//! After an unclean shutdown the tail of the highest segment may hold a
//! torn commit. Recovery walks segments from highest to lowest, scanning
//! each backward in slab-sized windows for the newest meta record whose
//! magic and checksum verify, truncates everything past it, and adopts it
//! as the committed state. A segment containing no valid meta at all is
//! unlinked and the predecessor is tried.

use std::cmp::min;
use std::sync::Arc;
use tracing::{debug, warn};

use canopy_common::{NodeHasher, Result};
use canopy_vfs::Vfs;

use crate::constants::{META_MAGIC, META_SIZE, SLAB_SIZE};
use crate::file::{SegmentFile, SegmentId};
use crate::handles::HandleCache;
use crate::meta::MetaRecord;

/// State adopted from the newest valid checkpoint on disk.
#[derive(Debug, Clone, Copy)]
pub struct RecoveredState {
    /// Content of the newest valid meta record.
    pub meta: MetaRecord,
    /// Location of that record.
    pub meta_index: SegmentId,
    pub meta_pos: u32,
}

/// Scans one segment backward for its newest valid meta record.
///
/// Windows are walked from the highest meta-aligned offset down, and within
/// each window positions are probed high to low. Window bases are always
/// meta-aligned (the slab size is a multiple of the record size), so a
/// record never straddles two windows.
pub async fn find_meta(
    file: &SegmentFile,
    hasher: &dyn NodeHasher,
) -> Result<Option<(u32, MetaRecord)>> {
    let size = file.size();
    let mut off = size - (size % META_SIZE as u64);
    let mut slab = vec![0u8; SLAB_SIZE];

    while off > 0 {
        let len = min(off, SLAB_SIZE as u64) as usize;
        let base = off - len as u64;
        file.read_into(base as u32, &mut slab[..len]).await?;

        let mut probe = len;
        while probe >= META_SIZE {
            probe -= META_SIZE;
            let window = &slab[probe..probe + META_SIZE];
            if window[..4] != META_MAGIC.to_le_bytes() {
                continue;
            }
            let pos = base as u32 + probe as u32;
            match MetaRecord::decode(window, file.id(), pos, hasher) {
                Ok(meta) => return Ok(Some((pos, meta))),
                // Stray magic bytes inside node or value data.
                Err(err) if err.is_meta_mismatch() => continue,
                Err(err) => return Err(err),
            }
        }
        off = base;
    }

    Ok(None)
}

/// Walks segments from `highest` down, recovering the newest checkpoint.
///
/// Returns the recovered state and the segment holding it, now truncated to
/// end exactly at the checkpoint. Returns `None` when no segment holds a
/// valid meta, in which case every segment has been unlinked and the store
/// is fresh.
pub(crate) async fn recover(
    vfs: &Arc<dyn Vfs>,
    handles: &HandleCache,
    hasher: &dyn NodeHasher,
    highest: SegmentId,
) -> Result<Option<(Arc<SegmentFile>, RecoveredState)>> {
    for raw in (1..=highest.0).rev() {
        let id = SegmentId(raw);
        let file = handles.open(id, id, false).await?;

        if let Some((pos, meta)) = find_meta(&file, hasher).await? {
            let keep = pos as u64 + META_SIZE as u64;
            if file.size() > keep {
                warn!(
                    segment = %id,
                    from = file.size(),
                    to = keep,
                    "truncating torn tail"
                );
                file.truncate(keep).await?;
                file.sync().await?;
            }
            debug!(segment = %id, pos, "recovered meta checkpoint");
            let state = RecoveredState {
                meta,
                meta_index: id,
                meta_pos: pos,
            };
            return Ok(Some((file, state)));
        }

        debug!(segment = %id, "no valid meta in segment, unlinking");
        handles.remove(id);
        file.close().await?;
        vfs.unlink(&handles.path_for(id)).await?;
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_common::Sha256Hasher;
    use canopy_vfs::{MemVfs, VfsFile};
    use std::path::PathBuf;

    async fn segment_with(vfs: &Arc<MemVfs>, id: SegmentId, bytes: &[u8]) -> Arc<SegmentFile> {
        let prefix = PathBuf::from("/db");
        vfs.mkdirp(&prefix, 0o750).await.unwrap();
        let file = vfs.open(&prefix.join(id.filename()), true).await.unwrap();
        file.write_at(0, bytes).await.unwrap();
        let size = file.len().unwrap();
        Arc::new(SegmentFile::new(id, file, size))
    }

    fn meta_bytes(record: MetaRecord) -> Vec<u8> {
        record.encode(&Sha256Hasher).to_vec()
    }

    #[tokio::test]
    async fn test_find_meta_empty_segment() {
        let vfs = Arc::new(MemVfs::new());
        let file = segment_with(&vfs, SegmentId(1), &[]).await;
        assert!(find_meta(&file, &Sha256Hasher).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_meta_picks_newest_and_skips_torn_tail() {
        let vfs = Arc::new(MemVfs::new());

        let first = MetaRecord::default();
        let second = MetaRecord {
            prev_index: SegmentId(1),
            prev_pos: 36,
            root_index: SegmentId(1),
            root_pos: 72,
        };

        // 36 bytes of data, meta, more data, meta, then a torn tail.
        let mut bytes = vec![0xabu8; 36];
        bytes.extend(meta_bytes(first));
        bytes.extend(vec![0xcdu8; 72]);
        bytes.extend(meta_bytes(second));
        bytes.extend(vec![0xefu8; 17]);

        let file = segment_with(&vfs, SegmentId(1), &bytes).await;
        let (pos, meta) = find_meta(&file, &Sha256Hasher).await.unwrap().unwrap();
        assert_eq!(pos, 144);
        assert_eq!(meta, second);
    }

    #[tokio::test]
    async fn test_find_meta_rejects_stray_magic() {
        let vfs = Arc::new(MemVfs::new());

        let real = MetaRecord {
            prev_index: SegmentId::NONE,
            prev_pos: 0,
            root_index: SegmentId(1),
            root_pos: 0,
        };

        // A valid meta, then an aligned block that starts with the magic
        // bytes but fails the checksum.
        let mut bytes = meta_bytes(real);
        let mut fake = vec![0u8; 36];
        fake[..4].copy_from_slice(&META_MAGIC.to_le_bytes());
        bytes.extend(fake);

        let file = segment_with(&vfs, SegmentId(1), &bytes).await;
        let (pos, meta) = find_meta(&file, &Sha256Hasher).await.unwrap().unwrap();
        assert_eq!(pos, 0);
        assert_eq!(meta, real);
    }

    #[tokio::test]
    async fn test_recover_truncates_and_adopts() {
        let vfs = Arc::new(MemVfs::new());
        let record = MetaRecord {
            prev_index: SegmentId::NONE,
            prev_pos: 0,
            root_index: SegmentId(1),
            root_pos: 0,
        };
        let mut bytes = vec![0x11u8; 72];
        bytes.extend(meta_bytes(record));
        bytes.extend(vec![0x22u8; 29]);
        segment_with(&vfs, SegmentId(1), &bytes).await;

        let handles = HandleCache::new(
            Arc::clone(&vfs) as Arc<dyn Vfs>,
            PathBuf::from("/db"),
            32,
        );
        let vfs_dyn: Arc<dyn Vfs> = vfs;
        let (file, state) = recover(&vfs_dyn, &handles, &Sha256Hasher, SegmentId(1))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(state.meta, record);
        assert_eq!(state.meta_index, SegmentId(1));
        assert_eq!(state.meta_pos, 72);
        assert_eq!(file.size(), 72 + META_SIZE as u64);
    }

    #[tokio::test]
    async fn test_recover_unlinks_metaless_segments() {
        let vfs = Arc::new(MemVfs::new());
        let record = MetaRecord {
            prev_index: SegmentId::NONE,
            prev_pos: 0,
            root_index: SegmentId(1),
            root_pos: 0,
        };
        let mut bytes = vec![0x11u8; 36];
        bytes.extend(meta_bytes(record));
        segment_with(&vfs, SegmentId(1), &bytes).await;
        // Segment 2 holds only garbage from a torn rollover.
        segment_with(&vfs, SegmentId(2), &[0x77u8; 90]).await;

        let handles = HandleCache::new(
            Arc::clone(&vfs) as Arc<dyn Vfs>,
            PathBuf::from("/db"),
            32,
        );
        let vfs_dyn: Arc<dyn Vfs> = Arc::clone(&vfs) as Arc<dyn Vfs>;
        let (file, state) = recover(&vfs_dyn, &handles, &Sha256Hasher, SegmentId(2))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(state.meta_index, SegmentId(1));
        assert_eq!(file.id(), SegmentId(1));
        // Segment 2 is gone.
        assert!(vfs
            .lstat(&PathBuf::from("/db/0000000002"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_recover_fresh_when_nothing_valid() {
        let vfs = Arc::new(MemVfs::new());
        segment_with(&vfs, SegmentId(1), &[0x42u8; 50]).await;

        let handles = HandleCache::new(
            Arc::clone(&vfs) as Arc<dyn Vfs>,
            PathBuf::from("/db"),
            32,
        );
        let vfs_dyn: Arc<dyn Vfs> = Arc::clone(&vfs) as Arc<dyn Vfs>;
        let recovered = recover(&vfs_dyn, &handles, &Sha256Hasher, SegmentId(1))
            .await
            .unwrap();

        assert!(recovered.is_none());
        assert!(vfs
            .lstat(&PathBuf::from("/db/0000000001"))
            .await
            .is_err());
    }
}
