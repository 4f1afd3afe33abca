//! Bounded cache of open segment handles.
//!
//! Segments are addressed by small dense indices, so the cache is a sparse
//! index-addressed vector. The cap is a soft target: when every cached
//! handle is either the current writable segment or has reads in flight,
//! a new handle is admitted anyway.

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use canopy_common::{CanopyError, Result};
use canopy_vfs::Vfs;

use crate::file::{SegmentFile, SegmentId};

struct Slots {
    files: Vec<Option<Arc<SegmentFile>>>,
    count: usize,
}

impl Slots {
    fn ensure(&mut self, idx: usize) {
        if self.files.len() <= idx {
            self.files.resize(idx + 1, None);
        }
    }

    fn get(&self, id: SegmentId) -> Option<Arc<SegmentFile>> {
        self.files.get(id.0 as usize).and_then(|slot| slot.clone())
    }

    /// Evicts one handle when the cache is at capacity.
    ///
    /// The victim is chosen uniformly at random from cached segments that
    /// are not the current writable segment and have no reads in flight.
    /// Random choice keeps adversarial access patterns from pinning stale
    /// handles. With no eligible victim this is a no-op.
    fn evict_if_full(&mut self, max_open: usize, current: SegmentId) {
        if self.count < max_open {
            return;
        }
        let candidates: Vec<usize> = self
            .files
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                let file = slot.as_ref()?;
                (file.id() != current && file.reads() == 0).then_some(idx)
            })
            .collect();
        if candidates.is_empty() {
            return;
        }
        let idx = candidates[rand::rng().random_range(0..candidates.len())];
        let victim = self.files[idx].take().expect("candidate slot occupied");
        self.count -= 1;
        debug!(segment = %victim.id(), "evicting segment handle");
        // The underlying descriptor closes when the last reference drops.
    }

    fn insert(&mut self, file: Arc<SegmentFile>) -> Result<()> {
        let idx = file.id().0 as usize;
        self.ensure(idx);
        if self.files[idx].is_some() {
            return Err(CanopyError::Assertion(format!(
                "segment {} already cached",
                file.id()
            )));
        }
        self.files[idx] = Some(file);
        self.count += 1;
        Ok(())
    }
}

/// Cache of open segment handles, bounded by `max_open`.
pub struct HandleCache {
    vfs: Arc<dyn Vfs>,
    prefix: PathBuf,
    max_open: usize,
    slots: RwLock<Slots>,
    /// Per-index locks serializing segment opens, so two tasks racing to
    /// open the same segment produce a single shared handle.
    open_locks: Mutex<HashMap<u16, Arc<AsyncMutex<()>>>>,
}

impl HandleCache {
    pub fn new(vfs: Arc<dyn Vfs>, prefix: PathBuf, max_open: usize) -> Self {
        Self {
            vfs,
            prefix,
            max_open,
            slots: RwLock::new(Slots {
                files: Vec::new(),
                count: 0,
            }),
            open_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn path_for(&self, id: SegmentId) -> PathBuf {
        self.prefix.join(id.filename())
    }

    /// Number of cached handles.
    pub fn len(&self) -> usize {
        self.slots.read().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: SegmentId) -> Option<Arc<SegmentFile>> {
        self.slots.read().get(id)
    }

    /// Returns the cached handle for `id`, opening the segment if needed.
    ///
    /// `current` names the writable segment, which is never evicted.
    pub async fn open(
        &self,
        id: SegmentId,
        current: SegmentId,
        create: bool,
    ) -> Result<Arc<SegmentFile>> {
        if let Some(file) = self.get(id) {
            return Ok(file);
        }

        let lock = Arc::clone(
            self.open_locks
                .lock()
                .entry(id.0)
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        );
        let _guard = lock.lock().await;

        // Another task may have opened the segment while we waited.
        if let Some(file) = self.get(id) {
            return Ok(file);
        }

        let file = self.vfs.open(&self.path_for(id), create).await?;
        let size = file.len()?;
        let segment = Arc::new(SegmentFile::new(id, file, size));

        let mut slots = self.slots.write();
        slots.evict_if_full(self.max_open, current);
        // Opens are serialized per index, so the slot must still be empty.
        slots.insert(Arc::clone(&segment))?;
        Ok(segment)
    }

    /// Synchronous variant for read paths that must not suspend. Never
    /// creates segments; insertion is idempotent under races with async
    /// openers.
    pub fn open_sync(&self, id: SegmentId, current: SegmentId) -> Result<Arc<SegmentFile>> {
        if let Some(file) = self.get(id) {
            return Ok(file);
        }

        let file = self.vfs.open_sync(&self.path_for(id), false)?;
        let size = file.len()?;
        let segment = Arc::new(SegmentFile::new(id, file, size));

        let mut slots = self.slots.write();
        if let Some(existing) = slots.get(id) {
            return Ok(existing);
        }
        slots.evict_if_full(self.max_open, current);
        slots.insert(Arc::clone(&segment))?;
        Ok(segment)
    }

    /// Drops the handle for `id`, returning it if it was cached.
    pub fn remove(&self, id: SegmentId) -> Option<Arc<SegmentFile>> {
        let mut slots = self.slots.write();
        let slot = slots.files.get_mut(id.0 as usize)?;
        let file = slot.take()?;
        slots.count -= 1;
        Some(file)
    }

    /// Removes and returns every cached handle.
    pub fn drain(&self) -> Vec<Arc<SegmentFile>> {
        let mut slots = self.slots.write();
        let files: Vec<_> = slots.files.iter_mut().filter_map(Option::take).collect();
        slots.count = 0;
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_vfs::MemVfs;

    async fn cache_with_segments(max_open: usize, segments: u16) -> HandleCache {
        let vfs = Arc::new(MemVfs::new());
        let prefix = PathBuf::from("/db");
        vfs.mkdirp(&prefix, 0o750).await.unwrap();
        for i in 1..=segments {
            vfs.open(&prefix.join(SegmentId(i).filename()), true)
                .await
                .unwrap();
        }
        HandleCache::new(vfs, prefix, max_open)
    }

    #[tokio::test]
    async fn test_open_returns_shared_handle() {
        let cache = cache_with_segments(4, 1).await;
        let a = cache
            .open(SegmentId(1), SegmentId(1), false)
            .await
            .unwrap();
        let b = cache
            .open(SegmentId(1), SegmentId(1), false)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_racing_openers_share_one_handle() {
        let cache = Arc::new(cache_with_segments(4, 1).await);
        let (a, b) = tokio::join!(
            {
                let cache = Arc::clone(&cache);
                async move { cache.open(SegmentId(1), SegmentId(1), false).await }
            },
            {
                let cache = Arc::clone(&cache);
                async move { cache.open(SegmentId(1), SegmentId(1), false).await }
            }
        );
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_eviction_respects_cap_and_current() {
        let cache = cache_with_segments(2, 3).await;
        let current = SegmentId(3);

        cache.open(SegmentId(1), current, false).await.unwrap();
        cache.open(SegmentId(2), current, false).await.unwrap();
        cache.open(current, current, false).await.unwrap();
        assert_eq!(cache.len(), 2);

        // The current segment survives; one of the others was evicted.
        assert!(cache.get(current).is_some());
        let survivors = [SegmentId(1), SegmentId(2)]
            .iter()
            .filter(|id| cache.get(**id).is_some())
            .count();
        assert_eq!(survivors, 1);
    }

    #[tokio::test]
    async fn test_cap_is_soft_when_no_candidate_exists() {
        let cache = cache_with_segments(1, 2).await;

        // Segment 1 is current, so it is not evictable; segment 2 joins anyway.
        cache
            .open(SegmentId(1), SegmentId(1), false)
            .await
            .unwrap();
        cache
            .open(SegmentId(2), SegmentId(1), false)
            .await
            .unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_open_sync_uses_cache() {
        let cache = cache_with_segments(4, 2).await;
        let a = cache
            .open(SegmentId(1), SegmentId(2), false)
            .await
            .unwrap();
        let b = cache.open_sync(SegmentId(1), SegmentId(2)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = cache.open_sync(SegmentId(2), SegmentId(2)).unwrap();
        assert_eq!(c.id(), SegmentId(2));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_and_drain() {
        let cache = cache_with_segments(4, 3).await;
        for i in 1..=3 {
            cache
                .open(SegmentId(i), SegmentId(3), false)
                .await
                .unwrap();
        }

        assert!(cache.remove(SegmentId(2)).is_some());
        assert!(cache.remove(SegmentId(2)).is_none());
        assert_eq!(cache.len(), 2);

        let drained = cache.drain();
        assert_eq!(drained.len(), 2);
        assert!(cache.is_empty());
    }
}
