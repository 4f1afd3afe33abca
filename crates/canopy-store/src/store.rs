//! Store orchestration: lifecycle, node I/O, commits, and root history.
//!
//! The store drives one writable segment at a time. Writes stage into the
//! write buffer; `commit` renders the buffer into per-segment chunks,
//! appends them (rolling segments as needed), appends a meta checkpoint,
//! and fsyncs before the in-memory state flips. Reads go through the
//! bounded handle cache and may target any segment still on disk.

use bytes::Bytes;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use canopy_common::hash::MIN_DIGEST_SIZE;
use canopy_common::{CanopyError, NodeHasher, Result, StoreConfig};
use canopy_vfs::Vfs;

use crate::buffer::WriteBuffer;
use crate::constants::{parse_file_name, META_SIZE};
use crate::file::{SegmentFile, SegmentId};
use crate::handles::HandleCache;
use crate::meta::MetaRecord;
use crate::node::{HashRef, Layout, Leaf, Node};
use crate::recovery;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Closed,
    Opening,
    Open,
    Committing,
    Closing,
}

/// The committed checkpoint: what the last meta record said and where it
/// lives. The location seeds the `prev` pointer of the next checkpoint.
#[derive(Debug, Clone, Copy, Default)]
struct CommittedState {
    meta: MetaRecord,
    meta_index: SegmentId,
    meta_pos: u32,
}

/// The persistent node store.
///
/// Single logical writer, many readers: the staging and commit methods take
/// `&mut self`, reads take `&self`.
pub struct Store {
    config: StoreConfig,
    vfs: Arc<dyn Vfs>,
    hasher: Arc<dyn NodeHasher>,
    layout: Layout,
    handles: HandleCache,
    lifecycle: Lifecycle,
    wb: WriteBuffer,
    /// Segment currently being appended to.
    current: Option<Arc<SegmentFile>>,
    /// On-disk bytes across all segments; measured at open, maintained
    /// through commits.
    total_size: u64,
    state: CommittedState,
    /// Frontier of the backward history walk. Every checkpoint between the
    /// newest meta and this frontier has its root memoized in `root_cache`.
    history: AsyncMutex<MetaRecord>,
    /// Hex root digest → pointer to the committed root node.
    root_cache: RwLock<HashMap<String, HashRef>>,
}

impl Store {
    pub fn new(
        vfs: Arc<dyn Vfs>,
        hasher: Arc<dyn NodeHasher>,
        config: StoreConfig,
    ) -> Result<Self> {
        config.validate()?;
        if hasher.size() < MIN_DIGEST_SIZE {
            return Err(CanopyError::Config(format!(
                "digest size {} is below the {MIN_DIGEST_SIZE}-byte minimum",
                hasher.size()
            )));
        }
        let layout = Layout::new(hasher.size(), config.key_bits);
        if layout.leaf_size > layout.node_size {
            return Err(CanopyError::Config(format!(
                "{}-bit keys do not fit a {}-byte node slot",
                config.key_bits, layout.node_size
            )));
        }

        let handles = HandleCache::new(
            Arc::clone(&vfs),
            config.prefix.clone(),
            config.max_open_files,
        );
        let wb = WriteBuffer::new(config.max_file_size);

        Ok(Self {
            config,
            vfs,
            hasher,
            layout,
            handles,
            lifecycle: Lifecycle::Closed,
            wb,
            current: None,
            total_size: 0,
            state: CommittedState::default(),
            history: AsyncMutex::new(MetaRecord::default()),
            root_cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn is_open(&self) -> bool {
        self.lifecycle == Lifecycle::Open
    }

    /// Index of the segment currently being appended to.
    pub fn current_index(&self) -> SegmentId {
        self.current
            .as_ref()
            .map(|file| file.id())
            .unwrap_or(SegmentId::NONE)
    }

    /// Bytes staged since the last commit.
    pub fn pending_bytes(&self) -> usize {
        self.wb.written()
    }

    /// True once enough bytes are staged that the caller should commit.
    pub fn needs_flush(&self) -> bool {
        self.wb.written() >= self.config.flush_threshold
    }

    /// Number of cached segment handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Number of segment files on disk.
    pub fn segment_count(&self) -> usize {
        self.current_index().0 as usize
    }

    /// Total committed bytes across all segments.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    fn ensure_open(&self) -> Result<()> {
        if self.lifecycle != Lifecycle::Open {
            return Err(CanopyError::StoreClosed);
        }
        Ok(())
    }

    // Lifecycle

    /// Opens the store: creates the prefix directory, validates the segment
    /// files, and (standalone) recovers the newest checkpoint.
    pub async fn open(&mut self) -> Result<()> {
        if self.lifecycle != Lifecycle::Closed {
            return Err(CanopyError::StoreOpen);
        }
        self.lifecycle = Lifecycle::Opening;
        match self.open_inner().await {
            Ok(()) => {
                self.lifecycle = Lifecycle::Open;
                Ok(())
            }
            Err(err) => {
                self.reset_in_memory();
                self.lifecycle = Lifecycle::Closed;
                Err(err)
            }
        }
    }

    async fn open_inner(&mut self) -> Result<()> {
        self.vfs.mkdirp(&self.config.prefix, 0o750).await?;

        match self.scan_directory().await? {
            None => self.start_fresh().await?,
            Some(highest) => {
                if self.config.standalone {
                    let recovered = recovery::recover(
                        &self.vfs,
                        &self.handles,
                        self.hasher.as_ref(),
                        highest,
                    )
                    .await?;
                    match recovered {
                        Some((file, state)) => {
                            self.state = CommittedState {
                                meta: state.meta,
                                meta_index: state.meta_index,
                                meta_pos: state.meta_pos,
                            };
                            self.wb.start(file.id(), file.size() as u32);
                            self.current = Some(file);
                        }
                        None => self.start_fresh().await?,
                    }
                } else {
                    // Embedded: the host owns durability; append to the
                    // highest segment without scanning for checkpoints.
                    let file = self.handles.open(highest, highest, false).await?;
                    self.wb.start(file.id(), file.size() as u32);
                    self.current = Some(file);
                }
            }
        }

        self.total_size = self.measure_total_size().await?;

        *self.history.get_mut() = self.state.meta;
        if self.config.standalone && !self.state.meta.root_index.is_none() {
            let mut root = self
                .read_node_internal(self.state.meta.root_index, self.state.meta.root_pos)
                .await?;
            let link = root.to_hash_ref(self.hasher.as_ref())?;
            self.root_cache
                .write()
                .insert(hex::encode(&link.digest), link);
        }

        debug!(
            prefix = %self.config.prefix.display(),
            current = %self.current_index(),
            "store opened"
        );
        Ok(())
    }

    /// Lists the prefix directory and validates the segment numbering.
    async fn scan_directory(&self) -> Result<Option<SegmentId>> {
        let names = self.vfs.readdir(&self.config.prefix).await?;
        let mut indices: Vec<u16> = names
            .iter()
            .filter_map(|name| parse_file_name(name))
            .collect();
        indices.sort_unstable();
        for (i, index) in indices.iter().enumerate() {
            if *index as usize != i + 1 {
                return Err(CanopyError::MissingTreeFiles);
            }
        }
        Ok(indices.last().map(|index| SegmentId(*index)))
    }

    /// Sums the on-disk segment sizes: the current segment from its handle,
    /// earlier segments by stat.
    async fn measure_total_size(&self) -> Result<u64> {
        let current = self.current_index();
        let mut total = self.current.as_ref().map(|file| file.size()).unwrap_or(0);
        for raw in 1..current.0 {
            let stat = self.vfs.lstat(&self.handles.path_for(SegmentId(raw))).await?;
            total += stat.len;
        }
        Ok(total)
    }

    async fn start_fresh(&mut self) -> Result<()> {
        let file = self
            .handles
            .open(SegmentId::FIRST, SegmentId::FIRST, true)
            .await?;
        self.state = CommittedState::default();
        self.wb.start(file.id(), file.size() as u32);
        self.current = Some(file);
        Ok(())
    }

    fn reset_in_memory(&mut self) {
        drop(self.handles.drain());
        self.current = None;
        self.total_size = 0;
        self.wb.start(SegmentId::NONE, 0);
        self.state = CommittedState::default();
        *self.history.get_mut() = MetaRecord::default();
        self.root_cache.write().clear();
    }

    /// Closes the store, dropping the uncommitted tail of the write buffer.
    pub async fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.lifecycle = Lifecycle::Closing;

        let mut first_err = None;
        for file in self.handles.drain() {
            if let Err(err) = file.close().await {
                first_err.get_or_insert(err);
            }
        }
        self.current = None;
        self.total_size = 0;
        self.wb.start(SegmentId::NONE, 0);
        self.state = CommittedState::default();
        *self.history.get_mut() = MetaRecord::default();
        self.root_cache.write().clear();
        self.lifecycle = Lifecycle::Closed;

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Unlinks every segment and removes the prefix directory. Only valid
    /// while closed.
    ///
    /// When foreign files keep the directory alive, it is renamed to a
    /// randomized sibling instead; the rename is observable and intended.
    pub async fn destroy(&mut self) -> Result<()> {
        if self.lifecycle != Lifecycle::Closed {
            return Err(CanopyError::StoreOpen);
        }

        let names = self.vfs.readdir(&self.config.prefix).await?;
        for name in &names {
            if parse_file_name(name).is_some() {
                self.vfs.unlink(&self.config.prefix.join(name)).await?;
            }
        }

        if self.vfs.rmdir(&self.config.prefix).await.is_err() {
            let target = Self::rename_target(&self.config.prefix);
            warn!(
                prefix = %self.config.prefix.display(),
                target = %target.display(),
                "prefix not empty, renaming aside"
            );
            self.vfs.rename(&self.config.prefix, &target).await?;
        }
        Ok(())
    }

    fn rename_target(prefix: &Path) -> PathBuf {
        let tag: u64 = rand::rng().random();
        let name = prefix
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "canopy".to_string());
        prefix.with_file_name(format!("{name}.{tag:016x}"))
    }

    // Reads

    fn check_index(&self, index: SegmentId) -> Result<()> {
        let current = self.current_index();
        if index.is_none() || index.0 > current.0 + 1 {
            return Err(CanopyError::InvalidFileIndex {
                index: index.0,
                current: current.0,
            });
        }
        Ok(())
    }

    async fn read_internal(&self, index: SegmentId, pos: u32, size: usize) -> Result<Bytes> {
        self.check_index(index)?;
        let file = self.handles.open(index, self.current_index(), false).await?;
        file.read(pos, size).await
    }

    async fn read_node_internal(&self, index: SegmentId, pos: u32) -> Result<Node> {
        let data = self.read_internal(index, pos, self.layout.node_size).await?;
        Node::decode(data, index, pos, &self.layout)
    }

    /// Reads raw bytes: value payloads, meta records.
    pub async fn read(&self, index: SegmentId, pos: u32, size: usize) -> Result<Bytes> {
        self.ensure_open()?;
        self.read_internal(index, pos, size).await
    }

    /// Synchronous raw read for traversals that must not suspend.
    pub fn read_sync(&self, index: SegmentId, pos: u32, size: usize) -> Result<Bytes> {
        self.ensure_open()?;
        self.check_index(index)?;
        let file = self.handles.open_sync(index, self.current_index())?;
        file.read_sync(pos, size)
    }

    /// Reads and decodes one node slot.
    pub async fn read_node(&self, index: SegmentId, pos: u32) -> Result<Node> {
        self.ensure_open()?;
        self.read_node_internal(index, pos).await
    }

    /// Synchronous variant of [`read_node`](Self::read_node).
    pub fn read_node_sync(&self, index: SegmentId, pos: u32) -> Result<Node> {
        let data = self.read_sync(index, pos, self.layout.node_size)?;
        Node::decode(data, index, pos, &self.layout)
    }

    /// Fetches the internal or leaf node a pointer names.
    pub async fn resolve(&self, link: &HashRef) -> Result<Node> {
        self.read_node(link.index, link.pos).await
    }

    /// Reads a leaf's value payload.
    pub async fn read_value(&self, leaf: &Leaf) -> Result<Bytes> {
        if leaf.vindex.is_none() {
            return leaf
                .value
                .clone()
                .ok_or_else(|| CanopyError::Assertion("leaf has no value".to_string()));
        }
        self.read(leaf.vindex, leaf.vpos, leaf.vsize as usize).await
    }

    // Writes

    /// Stages a node in the write buffer and assigns its position.
    ///
    /// The position is taken after the buffer's boundary check so a node
    /// staged at a segment boundary is recorded at `(next segment, 0)`,
    /// never straddling two segments.
    pub fn write_node(&mut self, node: &mut Node) -> Result<u32> {
        self.ensure_open()?;
        let (index, _) = node.position();
        if !index.is_none() {
            return Err(CanopyError::Assertion(
                "node already has a position".to_string(),
            ));
        }

        let encoded = node.encode(&self.layout)?;
        self.wb.expand(self.layout.node_size);
        let pos = self.wb.position();
        let segment = self.wb.index();
        self.wb.write(&encoded);
        node.set_position(segment, pos);
        Ok(pos)
    }

    /// Stages a leaf's value bytes and records their position on the leaf.
    pub fn write_value(&mut self, leaf: &mut Leaf) -> Result<u32> {
        self.ensure_open()?;
        let value = leaf
            .value
            .clone()
            .ok_or_else(|| CanopyError::Assertion("leaf has no value to stage".to_string()))?;
        if !leaf.vindex.is_none() {
            return Err(CanopyError::Assertion(
                "leaf value already has a position".to_string(),
            ));
        }
        if value.len() as u64 >= self.config.max_file_size as u64 {
            return Err(CanopyError::Assertion(format!(
                "value of {} bytes exceeds the segment size",
                value.len()
            )));
        }

        self.wb.expand(value.len());
        let pos = self.wb.position();
        let index = self.wb.index();
        self.wb.write(&value);
        leaf.vindex = index;
        leaf.vpos = pos;
        leaf.vsize = value.len() as u32;
        Ok(pos)
    }

    /// Stages one zeroed node slot.
    pub fn write_null(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.wb.expand(self.layout.node_size);
        self.wb.pad(self.layout.node_size);
        Ok(())
    }

    // Commit

    /// Makes everything staged since the last commit durable and adopts
    /// `root` as the new committed root.
    ///
    /// In standalone mode a meta checkpoint naming `root` is appended after
    /// the staged bytes; the fsync covers both before the in-memory state
    /// flips. In embedded mode the meta phase is skipped.
    pub async fn commit(&mut self, root: &mut Node) -> Result<()> {
        self.ensure_open()?;
        self.lifecycle = Lifecycle::Committing;
        let result = self.commit_inner(root).await;
        // On error the on-disk tail may be torn; recovery on the next open
        // discards it.
        self.lifecycle = Lifecycle::Open;
        result
    }

    async fn commit_inner(&mut self, root: &mut Node) -> Result<()> {
        let checkpoint = if self.config.standalone {
            Some(self.stage_meta(root)?)
        } else {
            None
        };

        for chunk in self.wb.flush() {
            if chunk.index != self.current_index() {
                let expected = self.current_index().next();
                if chunk.index != expected {
                    return Err(CanopyError::Assertion(format!(
                        "chunk targets segment {} but the next segment is {expected}",
                        chunk.index
                    )));
                }
                // The outgoing segment is complete; make it durable before
                // anything lands in its successor.
                if let Some(current) = &self.current {
                    current.sync().await?;
                }
                let file = self.handles.open(chunk.index, chunk.index, true).await?;
                self.current = Some(file);
            }

            let current = self
                .current
                .as_ref()
                .ok_or_else(|| CanopyError::Assertion("no current segment".to_string()))?;
            if current.size() != chunk.pos as u64 {
                return Err(CanopyError::Assertion(format!(
                    "chunk offset {} does not match segment {} size {}",
                    chunk.pos,
                    current.id(),
                    current.size()
                )));
            }
            current.write(&chunk.data).await?;
            self.total_size += chunk.data.len() as u64;
        }

        let current = self
            .current
            .as_ref()
            .ok_or_else(|| CanopyError::Assertion("no current segment".to_string()))?;
        current.sync().await?;

        if let Some((record, meta_index, meta_pos)) = checkpoint {
            self.state = CommittedState {
                meta: record,
                meta_index,
                meta_pos,
            };
            *self.history.get_mut() = record;
            if !root.is_null() {
                let link = root.to_hash_ref(self.hasher.as_ref())?;
                let key = hex::encode(&link.digest);
                debug!(root = %key, segment = %link.index, pos = link.pos, "commit");
                self.root_cache.write().insert(key, link);
            }
        }
        Ok(())
    }

    /// Stages the meta checkpoint, zero-padded onto a meta-aligned offset.
    fn stage_meta(&mut self, root: &Node) -> Result<(MetaRecord, SegmentId, u32)> {
        let (root_index, root_pos) = if root.is_null() {
            (SegmentId::NONE, 0)
        } else {
            let (index, pos) = root.position();
            if index.is_none() {
                return Err(CanopyError::Assertion(
                    "root node has not been written".to_string(),
                ));
            }
            (index, pos)
        };

        let record = MetaRecord {
            prev_index: self.state.meta_index,
            prev_pos: self.state.meta_pos,
            root_index,
            root_pos,
        };

        // The expand may roll into a fresh segment where offset 0 is already
        // aligned; recompute the padding in that case. The second expand
        // cannot roll over again.
        let mut padding = Self::meta_padding(self.wb.position());
        self.wb.expand(padding + META_SIZE);
        let recomputed = Self::meta_padding(self.wb.position());
        if recomputed != padding {
            padding = recomputed;
            self.wb.expand(padding + META_SIZE);
        }

        self.wb.pad(padding);
        let meta_index = self.wb.index();
        let meta_pos = self.wb.write(&record.encode(self.hasher.as_ref()));
        debug_assert_eq!(meta_pos as usize % META_SIZE, 0);
        Ok((record, meta_index, meta_pos))
    }

    fn meta_padding(pos: u32) -> usize {
        (META_SIZE - (pos as usize % META_SIZE)) % META_SIZE
    }

    // Roots and history

    /// The live root node, [`Node::Null`] before the first commit.
    pub async fn get_root(&self) -> Result<Node> {
        self.ensure_open()?;
        let meta = self.state.meta;
        if meta.root_index.is_none() {
            return Ok(Node::Null);
        }
        self.read_node_internal(meta.root_index, meta.root_pos).await
    }

    /// Digest of the live root; the zero digest for an empty tree.
    pub async fn get_root_hash(&self) -> Result<Bytes> {
        let mut root = self.get_root().await?;
        Ok(root.hash(self.hasher.as_ref()))
    }

    /// Finds a historical root by its digest.
    ///
    /// The zero digest resolves to [`Node::Null`]. Other digests resolve to
    /// an unresolved pointer, first from the root cache and then by walking
    /// the backward meta chain; a digest no checkpoint on disk matches fails
    /// with [`CanopyError::MissingNode`].
    pub async fn get_history(&self, root_hash: &[u8]) -> Result<Node> {
        self.ensure_open()?;
        if root_hash == self.hasher.zero_digest() {
            return Ok(Node::Null);
        }
        let key = hex::encode(root_hash);
        if let Some(link) = self.root_cache.read().get(&key).cloned() {
            return Ok(Node::Hash(link));
        }

        // One walk at a time: the frontier advances across suspensions.
        let mut frontier = self.history.lock().await;

        // The walk that just released the lock may have found this root.
        if let Some(link) = self.root_cache.read().get(&key).cloned() {
            return Ok(Node::Hash(link));
        }

        loop {
            if !frontier.root_index.is_none() {
                let mut node = self
                    .read_node_internal(frontier.root_index, frontier.root_pos)
                    .await?;
                let link = node.to_hash_ref(self.hasher.as_ref())?;
                self.root_cache
                    .write()
                    .insert(hex::encode(&link.digest), link.clone());
                if link.digest[..] == *root_hash {
                    return Ok(Node::Hash(link));
                }
            }

            if frontier.prev_index.is_none() {
                return Err(CanopyError::MissingNode { root: key });
            }
            let data = self
                .read_internal(frontier.prev_index, frontier.prev_pos, META_SIZE)
                .await?;
            *frontier = MetaRecord::decode(
                &data,
                frontier.prev_index,
                frontier.prev_pos,
                self.hasher.as_ref(),
            )?;
        }
    }

    /// True when a checkpoint for `root_hash` is still reachable on disk.
    pub async fn has_root(&self, root_hash: &[u8]) -> Result<bool> {
        match self.get_history(root_hash).await {
            Ok(_) => Ok(true),
            Err(CanopyError::MissingNode { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}
