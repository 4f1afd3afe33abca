//! Node model and the fixed-width node codec.
//!
//! Every persisted node occupies one `node_size` slot:
//! `1 + 2 * (digest + u16 index + u32 offset)` bytes. Internal nodes fill
//! the slot exactly; leaves occupy `leaf_size` bytes and are zero-padded on
//! the right. The leading tag byte disambiguates the two layouts.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use canopy_common::{CanopyError, NodeHasher, Result};

use crate::constants::{TAG_INTERNAL, TAG_LEAF};
use crate::file::SegmentId;

/// Fixed per-store sizes derived from the digest width and the key width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Digest width in bytes.
    pub digest_size: usize,
    /// Key width in bytes (`key_bits / 8`).
    pub key_size: usize,
    /// Size of one persisted node slot.
    pub node_size: usize,
    /// Occupied prefix of a leaf within its slot.
    pub leaf_size: usize,
}

impl Layout {
    pub fn new(digest_size: usize, key_bits: usize) -> Self {
        let key_size = key_bits / 8;
        let pointer_size = digest_size + 2 + 4;
        Self {
            digest_size,
            key_size,
            node_size: 1 + 2 * pointer_size,
            leaf_size: 1 + digest_size + key_size + 2 + 4 + 4,
        }
    }
}

/// An unresolved reference to a node persisted at `(index, pos)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRef {
    pub digest: Bytes,
    pub index: SegmentId,
    pub pos: u32,
}

/// A child slot of an internal node.
///
/// On disk a child is always a digest plus pointer fields; a zero digest
/// marks the empty subtree and its pointer fields are ignored.
#[derive(Debug, Clone)]
pub enum Child {
    Null,
    Hash(HashRef),
}

impl Child {
    /// The child's digest, with the zero digest standing in for [`Child::Null`].
    pub fn digest<'a>(&'a self, hasher: &'a dyn NodeHasher) -> &'a [u8] {
        match self {
            Child::Null => hasher.zero_digest(),
            Child::Hash(link) => &link.digest,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Child::Null)
    }
}

/// An internal node: two children, hash memoized on first request.
#[derive(Debug, Clone)]
pub struct Internal {
    pub left: Child,
    pub right: Child,
    hash: Option<Bytes>,
    /// Placement, assigned when written or read. Not part of this node's
    /// own on-disk payload.
    pub index: SegmentId,
    pub pos: u32,
}

impl Internal {
    pub fn new(left: Child, right: Child) -> Self {
        Self {
            left,
            right,
            hash: None,
            index: SegmentId::NONE,
            pos: 0,
        }
    }

    pub fn hash(&mut self, hasher: &dyn NodeHasher) -> Bytes {
        if self.hash.is_none() {
            let digest =
                hasher.hash_internal(self.left.digest(hasher), self.right.digest(hasher));
            self.hash = Some(Bytes::from(digest));
        }
        self.hash.as_ref().expect("memoized above").clone()
    }
}

/// A leaf node: a key, a pointer into the value area, and the leaf digest
/// computed by the tree layer.
#[derive(Debug, Clone)]
pub struct Leaf {
    pub digest: Bytes,
    pub key: Bytes,
    /// Raw value bytes, present until staged with `write_value`.
    pub value: Option<Bytes>,
    /// Value placement.
    pub vindex: SegmentId,
    pub vpos: u32,
    pub vsize: u32,
    /// Node placement.
    pub index: SegmentId,
    pub pos: u32,
}

impl Leaf {
    pub fn new(key: Bytes, value: Bytes, digest: Bytes) -> Self {
        Self {
            digest,
            key,
            value: Some(value),
            vindex: SegmentId::NONE,
            vpos: 0,
            vsize: 0,
            index: SegmentId::NONE,
            pos: 0,
        }
    }
}

/// A node of the trie as the store sees it.
#[derive(Debug, Clone)]
pub enum Node {
    /// The empty subtree. Hash equals the zero digest.
    Null,
    Internal(Internal),
    Leaf(Leaf),
    /// An unresolved pointer to a persisted node.
    Hash(HashRef),
}

impl Node {
    pub fn is_null(&self) -> bool {
        matches!(self, Node::Null)
    }

    /// The node's placement in the log, `(NONE, 0)` when unwritten.
    pub fn position(&self) -> (SegmentId, u32) {
        match self {
            Node::Null => (SegmentId::NONE, 0),
            Node::Internal(internal) => (internal.index, internal.pos),
            Node::Leaf(leaf) => (leaf.index, leaf.pos),
            Node::Hash(link) => (link.index, link.pos),
        }
    }

    pub(crate) fn set_position(&mut self, index: SegmentId, pos: u32) {
        match self {
            Node::Internal(internal) => {
                internal.index = index;
                internal.pos = pos;
            }
            Node::Leaf(leaf) => {
                leaf.index = index;
                leaf.pos = pos;
            }
            Node::Null | Node::Hash(_) => {}
        }
    }

    /// The node's digest; internal hashes are memoized on first request.
    pub fn hash(&mut self, hasher: &dyn NodeHasher) -> Bytes {
        match self {
            Node::Null => Bytes::copy_from_slice(hasher.zero_digest()),
            Node::Internal(internal) => internal.hash(hasher),
            Node::Leaf(leaf) => leaf.digest.clone(),
            Node::Hash(link) => link.digest.clone(),
        }
    }

    /// An unresolved pointer to this node. Requires a placement.
    pub fn to_hash_ref(&mut self, hasher: &dyn NodeHasher) -> Result<HashRef> {
        let (index, pos) = self.position();
        if index.is_none() {
            return Err(CanopyError::Assertion(
                "node has no position".to_string(),
            ));
        }
        let digest = self.hash(hasher);
        Ok(HashRef { digest, index, pos })
    }

    /// Encodes the node into one `node_size` slot.
    ///
    /// Only internal and leaf nodes have an on-disk form.
    pub fn encode(&self, layout: &Layout) -> Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(layout.node_size);
        match self {
            Node::Internal(internal) => {
                buf.put_u8(TAG_INTERNAL);
                encode_child(&mut buf, &internal.left, layout)?;
                encode_child(&mut buf, &internal.right, layout)?;
            }
            Node::Leaf(leaf) => {
                if leaf.key.len() != layout.key_size {
                    return Err(CanopyError::Assertion(format!(
                        "leaf key must be {} bytes, got {}",
                        layout.key_size,
                        leaf.key.len()
                    )));
                }
                if leaf.digest.len() != layout.digest_size {
                    return Err(CanopyError::Assertion(format!(
                        "leaf digest must be {} bytes, got {}",
                        layout.digest_size,
                        leaf.digest.len()
                    )));
                }
                buf.put_u8(TAG_LEAF);
                buf.put_slice(&leaf.digest);
                buf.put_slice(&leaf.key);
                buf.put_u16_le(leaf.vindex.0);
                buf.put_u32_le(leaf.vpos);
                buf.put_u32_le(leaf.vsize);
                debug_assert_eq!(buf.len(), layout.leaf_size);
                buf.resize(layout.node_size, 0);
            }
            Node::Null | Node::Hash(_) => {
                return Err(CanopyError::Assertion(
                    "only internal and leaf nodes are persisted".to_string(),
                ));
            }
        }
        debug_assert_eq!(buf.len(), layout.node_size);
        Ok(buf)
    }

    /// Decodes one `node_size` slot read from `(index, pos)`.
    ///
    /// Digest and key fields are zero-copy views of `data`.
    pub fn decode(mut data: Bytes, index: SegmentId, pos: u32, layout: &Layout) -> Result<Node> {
        debug_assert!(data.len() >= layout.node_size);
        let tag = data.get_u8();
        match tag {
            TAG_INTERNAL => {
                let left = decode_child(&mut data, layout);
                let right = decode_child(&mut data, layout);
                Ok(Node::Internal(Internal {
                    left,
                    right,
                    hash: None,
                    index,
                    pos,
                }))
            }
            TAG_LEAF => {
                let digest = data.split_to(layout.digest_size);
                let key = data.split_to(layout.key_size);
                let vindex = SegmentId(data.get_u16_le());
                let vpos = data.get_u32_le();
                let vsize = data.get_u32_le();
                Ok(Node::Leaf(Leaf {
                    digest,
                    key,
                    value: None,
                    vindex,
                    vpos,
                    vsize,
                    index,
                    pos,
                }))
            }
            _ => Err(CanopyError::DatabaseCorruption {
                tag,
                index: index.0,
                pos,
            }),
        }
    }
}

fn encode_child(buf: &mut BytesMut, child: &Child, layout: &Layout) -> Result<()> {
    match child {
        Child::Null => {
            buf.put_bytes(0, layout.digest_size);
            buf.put_u16_le(0);
            buf.put_u32_le(0);
        }
        Child::Hash(link) => {
            if link.digest.len() != layout.digest_size {
                return Err(CanopyError::Assertion(format!(
                    "child digest must be {} bytes, got {}",
                    layout.digest_size,
                    link.digest.len()
                )));
            }
            buf.put_slice(&link.digest);
            buf.put_u16_le(link.index.0);
            buf.put_u32_le(link.pos);
        }
    }
    Ok(())
}

fn decode_child(data: &mut Bytes, layout: &Layout) -> Child {
    let digest = data.split_to(layout.digest_size);
    let index = SegmentId(data.get_u16_le());
    let pos = data.get_u32_le();
    // A zero digest is the empty subtree; its pointer fields carry no meaning.
    if digest.iter().all(|b| *b == 0) {
        return Child::Null;
    }
    Child::Hash(HashRef { digest, index, pos })
}
