//! Persistent node store for the CanopyDB authenticated Merkle trie.
//!
//! The store is an append-only, segmented, crash-consistent log of
//! fixed-size node records and variable-length value payloads. A chain of
//! checksummed meta records makes every commit a durable checkpoint; after
//! an unclean shutdown, a backward scan finds the newest intact checkpoint
//! and truncates the torn tail.

pub mod buffer;
pub mod constants;
pub mod file;
pub mod handles;
pub mod meta;
pub mod node;
pub mod recovery;
pub mod store;

pub use buffer::{WriteBuffer, WriteChunk};
pub use file::{SegmentFile, SegmentId};
pub use handles::HandleCache;
pub use meta::MetaRecord;
pub use node::{Child, HashRef, Internal, Layout, Leaf, Node};
pub use store::Store;
