//! Meta records: the 36-byte commit checkpoints.
//!
//! Layout (all integers little-endian):
//! - magic: 4 bytes
//! - prev meta segment: 2 bytes
//! - prev meta offset: 4 bytes
//! - root segment: 2 bytes
//! - root offset: 4 bytes
//! - checksum: first 20 bytes of `digest(bytes[0..16])`
//!
//! The prev-meta fields form a singly-linked backward chain of checkpoints;
//! the recovery scan and the history walk both follow it. A meta record
//! always sits at an offset that is a multiple of its own size.

use bytes::{Buf, BufMut, BytesMut};

use canopy_common::{CanopyError, NodeHasher, Result};

use crate::constants::{META_CHECKSUM_SIZE, META_HEADER_SIZE, META_MAGIC, META_SIZE};
use crate::file::SegmentId;

/// A parsed meta record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetaRecord {
    /// Location of the previous meta record, `(NONE, 0)` when this is the
    /// first checkpoint.
    pub prev_index: SegmentId,
    pub prev_pos: u32,
    /// Location of the committed root node, `(NONE, 0)` when the tree was
    /// empty at commit time.
    pub root_index: SegmentId,
    pub root_pos: u32,
}

impl MetaRecord {
    /// Encodes the record, checksummed with the configured hash.
    pub fn encode(&self, hasher: &dyn NodeHasher) -> BytesMut {
        let mut buf = BytesMut::with_capacity(META_SIZE);
        buf.put_u32_le(META_MAGIC);
        buf.put_u16_le(self.prev_index.0);
        buf.put_u32_le(self.prev_pos);
        buf.put_u16_le(self.root_index.0);
        buf.put_u32_le(self.root_pos);
        debug_assert_eq!(buf.len(), META_HEADER_SIZE);

        let checksum = hasher.digest(&buf[..META_HEADER_SIZE]);
        buf.put_slice(&checksum[..META_CHECKSUM_SIZE]);
        debug_assert_eq!(buf.len(), META_SIZE);
        buf
    }

    /// Parses and verifies a record read from `(index, pos)`.
    pub fn decode(
        data: &[u8],
        index: SegmentId,
        pos: u32,
        hasher: &dyn NodeHasher,
    ) -> Result<Self> {
        debug_assert!(data.len() >= META_SIZE);
        let header = &data[..META_HEADER_SIZE];
        let mut cursor = data;

        let magic = cursor.get_u32_le();
        if magic != META_MAGIC {
            return Err(CanopyError::InvalidMagic {
                index: index.0,
                pos,
            });
        }

        let prev_index = SegmentId(cursor.get_u16_le());
        let prev_pos = cursor.get_u32_le();
        let root_index = SegmentId(cursor.get_u16_le());
        let root_pos = cursor.get_u32_le();

        let expected = hasher.digest(header);
        if cursor[..META_CHECKSUM_SIZE] != expected[..META_CHECKSUM_SIZE] {
            return Err(CanopyError::InvalidChecksum {
                index: index.0,
                pos,
            });
        }

        Ok(Self {
            prev_index,
            prev_pos,
            root_index,
            root_pos,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_common::Sha256Hasher;

    fn sample() -> MetaRecord {
        MetaRecord {
            prev_index: SegmentId(1),
            prev_pos: 252,
            root_index: SegmentId(2),
            root_pos: 77,
        }
    }

    #[test]
    fn test_encoded_size_and_magic() {
        let hasher = Sha256Hasher;
        let encoded = sample().encode(&hasher);
        assert_eq!(encoded.len(), META_SIZE);
        assert_eq!(&encoded[..4], &META_MAGIC.to_le_bytes());
    }

    #[test]
    fn test_roundtrip() {
        let hasher = Sha256Hasher;
        let record = sample();
        let encoded = record.encode(&hasher);
        let decoded = MetaRecord::decode(&encoded, SegmentId(2), 108, &hasher).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_checksum_authenticates_header() {
        let hasher = Sha256Hasher;
        let mut encoded = sample().encode(&hasher);

        // Flip one header bit: the checksum no longer matches.
        encoded[6] ^= 0x01;
        let err = MetaRecord::decode(&encoded, SegmentId(1), 36, &hasher).unwrap_err();
        assert!(matches!(err, CanopyError::InvalidChecksum { index: 1, pos: 36 }));

        // Flip a checksum byte instead.
        let mut encoded = sample().encode(&hasher);
        encoded[META_SIZE - 1] ^= 0x01;
        let err = MetaRecord::decode(&encoded, SegmentId(1), 72, &hasher).unwrap_err();
        assert!(err.is_meta_mismatch());
    }

    #[test]
    fn test_bad_magic() {
        let hasher = Sha256Hasher;
        let mut encoded = sample().encode(&hasher);
        encoded[0] = 0;
        let err = MetaRecord::decode(&encoded, SegmentId(3), 0, &hasher).unwrap_err();
        assert!(matches!(err, CanopyError::InvalidMagic { index: 3, pos: 0 }));
    }

    #[test]
    fn test_default_is_empty_chain() {
        let record = MetaRecord::default();
        assert!(record.prev_index.is_none());
        assert!(record.root_index.is_none());
    }
}
