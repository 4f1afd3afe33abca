//! Hash capability consumed by the node store.
//!
//! The store never picks a hash function itself. It hashes internal nodes,
//! authenticates meta checkpoints with a truncated digest, and compares
//! against the zero digest that marks an empty subtree; all three go through
//! this trait.

use sha2::{Digest, Sha256};

/// Domain-separation prefix for internal-node hashing.
const INTERNAL_PREFIX: u8 = 0x01;

/// Minimum digest width. Meta checkpoints embed the first 20 bytes of a
/// digest as their checksum, so anything narrower cannot back a store.
pub const MIN_DIGEST_SIZE: usize = 20;

/// Cryptographic hash capability.
pub trait NodeHasher: Send + Sync {
    /// Digest width in bytes. Must be at least [`MIN_DIGEST_SIZE`].
    fn size(&self) -> usize;

    /// The all-zero digest marking the empty subtree.
    fn zero_digest(&self) -> &[u8];

    /// Hashes arbitrary bytes.
    fn digest(&self, data: &[u8]) -> Vec<u8>;

    /// Hashes an internal node from its two child digests.
    fn hash_internal(&self, left: &[u8], right: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + left.len() + right.len());
        buf.push(INTERNAL_PREFIX);
        buf.extend_from_slice(left);
        buf.extend_from_slice(right);
        self.digest(&buf)
    }
}

/// SHA-256 backed hasher, the default for tests and standalone trees.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Hasher;

static ZERO_DIGEST_256: [u8; 32] = [0u8; 32];

impl NodeHasher for Sha256Hasher {
    fn size(&self) -> usize {
        32
    }

    fn zero_digest(&self) -> &[u8] {
        &ZERO_DIGEST_256
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_width() {
        let hasher = Sha256Hasher;
        assert_eq!(hasher.size(), 32);
        assert!(hasher.size() >= MIN_DIGEST_SIZE);
        assert_eq!(hasher.digest(b"canopy").len(), 32);
    }

    #[test]
    fn test_zero_digest_is_all_zeros() {
        let hasher = Sha256Hasher;
        assert_eq!(hasher.zero_digest().len(), hasher.size());
        assert!(hasher.zero_digest().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_digest_is_deterministic() {
        let hasher = Sha256Hasher;
        assert_eq!(hasher.digest(b"abc"), hasher.digest(b"abc"));
        assert_ne!(hasher.digest(b"abc"), hasher.digest(b"abd"));
    }

    #[test]
    fn test_internal_hash_is_domain_separated() {
        let hasher = Sha256Hasher;
        let left = hasher.digest(b"left");
        let right = hasher.digest(b"right");

        let internal = hasher.hash_internal(&left, &right);
        assert_eq!(internal.len(), hasher.size());

        // Not the plain concatenation hash, and order matters.
        let mut concat = left.clone();
        concat.extend_from_slice(&right);
        assert_ne!(internal, hasher.digest(&concat));
        assert_ne!(internal, hasher.hash_internal(&right, &left));
    }
}
