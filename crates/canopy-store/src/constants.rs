//! Store constants for the on-disk format and file lifecycle.

// Node record constants

/// Tag byte of a persisted internal node.
pub const TAG_INTERNAL: u8 = 1;

/// Tag byte of a persisted leaf node.
pub const TAG_LEAF: u8 = 2;

// Meta record constants

/// Magic framing a meta record ("mrkl" read as a little-endian u32).
pub const META_MAGIC: u32 = 0x6d72_6b6c;

/// Size of a meta record on disk.
pub const META_SIZE: usize = 36;

/// Bytes of the meta record covered by the checksum.
pub const META_HEADER_SIZE: usize = 16;

/// Truncated-digest checksum width inside a meta record.
pub const META_CHECKSUM_SIZE: usize = 20;

// Recovery constants

/// Allocation cap for the backward meta scan's read window.
pub const READ_BUFFER: usize = 1 << 20;

/// Scan window size: the largest meta multiple within [`READ_BUFFER`].
/// Window bases stay meta-aligned, so a record never straddles two windows.
pub const SLAB_SIZE: usize = (READ_BUFFER / META_SIZE) * META_SIZE;

// Write buffer constants

/// Initial capacity of the write buffer; growth doubles from here.
pub const WRITE_BUFFER_INITIAL: usize = 8 * 1024;

// Segment file constants

/// Width of the zero-padded decimal segment file name.
pub const FILE_NAME_WIDTH: usize = 10;

/// Parses a directory entry name as a segment index.
///
/// Accepts exactly [`FILE_NAME_WIDTH`] ASCII digits naming an index in
/// `1..=0xFFFF`; anything else is a foreign file and yields `None`.
pub fn parse_file_name(name: &str) -> Option<u16> {
    if name.len() != FILE_NAME_WIDTH || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match name.parse::<u32>() {
        Ok(index) if (1..=0xFFFF).contains(&index) => Some(index as u16),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slab_size_is_meta_aligned() {
        assert_eq!(SLAB_SIZE % META_SIZE, 0);
        assert!(SLAB_SIZE <= READ_BUFFER);
        assert!(SLAB_SIZE + META_SIZE > READ_BUFFER);
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(parse_file_name("0000000001"), Some(1));
        assert_eq!(parse_file_name("0000065535"), Some(0xFFFF));
        assert_eq!(parse_file_name("0000065536"), None); // out of range
        assert_eq!(parse_file_name("0000000000"), None); // index 0 reserved
        assert_eq!(parse_file_name("1"), None); // not zero-padded
        assert_eq!(parse_file_name("000000001x"), None);
        assert_eq!(parse_file_name("meta"), None);
    }
}
