//! Error types for CanopyDB.

use thiserror::Error;

/// Result type alias using CanopyError.
pub type Result<T> = std::result::Result<T, CanopyError>;

/// Errors that can occur in CanopyDB operations.
#[derive(Debug, Error)]
pub enum CanopyError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Lifecycle errors
    #[error("store is closed")]
    StoreClosed,

    #[error("store is already open")]
    StoreOpen,

    // Log errors
    #[error("invalid file index: {index} (current: {current})")]
    InvalidFileIndex { index: u16, current: u16 },

    #[error("missing tree files")]
    MissingTreeFiles,

    #[error("database corruption: unknown node tag {tag} at {index}/{pos}")]
    DatabaseCorruption { tag: u8, index: u16, pos: u32 },

    // Meta record errors
    #[error("invalid meta magic at {index}/{pos}")]
    InvalidMagic { index: u16, pos: u32 },

    #[error("invalid meta checksum at {index}/{pos}")]
    InvalidChecksum { index: u16, pos: u32 },

    // History errors
    #[error("missing node for root {root}")]
    MissingNode { root: String },

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    // Internal errors
    #[error("assertion failed: {0}")]
    Assertion(String),
}

impl CanopyError {
    /// True for the meta parse failures that the backward scan treats as
    /// "not a meta record at this position" rather than as fatal.
    pub fn is_meta_mismatch(&self) -> bool {
        matches!(
            self,
            CanopyError::InvalidMagic { .. } | CanopyError::InvalidChecksum { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: CanopyError = io_err.into();
        assert!(matches!(err, CanopyError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_lifecycle_errors_display() {
        assert_eq!(CanopyError::StoreClosed.to_string(), "store is closed");
        assert_eq!(CanopyError::StoreOpen.to_string(), "store is already open");
    }

    #[test]
    fn test_file_index_display() {
        let err = CanopyError::InvalidFileIndex {
            index: 7,
            current: 3,
        };
        assert_eq!(err.to_string(), "invalid file index: 7 (current: 3)");
    }

    #[test]
    fn test_corruption_display() {
        let err = CanopyError::DatabaseCorruption {
            tag: 9,
            index: 2,
            pos: 154,
        };
        assert_eq!(
            err.to_string(),
            "database corruption: unknown node tag 9 at 2/154"
        );
    }

    #[test]
    fn test_meta_mismatch_classification() {
        assert!(CanopyError::InvalidMagic { index: 1, pos: 0 }.is_meta_mismatch());
        assert!(CanopyError::InvalidChecksum { index: 1, pos: 36 }.is_meta_mismatch());
        assert!(!CanopyError::MissingTreeFiles.is_meta_mismatch());
    }

    #[test]
    fn test_missing_node_display() {
        let err = CanopyError::MissingNode {
            root: "ab".repeat(16),
        };
        assert!(err.to_string().starts_with("missing node for root abab"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CanopyError>();
    }
}
