//! Configuration structures for the CanopyDB store.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{CanopyError, Result};

/// Largest byte size a single segment file may reach.
pub const MAX_FILE_SIZE: u32 = 0x7FFF_F000;

/// Largest usable segment index. Indices are 16 bits on the wire and
/// 1-based, so index 0 is reserved.
pub const MAX_FILES: u32 = 0xFFFF;

/// Configuration for the node store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the segment files.
    pub prefix: PathBuf,
    /// Key width in bits. Keys are exactly `key_bits / 8` bytes.
    pub key_bits: usize,
    /// Maximum size of each segment file.
    pub max_file_size: u32,
    /// Soft cap on simultaneously open segment handles.
    pub max_open_files: usize,
    /// Staged bytes after which a commit should be forced.
    pub flush_threshold: usize,
    /// When set, the store owns durability: it writes meta checkpoints on
    /// commit and recovers state at open. When cleared, the store is
    /// embedded in a host durability protocol and skips both.
    pub standalone: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            prefix: PathBuf::from("./canopy"),
            key_bits: 256,
            max_file_size: MAX_FILE_SIZE,
            max_open_files: 32,
            flush_threshold: 120 * 1024 * 1024, // 120 MiB
            standalone: true,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with defaults for the given prefix directory.
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.key_bits == 0 || self.key_bits % 8 != 0 {
            return Err(CanopyError::Config(format!(
                "key_bits must be a positive multiple of 8, got {}",
                self.key_bits
            )));
        }
        if self.max_file_size == 0 || self.max_file_size > MAX_FILE_SIZE {
            return Err(CanopyError::Config(format!(
                "max_file_size must be in (0, {MAX_FILE_SIZE}], got {}",
                self.max_file_size
            )));
        }
        if self.max_open_files == 0 {
            return Err(CanopyError::Config(
                "max_open_files must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
