//! CanopyDB common errors, configuration, and the hash capability.
//!
//! This crate provides shared definitions used across all CanopyDB components.

pub mod config;
pub mod error;
pub mod hash;

pub use config::StoreConfig;
pub use error::{CanopyError, Result};
pub use hash::{NodeHasher, Sha256Hasher};
