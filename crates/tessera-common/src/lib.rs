//! Tessera Common - Shared types and configuration
//!
//! This crate provides the entity types indexed by metadata partitions
//! (inodes, directory entries, extent keys), the common error type and
//! the configuration structures used across Tessera components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, MarshalVersion, PartitionConfig, StoreMode};
pub use error::{Error, Result};
pub use types::*;
