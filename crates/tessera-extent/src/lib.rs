//! Tessera Extent - small durable files kept next to an extent store
//!
//! - [`ExtentMetaFile`]: fixed-offset record holding the base extent id
//!   and the reserved (pre-allocated) extent id
//! - [`TombstoneLog`]: append-only log of deleted extent ids

mod meta_file;
mod tombstone;

pub use meta_file::ExtentMetaFile;
pub use tombstone::TombstoneLog;

/// Error type for extent file operations
#[derive(Debug, thiserror::Error)]
pub enum ExtentError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("extent metadata file {path} is {len} bytes, expected at least {expected}")]
    ShortFile { path: String, len: u64, expected: u64 },
}

pub type ExtentResult<T> = Result<T, ExtentError>;
