//! Extent metadata file
//!
//! ```text
//! +-----------------+---------------------+
//! | base extent id  | reserved extent id  |
//! | u64 BE @ 0      | u64 BE @ 8          |
//! +-----------------+---------------------+
//! ```

use crate::{ExtentError, ExtentResult};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

const BASE_EXTENT_ID_OFFSET: u64 = 0;
const RESERVED_EXTENT_ID_OFFSET: u64 = 8;
const META_FILE_SIZE: u64 = 16;

/// Fixed-layout metadata file of an extent store
pub struct ExtentMetaFile {
    file: File,
    path: PathBuf,
}

impl ExtentMetaFile {
    /// Open or create the file, zero-filling it to its full size
    pub fn open(path: impl AsRef<Path>) -> ExtentResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < META_FILE_SIZE {
            file.set_len(META_FILE_SIZE)?;
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn persist_base_extent_id(&self, extent_id: u64) -> ExtentResult<()> {
        self.write_u64(BASE_EXTENT_ID_OFFSET, extent_id)
    }

    pub fn base_extent_id(&self) -> ExtentResult<u64> {
        self.read_u64(BASE_EXTENT_ID_OFFSET)
    }

    pub fn persist_reserved_extent_id(&self, extent_id: u64) -> ExtentResult<()> {
        self.write_u64(RESERVED_EXTENT_ID_OFFSET, extent_id)
    }

    pub fn reserved_extent_id(&self) -> ExtentResult<u64> {
        self.read_u64(RESERVED_EXTENT_ID_OFFSET)
    }

    pub fn sync(&self) -> ExtentResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn write_u64(&self, offset: u64, value: u64) -> ExtentResult<()> {
        self.file.write_all_at(&value.to_be_bytes(), offset)?;
        Ok(())
    }

    fn read_u64(&self, offset: u64) -> ExtentResult<u64> {
        let len = self.file.metadata()?.len();
        if len < offset + 8 {
            return Err(ExtentError::ShortFile {
                path: self.path.display().to_string(),
                len,
                expected: offset + 8,
            });
        }
        let mut buf = [0u8; 8];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(u64::from_be_bytes(buf))
    }
}
