//! Core entity definitions for Tessera metadata partitions
//!
//! A metadata partition indexes two kinds of records: inodes, keyed by
//! their numeric identifier, and directory entries, keyed by
//! `(parent inode, name)`. Inodes reference file data through an
//! ordered list of extent keys pointing at block-storage extents.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// File type bits of an inode's `type_` field (POSIX `st_mode` layout)
pub const MODE_TYPE_MASK: u32 = 0o170_000;
/// Directory
pub const MODE_DIR: u32 = 0o040_000;
/// Regular file
pub const MODE_REGULAR: u32 = 0o100_000;
/// Symbolic link
pub const MODE_SYMLINK: u32 = 0o120_000;

/// Inode `flag` bit set once the last link is gone
pub const FLAG_DELETE_MARK: u32 = 0x1;

/// Reference from a file byte range to a physical extent on a data node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtentKey {
    /// Offset of this extent within the file
    pub file_offset: u64,
    /// Data partition that owns the extent
    pub partition_id: u64,
    /// Extent identifier within the data partition
    pub extent_id: u64,
    /// Offset within the extent
    pub extent_offset: u64,
    /// Length in bytes
    pub size: u32,
    /// CRC of the referenced bytes (0 = not computed)
    pub crc: u32,
}

impl ExtentKey {
    /// File offset just past the end of this extent, capped at `u64::MAX`
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.file_offset.saturating_add(self.size as u64)
    }
}

/// A filesystem object
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    /// Inode number, unique within the partition range
    pub inode: u64,
    /// Mode bits (file type and permissions)
    pub type_: u32,
    pub uid: u32,
    pub gid: u32,
    /// Logical file size in bytes
    pub size: u64,
    /// Bumped on every truncate
    pub generation: u64,
    pub create_time: i64,
    pub access_time: i64,
    pub modify_time: i64,
    /// Symlink target (empty for non-symlinks)
    pub link_target: Vec<u8>,
    pub nlink: u32,
    pub flag: u32,
    /// Extents in ascending `file_offset` order
    pub extents: Vec<ExtentKey>,
}

impl Inode {
    /// Create an inode with no data and a single link
    #[must_use]
    pub fn new(inode: u64, type_: u32) -> Self {
        let nlink = if type_ & MODE_TYPE_MASK == MODE_DIR { 2 } else { 1 };
        Self {
            inode,
            type_,
            generation: 1,
            nlink,
            ..Default::default()
        }
    }

    /// Set all three timestamps
    #[must_use]
    pub fn with_time(mut self, time: i64) -> Self {
        self.create_time = time;
        self.access_time = time;
        self.modify_time = time;
        self
    }

    #[must_use]
    pub const fn is_dir(&self) -> bool {
        self.type_ & MODE_TYPE_MASK == MODE_DIR
    }

    #[must_use]
    pub const fn is_symlink(&self) -> bool {
        self.type_ & MODE_TYPE_MASK == MODE_SYMLINK
    }

    /// Insert an extent keeping the list sorted by file offset.
    ///
    /// Existing extents lying entirely inside the new extent's range are
    /// superseded and returned so the caller can queue them for
    /// reclamation. The file size grows to cover the new extent.
    pub fn append_extent(&mut self, key: ExtentKey) -> Vec<ExtentKey> {
        let start = key.file_offset;
        let end = key.end();
        let mut superseded = Vec::new();
        self.extents.retain(|e| {
            let covered = e.file_offset >= start && e.end() <= end;
            if covered {
                superseded.push(*e);
            }
            !covered
        });
        let pos = self.extents.partition_point(|e| e.file_offset <= start);
        self.extents.insert(pos, key);
        self.size = self.size.max(end);
        superseded
    }

    /// Shrink (or grow) the file to `size` bytes.
    ///
    /// Extents starting at or beyond the new size are dropped and
    /// returned. Bumps the generation.
    pub fn truncate(&mut self, size: u64) -> Vec<ExtentKey> {
        let keep = self.extents.partition_point(|e| e.file_offset < size);
        let dropped = self.extents.split_off(keep);
        self.size = size;
        self.generation = self.generation.saturating_add(1);
        dropped
    }
}

/// Ordering key of a directory entry
#[derive(
    Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize,
)]
#[display("{parent_id}/{name}")]
pub struct DentryKey {
    pub parent_id: u64,
    pub name: String,
}

impl DentryKey {
    pub fn new(parent_id: u64, name: impl Into<String>) -> Self {
        Self {
            parent_id,
            name: name.into(),
        }
    }

    /// Smallest key of the given parent directory
    #[must_use]
    pub fn first_of(parent_id: u64) -> Self {
        Self {
            parent_id,
            name: String::new(),
        }
    }
}

/// A directory entry mapping `(parent, name)` to a child inode
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dentry {
    pub parent_id: u64,
    pub name: String,
    /// Child inode number
    pub inode: u64,
    pub type_: u32,
}

impl Dentry {
    pub fn new(parent_id: u64, name: impl Into<String>, inode: u64, type_: u32) -> Self {
        Self {
            parent_id,
            name: name.into(),
            inode,
            type_,
        }
    }

    #[must_use]
    pub fn key(&self) -> DentryKey {
        DentryKey::new(self.parent_id, self.name.clone())
    }
}

/// A replica of a metadata partition
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Node id of the replica
    pub id: u64,
    /// Address the replica listens on
    pub addr: String,
}
