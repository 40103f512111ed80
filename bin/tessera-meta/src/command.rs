//! Commands carried by the replicated log
//!
//! Every field a command needs to produce its effect, timestamps
//! included, travels inside the command so that replicas applying the
//! same log reach byte-identical state.

use crate::error::{PartitionError, PartitionResult};
use serde::{Deserialize, Serialize};
use tessera_common::{Dentry, ExtentKey, Inode};

/// A state-machine mutation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaCommand {
    /// Insert a new inode; an existing one with the same number is kept
    CreateInode(Inode),
    /// Add a hard link
    LinkInode { inode: u64, time: i64 },
    /// Drop a hard link; the last one sets the delete mark
    UnlinkInode { inode: u64, time: i64 },
    /// Physically remove an inode and queue its extents for reclamation
    EvictInode { inode: u64 },
    AppendExtents {
        inode: u64,
        extents: Vec<ExtentKey>,
        time: i64,
    },
    Truncate { inode: u64, size: u64, time: i64 },
    CreateDentry(Dentry),
    DeleteDentry { parent_id: u64, name: String },
    /// Point an existing entry at another inode
    UpdateDentry {
        parent_id: u64,
        name: String,
        inode: u64,
    },
    /// Snapshot the partition at this index and queue it for storing
    StoreTick,
    /// Discard extents queued for reclamation
    ExtentReset,
}

impl MetaCommand {
    /// Serialize for the log
    pub fn encode(&self) -> PartitionResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| PartitionError::Encode(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> PartitionResult<Self> {
        bincode::deserialize(data).map_err(|e| PartitionError::Decode(e.to_string()))
    }

    /// Short name for logs and metrics
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CreateInode(_) => "create_inode",
            Self::LinkInode { .. } => "link_inode",
            Self::UnlinkInode { .. } => "unlink_inode",
            Self::EvictInode { .. } => "evict_inode",
            Self::AppendExtents { .. } => "append_extents",
            Self::Truncate { .. } => "truncate",
            Self::CreateDentry(_) => "create_dentry",
            Self::DeleteDentry { .. } => "delete_dentry",
            Self::UpdateDentry { .. } => "update_dentry",
            Self::StoreTick => "store_tick",
            Self::ExtentReset => "extent_reset",
        }
    }
}

/// Result of applying one command
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyResponse {
    /// Whether an insert created a new record
    Inserted(bool),
    /// The inode after the mutation
    Inode(Inode),
    /// The dentry as it was before the mutation
    Dentry(Dentry),
    NotFound,
    /// The inode number lies outside the partition's range
    OutOfRange(u64),
    /// Whether the snapshot was queued (false when the queue is full)
    StoreScheduled(bool),
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_common::MODE_REGULAR;

    #[test]
    fn test_encode_decode() {
        let commands = vec![
            MetaCommand::CreateInode(Inode::new(10, MODE_REGULAR).with_time(5)),
            MetaCommand::Truncate {
                inode: 10,
                size: 0,
                time: 6,
            },
            MetaCommand::CreateDentry(Dentry::new(1, "a", 10, MODE_REGULAR)),
            MetaCommand::StoreTick,
        ];
        for cmd in commands {
            assert_eq!(MetaCommand::decode(&cmd.encode().unwrap()).unwrap(), cmd);
        }
    }

    #[test]
    fn test_encode_returns_bytes() {
        let extents = (0..1000)
            .map(|i| ExtentKey {
                file_offset: i * 4096,
                partition_id: 3,
                extent_id: i,
                extent_offset: 0,
                size: 4096,
                crc: 0,
            })
            .collect::<Vec<_>>();
        let cmd = MetaCommand::AppendExtents {
            inode: 10,
            extents,
            time: 1,
        };
        let bytes = cmd.encode().unwrap();
        assert!(bytes.len() > 1000 * 8);
        assert_eq!(MetaCommand::decode(&bytes).unwrap(), cmd);
        assert!(!MetaCommand::ExtentReset.encode().unwrap().is_empty());
    }

    #[test]
    fn test_decode_garbage() {
        let err = MetaCommand::decode(&[0xff, 0xff, 0xff, 0xff, 0x01]).unwrap_err();
        assert!(matches!(err, PartitionError::Decode(_)));
    }

    #[test]
    fn test_kind() {
        assert_eq!(MetaCommand::ExtentReset.kind(), "extent_reset");
        assert_eq!(MetaCommand::EvictInode { inode: 1 }.kind(), "evict_inode");
    }
}
