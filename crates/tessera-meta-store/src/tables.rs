//! Redb table definitions for the embedded index backend.

use redb::TableDefinition;

// Key: inode number (8-byte big-endian), Value: v2-encoded Inode
pub const INODES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("inodes");
// Key: parent inode (8-byte big-endian) followed by the name bytes,
// Value: v2-encoded Dentry
pub const DENTRIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("dentries");

// Partition bookkeeping (last applied log index)
pub const PARTITION_STATE: TableDefinition<&str, u64> = TableDefinition::new("partition_state");

pub const APPLY_INDEX_KEY: &str = "apply_index";
