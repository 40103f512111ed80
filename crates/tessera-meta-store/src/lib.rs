//! Tessera Meta Store - indexes and persistence for metadata partitions
//!
//! This crate holds everything a metadata partition keeps on the local
//! node:
//! - Ordered indexes over inodes and dentries, with an in-memory
//!   multi-version B-tree backend and an embedded redb backend
//! - Entity codecs for the two snapshot marshal versions
//! - Point-in-time partition snapshots
//! - Snapshot persistence (atomic store, self-describing load)

pub mod codec;
pub mod error;
pub mod index;
pub mod persist;
pub mod snapshot;
pub mod tables;

// Re-exports
pub use codec::{MarshalCodec, Record, codec, codec_for_tag};
pub use error::{MetaStoreError, MetaStoreResult};
pub use index::{IndexEntity, IndexView, MemIndex, MetaIndexes, OrderedIndex, RedbEnv, RedbIndex};
pub use persist::{SnapshotHeader, load_snapshot, store_snapshot};
pub use snapshot::PartitionSnapshot;
