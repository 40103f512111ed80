//! Ordered indexes over partition entities
//!
//! A partition keeps two indexes: inodes ordered by inode number and
//! dentries ordered by `(parent, name)`. Both are served by one of two
//! interchangeable backends chosen when the partition is created:
//!
//! - [`MemIndex`]: multi-version B-tree in memory
//! - [`RedbIndex`]: tables in an embedded redb database
//!
//! Callers see the same semantics from either backend, including O(1)
//! point-in-time views.

mod mem;
mod embedded;

pub use self::mem::MemIndex;
pub use self::embedded::{RedbEnv, RedbIndex};

use crate::codec::{MarshalCodec, Record, codec};
use crate::error::MetaStoreResult;
use crate::snapshot::PartitionSnapshot;
use crate::tables;
use redb::TableDefinition;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tessera_common::{Dentry, DentryKey, Inode, MarshalVersion, StoreMode};

/// File name of the embedded database inside a partition root
pub const REDB_FILE: &str = "meta.redb";

/// Storage encoding used by the redb backend
const STORAGE_CODEC: MarshalVersion = MarshalVersion::V2;

/// An entity that can live in an ordered index
pub trait IndexEntity: Record + Clone + Send + Sync + 'static {
    type Key: Ord + Clone + fmt::Debug + Send + Sync + 'static;

    fn key(&self) -> Self::Key;

    /// Byte encoding of a key whose lexicographic order matches `Ord`
    fn encode_key(key: &Self::Key) -> Vec<u8>;

    /// Redb table holding this entity
    fn table() -> TableDefinition<'static, &'static [u8], &'static [u8]>;

    fn encode_value(&self) -> MetaStoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        self.marshal(storage_codec(), &mut buf)?;
        Ok(buf)
    }

    fn decode_value(data: &[u8]) -> MetaStoreResult<Self> {
        Self::unmarshal(storage_codec(), data)
    }
}

fn storage_codec() -> &'static MarshalCodec {
    codec(STORAGE_CODEC)
}

impl IndexEntity for Inode {
    type Key = u64;

    fn key(&self) -> u64 {
        self.inode
    }

    fn encode_key(key: &u64) -> Vec<u8> {
        key.to_be_bytes().to_vec()
    }

    fn table() -> TableDefinition<'static, &'static [u8], &'static [u8]> {
        tables::INODES
    }
}

impl IndexEntity for Dentry {
    type Key = DentryKey;

    fn key(&self) -> DentryKey {
        Dentry::key(self)
    }

    fn encode_key(key: &DentryKey) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + key.name.len());
        buf.extend_from_slice(&key.parent_id.to_be_bytes());
        buf.extend_from_slice(key.name.as_bytes());
        buf
    }

    fn table() -> TableDefinition<'static, &'static [u8], &'static [u8]> {
        tables::DENTRIES
    }
}

/// Visitor passed to range scans; return `Ok(false)` to stop early
pub type Visit<'a, E> = &'a mut dyn FnMut(E) -> MetaStoreResult<bool>;

/// Live ordered index with a single writer and concurrent readers
pub trait OrderedIndex<E: IndexEntity>: Send + Sync {
    fn get(&self, key: &E::Key) -> MetaStoreResult<Option<E>>;

    /// Insert unless the key exists; returns whether it was inserted
    fn insert_if_absent(&self, entity: E) -> MetaStoreResult<bool>;

    /// Insert or replace
    fn put(&self, entity: E) -> MetaStoreResult<()>;

    /// Remove; returns whether the key existed
    fn delete(&self, key: &E::Key) -> MetaStoreResult<bool>;

    /// Insert a batch of entities that must all be new.
    ///
    /// Returns how many were inserted; keys already present are skipped.
    fn insert_batch(&self, batch: Vec<E>) -> MetaStoreResult<usize>;

    fn count(&self) -> MetaStoreResult<u64>;

    /// Visit entities with `lower <= key < upper` in key order
    fn range(
        &self,
        lower: Option<&E::Key>,
        upper: Option<&E::Key>,
        visit: Visit<'_, E>,
    ) -> MetaStoreResult<()>;

    /// Point-in-time view of the current contents
    fn snapshot(&self) -> MetaStoreResult<Box<dyn IndexView<E>>>;

    /// Remove everything
    fn clear(&self) -> MetaStoreResult<()>;

    /// Reclaim storage no longer visible to any view
    fn vacuum(&self) {}
}

/// Read-only point-in-time view of an index
pub trait IndexView<E: IndexEntity>: Send + Sync {
    fn get(&self, key: &E::Key) -> MetaStoreResult<Option<E>>;

    fn range(
        &self,
        lower: Option<&E::Key>,
        upper: Option<&E::Key>,
        visit: Visit<'_, E>,
    ) -> MetaStoreResult<()>;

    /// Number of entities, computed by scanning
    fn count(&self) -> MetaStoreResult<u64> {
        let mut n = 0;
        self.range(None, None, &mut |_| {
            n += 1;
            Ok(true)
        })?;
        Ok(n)
    }

    /// Release backend resources; later reads fail. Idempotent.
    fn release(&self);
}

/// Both indexes of a partition, on the backend chosen at creation
pub struct MetaIndexes {
    mode: StoreMode,
    pub inodes: Arc<dyn OrderedIndex<Inode>>,
    pub dentries: Arc<dyn OrderedIndex<Dentry>>,
    env: Option<Arc<RedbEnv>>,
}

impl MetaIndexes {
    /// Build the backend for `mode` under the partition root
    pub fn open(mode: StoreMode, root: &Path) -> MetaStoreResult<Self> {
        match mode {
            StoreMode::Mem => Ok(Self {
                mode,
                inodes: Arc::new(MemIndex::<Inode>::new()),
                dentries: Arc::new(MemIndex::<Dentry>::new()),
                env: None,
            }),
            StoreMode::Redb => {
                let env = RedbEnv::open(root.join(REDB_FILE))?;
                Ok(Self {
                    mode,
                    inodes: Arc::new(RedbIndex::<Inode>::new(Arc::clone(&env))),
                    dentries: Arc::new(RedbIndex::<Dentry>::new(Arc::clone(&env))),
                    env: Some(env),
                })
            }
        }
    }

    #[must_use]
    pub const fn mode(&self) -> StoreMode {
        self.mode
    }

    /// Apply index recorded by a durable backend, if any
    pub fn persisted_apply_index(&self) -> MetaStoreResult<Option<u64>> {
        self.env.as_ref().map(|env| env.apply_index()).transpose()
    }

    /// Record the apply index in a durable backend (no-op in memory)
    pub fn record_apply_index(&self, index: u64) -> MetaStoreResult<()> {
        match &self.env {
            Some(env) => env.set_apply_index(index),
            None => Ok(()),
        }
    }

    /// Capture both views. Callers serialize this with writers so the two
    /// views and `apply_index` describe the same state.
    pub fn snapshot(&self, apply_index: u64) -> MetaStoreResult<PartitionSnapshot> {
        let inodes = self.inodes.snapshot()?;
        let dentries = self.dentries.snapshot()?;
        Ok(PartitionSnapshot::new(apply_index, inodes, dentries))
    }

    pub fn clear(&self) -> MetaStoreResult<()> {
        self.inodes.clear()?;
        self.dentries.clear()?;
        if let Some(env) = &self.env {
            env.set_apply_index(0)?;
        }
        Ok(())
    }

    pub fn vacuum(&self) {
        self.inodes.vacuum();
        self.dentries.vacuum();
    }
}

impl fmt::Debug for MetaIndexes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaIndexes").field("mode", &self.mode).finish_non_exhaustive()
    }
}
