//! Ordered index backed by an embedded redb database.
//!
//! Both entity tables of a partition live in one database file together
//! with the partition's last applied index. Every write is its own
//! committed transaction. Views hold a redb read transaction, which gives
//! a consistent point-in-time image without copying.

use super::{IndexEntity, IndexView, OrderedIndex, Visit};
use crate::error::{MetaStoreError, MetaStoreResult};
use crate::tables;
use parking_lot::Mutex;
use redb::{Database, ReadTransaction, ReadableTable, ReadableTableMetadata};
use std::marker::PhantomData;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Database shared by the indexes of one partition
pub struct RedbEnv {
    db: Database,
    path: PathBuf,
}

impl RedbEnv {
    /// Open (or create) the database and all of its tables
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Arc<Self>> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::INODES)?;
            let _t = write_txn.open_table(tables::DENTRIES)?;
            let _t = write_txn.open_table(tables::PARTITION_STATE)?;
        }
        write_txn.commit()?;
        debug!("opened redb index at {}", path.display());

        Ok(Arc::new(Self {
            db,
            path: path.to_path_buf(),
        }))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last apply index recorded with the data (0 if never recorded)
    pub fn apply_index(&self) -> MetaStoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::PARTITION_STATE)?;
        Ok(table.get(tables::APPLY_INDEX_KEY)?.map_or(0, |v| v.value()))
    }

    pub fn set_apply_index(&self, index: u64) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::PARTITION_STATE)?;
            table.insert(tables::APPLY_INDEX_KEY, index)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

/// One entity table of a [`RedbEnv`]
pub struct RedbIndex<E> {
    env: Arc<RedbEnv>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: IndexEntity> RedbIndex<E> {
    #[must_use]
    pub const fn new(env: Arc<RedbEnv>) -> Self {
        Self {
            env,
            _entity: PhantomData,
        }
    }
}

fn get_in<E: IndexEntity>(txn: &ReadTransaction, key: &E::Key) -> MetaStoreResult<Option<E>> {
    let table = txn.open_table(E::table())?;
    let key = E::encode_key(key);
    table
        .get(key.as_slice())?
        .map(|v| E::decode_value(v.value()))
        .transpose()
}

fn range_in<E: IndexEntity>(
    txn: &ReadTransaction,
    lower: Option<&E::Key>,
    upper: Option<&E::Key>,
    visit: Visit<'_, E>,
) -> MetaStoreResult<()> {
    if let (Some(l), Some(u)) = (lower, upper)
        && l >= u
    {
        return Ok(());
    }
    let table = txn.open_table(E::table())?;
    let lo = lower.map(E::encode_key);
    let hi = upper.map(E::encode_key);
    let bounds: (Bound<&[u8]>, Bound<&[u8]>) = (
        lo.as_deref().map_or(Bound::Unbounded, Bound::Included),
        hi.as_deref().map_or(Bound::Unbounded, Bound::Excluded),
    );
    for entry in table.range::<&[u8]>(bounds)? {
        let (_, value) = entry?;
        if !visit(E::decode_value(value.value())?)? {
            break;
        }
    }
    Ok(())
}

impl<E: IndexEntity> OrderedIndex<E> for RedbIndex<E> {
    fn get(&self, key: &E::Key) -> MetaStoreResult<Option<E>> {
        let read_txn = self.env.db.begin_read()?;
        get_in(&read_txn, key)
    }

    fn insert_if_absent(&self, entity: E) -> MetaStoreResult<bool> {
        let key = E::encode_key(&entity.key());
        let value = entity.encode_value()?;

        let write_txn = self.env.db.begin_write()?;
        let inserted = {
            let mut table = write_txn.open_table(E::table())?;
            let exists = table.get(key.as_slice())?.is_some();
            if !exists {
                table.insert(key.as_slice(), value.as_slice())?;
            }
            !exists
        };
        if inserted {
            write_txn.commit()?;
        } else {
            write_txn.abort()?;
        }
        Ok(inserted)
    }

    fn put(&self, entity: E) -> MetaStoreResult<()> {
        let key = E::encode_key(&entity.key());
        let value = entity.encode_value()?;

        let write_txn = self.env.db.begin_write()?;
        {
            let mut table = write_txn.open_table(E::table())?;
            table.insert(key.as_slice(), value.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete(&self, key: &E::Key) -> MetaStoreResult<bool> {
        let key = E::encode_key(key);
        let write_txn = self.env.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(E::table())?;
            table.remove(key.as_slice())?.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    fn insert_batch(&self, batch: Vec<E>) -> MetaStoreResult<usize> {
        let write_txn = self.env.db.begin_write()?;
        let mut inserted = 0;
        {
            let mut table = write_txn.open_table(E::table())?;
            for entity in &batch {
                let key = E::encode_key(&entity.key());
                if table.get(key.as_slice())?.is_some() {
                    continue;
                }
                table.insert(key.as_slice(), entity.encode_value()?.as_slice())?;
                inserted += 1;
            }
        }
        write_txn.commit()?;
        Ok(inserted)
    }

    fn count(&self) -> MetaStoreResult<u64> {
        let read_txn = self.env.db.begin_read()?;
        let table = read_txn.open_table(E::table())?;
        Ok(table.len()?)
    }

    fn range(
        &self,
        lower: Option<&E::Key>,
        upper: Option<&E::Key>,
        visit: Visit<'_, E>,
    ) -> MetaStoreResult<()> {
        let read_txn = self.env.db.begin_read()?;
        range_in(&read_txn, lower, upper, visit)
    }

    fn snapshot(&self) -> MetaStoreResult<Box<dyn IndexView<E>>> {
        let read_txn = self.env.db.begin_read()?;
        Ok(Box::new(RedbView::<E> {
            txn: Mutex::new(Some(read_txn)),
            _entity: PhantomData,
        }))
    }

    fn clear(&self) -> MetaStoreResult<()> {
        let write_txn = self.env.db.begin_write()?;
        write_txn.delete_table(E::table())?;
        {
            let _t = write_txn.open_table(E::table())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

/// View over a redb read transaction
struct RedbView<E> {
    txn: Mutex<Option<ReadTransaction>>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: IndexEntity> IndexView<E> for RedbView<E> {
    fn get(&self, key: &E::Key) -> MetaStoreResult<Option<E>> {
        let guard = self.txn.lock();
        let txn = guard.as_ref().ok_or(MetaStoreError::SnapshotReleased)?;
        get_in(txn, key)
    }

    fn range(
        &self,
        lower: Option<&E::Key>,
        upper: Option<&E::Key>,
        visit: Visit<'_, E>,
    ) -> MetaStoreResult<()> {
        let guard = self.txn.lock();
        let txn = guard.as_ref().ok_or(MetaStoreError::SnapshotReleased)?;
        range_in(txn, lower, upper, visit)
    }

    fn count(&self) -> MetaStoreResult<u64> {
        let guard = self.txn.lock();
        let txn = guard.as_ref().ok_or(MetaStoreError::SnapshotReleased)?;
        Ok(txn.open_table(E::table())?.len()?)
    }

    fn release(&self) {
        drop(self.txn.lock().take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tessera_common::{Dentry, DentryKey, Inode, MODE_DIR, MODE_REGULAR};

    #[test]
    fn test_view_is_point_in_time() {
        let dir = tempdir().unwrap();
        let env = RedbEnv::open(dir.path().join("meta.redb")).unwrap();
        let index = RedbIndex::<Inode>::new(Arc::clone(&env));

        index.put(Inode::new(1, MODE_DIR)).unwrap();
        let view = index.snapshot().unwrap();
        index.put(Inode::new(2, MODE_REGULAR)).unwrap();
        index.delete(&1).unwrap();

        assert!(view.get(&1).unwrap().is_some());
        assert!(view.get(&2).unwrap().is_none());
        assert_eq!(view.count().unwrap(), 1);
        assert_eq!(index.count().unwrap(), 1);

        view.release();
        view.release();
        assert!(matches!(view.count(), Err(MetaStoreError::SnapshotReleased)));
    }

    #[test]
    fn test_insert_batch_skips_existing() {
        let dir = tempdir().unwrap();
        let env = RedbEnv::open(dir.path().join("meta.redb")).unwrap();
        let index = RedbIndex::<Dentry>::new(env);

        index.put(Dentry::new(1, "a", 10, MODE_REGULAR)).unwrap();
        let batch = vec![
            Dentry::new(1, "a", 99, MODE_REGULAR),
            Dentry::new(1, "b", 11, MODE_REGULAR),
            Dentry::new(1, "c", 12, MODE_REGULAR),
        ];
        assert_eq!(index.insert_batch(batch).unwrap(), 2);
        assert_eq!(index.get(&DentryKey::new(1, "a")).unwrap().unwrap().inode, 10);
        assert_eq!(index.count().unwrap(), 3);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.redb");
        {
            let env = RedbEnv::open(&path).unwrap();
            let index = RedbIndex::<Inode>::new(Arc::clone(&env));
            index.put(Inode::new(5, MODE_REGULAR)).unwrap();
            env.set_apply_index(3).unwrap();
        }
        let env = RedbEnv::open(&path).unwrap();
        assert_eq!(env.apply_index().unwrap(), 3);
        assert_eq!(env.path(), path.as_path());
        let index = RedbIndex::<Inode>::new(env);
        assert_eq!(index.get(&5).unwrap().unwrap(), Inode::new(5, MODE_REGULAR));
    }
}
