//! In-memory multi-version B-tree index
//!
//! Every key maps to a short chain of versions tagged with the mutation
//! sequence that wrote them (a `None` value is a tombstone). A view pins
//! the sequence current at capture time and reads, for each key, the
//! newest version at or below its pin. Capturing a view is O(1).
//!
//! Old versions are dropped when the key is next written, or by
//! [`MemIndex::vacuum`] once the views that needed them are released.
//! Range scans copy bounded batches of `Arc`s out of the tree so the
//! writer is never blocked for the length of a full scan.

use super::{IndexEntity, IndexView, OrderedIndex, Visit};
use crate::error::{MetaStoreError, MetaStoreResult};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Keys copied out of the tree per read-lock acquisition during scans
const SCAN_BATCH: usize = 512;

/// Keys visited per write-lock acquisition during vacuum
const VACUUM_BATCH: usize = 1024;

#[derive(Debug)]
struct Version<E> {
    seq: u64,
    value: Option<Arc<E>>,
}

type Chain<E> = Vec<Version<E>>;

struct Tree<E: IndexEntity> {
    map: BTreeMap<E::Key, Chain<E>>,
    /// Last assigned mutation sequence
    seq: u64,
    /// Live (non-tombstoned) keys
    live: u64,
}

struct Shared<E: IndexEntity> {
    tree: RwLock<Tree<E>>,
    /// Pinned sequence -> number of views holding it
    pins: Mutex<BTreeMap<u64, usize>>,
}

impl<E: IndexEntity> Shared<E> {
    fn oldest_pin(&self) -> Option<u64> {
        self.pins.lock().keys().next().copied()
    }

    /// Walk `[lower, upper)` as seen at `seq` (`None` = latest)
    fn scan(
        &self,
        seq: Option<u64>,
        lower: Option<&E::Key>,
        upper: Option<&E::Key>,
        visit: Visit<'_, E>,
    ) -> MetaStoreResult<()> {
        if let (Some(l), Some(u)) = (lower, upper)
            && l >= u
        {
            return Ok(());
        }

        let mut cursor: Option<E::Key> = None;
        loop {
            let (batch, exhausted) = {
                let tree = self.tree.read();
                let lo = match &cursor {
                    Some(k) => Bound::Excluded(k),
                    None => lower.map_or(Bound::Unbounded, Bound::Included),
                };
                let hi = upper.map_or(Bound::Unbounded, Bound::Excluded);

                let mut batch = Vec::with_capacity(SCAN_BATCH);
                let mut scanned = 0;
                let mut last = None;
                for (key, chain) in tree.map.range((lo, hi)) {
                    if let Some(value) = visible(chain, seq) {
                        batch.push(value);
                    }
                    last = Some(key);
                    scanned += 1;
                    if scanned == SCAN_BATCH {
                        break;
                    }
                }
                let exhausted = scanned < SCAN_BATCH;
                let next = last.cloned();
                drop(tree);
                cursor = next;
                (batch, exhausted)
            };

            for value in batch {
                if !visit(E::clone(&value))? {
                    return Ok(());
                }
            }
            if exhausted {
                return Ok(());
            }
        }
    }
}

/// Newest value visible at `seq`
fn visible<E>(chain: &Chain<E>, seq: Option<u64>) -> Option<Arc<E>> {
    let version = match seq {
        None => chain.last(),
        Some(seq) => chain.iter().rev().find(|v| v.seq <= seq),
    };
    version.and_then(|v| v.value.clone())
}

/// Drop versions no view can reach. Returns true when nothing remains
/// that any reader could observe.
fn prune<E>(chain: &mut Chain<E>, oldest_pin: Option<u64>) -> bool {
    let keep_from = match oldest_pin {
        None => chain.len().saturating_sub(1),
        Some(pin) => chain.iter().rposition(|v| v.seq <= pin).unwrap_or(0),
    };
    chain.drain(..keep_from);
    chain.iter().all(|v| v.value.is_none())
}

/// In-memory ordered index
pub struct MemIndex<E: IndexEntity> {
    shared: Arc<Shared<E>>,
}

impl<E: IndexEntity> MemIndex<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tree: RwLock::new(Tree {
                    map: BTreeMap::new(),
                    seq: 0,
                    live: 0,
                }),
                pins: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Number of views currently pinning old versions
    #[must_use]
    pub fn pinned_views(&self) -> usize {
        self.shared.pins.lock().values().sum()
    }

    /// Total versions held, live or not
    #[must_use]
    pub fn version_count(&self) -> usize {
        self.shared.tree.read().map.values().map(Vec::len).sum()
    }

    /// Append a version for `key` under an already-held write lock
    fn write_locked(&self, tree: &mut Tree<E>, key: E::Key, value: Option<Arc<E>>) {
        let oldest = self.shared.oldest_pin();
        tree.seq += 1;
        let seq = tree.seq;

        let inserting = value.is_some();
        let chain = tree.map.entry(key.clone()).or_default();
        let was_live = chain.last().is_some_and(|v| v.value.is_some());
        chain.push(Version { seq, value });
        if prune(chain, oldest) {
            tree.map.remove(&key);
        }

        match (was_live, inserting) {
            (false, true) => tree.live += 1,
            (true, false) => tree.live -= 1,
            _ => {}
        }
    }

    fn is_live(tree: &Tree<E>, key: &E::Key) -> bool {
        tree.map
            .get(key)
            .and_then(|chain| chain.last())
            .is_some_and(|v| v.value.is_some())
    }
}

impl<E: IndexEntity> Default for MemIndex<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: IndexEntity> OrderedIndex<E> for MemIndex<E> {
    fn get(&self, key: &E::Key) -> MetaStoreResult<Option<E>> {
        let tree = self.shared.tree.read();
        Ok(tree
            .map
            .get(key)
            .and_then(|chain| visible(chain, None))
            .map(|v| E::clone(&v)))
    }

    fn insert_if_absent(&self, entity: E) -> MetaStoreResult<bool> {
        let key = entity.key();
        let mut tree = self.shared.tree.write();
        if Self::is_live(&tree, &key) {
            return Ok(false);
        }
        self.write_locked(&mut tree, key, Some(Arc::new(entity)));
        Ok(true)
    }

    fn put(&self, entity: E) -> MetaStoreResult<()> {
        let key = entity.key();
        let mut tree = self.shared.tree.write();
        self.write_locked(&mut tree, key, Some(Arc::new(entity)));
        Ok(())
    }

    fn delete(&self, key: &E::Key) -> MetaStoreResult<bool> {
        let mut tree = self.shared.tree.write();
        if !Self::is_live(&tree, key) {
            return Ok(false);
        }
        self.write_locked(&mut tree, key.clone(), None);
        Ok(true)
    }

    fn insert_batch(&self, batch: Vec<E>) -> MetaStoreResult<usize> {
        let mut tree = self.shared.tree.write();
        let mut inserted = 0;
        for entity in batch {
            let key = entity.key();
            if Self::is_live(&tree, &key) {
                continue;
            }
            self.write_locked(&mut tree, key, Some(Arc::new(entity)));
            inserted += 1;
        }
        Ok(inserted)
    }

    fn count(&self) -> MetaStoreResult<u64> {
        Ok(self.shared.tree.read().live)
    }

    fn range(
        &self,
        lower: Option<&E::Key>,
        upper: Option<&E::Key>,
        visit: Visit<'_, E>,
    ) -> MetaStoreResult<()> {
        self.shared.scan(None, lower, upper, visit)
    }

    fn snapshot(&self) -> MetaStoreResult<Box<dyn IndexView<E>>> {
        // Holding the read lock keeps writers from assigning a new
        // sequence between reading it and pinning it.
        let tree = self.shared.tree.read();
        let seq = tree.seq;
        *self.shared.pins.lock().entry(seq).or_insert(0) += 1;
        drop(tree);

        Ok(Box::new(MemView {
            shared: Arc::clone(&self.shared),
            seq,
            released: AtomicBool::new(false),
        }))
    }

    fn clear(&self) -> MetaStoreResult<()> {
        let mut tree = self.shared.tree.write();
        if self.shared.pins.lock().is_empty() {
            tree.map.clear();
            tree.live = 0;
            return Ok(());
        }
        let keys: Vec<E::Key> = tree
            .map
            .iter()
            .filter(|(_, chain)| chain.last().is_some_and(|v| v.value.is_some()))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            self.write_locked(&mut tree, key, None);
        }
        Ok(())
    }

    fn vacuum(&self) {
        let mut cursor: Option<E::Key> = None;
        let mut removed = 0usize;
        loop {
            let mut tree = self.shared.tree.write();
            let oldest = self.shared.oldest_pin();
            let lo = cursor.as_ref().map_or(Bound::Unbounded, Bound::Excluded);

            let mut visited = 0;
            let mut empty = Vec::new();
            let mut last = None;
            for (key, chain) in tree.map.range_mut((lo, Bound::Unbounded)) {
                if prune(chain, oldest) {
                    empty.push(key.clone());
                }
                last = Some(key.clone());
                visited += 1;
                if visited == VACUUM_BATCH {
                    break;
                }
            }
            for key in &empty {
                tree.map.remove(key);
            }
            removed += empty.len();
            drop(tree);

            if visited < VACUUM_BATCH {
                break;
            }
            cursor = last;
        }
        if removed > 0 {
            debug!("vacuum dropped {} dead keys", removed);
        }
    }
}

/// Point-in-time view pinned at a mutation sequence
struct MemView<E: IndexEntity> {
    shared: Arc<Shared<E>>,
    seq: u64,
    released: AtomicBool,
}

impl<E: IndexEntity> MemView<E> {
    fn check(&self) -> MetaStoreResult<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(MetaStoreError::SnapshotReleased);
        }
        Ok(())
    }
}

impl<E: IndexEntity> IndexView<E> for MemView<E> {
    fn get(&self, key: &E::Key) -> MetaStoreResult<Option<E>> {
        self.check()?;
        let tree = self.shared.tree.read();
        Ok(tree
            .map
            .get(key)
            .and_then(|chain| visible(chain, Some(self.seq)))
            .map(|v| E::clone(&v)))
    }

    fn range(
        &self,
        lower: Option<&E::Key>,
        upper: Option<&E::Key>,
        visit: Visit<'_, E>,
    ) -> MetaStoreResult<()> {
        self.check()?;
        self.shared.scan(Some(self.seq), lower, upper, visit)
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut pins = self.shared.pins.lock();
        if let Some(n) = pins.get_mut(&self.seq) {
            *n -= 1;
            if *n == 0 {
                pins.remove(&self.seq);
            }
        }
    }
}

impl<E: IndexEntity> Drop for MemView<E> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::BTreeSet;
    use tessera_common::{Inode, MODE_REGULAR};

    fn inode(id: u64, size: u64) -> Inode {
        let mut ino = Inode::new(id, MODE_REGULAR);
        ino.size = size;
        ino
    }

    fn sizes(view: &dyn IndexView<Inode>) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        view.range(None, None, &mut |i| {
            out.push((i.inode, i.size));
            Ok(true)
        })
        .unwrap();
        out
    }

    #[test]
    fn test_view_isolated_from_later_writes() {
        let index = MemIndex::<Inode>::new();
        index.put(inode(1, 10)).unwrap();
        index.put(inode(2, 20)).unwrap();

        let view = index.snapshot().unwrap();
        index.put(inode(1, 11)).unwrap();
        index.delete(&2).unwrap();
        index.put(inode(3, 30)).unwrap();

        assert_eq!(sizes(view.as_ref()), vec![(1, 10), (2, 20)]);
        assert_eq!(index.get(&1).unwrap().unwrap().size, 11);
        assert!(index.get(&2).unwrap().is_none());
        assert_eq!(index.count().unwrap(), 2);
    }

    #[test]
    fn test_versions_pruned_after_release() {
        let index = MemIndex::<Inode>::new();
        index.put(inode(1, 1)).unwrap();
        let view = index.snapshot().unwrap();
        for size in 2..10 {
            index.put(inode(1, size)).unwrap();
        }
        index.delete(&1).unwrap();
        assert!(index.version_count() > 1);
        assert_eq!(index.pinned_views(), 1);

        view.release();
        view.release();
        assert_eq!(index.pinned_views(), 0);
        assert!(matches!(view.get(&1), Err(MetaStoreError::SnapshotReleased)));

        index.vacuum();
        assert_eq!(index.version_count(), 0);
    }

    #[test]
    fn test_drop_releases_pin() {
        let index = MemIndex::<Inode>::new();
        {
            let _view = index.snapshot().unwrap();
            assert_eq!(index.pinned_views(), 1);
        }
        assert_eq!(index.pinned_views(), 0);
    }

    #[test]
    fn test_scan_crosses_batches() {
        let index = MemIndex::<Inode>::new();
        let n = (SCAN_BATCH * 3 + 7) as u64;
        for id in 0..n {
            index.put(inode(id, id)).unwrap();
        }
        // Tombstones inside a batch must not end the scan early
        for id in (0..n).step_by(3) {
            index.delete(&id).unwrap();
        }
        let view = index.snapshot().unwrap();
        let mut seen = Vec::new();
        view.range(Some(&5), None, &mut |i| {
            seen.push(i.inode);
            Ok(true)
        })
        .unwrap();
        let expected: Vec<u64> = (5..n).filter(|id| id % 3 != 0).collect();
        assert_eq!(seen, expected);
        assert_eq!(view.count().unwrap(), index.count().unwrap());
    }

    #[test]
    fn test_visit_error_propagates() {
        let index = MemIndex::<Inode>::new();
        index.put(inode(1, 1)).unwrap();
        let err = index
            .range(None, None, &mut |_| Err(MetaStoreError::Corrupt("stop".into())))
            .unwrap_err();
        assert!(matches!(err, MetaStoreError::Corrupt(_)));
    }

    #[test]
    fn test_clear_with_open_view() {
        let index = MemIndex::<Inode>::new();
        index.put(inode(1, 1)).unwrap();
        let view = index.snapshot().unwrap();
        index.clear().unwrap();
        assert_eq!(index.count().unwrap(), 0);
        assert_eq!(view.count().unwrap(), 1);
    }

    #[test]
    fn test_random_ops_match_model() {
        let index = MemIndex::<Inode>::new();
        let mut model = BTreeSet::new();
        let mut rng = rand::thread_rng();
        let mut views = Vec::new();

        for step in 0..5000u64 {
            let id = rng.gen_range(0..200);
            match rng.gen_range(0..4) {
                0 | 1 => {
                    let inserted = index.insert_if_absent(inode(id, step)).unwrap();
                    assert_eq!(inserted, model.insert(id));
                }
                2 => assert_eq!(index.delete(&id).unwrap(), model.remove(&id)),
                _ => {
                    if views.len() < 4 {
                        views.push((index.snapshot().unwrap(), model.clone()));
                    } else {
                        views.remove(0);
                    }
                }
            }
        }

        assert_eq!(index.count().unwrap(), model.len() as u64);
        for (view, expected) in &views {
            let ids: BTreeSet<u64> = sizes(view.as_ref()).into_iter().map(|(id, _)| id).collect();
            assert_eq!(&ids, expected);
        }
    }
}
