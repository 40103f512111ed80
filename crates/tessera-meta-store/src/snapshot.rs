//! Point-in-time image of a partition's indexes

use crate::index::IndexView;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tessera_common::{Dentry, Inode};

/// Consistent view of both indexes at one apply index.
///
/// Holding a snapshot keeps the backend from reclaiming the versions it
/// reads. Release it with [`PartitionSnapshot::close`] (or by dropping it)
/// as soon as it has been persisted.
pub struct PartitionSnapshot {
    apply_index: u64,
    inodes: Box<dyn IndexView<Inode>>,
    dentries: Box<dyn IndexView<Dentry>>,
    closed: AtomicBool,
}

impl PartitionSnapshot {
    #[must_use]
    pub fn new(
        apply_index: u64,
        inodes: Box<dyn IndexView<Inode>>,
        dentries: Box<dyn IndexView<Dentry>>,
    ) -> Self {
        Self {
            apply_index,
            inodes,
            dentries,
            closed: AtomicBool::new(false),
        }
    }

    /// Index of the last command reflected in the views
    #[must_use]
    pub const fn apply_index(&self) -> u64 {
        self.apply_index
    }

    #[must_use]
    pub fn inodes(&self) -> &dyn IndexView<Inode> {
        self.inodes.as_ref()
    }

    #[must_use]
    pub fn dentries(&self) -> &dyn IndexView<Dentry> {
        self.dentries.as_ref()
    }

    /// Release both views. Later calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inodes.release();
        self.dentries.release();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for PartitionSnapshot {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for PartitionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionSnapshot")
            .field("apply_index", &self.apply_index)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MetaStoreError;
    use crate::index::{MemIndex, OrderedIndex};
    use tessera_common::{MODE_DIR, MODE_REGULAR};

    #[test]
    fn test_close_is_idempotent() {
        let inodes = MemIndex::<Inode>::new();
        let dentries = MemIndex::<Dentry>::new();
        inodes.put(Inode::new(1, MODE_DIR)).unwrap();
        dentries.put(Dentry::new(1, "f", 2, MODE_REGULAR)).unwrap();

        let snap =
            PartitionSnapshot::new(9, inodes.snapshot().unwrap(), dentries.snapshot().unwrap());
        assert_eq!(snap.apply_index(), 9);
        assert_eq!(snap.inodes().count().unwrap(), 1);
        assert_eq!(inodes.pinned_views(), 1);

        snap.close();
        snap.close();
        assert!(snap.is_closed());
        assert_eq!(inodes.pinned_views(), 0);
        assert_eq!(dentries.pinned_views(), 0);
        assert!(matches!(snap.dentries().count(), Err(MetaStoreError::SnapshotReleased)));
    }

    #[test]
    fn test_drop_releases_views() {
        let inodes = MemIndex::<Inode>::new();
        let dentries = MemIndex::<Dentry>::new();
        {
            let _snap =
                PartitionSnapshot::new(0, inodes.snapshot().unwrap(), dentries.snapshot().unwrap());
            assert_eq!(dentries.pinned_views(), 1);
        }
        assert_eq!(inodes.pinned_views(), 0);
        assert_eq!(dentries.pinned_views(), 0);
    }
}
