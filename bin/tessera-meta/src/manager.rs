//! Registry of the metadata partitions hosted by this node

use crate::error::{PartitionError, PartitionResult};
use crate::partition::MetaPartition;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tessera_common::{Error, PartitionConfig};
use tracing::{info, warn};

const PARTITION_DIR_PREFIX: &str = "partition_";

/// Owns every partition on the node, keyed by partition id
pub struct MetadataManager {
    node_id: u64,
    data_dir: PathBuf,
    partitions: RwLock<HashMap<u64, Arc<MetaPartition>>>,
}

impl MetadataManager {
    pub fn new(node_id: u64, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id,
            data_dir: data_dir.into(),
            partitions: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn node_id(&self) -> u64 {
        self.node_id
    }

    /// Default root directory of a partition
    #[must_use]
    pub fn partition_dir(&self, partition_id: u64) -> PathBuf {
        self.data_dir.join(format!("{PARTITION_DIR_PREFIX}{partition_id}"))
    }

    /// Open, load and start a partition, then register it
    pub fn create_partition(
        &self,
        mut config: PartitionConfig,
    ) -> PartitionResult<Arc<MetaPartition>> {
        if config.partition_id == 0 {
            return Err(Error::invalid_argument("partition id 0 is reserved").into());
        }
        if self.partitions.read().contains_key(&config.partition_id) {
            return Err(PartitionError::Exists(config.partition_id));
        }
        if config.root_dir.as_os_str().is_empty() {
            config.root_dir = self.partition_dir(config.partition_id);
        }
        if config.node_id == 0 {
            config.node_id = self.node_id;
        }

        let partition = MetaPartition::open(config)?;
        partition.load()?;
        partition.start()?;

        let mut partitions = self.partitions.write();
        if partitions.contains_key(&partition.id()) {
            // Lost a race with a concurrent create; undo the start
            let id = partition.id();
            let loser = Arc::clone(&partition);
            tokio::spawn(async move { loser.stop().await });
            return Err(PartitionError::Exists(id));
        }
        partitions.insert(partition.id(), Arc::clone(&partition));
        Ok(partition)
    }

    #[must_use]
    pub fn partition(&self, partition_id: u64) -> Option<Arc<MetaPartition>> {
        self.partitions.read().get(&partition_id).cloned()
    }

    /// Ids of all registered partitions, ascending
    #[must_use]
    pub fn partition_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.partitions.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Reopen every partition found under the data directory.
    ///
    /// Partitions that fail to load are logged and skipped. Returns the
    /// number started.
    pub fn load_all(&self) -> PartitionResult<usize> {
        if !self.data_dir.exists() {
            return Ok(0);
        }
        let mut loaded = 0;
        for entry in std::fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            let Some(expected_id) = partition_id_of(&path) else {
                continue;
            };
            match self.reopen(&path, expected_id) {
                Ok(partition) => {
                    info!(
                        "Loaded partition {} at apply index {}",
                        partition.id(),
                        partition.apply_index()
                    );
                    loaded += 1;
                }
                Err(e) => warn!("Skipping partition at {}: {}", path.display(), e),
            }
        }
        Ok(loaded)
    }

    fn reopen(&self, dir: &Path, expected_id: u64) -> PartitionResult<Arc<MetaPartition>> {
        let mut config = PartitionConfig::read_from(dir)?;
        if config.partition_id != expected_id {
            return Err(Error::invalid_argument(format!(
                "{} holds config of partition {}",
                dir.display(),
                config.partition_id
            ))
            .into());
        }
        config.root_dir = dir.to_path_buf();
        self.create_partition(config)
    }

    /// Stop every partition and empty the registry
    pub async fn stop_all(&self) {
        let partitions: Vec<Arc<MetaPartition>> =
            self.partitions.write().drain().map(|(_, p)| p).collect();
        for partition in partitions {
            partition.stop().await;
        }
    }
}

fn partition_id_of(path: &Path) -> Option<u64> {
    if !path.is_dir() {
        return None;
    }
    path.file_name()?
        .to_str()?
        .strip_prefix(PARTITION_DIR_PREFIX)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::MetaCommand;
    use crate::partition::PartitionState;
    use tempfile::tempdir;
    use tessera_common::{Inode, MODE_REGULAR, StoreMode};

    fn config(id: u64) -> PartitionConfig {
        let mut config = PartitionConfig::new(id, id * 1000, (id + 1) * 1000, PathBuf::new());
        config.store_interval_secs = 0;
        config
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let dir = tempdir().unwrap();
        let manager = MetadataManager::new(4, dir.path());
        let mp = manager.create_partition(config(2)).unwrap();
        assert_eq!(mp.config().root_dir, dir.path().join("partition_2"));
        assert_eq!(mp.config().node_id, 4);
        assert_eq!(mp.state(), PartitionState::Running);

        assert!(matches!(manager.create_partition(config(2)), Err(PartitionError::Exists(2))));
        assert!(matches!(manager.create_partition(config(0)), Err(PartitionError::Config(_))));
        manager.create_partition(config(1)).unwrap();
        assert_eq!(manager.partition_ids(), vec![1, 2]);
        assert!(manager.partition(3).is_none());

        manager.stop_all().await;
        assert!(manager.partition_ids().is_empty());
        assert_eq!(mp.state(), PartitionState::Stopped);
    }

    #[tokio::test]
    async fn test_load_all_restores_partitions() {
        let dir = tempdir().unwrap();
        {
            let manager = MetadataManager::new(1, dir.path());
            let mp = manager.create_partition(config(5).with_store_mode(StoreMode::Redb)).unwrap();
            let create = MetaCommand::CreateInode(Inode::new(5000, MODE_REGULAR));
            mp.apply(&create.encode().unwrap(), 1).unwrap();
            manager.create_partition(config(6)).unwrap();
            manager.stop_all().await;
        }
        std::fs::create_dir_all(dir.path().join("partition_9")).unwrap();
        std::fs::create_dir_all(dir.path().join("scratch")).unwrap();

        let manager = MetadataManager::new(1, dir.path());
        assert_eq!(manager.load_all().unwrap(), 2);
        assert_eq!(manager.partition_ids(), vec![5, 6]);
        let mp = manager.partition(5).unwrap();
        assert_eq!(mp.apply_index(), 1);
        assert!(mp.get_inode(5000).unwrap().is_some());
        manager.stop_all().await;
    }

    #[test]
    fn test_load_all_without_data_dir() {
        let dir = tempdir().unwrap();
        let manager = MetadataManager::new(1, dir.path().join("missing"));
        assert_eq!(manager.load_all().unwrap(), 0);
    }

    #[test]
    fn test_partition_id_of() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("partition_12");
        std::fs::create_dir(&good).unwrap();
        assert_eq!(partition_id_of(&good), Some(12));
        assert_eq!(partition_id_of(&dir.path().join("partition_13")), None);
        let bad = dir.path().join("partition_x");
        std::fs::create_dir(&bad).unwrap();
        assert_eq!(partition_id_of(&bad), None);
    }
}
