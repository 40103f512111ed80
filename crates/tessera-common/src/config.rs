//! Configuration types for Tessera
//!
//! `Config` is the root of the metadata daemon's TOML file.
//! `PartitionConfig` describes one metadata partition and is also
//! persisted next to the partition's data as `meta.json`.

use crate::error::{Error, Result};
use crate::types::Peer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// File name of the persisted partition configuration
pub const PARTITION_CONFIG_FILE: &str = "meta.json";

/// Root configuration for a metadata node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Partitions to create on first start (existing ones are reloaded
    /// from their data directories)
    #[serde(default)]
    pub partitions: Vec<PartitionConfig>,
}

impl Config {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load from a TOML file; a missing file yields the defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }
}

/// Node identity
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_id")]
    pub node_id: u64,
    /// Directory holding one `partition_<id>` subdirectory per partition
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Ordered index backend of a partition
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// In-memory B-tree; durable only through snapshots
    #[default]
    Mem,
    /// Embedded redb database under the partition root
    Redb,
}

impl fmt::Display for StoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mem => write!(f, "mem"),
            Self::Redb => write!(f, "redb"),
        }
    }
}

/// Encoding used for inode/dentry records in snapshot files
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarshalVersion {
    /// Big-endian key/value layout
    V1,
    /// Compact bincode layout
    #[default]
    V2,
}

impl MarshalVersion {
    /// Tag written into snapshot headers
    #[must_use]
    pub const fn tag(self) -> u32 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    /// Inverse of [`MarshalVersion::tag`]
    #[must_use]
    pub const fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            _ => None,
        }
    }
}

impl fmt::Display for MarshalVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.tag())
    }
}

/// Configuration of one metadata partition
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub partition_id: u64,
    #[serde(default)]
    pub node_id: u64,
    /// First inode number owned by the partition (inclusive)
    pub start: u64,
    /// End of the owned inode range (exclusive)
    pub end: u64,
    #[serde(default)]
    pub peers: Vec<Peer>,
    /// Directory holding this partition's durable artifacts; when empty
    /// the node assigns `<data_dir>/partition_<id>`
    #[serde(default)]
    pub root_dir: PathBuf,
    #[serde(default)]
    pub store_mode: StoreMode,
    #[serde(default)]
    pub marshal_version: MarshalVersion,
    /// Seconds between background stores (0 disables the timer)
    #[serde(default = "default_store_interval_secs")]
    pub store_interval_secs: u64,
    /// Pending store requests before new ones are dropped
    #[serde(default = "default_store_queue_depth")]
    pub store_queue_depth: usize,
}

impl PartitionConfig {
    /// Create a config with defaults for everything but identity and range
    pub fn new(partition_id: u64, start: u64, end: u64, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            partition_id,
            node_id: 0,
            start,
            end,
            peers: Vec::new(),
            root_dir: root_dir.into(),
            store_mode: StoreMode::default(),
            marshal_version: MarshalVersion::default(),
            store_interval_secs: default_store_interval_secs(),
            store_queue_depth: default_store_queue_depth(),
        }
    }

    #[must_use]
    pub fn with_store_mode(mut self, mode: StoreMode) -> Self {
        self.store_mode = mode;
        self
    }

    #[must_use]
    pub fn with_marshal_version(mut self, version: MarshalVersion) -> Self {
        self.marshal_version = version;
        self
    }

    /// Whether `inode` falls in `[start, end)`
    #[must_use]
    pub const fn contains(&self, inode: u64) -> bool {
        inode >= self.start && inode < self.end
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.start >= self.end {
            return Err(Error::configuration(format!(
                "partition {}: empty inode range [{}, {})",
                self.partition_id, self.start, self.end
            )));
        }
        if self.root_dir.as_os_str().is_empty() {
            return Err(Error::configuration(format!(
                "partition {}: root_dir is empty",
                self.partition_id
            )));
        }
        if self.store_queue_depth == 0 {
            return Err(Error::configuration(format!(
                "partition {}: store_queue_depth must be positive",
                self.partition_id
            )));
        }
        Ok(())
    }

    /// Write `meta.json` into the root directory
    pub fn persist(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root_dir)?;
        let data = serde_json::to_vec_pretty(self)?;
        let path = self.root_dir.join(PARTITION_CONFIG_FILE);
        let tmp = self.root_dir.join(format!("{PARTITION_CONFIG_FILE}.tmp"));
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Read `meta.json` from a partition directory
    pub fn read_from(dir: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(dir.as_ref().join(PARTITION_CONFIG_FILE))?;
        Ok(serde_json::from_slice(&data)?)
    }
}

fn default_node_id() -> u64 {
    1
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./meta-data")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_store_interval_secs() -> u64 {
    60
}

fn default_store_queue_depth() -> usize {
    5
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.node_id, 1);
        assert_eq!(config.logging.level, "info");
        assert!(config.partitions.is_empty());
    }

    #[test]
    fn test_parse_toml() {
        let config = Config::from_toml_str(
            r#"
            [node]
            node_id = 3
            data_dir = "/var/lib/tessera"

            [[partitions]]
            partition_id = 7
            start = 1
            end = 1000000
            root_dir = "/var/lib/tessera/partition_7"
            store_mode = "redb"
            marshal_version = "v1"
            "#,
        )
        .unwrap();

        assert_eq!(config.node.node_id, 3);
        assert_eq!(config.partitions.len(), 1);
        let p = &config.partitions[0];
        assert_eq!(p.store_mode, StoreMode::Redb);
        assert_eq!(p.marshal_version, MarshalVersion::V1);
        assert_eq!(p.store_interval_secs, 60);
        assert_eq!(p.store_queue_depth, 5);
        p.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_empty_range() {
        let config = PartitionConfig::new(1, 10, 10, "/tmp/p1");
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_contains() {
        let config = PartitionConfig::new(1, 10, 20, "/tmp/p1");
        assert!(!config.contains(9));
        assert!(config.contains(10));
        assert!(config.contains(19));
        assert!(!config.contains(20));
    }

    #[test]
    fn test_marshal_version_tags() {
        for v in [MarshalVersion::V1, MarshalVersion::V2] {
            assert_eq!(MarshalVersion::from_tag(v.tag()), Some(v));
        }
        assert_eq!(MarshalVersion::from_tag(9), None);
    }

    #[test]
    fn test_persist_and_read_back() {
        let dir = tempdir().unwrap();
        let mut config = PartitionConfig::new(4, 1, 100, dir.path().join("partition_4"));
        config.peers.push(Peer {
            id: 1,
            addr: "127.0.0.1:9500".to_string(),
        });
        config.persist().unwrap();

        let loaded = PartitionConfig::read_from(&config.root_dir).unwrap();
        assert_eq!(loaded, config);
    }
}
