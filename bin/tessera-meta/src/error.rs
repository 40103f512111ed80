//! Errors raised by metadata partitions

use crate::partition::PartitionState;
use tessera_meta_store::MetaStoreError;

/// Error type for partition operations
#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    /// The log delivered an index other than the next one. Applying it
    /// would diverge from the other replicas, so the partition halts.
    #[error("partition {partition_id}: out-of-order apply, expected index {expected}, got {got}")]
    ProtocolOrder { partition_id: u64, expected: u64, got: u64 },

    #[error("command encoding failed: {0}")]
    Encode(String),

    /// The command bytes could not be decoded; nothing was applied
    #[error("malformed command: {0}")]
    Decode(String),

    #[error("backend failure: {0}")]
    Backend(#[from] MetaStoreError),

    #[error("partition {partition_id} is {state}")]
    NotRunning { partition_id: u64, state: PartitionState },

    #[error("partition {partition_id} halted after a fatal error")]
    Halted { partition_id: u64 },

    #[error("partition {partition_id}: snapshot load failed: {source}")]
    Load {
        partition_id: u64,
        #[source]
        source: MetaStoreError,
    },

    #[error("partition {partition_id}: store failed: {source}")]
    Store {
        partition_id: u64,
        #[source]
        source: MetaStoreError,
    },

    #[error("partition {0} already exists")]
    Exists(u64),

    #[error("configuration error: {0}")]
    Config(#[from] tessera_common::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PartitionError {
    /// Whether the partition can no longer apply commands after this error
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProtocolOrder { .. } | Self::Backend(_) | Self::Halted { .. }
        )
    }
}

pub type PartitionResult<T> = Result<T, PartitionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let order = PartitionError::ProtocolOrder {
            partition_id: 1,
            expected: 5,
            got: 7,
        };
        assert!(order.is_fatal());
        assert_eq!(
            order.to_string(),
            "partition 1: out-of-order apply, expected index 5, got 7"
        );
        assert!(!PartitionError::Decode("bad".into()).is_fatal());
        assert!(!PartitionError::Encode("bad".into()).is_fatal());
        assert!(PartitionError::Backend(MetaStoreError::SnapshotReleased).is_fatal());
        assert!(!PartitionError::Exists(3).is_fatal());
    }
}
