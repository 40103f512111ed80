//! Tessera Meta - metadata partition state machine
//!
//! A metadata partition owns one range of inode numbers and the directory
//! entries whose parents fall in it. It is driven by a replicated log:
//! every committed command is handed to [`MetaPartition::apply`] with its
//! log index, and applying the same commands in the same order always
//! produces the same state. Durable snapshots are written in the
//! background by a per-partition store scheduler.

pub mod command;
pub mod error;
pub mod manager;
pub mod partition;
pub mod scheduler;

pub use command::{ApplyResponse, MetaCommand};
pub use error::{PartitionError, PartitionResult};
pub use manager::MetadataManager;
pub use partition::{MetaPartition, PartitionState, StoreStats};
pub use scheduler::StoreRequest;
