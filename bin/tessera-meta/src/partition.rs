//! Metadata partition state machine
//!
//! Lifecycle:
//!
//! ```text
//! open() --> Initializing --load()/start()--> Running --stop()--> Stopping --> Stopped
//!                 |                              |
//!                 +--------(fatal error)---------+----> Failed
//! ```
//!
//! `apply` is serialized by the apply lock, which also guards the apply
//! index. Snapshot capture takes the same lock for O(1) work so that the
//! two index views and the apply index always agree. Reads go straight to
//! the indexes and never wait for an apply to finish. `stop` releases the
//! index backend; a stopped partition answers every read with
//! `NotRunning`.

use crate::command::{ApplyResponse, MetaCommand};
use crate::error::{PartitionError, PartitionResult};
use crate::scheduler::{StoreRequest, StoreScheduler};
use derive_more::Display;
use metrics::{counter, gauge};
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tessera_common::{
    Dentry, DentryKey, ExtentKey, FLAG_DELETE_MARK, Inode, MarshalVersion, PartitionConfig,
    StoreMode,
};
use tessera_meta_store::index::Visit;
use tessera_meta_store::persist::{self, SnapshotHeader};
use tessera_meta_store::{MetaIndexes, MetaStoreError, OrderedIndex, PartitionSnapshot};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Records handed to the index per batch while loading a snapshot
const LOAD_BATCH: usize = 1024;

/// Lifecycle state of a partition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum PartitionState {
    #[display("initializing")]
    Initializing,
    #[display("running")]
    Running,
    #[display("stopping")]
    Stopping,
    #[display("stopped")]
    Stopped,
    /// A fatal error halted the partition; only `stop` is accepted
    #[display("failed")]
    Failed,
}

/// Outcome counters of background stores
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub stores: u64,
    pub failures: u64,
    /// Apply index of the newest stored (or loaded) snapshot
    pub last_apply_index: u64,
    pub last_inode_count: u64,
    pub last_dentry_count: u64,
    pub last_duration: Duration,
    /// Highest number of stores observed running at once
    pub peak_concurrent: usize,
}

/// Channels to the running store scheduler
struct SchedulerLink {
    store_tx: mpsc::Sender<StoreRequest>,
    reset_tx: mpsc::Sender<()>,
}

/// One metadata partition replica
pub struct MetaPartition {
    config: PartitionConfig,
    /// Index backend; taken by `stop`
    indexes: RwLock<Option<MetaIndexes>>,
    /// Apply lock; holds the last applied index
    apply_lock: Mutex<u64>,
    /// Mirror of the apply index for lock-free readers
    applied: AtomicU64,
    state: RwLock<PartitionState>,
    marshal_version: RwLock<MarshalVersion>,
    stats: Mutex<StoreStats>,
    stores_in_flight: AtomicUsize,
    /// Extents released by truncate/evict/append, awaiting reclamation
    freed_extents: Mutex<Vec<ExtentKey>>,
    link: Mutex<Option<SchedulerLink>>,
    stop_tx: watch::Sender<bool>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl MetaPartition {
    /// Validate the config, prepare the root directory and build the
    /// index backend. The partition starts out empty in `Initializing`.
    pub fn open(config: PartitionConfig) -> PartitionResult<Arc<Self>> {
        config.validate()?;
        std::fs::create_dir_all(&config.root_dir)?;
        config.persist()?;

        let indexes = MetaIndexes::open(config.store_mode, &config.root_dir)?;
        let (stop_tx, _) = watch::channel(false);
        info!(
            "Opened partition {} range [{}, {}) store_mode={} marshal={} at {}",
            config.partition_id,
            config.start,
            config.end,
            config.store_mode,
            config.marshal_version,
            config.root_dir.display()
        );

        Ok(Arc::new(Self {
            marshal_version: RwLock::new(config.marshal_version),
            config,
            indexes: RwLock::new(Some(indexes)),
            apply_lock: Mutex::new(0),
            applied: AtomicU64::new(0),
            state: RwLock::new(PartitionState::Initializing),
            stats: Mutex::new(StoreStats::default()),
            stores_in_flight: AtomicUsize::new(0),
            freed_extents: Mutex::new(Vec::new()),
            link: Mutex::new(None),
            stop_tx,
            scheduler: Mutex::new(None),
        }))
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.config.partition_id
    }

    #[must_use]
    pub const fn config(&self) -> &PartitionConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> PartitionState {
        *self.state.read()
    }

    /// Index of the last applied command
    #[must_use]
    pub fn apply_index(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn marshal_version(&self) -> MarshalVersion {
        *self.marshal_version.read()
    }

    /// Change the encoding used by subsequent stores
    pub fn set_marshal_version(&self, version: MarshalVersion) {
        let previous = std::mem::replace(&mut *self.marshal_version.write(), version);
        if previous != version {
            info!("Partition {}: marshal version {} -> {}", self.id(), previous, version);
        }
    }

    #[must_use]
    pub fn store_stats(&self) -> StoreStats {
        self.stats.lock().clone()
    }

    fn set_state(&self, state: PartitionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        debug!("Partition {}: {} -> {}", self.id(), previous, state);
    }

    fn not_running(&self, state: PartitionState) -> PartitionError {
        PartitionError::NotRunning {
            partition_id: self.id(),
            state,
        }
    }

    /// The index backend, unless `stop` has released it
    fn indexes(&self) -> PartitionResult<MappedRwLockReadGuard<'_, MetaIndexes>> {
        RwLockReadGuard::try_map(self.indexes.read(), |indexes| indexes.as_ref())
            .map_err(|_| self.not_running(self.state()))
    }

    /// Halt after an error that makes further applies unsafe
    fn fail(&self, err: &PartitionError) {
        error!("Partition {} halted: {}", self.id(), err);
        counter!("tessera_meta_fatal_errors_total", "partition" => self.id().to_string())
            .increment(1);
        let mut state = self.state.write();
        if matches!(*state, PartitionState::Initializing | PartitionState::Running) {
            *state = PartitionState::Failed;
        }
    }

    fn set_applied(&self, guard: &mut u64, index: u64) {
        *guard = index;
        self.applied.store(index, Ordering::Release);
    }

    // ---- Load / start / stop ----

    /// Restore state from the stored snapshot, if any.
    ///
    /// The snapshot's own header decides how its records are decoded. In
    /// redb mode the database is kept as-is when it already reflects the
    /// snapshot's apply index or later, and a failed load leaves it
    /// untouched for the next attempt.
    pub fn load(&self) -> PartitionResult<Option<SnapshotHeader>> {
        let state = self.state();
        if state != PartitionState::Initializing {
            return Err(self.not_running(state));
        }
        let mut applied = self.apply_lock.lock();
        let indexes = self.indexes()?;
        match self.load_locked(&indexes) {
            Ok((index, header)) => {
                self.set_applied(&mut applied, index);
                let mut stats = self.stats.lock();
                stats.last_apply_index = header.as_ref().map_or(0, |h| h.apply_index);
                if let Some(h) = &header {
                    stats.last_inode_count = h.inode_count;
                    stats.last_dentry_count = h.dentry_count;
                }
                Ok(header)
            }
            Err(source) => {
                let err = PartitionError::Load {
                    partition_id: self.id(),
                    source,
                };
                // Partially loaded memory state is discarded; redb tables
                // stay for the next attempt
                if indexes.mode() == StoreMode::Mem
                    && let Err(e) = indexes.clear()
                {
                    warn!("Partition {}: failed to clear after load error: {}", self.id(), e);
                }
                self.fail(&err);
                Err(err)
            }
        }
    }

    fn load_locked(
        &self,
        indexes: &MetaIndexes,
    ) -> Result<(u64, Option<SnapshotHeader>), MetaStoreError> {
        let root = &self.config.root_dir;
        let started = Instant::now();

        if let Some(persisted) = indexes.persisted_apply_index()? {
            let header = persist::read_header(root)?;
            let snapshot_index = header.as_ref().map_or(0, |h| h.apply_index);
            if persisted >= snapshot_index {
                info!(
                    "Partition {}: keeping redb contents at index {} (snapshot at {})",
                    self.id(),
                    persisted,
                    snapshot_index
                );
                return Ok((persisted, header));
            }
        }

        indexes.clear()?;
        let inodes = indexes.inodes.as_ref();
        let dentries = indexes.dentries.as_ref();
        let mut inode_batch = Vec::with_capacity(LOAD_BATCH);
        let mut dentry_batch = Vec::with_capacity(LOAD_BATCH);

        let header = persist::load_snapshot(
            root,
            |inode| {
                inode_batch.push(inode);
                if inode_batch.len() >= LOAD_BATCH {
                    flush_batch(inodes, &mut inode_batch)?;
                }
                Ok(())
            },
            |dentry| {
                dentry_batch.push(dentry);
                if dentry_batch.len() >= LOAD_BATCH {
                    flush_batch(dentries, &mut dentry_batch)?;
                }
                Ok(())
            },
        )?;
        flush_batch(inodes, &mut inode_batch)?;
        flush_batch(dentries, &mut dentry_batch)?;

        let Some(header) = header else {
            info!("Partition {}: no snapshot, starting empty", self.id());
            return Ok((0, None));
        };
        indexes.record_apply_index(header.apply_index)?;
        info!(
            "Partition {}: loaded snapshot at index {} ({} inodes, {} dentries, v{}) in {:?}",
            self.id(),
            header.apply_index,
            header.inode_count,
            header.dentry_count,
            header.marshal_version,
            started.elapsed()
        );
        Ok((header.apply_index, Some(header)))
    }

    /// Start the store scheduler and accept commands
    pub fn start(self: &Arc<Self>) -> PartitionResult<()> {
        {
            let mut state = self.state.write();
            if *state != PartitionState::Initializing {
                return Err(self.not_running(*state));
            }
            *state = PartitionState::Running;
        }

        let (store_tx, store_rx) = mpsc::channel(self.config.store_queue_depth);
        let (reset_tx, reset_rx) = mpsc::channel(1);
        *self.link.lock() = Some(SchedulerLink { store_tx, reset_tx });

        let scheduler =
            StoreScheduler::new(Arc::clone(self), store_rx, reset_rx, self.stop_tx.subscribe());
        *self.scheduler.lock() = Some(tokio::spawn(scheduler.run()));

        info!("Partition {} running at apply index {}", self.id(), self.apply_index());
        Ok(())
    }

    /// Stop the scheduler, abandoning queued stores, wait for it, then
    /// release the index backend
    pub async fn stop(&self) {
        {
            let mut state = self.state.write();
            if matches!(*state, PartitionState::Stopping | PartitionState::Stopped) {
                return;
            }
            *state = PartitionState::Stopping;
        }
        info!("Stopping partition {}", self.id());

        self.stop_tx.send_replace(true);
        self.link.lock().take();
        let handle = self.scheduler.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!("Partition {}: store scheduler task failed: {}", self.id(), e);
        }

        // Waits for in-flight applies and reads holding the backend
        let released = self.indexes.write().take();
        drop(released);

        self.set_state(PartitionState::Stopped);
        info!("Partition {} stopped at apply index {}", self.id(), self.apply_index());
    }

    // ---- Apply ----

    /// Apply the command committed at log position `index`.
    ///
    /// `index` must be exactly one past the current apply index. Any
    /// other value, and any backend failure while mutating, halts the
    /// partition. A command that fails to decode is rejected without
    /// advancing the apply index.
    pub fn apply(&self, command: &[u8], index: u64) -> PartitionResult<ApplyResponse> {
        match self.state() {
            PartitionState::Running => {}
            PartitionState::Failed => {
                return Err(PartitionError::Halted {
                    partition_id: self.id(),
                });
            }
            state => return Err(self.not_running(state)),
        }

        let mut applied = self.apply_lock.lock();
        let expected = *applied + 1;
        if index != expected {
            let err = PartitionError::ProtocolOrder {
                partition_id: self.id(),
                expected,
                got: index,
            };
            self.fail(&err);
            return Err(err);
        }

        let command = MetaCommand::decode(command)?;
        let kind = command.kind();
        let indexes = self.indexes()?;
        let result = self.execute(&indexes, command, index).and_then(|response| {
            indexes.record_apply_index(index)?;
            Ok(response)
        });

        match result {
            Ok(response) => {
                self.set_applied(&mut applied, index);
                debug!("Partition {}: applied {} at {}", self.id(), kind, index);
                Ok(response)
            }
            Err(err) => {
                if err.is_fatal() {
                    self.fail(&err);
                }
                Err(err)
            }
        }
    }

    fn execute(
        &self,
        indexes: &MetaIndexes,
        command: MetaCommand,
        index: u64,
    ) -> PartitionResult<ApplyResponse> {
        let inodes = indexes.inodes.as_ref();
        let dentries = indexes.dentries.as_ref();

        match command {
            MetaCommand::CreateInode(inode) => {
                if !self.config.contains(inode.inode) {
                    return Ok(ApplyResponse::OutOfRange(inode.inode));
                }
                Ok(ApplyResponse::Inserted(inodes.insert_if_absent(inode)?))
            }
            MetaCommand::LinkInode { inode, time } => update_inode(inodes, inode, |ino| {
                ino.nlink = ino.nlink.saturating_add(1);
                ino.modify_time = time;
            }),
            MetaCommand::UnlinkInode { inode, time } => update_inode(inodes, inode, |ino| {
                ino.nlink = ino.nlink.saturating_sub(1);
                if ino.is_dir() && ino.nlink < 2 {
                    ino.nlink = 0;
                }
                if ino.nlink == 0 {
                    ino.flag |= FLAG_DELETE_MARK;
                }
                ino.modify_time = time;
            }),
            MetaCommand::EvictInode { inode } => {
                let Some(ino) = inodes.get(&inode)? else {
                    return Ok(ApplyResponse::NotFound);
                };
                inodes.delete(&inode)?;
                self.free_extents(ino.extents);
                Ok(ApplyResponse::Done)
            }
            MetaCommand::AppendExtents {
                inode,
                extents,
                time,
            } => {
                let mut superseded = Vec::new();
                let response = update_inode(inodes, inode, |ino| {
                    for key in extents {
                        superseded.extend(ino.append_extent(key));
                    }
                    ino.modify_time = time;
                })?;
                self.free_extents(superseded);
                Ok(response)
            }
            MetaCommand::Truncate { inode, size, time } => {
                let mut dropped = Vec::new();
                let response = update_inode(inodes, inode, |ino| {
                    dropped = ino.truncate(size);
                    ino.modify_time = time;
                })?;
                self.free_extents(dropped);
                Ok(response)
            }
            MetaCommand::CreateDentry(dentry) => {
                Ok(ApplyResponse::Inserted(dentries.insert_if_absent(dentry)?))
            }
            MetaCommand::DeleteDentry { parent_id, name } => {
                let key = DentryKey::new(parent_id, name);
                let Some(dentry) = dentries.get(&key)? else {
                    return Ok(ApplyResponse::NotFound);
                };
                dentries.delete(&key)?;
                Ok(ApplyResponse::Dentry(dentry))
            }
            MetaCommand::UpdateDentry {
                parent_id,
                name,
                inode,
            } => {
                let key = DentryKey::new(parent_id, name);
                let Some(previous) = dentries.get(&key)? else {
                    return Ok(ApplyResponse::NotFound);
                };
                let mut updated = previous.clone();
                updated.inode = inode;
                dentries.put(updated)?;
                Ok(ApplyResponse::Dentry(previous))
            }
            MetaCommand::StoreTick => {
                let snapshot = indexes.snapshot(index)?;
                Ok(ApplyResponse::StoreScheduled(self.schedule_store(snapshot)))
            }
            MetaCommand::ExtentReset => {
                if let Some(link) = self.link.lock().as_ref() {
                    // A reset already pending covers this one
                    let _ = link.reset_tx.try_send(());
                }
                Ok(ApplyResponse::Done)
            }
        }
    }

    fn free_extents(&self, extents: Vec<ExtentKey>) {
        if !extents.is_empty() {
            self.freed_extents.lock().extend(extents);
        }
    }

    /// Queue a snapshot for the scheduler; dropped if the queue is full
    fn schedule_store(&self, snapshot: PartitionSnapshot) -> bool {
        let link = self.link.lock();
        let Some(link) = link.as_ref() else {
            return false;
        };
        let apply_index = snapshot.apply_index();
        match link.store_tx.try_send(StoreRequest { snapshot }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(req)) => {
                warn!(
                    "Partition {}: store queue full, dropping snapshot at index {}",
                    self.id(),
                    apply_index
                );
                counter!("tessera_meta_store_dropped_total", "partition" => self.id().to_string())
                    .increment(1);
                req.snapshot.close();
                false
            }
            Err(mpsc::error::TrySendError::Closed(req)) => {
                req.snapshot.close();
                false
            }
        }
    }

    // ---- Snapshot / store ----

    /// Capture a consistent view of both indexes at the current apply index
    pub fn snapshot(&self) -> PartitionResult<PartitionSnapshot> {
        let applied = self.apply_lock.lock();
        Ok(self.indexes()?.snapshot(*applied)?)
    }

    /// Persist a snapshot with the current marshal version.
    ///
    /// Normally called only by the store scheduler, which never runs two
    /// stores at once.
    pub fn store(&self, snapshot: &PartitionSnapshot) -> PartitionResult<SnapshotHeader> {
        let version = self.marshal_version();
        let concurrent = self.stores_in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        let started = Instant::now();
        let result = persist::store_snapshot(&self.config.root_dir, snapshot, version);
        let elapsed = started.elapsed();
        self.stores_in_flight.fetch_sub(1, Ordering::AcqRel);

        let partition = self.id().to_string();
        let mut stats = self.stats.lock();
        stats.peak_concurrent = stats.peak_concurrent.max(concurrent);
        match result {
            Ok(header) => {
                stats.stores += 1;
                stats.last_apply_index = header.apply_index;
                stats.last_inode_count = header.inode_count;
                stats.last_dentry_count = header.dentry_count;
                stats.last_duration = elapsed;
                drop(stats);

                counter!("tessera_meta_stores_total", "partition" => partition.clone())
                    .increment(1);
                gauge!("tessera_meta_stored_apply_index", "partition" => partition.clone())
                    .set(header.apply_index as f64);
                gauge!("tessera_meta_inodes", "partition" => partition.clone())
                    .set(header.inode_count as f64);
                gauge!("tessera_meta_dentries", "partition" => partition)
                    .set(header.dentry_count as f64);
                info!(
                    "Partition {}: stored index {} ({} inodes, {} dentries, {}) in {:?}",
                    self.id(),
                    header.apply_index,
                    header.inode_count,
                    header.dentry_count,
                    version,
                    elapsed
                );
                Ok(header)
            }
            Err(source) => {
                stats.failures += 1;
                drop(stats);
                counter!("tessera_meta_store_failures_total", "partition" => partition)
                    .increment(1);
                error!(
                    "Partition {}: store at index {} failed: {}",
                    self.id(),
                    snapshot.apply_index(),
                    source
                );
                Err(PartitionError::Store {
                    partition_id: self.id(),
                    source,
                })
            }
        }
    }

    /// Drop index versions no longer reachable by any snapshot
    pub fn vacuum(&self) {
        if let Some(indexes) = self.indexes.read().as_ref() {
            indexes.vacuum();
        }
    }

    // ---- Extent reclamation queue ----

    /// Take the extents released since the last call
    pub fn take_freed_extents(&self) -> Vec<ExtentKey> {
        std::mem::take(&mut *self.freed_extents.lock())
    }

    #[must_use]
    pub fn freed_extent_count(&self) -> usize {
        self.freed_extents.lock().len()
    }

    /// Discard the reclamation queue
    pub(crate) fn reset_freed_extents(&self) {
        let dropped = self.take_freed_extents().len();
        if dropped > 0 {
            info!("Partition {}: discarded {} queued extents", self.id(), dropped);
        }
    }

    // ---- Reads ----

    pub fn get_inode(&self, inode: u64) -> PartitionResult<Option<Inode>> {
        Ok(self.indexes()?.inodes.get(&inode)?)
    }

    /// Directory entry `name` under `parent_id`
    pub fn lookup(&self, parent_id: u64, name: &str) -> PartitionResult<Option<Dentry>> {
        Ok(self.indexes()?.dentries.get(&DentryKey::new(parent_id, name))?)
    }

    /// All entries of a directory in name order
    pub fn read_dir(&self, parent_id: u64) -> PartitionResult<Vec<Dentry>> {
        let lower = DentryKey::first_of(parent_id);
        let upper = parent_id.checked_add(1).map(DentryKey::first_of);
        let mut entries = Vec::new();
        self.indexes()?.dentries.range(Some(&lower), upper.as_ref(), &mut |d| {
            entries.push(d);
            Ok(true)
        })?;
        Ok(entries)
    }

    pub fn inode_count(&self) -> PartitionResult<u64> {
        Ok(self.indexes()?.inodes.count()?)
    }

    pub fn dentry_count(&self) -> PartitionResult<u64> {
        Ok(self.indexes()?.dentries.count()?)
    }

    pub fn range_inodes(
        &self,
        lower: Option<u64>,
        upper: Option<u64>,
        visit: Visit<'_, Inode>,
    ) -> PartitionResult<()> {
        Ok(self.indexes()?.inodes.range(lower.as_ref(), upper.as_ref(), visit)?)
    }

    pub fn range_dentries(
        &self,
        lower: Option<&DentryKey>,
        upper: Option<&DentryKey>,
        visit: Visit<'_, Dentry>,
    ) -> PartitionResult<()> {
        Ok(self.indexes()?.dentries.range(lower, upper, visit)?)
    }
}

fn update_inode(
    inodes: &dyn OrderedIndex<Inode>,
    inode: u64,
    mutate: impl FnOnce(&mut Inode),
) -> PartitionResult<ApplyResponse> {
    let Some(mut ino) = inodes.get(&inode)? else {
        return Ok(ApplyResponse::NotFound);
    };
    mutate(&mut ino);
    inodes.put(ino.clone())?;
    Ok(ApplyResponse::Inode(ino))
}

fn flush_batch<E: tessera_meta_store::IndexEntity>(
    index: &dyn OrderedIndex<E>,
    batch: &mut Vec<E>,
) -> Result<(), MetaStoreError> {
    if batch.is_empty() {
        return Ok(());
    }
    let expected = batch.len();
    let inserted = index.insert_batch(std::mem::take(batch))?;
    if inserted != expected {
        return Err(MetaStoreError::Corrupt(format!(
            "snapshot holds {} duplicate keys",
            expected - inserted
        )));
    }
    Ok(())
}
