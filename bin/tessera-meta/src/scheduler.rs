//! Background store scheduler: one task per running partition.
//!
//! Snapshots queued by `StoreTick` commands (and, when configured, by a
//! periodic timer) are persisted one at a time on the blocking pool. The
//! loop also services extent-reset requests. Stopping abandons queued
//! snapshots but waits for a store already in progress.

use crate::partition::MetaPartition;
use std::sync::Arc;
use std::time::Duration;
use tessera_meta_store::PartitionSnapshot;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// A snapshot waiting to be stored
#[derive(Debug)]
pub struct StoreRequest {
    pub snapshot: PartitionSnapshot,
}

pub(crate) struct StoreScheduler {
    partition: Arc<MetaPartition>,
    store_rx: mpsc::Receiver<StoreRequest>,
    reset_rx: mpsc::Receiver<()>,
    stop_rx: watch::Receiver<bool>,
}

impl StoreScheduler {
    pub(crate) const fn new(
        partition: Arc<MetaPartition>,
        store_rx: mpsc::Receiver<StoreRequest>,
        reset_rx: mpsc::Receiver<()>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            partition,
            store_rx,
            reset_rx,
            stop_rx,
        }
    }

    pub(crate) async fn run(mut self) {
        let id = self.partition.id();
        let interval_secs = self.partition.config().store_interval_secs;
        let periodic = interval_secs > 0;
        // Zero would panic in interval_at; the branch is disabled anyway
        let period = Duration::from_secs(interval_secs.max(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Partition {}: store scheduler started (interval {}s)", id, interval_secs);

        loop {
            tokio::select! {
                biased;

                changed = self.stop_rx.changed() => {
                    if changed.is_err() || *self.stop_rx.borrow() {
                        break;
                    }
                }
                request = self.store_rx.recv() => {
                    let Some(request) = request else { break };
                    self.store(request.snapshot).await;
                }
                Some(()) = self.reset_rx.recv() => {
                    self.partition.reset_freed_extents();
                }
                _ = ticker.tick(), if periodic => {
                    self.periodic_store().await;
                }
            }
        }

        let mut abandoned = 0usize;
        self.store_rx.close();
        while let Ok(request) = self.store_rx.try_recv() {
            request.snapshot.close();
            abandoned += 1;
        }
        if abandoned > 0 {
            warn!("Partition {}: abandoned {} pending stores", id, abandoned);
        }
        info!("Partition {}: store scheduler exited", id);
    }

    async fn periodic_store(&self) {
        let applied = self.partition.apply_index();
        if applied <= self.partition.store_stats().last_apply_index {
            return;
        }
        match self.partition.snapshot() {
            Ok(snapshot) => self.store(snapshot).await,
            Err(e) => error!("Partition {}: periodic snapshot failed: {}", self.partition.id(), e),
        }
    }

    async fn store(&self, snapshot: PartitionSnapshot) {
        let partition = Arc::clone(&self.partition);
        let result = tokio::task::spawn_blocking(move || {
            // Failures are logged and counted by `store`
            let _ = partition.store(&snapshot);
            snapshot.close();
            partition.vacuum();
        })
        .await;
        if let Err(e) = result {
            error!("Partition {}: store task failed: {}", self.partition.id(), e);
        }
    }
}
