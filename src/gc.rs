//! Garbage collection over delta chains and durability files.
//!
//! The collector finds the oldest start timestamp any active transaction
//! holds; committed transactions entirely below it can no longer be
//! reached by any chain walk, so their chain suffixes are unlinked and
//! objects whose surviving state is a committed delete are dropped from
//! the stores. A second sweep applies the snapshot retention policy and
//! removes WAL segments fully covered by a retained snapshot, unless the
//! file retainer has them pinned for an in-flight transfer.

use std::collections::BTreeSet;
use std::fs;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::delta::{Delta, OwnerRef};
use crate::durability::{snapshot, wal};
use crate::engine::StorageEngine;
use crate::mvcc;
use crate::types::Gid;

#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub oldest_active_start_timestamp: u64,
    pub transactions_collected: usize,
    pub chains_truncated: usize,
    pub objects_reclaimed: usize,
    pub durability_files_deleted: usize,
    pub duration: Duration,
}

#[derive(Debug)]
pub enum GcMessage {
    Trigger,
    Shutdown,
}

#[derive(Debug)]
pub struct GcHandle {
    sender: Sender<GcMessage>,
    worker: Option<JoinHandle<()>>,
}

impl GcHandle {
    pub fn trigger(&self) {
        let _ = self.sender.send(GcMessage::Trigger);
    }

    /// Stops the worker. Joining is skipped when the call happens on the
    /// worker itself (the engine can be dropped from a GC iteration that
    /// holds the last strong reference).
    pub fn shutdown(mut self) {
        let _ = self.sender.send(GcMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

pub fn spawn_worker(engine: Weak<StorageEngine>, cycle: Duration) -> GcHandle {
    let (sender, receiver) = mpsc::channel();
    let worker = thread::Builder::new()
        .name("lamina-gc".into())
        .spawn(move || loop {
            match receiver.recv_timeout(cycle) {
                Ok(GcMessage::Trigger) | Err(RecvTimeoutError::Timeout) => {
                    let Some(engine) = engine.upgrade() else {
                        break;
                    };
                    let stats = run_gc(&engine);
                    if stats.objects_reclaimed > 0 || stats.durability_files_deleted > 0 {
                        debug!(
                            objects_reclaimed = stats.objects_reclaimed,
                            files_deleted = stats.durability_files_deleted,
                            "gc cycle reclaimed storage"
                        );
                    }
                }
                Ok(GcMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })
        .expect("failed to spawn gc worker");
    GcHandle {
        sender,
        worker: Some(worker),
    }
}

pub fn run_gc(engine: &StorageEngine) -> GcStats {
    let started = Instant::now();
    let oldest_active = engine.oldest_active_start_timestamp();
    let reclaimable = engine.take_reclaimable_transactions(oldest_active);

    let mut vertex_owners: BTreeSet<Gid> = BTreeSet::new();
    let mut edge_owners: BTreeSet<Gid> = BTreeSet::new();
    for transaction in &reclaimable {
        for delta in &transaction.deltas {
            match delta.owner {
                OwnerRef::Vertex(gid) => {
                    vertex_owners.insert(gid);
                }
                OwnerRef::Edge(gid) => {
                    edge_owners.insert(gid);
                }
            }
        }
    }

    let mut objects_reclaimed = 0;
    let chains_truncated = vertex_owners.len() + edge_owners.len();
    for gid in vertex_owners {
        if engine.truncate_vertex_chain(gid, oldest_active) {
            objects_reclaimed += 1;
        }
    }
    for gid in edge_owners {
        if engine.truncate_edge_chain(gid, oldest_active) {
            objects_reclaimed += 1;
        }
    }

    let durability_files_deleted = sweep_durability_files(engine);

    let stats = GcStats {
        oldest_active_start_timestamp: oldest_active,
        transactions_collected: reclaimable.len(),
        chains_truncated,
        objects_reclaimed,
        durability_files_deleted,
        duration: started.elapsed(),
    };
    if stats.transactions_collected > 0 {
        info!(
            oldest_active,
            transactions = stats.transactions_collected,
            objects_reclaimed,
            "gc cycle finished"
        );
    }
    stats
}

/// Cuts the chain at the first delta no active snapshot can reach.
/// Walkers stop before applying such a delta, so the suffix starting
/// there is unreachable and safe to drop.
pub(crate) fn truncate_chain(head_slot: &mut Option<Arc<Delta>>, oldest_active: u64) {
    let Some(head) = head_slot else {
        return;
    };
    let timestamp = head.timestamp();
    if mvcc::is_committed(timestamp) && timestamp < oldest_active {
        *head_slot = None;
        return;
    }
    let mut newer = Arc::clone(head);
    while let Some(next) = newer.next() {
        let timestamp = next.timestamp();
        if mvcc::is_committed(timestamp) && timestamp < oldest_active {
            newer.take_next();
            return;
        }
        newer = next;
    }
}

fn sweep_durability_files(engine: &StorageEngine) -> usize {
    let config = &engine.config().durability;
    let retainer = engine.file_retainer();
    let mut deleted = 0;

    let snapshots =
        match snapshot::list_snapshot_files(&config.snapshot_directory, Some(engine.uuid())) {
            Ok(snapshots) => snapshots,
            Err(err) => {
                warn!(error = %err, "gc could not list snapshots");
                return deleted;
            }
        };

    let mut retained = snapshots.clone();
    if snapshots.len() > config.snapshot_retention_count {
        let excess = snapshots.len() - config.snapshot_retention_count;
        for info in &snapshots[..excess] {
            if retainer.is_pinned(&info.path) {
                continue;
            }
            match fs::remove_file(&info.path) {
                Ok(()) => {
                    deleted += 1;
                    retained.retain(|kept| kept.path != info.path);
                }
                Err(err) => warn!(path = %info.path.display(), error = %err, "gc could not delete snapshot"),
            }
        }
    }

    // A WAL whose whole range sits at or below a retained snapshot's
    // timestamp adds nothing to any recovery that starts at it.
    let Some(oldest_retained) = retained.first() else {
        return deleted;
    };
    let wal_files = match wal::list_finalized_wal_files(&config.wal_directory, engine.uuid()) {
        Ok(files) => files,
        Err(err) => {
            warn!(error = %err, "gc could not list wal files");
            return deleted;
        }
    };
    for info in wal_files {
        if info.to_timestamp > oldest_retained.start_timestamp {
            continue;
        }
        if retainer.is_pinned(&info.path) {
            continue;
        }
        match fs::remove_file(&info.path) {
            Ok(()) => deleted += 1,
            Err(err) => warn!(path = %info.path.display(), error = %err, "gc could not delete wal"),
        }
    }
    deleted
}
