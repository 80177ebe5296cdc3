//! Per-replica client state machine.
//!
//! A client is in exactly one of four states. READY replicas receive each
//! commit over a delta stream; a replica that falls behind is caught up
//! from durability artifacts by a background recovery task; a broken
//! connection parks the client in INVALID until a reconnect heartbeat
//! succeeds. All transitions happen under the client lock; transport
//! calls never do.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::config::{ReplicaConfig, ReplicationMode};
use crate::durability::encoder::{self, WalDeltaOp};
use crate::durability::{snapshot, wal};
use crate::engine::StorageEngine;
use crate::error::{Result, StorageError};
use crate::replication::rpc::{
    AppendDeltasRequest, CurrentWalRequest, FileTransfer, HeartbeatRequest, OnlySnapshotRequest,
    ReplicaTransport, SnapshotRequest, WalFilesRequest,
};
use crate::utils::file_retainer::FileLocker;
use crate::utils::thread_pool::ThreadPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// Caught up; the next commit opens a delta stream.
    Ready,
    /// A delta stream is open and unfinalized.
    Replicating,
    /// A background task is shipping durability artifacts.
    Recovery,
    /// The connection is broken; a reconnect task owns the next step.
    Invalid,
}

/// One shipment a recovering replica is asked to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryStep {
    Snapshot(PathBuf),
    Wals(Vec<PathBuf>),
    CurrentWal(u64),
    OnlySnapshot(u64),
}

/// The open delta stream. Appends accumulate in `batch`; `finalize` ships
/// the whole transaction. The generation ties the stream to the client
/// state that created it, so a response arriving after a SYNC timeout
/// demotion is recognized as stale and dropped.
#[derive(Debug)]
struct ReplicaStream {
    previous_commit_timestamp: u64,
    current_wal_seq_num: u64,
    batch: Vec<u8>,
    final_commit_timestamp: u64,
    generation: u64,
}

#[derive(Debug)]
struct ClientState {
    replica_state: ReplicaState,
    stream: Option<ReplicaStream>,
}

#[derive(Debug, Default)]
struct TimeoutFlags {
    /// The finalize worker is still running.
    active: bool,
    /// The previous timer task has fully exited.
    finished: bool,
}

/// Latch on which the commit thread, the finalize worker and the timeout
/// timer race; whichever finishes first wakes the commit thread.
#[derive(Debug)]
struct TimeoutDispatcher {
    flags: Mutex<TimeoutFlags>,
    condvar: Condvar,
}

impl TimeoutDispatcher {
    fn new() -> Self {
        Self {
            flags: Mutex::new(TimeoutFlags {
                active: false,
                finished: true,
            }),
            condvar: Condvar::new(),
        }
    }

    fn wait_for_previous_timer(&self) {
        let mut flags = self.flags.lock();
        while !flags.finished {
            self.condvar.wait(&mut flags);
        }
    }

    fn arm(&self) {
        self.flags.lock().active = true;
    }

    fn work_finished(&self) {
        let mut flags = self.flags.lock();
        flags.active = false;
        self.condvar.notify_all();
    }

    fn wait_until_inactive(&self) {
        let mut flags = self.flags.lock();
        while flags.active {
            self.condvar.wait(&mut flags);
        }
    }
}

pub struct ReplicationClient {
    name: String,
    /// Mode and timeout move under this lock when a SYNC replica is
    /// demoted to ASYNC.
    config: Mutex<ReplicaConfig>,
    transport: Arc<dyn ReplicaTransport>,
    engine: Weak<StorageEngine>,
    state: Mutex<ClientState>,
    /// Bumped on demotion; streams created before the bump are stale.
    generation: AtomicU64,
    /// Runs finalization and recovery so commits never block on I/O they
    /// did not ask to wait for.
    pool: ThreadPool,
    timeout_pool: ThreadPool,
    timeout_dispatcher: TimeoutDispatcher,
}

impl ReplicationClient {
    pub(crate) fn new(
        config: ReplicaConfig,
        transport: Arc<dyn ReplicaTransport>,
        engine: Weak<StorageEngine>,
    ) -> Arc<Self> {
        let name = config.name.clone();
        Arc::new(Self {
            pool: ThreadPool::new(&format!("replica-{name}")),
            timeout_pool: ThreadPool::new(&format!("replica-{name}-timer")),
            timeout_dispatcher: TimeoutDispatcher::new(),
            name,
            config: Mutex::new(config),
            transport,
            engine,
            state: Mutex::new(ClientState {
                replica_state: ReplicaState::Invalid,
                stream: None,
            }),
            generation: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ReplicaState {
        self.state.lock().replica_state
    }

    pub fn mode(&self) -> ReplicationMode {
        self.config.lock().mode
    }

    pub fn replica_config(&self) -> ReplicaConfig {
        self.config.lock().clone()
    }

    // ---------------------------------------------------------------
    // Handshake
    // ---------------------------------------------------------------

    pub fn try_initialize(self: &Arc<Self>) {
        if let Err(err) = self.initialize() {
            self.state.lock().replica_state = ReplicaState::Invalid;
            error!(replica = %self.name, error = %err, "failed to connect to replica");
        }
    }

    fn initialize(self: &Arc<Self>) -> Result<()> {
        let engine = self.upgrade_engine()?;
        let epoch_id = engine.epoch_id();
        let last_commit = engine.last_commit_timestamp();

        let response = self.transport.heartbeat(HeartbeatRequest {
            epoch_id: epoch_id.clone(),
            last_commit_timestamp: last_commit,
        })?;

        // A replica on a different epoch is only usable when that epoch
        // appears in our history and ends exactly where the replica
        // stands; everything else means its history branched off ours.
        let mut branching_point = None;
        if response.epoch_id != epoch_id && response.current_commit_timestamp != 0 {
            let history = engine.epoch_history();
            match history
                .iter()
                .rev()
                .find(|(epoch, _)| *epoch == response.epoch_id)
            {
                None => branching_point = Some(0),
                Some((_, end_timestamp)) if *end_timestamp != response.current_commit_timestamp => {
                    branching_point = Some(*end_timestamp)
                }
                Some(_) => {}
            }
        }
        if let Some(branching_point) = branching_point {
            error!(
                replica = %self.name,
                branching_point,
                "replica cannot be used with this instance, its history diverged"
            );
            self.state.lock().replica_state = ReplicaState::Invalid;
            return Ok(());
        }

        if response.current_commit_timestamp == last_commit {
            debug!(replica = %self.name, "replica up to date");
            self.state.lock().replica_state = ReplicaState::Ready;
        } else {
            debug!(
                replica = %self.name,
                replica_commit = response.current_commit_timestamp,
                primary_commit = last_commit,
                "replica is behind"
            );
            self.state.lock().replica_state = ReplicaState::Recovery;
            let this = Arc::clone(self);
            let replica_commit = response.current_commit_timestamp;
            self.pool.add_task(move || this.recover_replica(replica_commit));
        }
        Ok(())
    }

    fn upgrade_engine(&self) -> Result<Arc<StorageEngine>> {
        self.engine
            .upgrade()
            .ok_or_else(|| StorageError::Rpc("storage engine is shutting down".into()))
    }

    fn handle_rpc_failure(self: &Arc<Self>) {
        error!(replica = %self.name, "could not replicate data to replica");
        let this = Arc::clone(self);
        self.pool.add_task(move || this.try_initialize());
    }

    // ---------------------------------------------------------------
    // Delta stream
    // ---------------------------------------------------------------

    /// Called by the engine, under the engine lock, for every commit.
    /// Opens (or refuses to open) the stream and buffers the encoded
    /// transaction; no transport traffic happens here.
    pub(crate) fn append_committed_transaction(
        self: &Arc<Self>,
        previous_commit_timestamp: u64,
        current_wal_seq_num: u64,
        commit_timestamp: u64,
        ops: &[WalDeltaOp],
    ) {
        let mut state = self.state.lock();
        match state.replica_state {
            ReplicaState::Recovery => {
                debug!(replica = %self.name, "replica is behind, commit ships via recovery");
            }
            ReplicaState::Replicating => {
                // The previous transaction has not finalized; a second
                // stream would race it, so the missed commit is left for
                // the recovery task that finalization will spawn.
                debug!(replica = %self.name, "replica missed a transaction");
                state.replica_state = ReplicaState::Recovery;
            }
            ReplicaState::Invalid => {
                drop(state);
                self.handle_rpc_failure();
            }
            ReplicaState::Ready => {
                let mut stream = ReplicaStream {
                    previous_commit_timestamp,
                    current_wal_seq_num,
                    batch: Vec::new(),
                    final_commit_timestamp: commit_timestamp,
                    generation: self.generation.load(Ordering::Acquire),
                };
                encoder::encode_transaction(&mut stream.batch, commit_timestamp, ops);
                state.stream = Some(stream);
                state.replica_state = ReplicaState::Replicating;
            }
        }
    }

    /// Called by the engine after the engine lock is released. SYNC
    /// replicas block the committing thread here (bounded by the
    /// configured timeout); ASYNC replicas hand the work to the pool.
    pub(crate) fn finalize_transaction_replication(self: &Arc<Self>) {
        if self.state.lock().replica_state != ReplicaState::Replicating {
            return;
        }
        let (mode, timeout) = {
            let config = self.config.lock();
            (config.mode, config.timeout_duration())
        };
        match (mode, timeout) {
            (ReplicationMode::Async, _) => {
                let this = Arc::clone(self);
                self.pool.add_task(move || this.finalize_internal());
            }
            (ReplicationMode::Sync, Some(timeout)) => self.finalize_with_timeout(timeout),
            (ReplicationMode::Sync, None) => self.finalize_internal(),
        }
    }

    fn finalize_with_timeout(self: &Arc<Self>, timeout: Duration) {
        let dispatcher = &self.timeout_dispatcher;
        dispatcher.wait_for_previous_timer();
        dispatcher.arm();

        let worker = Arc::clone(self);
        self.pool.add_task(move || {
            worker.finalize_internal();
            worker.timeout_dispatcher.work_finished();
        });

        let timer = Arc::clone(self);
        self.timeout_pool.add_task(move || {
            {
                timer.timeout_dispatcher.flags.lock().finished = false;
            }
            let deadline = Instant::now() + timeout;
            loop {
                {
                    let flags = timer.timeout_dispatcher.flags.lock();
                    if !flags.active {
                        break;
                    }
                }
                if Instant::now() >= deadline {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            let mut flags = timer.timeout_dispatcher.flags.lock();
            flags.finished = true;
            flags.active = false;
            timer.timeout_dispatcher.condvar.notify_all();
        });

        dispatcher.wait_until_inactive();

        // Still REPLICATING here means the timer won the race: the
        // replica did not acknowledge in time and runs as ASYNC from now
        // on. Bumping the generation marks the in-flight stream stale so
        // its eventual response is discarded, not misread as progress.
        let state = self.state.lock();
        if state.replica_state == ReplicaState::Replicating {
            drop(state);
            self.generation.fetch_add(1, Ordering::AcqRel);
            let mut config = self.config.lock();
            config.mode = ReplicationMode::Async;
            config.timeout = None;
            info!(
                replica = %self.name,
                "replica timed out, demoted to asynchronous replication"
            );
        }
    }

    fn finalize_internal(self: &Arc<Self>) {
        let Some(stream) = self.state.lock().stream.take() else {
            return;
        };
        let Ok(engine) = self.upgrade_engine() else {
            return;
        };
        let request = AppendDeltasRequest {
            epoch_id: engine.epoch_id(),
            previous_commit_timestamp: stream.previous_commit_timestamp,
            current_wal_seq_num: stream.current_wal_seq_num,
            batch: stream.batch,
            final_commit_timestamp: stream.final_commit_timestamp,
        };
        match self.transport.append_deltas(request) {
            Ok(response) => {
                let mut state = self.state.lock();
                if stream.generation != self.generation.load(Ordering::Acquire) {
                    // The stream was demoted while this response was in
                    // flight. Its READY/RECOVERY verdict is discarded,
                    // but the replica's reported position still seeds a
                    // reconciliation pass.
                    debug!(
                        replica = %self.name,
                        "discarding stale stream response after demotion"
                    );
                    state.replica_state = ReplicaState::Recovery;
                    drop(state);
                    let this = Arc::clone(self);
                    let replica_commit = response.current_commit_timestamp;
                    self.pool
                        .add_task(move || this.recover_replica(replica_commit));
                    return;
                }
                if !response.success || state.replica_state == ReplicaState::Recovery {
                    state.replica_state = ReplicaState::Recovery;
                    drop(state);
                    let this = Arc::clone(self);
                    let replica_commit = response.current_commit_timestamp;
                    self.pool
                        .add_task(move || this.recover_replica(replica_commit));
                } else {
                    state.replica_state = ReplicaState::Ready;
                }
            }
            Err(err) => {
                debug!(replica = %self.name, error = %err, "delta stream finalize failed");
                self.state.lock().replica_state = ReplicaState::Invalid;
                self.handle_rpc_failure();
            }
        }
    }

    // ---------------------------------------------------------------
    // Recovery
    // ---------------------------------------------------------------

    fn recover_replica(self: &Arc<Self>, mut replica_commit: u64) {
        let Ok(engine) = self.upgrade_engine() else {
            return;
        };
        loop {
            let mut locker = engine.file_retainer().add_locker();
            let steps = match self.get_recovery_steps(&engine, replica_commit, &mut locker) {
                Ok(steps) => steps,
                Err(err) => {
                    error!(replica = %self.name, error = %err, "recovery planning failed");
                    self.state.lock().replica_state = ReplicaState::Invalid;
                    self.handle_rpc_failure();
                    return;
                }
            };
            for step in steps {
                match self.execute_recovery_step(&engine, step) {
                    Ok(Some(current_commit_timestamp)) => {
                        replica_commit = current_commit_timestamp;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        debug!(replica = %self.name, error = %err, "recovery step failed");
                        self.state.lock().replica_state = ReplicaState::Invalid;
                        self.handle_rpc_failure();
                        return;
                    }
                }
            }

            // The comparison happens under the client lock so a commit
            // racing this check cannot slip between "replica caught up"
            // and "state set to READY" unnoticed.
            let mut state = self.state.lock();
            if engine.last_commit_timestamp() == replica_commit {
                state.replica_state = ReplicaState::Ready;
                info!(replica = %self.name, replica_commit, "replica recovered");
                return;
            }
        }
    }

    fn execute_recovery_step(
        self: &Arc<Self>,
        engine: &Arc<StorageEngine>,
        step: RecoveryStep,
    ) -> Result<Option<u64>> {
        let epoch_id = engine.epoch_id();
        match step {
            RecoveryStep::Snapshot(path) => {
                debug!(replica = %self.name, path = %path.display(), "sending snapshot");
                let data = std::fs::read(&path)?;
                let filename = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or_default()
                    .to_owned();
                let response = self.transport.transfer_snapshot(SnapshotRequest {
                    epoch_id,
                    file: FileTransfer { filename, data },
                })?;
                Ok(Some(response.current_commit_timestamp))
            }
            RecoveryStep::Wals(paths) => {
                debug!(replica = %self.name, count = paths.len(), "sending wal files");
                let mut files = Vec::with_capacity(paths.len());
                for path in paths {
                    files.push(FileTransfer {
                        filename: path
                            .file_name()
                            .and_then(|name| name.to_str())
                            .unwrap_or_default()
                            .to_owned(),
                        data: std::fs::read(&path)?,
                    });
                }
                let response = self
                    .transport
                    .transfer_wal_files(WalFilesRequest { epoch_id, files })?;
                Ok(Some(response.current_commit_timestamp))
            }
            RecoveryStep::CurrentWal(seq_num) => {
                // Only ship if the segment the plan saw is still the
                // current one; a rotation in between means the finalized
                // successor will cover it on the next planner round.
                let Some((filename, file_data, buffer_data)) =
                    engine.current_wal_image(seq_num)?
                else {
                    return Ok(None);
                };
                debug!(replica = %self.name, seq_num, "sending current wal");
                let size = (file_data.len() + buffer_data.len()) as u64;
                let response = self.transport.transfer_current_wal(CurrentWalRequest {
                    epoch_id,
                    filename,
                    size,
                    file_data,
                    buffer_data,
                })?;
                Ok(Some(response.current_commit_timestamp))
            }
            RecoveryStep::OnlySnapshot(snapshot_timestamp) => {
                debug!(replica = %self.name, snapshot_timestamp, "snapshot timestamp is the latest state");
                let response = self.transport.transfer_only_snapshot(OnlySnapshotRequest {
                    epoch_id,
                    snapshot_timestamp,
                })?;
                if response.success {
                    Ok(Some(response.current_commit_timestamp))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Plans the cheapest sequence of shipments that brings a replica at
    /// `replica_commit` up to the primary's last commit. Finalized WAL
    /// chains are preferred over snapshots; the current WAL covers the
    /// newest commits when its sequence number still matches at transfer
    /// time. Every planned file is pinned in `locker` for the duration.
    pub fn get_recovery_steps(
        &self,
        engine: &Arc<StorageEngine>,
        replica_commit: u64,
        locker: &mut FileLocker,
    ) -> Result<Vec<RecoveryStep>> {
        let current_wal_seq_num = engine.current_wal_seq_num();
        let config = &engine.config().durability;
        let wal_files = wal::list_finalized_wal_files(&config.wal_directory, engine.uuid())?;
        let snapshots =
            snapshot::list_snapshot_files(&config.snapshot_directory, Some(engine.uuid()))?;
        let latest_snapshot = snapshots.last().cloned();

        let mut steps = Vec::new();

        // Nothing finalized: the whole difference sits in the current
        // WAL, or in a snapshot that was the last write of its epoch.
        let Some(newest) = wal_files.last() else {
            if let Some(seq_num) = current_wal_seq_num {
                steps.push(RecoveryStep::CurrentWal(seq_num));
            } else {
                let latest = latest_snapshot.ok_or_else(|| {
                    StorageError::Recovery("no durability files to recover a replica from".into())
                })?;
                locker.add_file(&latest.path);
                steps.push(RecoveryStep::OnlySnapshot(latest.start_timestamp));
            }
            return Ok(steps);
        };

        // Every finalized segment is already covered by the replica.
        if newest.to_timestamp <= replica_commit {
            if let Some(seq_num) = current_wal_seq_num {
                steps.push(RecoveryStep::CurrentWal(seq_num));
            } else {
                let latest = latest_snapshot.ok_or_else(|| {
                    StorageError::Recovery("no durability files to recover a replica from".into())
                })?;
                locker.add_file(&latest.path);
                steps.push(RecoveryStep::OnlySnapshot(latest.start_timestamp));
            }
            return Ok(steps);
        }

        // Longest contiguous chain ending at the newest segment that
        // reaches back to the replica's commit (or to sequence 0).
        let mut start_index = None;
        let mut previous_seq_num = newest.seq_num;
        for (index, info) in wal_files.iter().enumerate().rev() {
            if previous_seq_num - info.seq_num > 1 {
                break;
            }
            if replica_commit >= info.from_timestamp || info.seq_num == 0 {
                // A segment the replica fully holds is dropped from the
                // chain; its successor is the first useful one.
                start_index = Some(if replica_commit >= info.to_timestamp {
                    index + 1
                } else {
                    index
                });
                break;
            }
            previous_seq_num = info.seq_num;
        }

        if let Some(start_index) = start_index {
            let mut chain = Vec::with_capacity(wal_files.len() - start_index);
            for info in &wal_files[start_index..] {
                locker.add_file(&info.path);
                chain.push(info.path.clone());
            }
            steps.push(RecoveryStep::Wals(chain));
            if let Some(seq_num) = current_wal_seq_num {
                steps.push(RecoveryStep::CurrentWal(seq_num));
            }
            return Ok(steps);
        }

        // No usable chain: ship the latest snapshot plus every segment
        // past it, including the one straddling its timestamp.
        let latest = latest_snapshot.ok_or_else(|| {
            StorageError::Recovery("invalid durability state, missing snapshot".into())
        })?;
        locker.add_file(&latest.path);
        steps.push(RecoveryStep::Snapshot(latest.path.clone()));

        let mut tail_start = wal_files.len();
        for (index, info) in wal_files.iter().enumerate() {
            if latest.start_timestamp < info.to_timestamp {
                tail_start = if latest.start_timestamp < info.from_timestamp && index > 0 {
                    index - 1
                } else {
                    index
                };
                break;
            }
        }
        let mut tail = Vec::new();
        for info in &wal_files[tail_start..] {
            locker.add_file(&info.path);
            tail.push(info.path.clone());
        }
        if tail.is_empty() {
            // Only segments older than the snapshot exist; the newest one
            // still anchors the replica's chain.
            let last = wal_files.last().expect("checked non-empty");
            locker.add_file(&last.path);
            tail.push(last.path.clone());
        }
        steps.push(RecoveryStep::Wals(tail));
        if let Some(seq_num) = current_wal_seq_num {
            steps.push(RecoveryStep::CurrentWal(seq_num));
        }
        Ok(steps)
    }
}
