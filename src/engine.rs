//! The storage engine: transaction lifecycle, graph mutations, view
//! evaluation, durability and replication hand-off.
//!
//! One mutex (the engine lock) serializes commit timestamp assignment,
//! active-set updates, epoch changes and WAL rotation. Object-level work
//! happens under per-record locks; reads never touch the engine lock.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{Config, ReplicaConfig};
use crate::delta::{Delta, DeltaAction, OwnerRef};
use crate::durability::encoder::WalDeltaOp;
use crate::durability::recovery;
use crate::durability::snapshot::{self, SnapshotData, SnapshotEdge, SnapshotVertex};
use crate::durability::wal::WalFile;
use crate::edge::Edge;
use crate::error::{Result, StorageError};
use crate::gc::{self, GcHandle, GcStats};
use crate::indices::{IndexObserver, ObserverList};
use crate::mvcc;
use crate::name_mapper::NameIdMapper;
use crate::property::PropertyValue;
use crate::replication::client::{ReplicaState, ReplicationClient};
use crate::replication::rpc::ReplicaTransport;
use crate::transaction::{Snapshot, Transaction, TxState};
use crate::types::{
    AdjacencyEntry, EdgeTypeId, Gid, IsolationLevel, LabelId, PropertyKeyId, View,
    TRANSACTION_INITIAL_ID,
};
use crate::utils::file_retainer::FileRetainer;
use crate::utils::generate_epoch_id;
use crate::vertex::Vertex;

/// Fields guarded by the engine lock.
#[derive(Debug)]
pub(crate) struct EngineState {
    /// Active transactions: id -> start timestamp.
    pub(crate) active: std::collections::BTreeMap<u64, u64>,
    pub(crate) epoch_id: String,
    /// `(epoch_id, last commit timestamp before the switch)`, oldest first.
    pub(crate) epoch_history: Vec<(String, u64)>,
    pub(crate) wal: Option<WalFile>,
    pub(crate) next_wal_seq_num: u64,
}

/// A committed transaction's deltas, parked until GC decides no snapshot
/// can reach them.
#[derive(Debug)]
pub(crate) struct CommittedTransaction {
    pub(crate) commit_timestamp: u64,
    pub(crate) deltas: Vec<Arc<Delta>>,
}

#[derive(Debug, Clone)]
pub struct ReplicaInfo {
    pub name: String,
    pub endpoint: String,
    pub state: ReplicaState,
    pub config: ReplicaConfig,
}

pub struct StorageEngine {
    config: Config,
    /// Identity of this storage line; durability artifacts carry it.
    uuid: String,
    name_mapper: Arc<NameIdMapper>,
    vertices: DashMap<Gid, Arc<RwLock<Vertex>>>,
    edges: DashMap<Gid, Arc<RwLock<Edge>>>,
    /// Next start/commit timestamp.
    timestamp: AtomicU64,
    next_transaction_id: AtomicU64,
    next_gid: AtomicU64,
    last_commit_timestamp: AtomicU64,
    state: Mutex<EngineState>,
    committed: Mutex<VecDeque<CommittedTransaction>>,
    file_retainer: Arc<FileRetainer>,
    replication_clients: RwLock<Vec<Arc<ReplicationClient>>>,
    observers: RwLock<ObserverList>,
    gc_handle: Mutex<Option<GcHandle>>,
    /// Cleared while boot recovery replays the WAL so the replay does not
    /// write itself back out.
    durability_enabled: AtomicBool,
}

impl StorageEngine {
    pub fn open(config: Config) -> Result<Arc<Self>> {
        // The storage uuid survives restarts through the durability
        // artifacts; a fresh one is only minted for an empty data
        // directory.
        let recovered = if config.durability.recover_on_startup {
            recovery::recover(
                &config.durability.wal_directory,
                &config.durability.snapshot_directory,
            )?
        } else {
            None
        };
        let uuid = recovered
            .as_ref()
            .map(|state| state.uuid.clone())
            .unwrap_or_else(generate_epoch_id);

        let engine = Arc::new(Self {
            uuid,
            name_mapper: Arc::new(NameIdMapper::new()),
            vertices: DashMap::new(),
            edges: DashMap::new(),
            timestamp: AtomicU64::new(1),
            next_transaction_id: AtomicU64::new(TRANSACTION_INITIAL_ID + 1),
            next_gid: AtomicU64::new(0),
            last_commit_timestamp: AtomicU64::new(0),
            state: Mutex::new(EngineState {
                active: Default::default(),
                epoch_id: generate_epoch_id(),
                epoch_history: Vec::new(),
                wal: None,
                next_wal_seq_num: 0,
            }),
            committed: Mutex::new(VecDeque::new()),
            file_retainer: Arc::new(FileRetainer::new()),
            replication_clients: RwLock::new(Vec::new()),
            observers: RwLock::new(Vec::new()),
            gc_handle: Mutex::new(None),
            durability_enabled: AtomicBool::new(true),
            config,
        });

        if let Some(recovered) = recovered {
            engine.apply_recovered_state(recovered)?;
        }

        if let Some(cycle) = engine.config.gc_cycle {
            let handle = gc::spawn_worker(Arc::downgrade(&engine), cycle);
            *engine.gc_handle.lock() = Some(handle);
        }

        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn name_mapper(&self) -> &Arc<NameIdMapper> {
        &self.name_mapper
    }

    pub fn file_retainer(&self) -> &Arc<FileRetainer> {
        &self.file_retainer
    }

    pub fn last_commit_timestamp(&self) -> u64 {
        self.last_commit_timestamp.load(Ordering::Acquire)
    }

    pub fn epoch_id(&self) -> String {
        self.state.lock().epoch_id.clone()
    }

    pub fn epoch_history(&self) -> Vec<(String, u64)> {
        self.state.lock().epoch_history.clone()
    }

    /// Starts a fresh epoch, recording where the previous one ended. Used
    /// when this node becomes a primary after a life as a replica.
    pub fn start_new_epoch(&self) -> String {
        let mut state = self.state.lock();
        let last_commit = self.last_commit_timestamp.load(Ordering::Acquire);
        let old = std::mem::replace(&mut state.epoch_id, generate_epoch_id());
        state.epoch_history.push((old, last_commit));
        info!(epoch_id = %state.epoch_id, last_commit, "started new epoch");
        state.epoch_id.clone()
    }

    /// Adopts a primary's epoch on the replica side of a delta stream.
    pub(crate) fn adopt_epoch(&self, epoch_id: &str) {
        let mut state = self.state.lock();
        if state.epoch_id == epoch_id {
            return;
        }
        let last_commit = self.last_commit_timestamp.load(Ordering::Acquire);
        let old = std::mem::replace(&mut state.epoch_id, epoch_id.to_owned());
        if !old.is_empty() {
            state.epoch_history.push((old, last_commit));
        }
    }

    pub fn register_index_observer(&self, observer: Arc<dyn IndexObserver>) {
        self.observers.write().push(observer);
    }

    // ---------------------------------------------------------------
    // Transaction lifecycle
    // ---------------------------------------------------------------

    pub fn begin(&self, isolation: IsolationLevel) -> Transaction {
        self.begin_internal(isolation).0
    }

    /// Begin plus the last commit timestamp, captured under one lock so
    /// the pair is consistent (the snapshot writer needs both).
    fn begin_internal(&self, isolation: IsolationLevel) -> (Transaction, u64) {
        let mut state = self.state.lock();
        let id = self.next_transaction_id.fetch_add(1, Ordering::AcqRel);
        let start_timestamp = self.timestamp.fetch_add(1, Ordering::AcqRel);
        let active: BTreeSet<u64> = state.active.keys().copied().collect();
        state.active.insert(id, start_timestamp);
        let last_commit = self.last_commit_timestamp.load(Ordering::Acquire);
        (
            Transaction::new(
                id,
                Snapshot {
                    start_timestamp,
                    active,
                },
                isolation,
            ),
            last_commit,
        )
    }

    /// Moves the transaction to its next command. Under read-committed
    /// isolation this also refreshes the snapshot.
    pub fn advance_command(&self, txn: &mut Transaction) {
        txn.command_id += 1;
        if txn.isolation() == IsolationLevel::ReadCommitted {
            let mut state = self.state.lock();
            let start_timestamp = self.timestamp.fetch_add(1, Ordering::AcqRel);
            let active: BTreeSet<u64> = state
                .active
                .keys()
                .copied()
                .filter(|id| *id != txn.id())
                .collect();
            state.active.insert(txn.id(), start_timestamp);
            txn.refresh_snapshot(Snapshot {
                start_timestamp,
                active,
            });
        }
    }

    pub fn commit(&self, txn: &mut Transaction) -> Result<u64> {
        self.commit_with_timestamp(txn, None)
    }

    /// Commits, optionally at a caller-chosen timestamp. The replication
    /// server uses the primary's timestamps so both sides agree on every
    /// commit's position in history.
    pub fn commit_with_timestamp(
        &self,
        txn: &mut Transaction,
        desired_commit_timestamp: Option<u64>,
    ) -> Result<u64> {
        self.ensure_active(txn)?;

        if txn.deltas.is_empty() {
            self.state.lock().active.remove(&txn.id());
            txn.state = TxState::Committed;
            return Ok(self.last_commit_timestamp.load(Ordering::Acquire));
        }

        let wire_ops = self.derive_wire_ops(txn)?;

        let mut state = self.state.lock();
        let commit_timestamp = match desired_commit_timestamp {
            Some(timestamp) => {
                self.timestamp.fetch_max(timestamp + 1, Ordering::AcqRel);
                timestamp
            }
            None => self.timestamp.fetch_add(1, Ordering::AcqRel),
        };

        let current_wal_seq_num = match self.append_to_wal(&mut state, commit_timestamp, &wire_ops)
        {
            Ok(seq_num) => seq_num,
            Err(err) => {
                error!(commit_timestamp, error = %err, "wal append failed, aborting commit");
                state.active.remove(&txn.id());
                drop(state);
                self.undo_transaction(txn);
                txn.state = TxState::Aborted;
                return Err(err);
            }
        };

        txn.publish(commit_timestamp);

        // Streams open against the pre-commit timestamp; the replica uses
        // it to verify it is not missing anything.
        let previous_commit_timestamp = self.last_commit_timestamp.load(Ordering::Acquire);
        let clients: Vec<Arc<ReplicationClient>> = self.replication_clients.read().clone();
        for client in &clients {
            client.append_committed_transaction(
                previous_commit_timestamp,
                current_wal_seq_num,
                commit_timestamp,
                &wire_ops,
            );
        }

        self.last_commit_timestamp
            .store(commit_timestamp, Ordering::Release);
        state.active.remove(&txn.id());
        self.committed.lock().push_back(CommittedTransaction {
            commit_timestamp,
            deltas: txn.deltas.clone(),
        });
        drop(state);

        for client in &clients {
            client.finalize_transaction_replication();
        }

        debug!(
            commit_timestamp,
            deltas = txn.deltas.len(),
            "transaction committed"
        );
        Ok(commit_timestamp)
    }

    pub fn abort(&self, txn: &mut Transaction) {
        if !txn.is_active() {
            return;
        }
        self.undo_transaction(txn);
        self.state.lock().active.remove(&txn.id());
        txn.state = TxState::Aborted;
        debug!(txn_id = txn.id(), "transaction aborted");
    }

    /// Reverses every forward effect and unlinks the transaction's deltas
    /// from the chain heads. Own deltas sit contiguously at the head of
    /// every chain they are on, so popping in reverse creation order is
    /// exact.
    fn undo_transaction(&self, txn: &mut Transaction) {
        for delta in txn.deltas.iter().rev() {
            match delta.owner {
                OwnerRef::Vertex(gid) => {
                    let Some(entry) = self.vertices.get(&gid).map(|e| Arc::clone(e.value()))
                    else {
                        continue;
                    };
                    let mut vertex = entry.write();
                    mvcc::apply_to_vertex(&mut vertex, &delta.action);
                    if let Some(head) = &vertex.delta_head {
                        if Arc::ptr_eq(head, delta) {
                            vertex.delta_head = delta.take_next();
                        }
                    }
                    let reclaim = vertex.deleted && vertex.delta_head.is_none();
                    drop(vertex);
                    if reclaim {
                        self.vertices.remove(&gid);
                    }
                }
                OwnerRef::Edge(gid) => {
                    let Some(entry) = self.edges.get(&gid).map(|e| Arc::clone(e.value())) else {
                        continue;
                    };
                    let mut edge = entry.write();
                    mvcc::apply_to_edge(&mut edge, &delta.action);
                    if let Some(head) = &edge.delta_head {
                        if Arc::ptr_eq(head, delta) {
                            edge.delta_head = delta.take_next();
                        }
                    }
                    let reclaim = edge.deleted && edge.delta_head.is_none();
                    drop(edge);
                    if reclaim {
                        self.edges.remove(&gid);
                    }
                }
            }
        }
        txn.deltas.clear();
    }

    fn ensure_active(&self, txn: &Transaction) -> Result<()> {
        if !txn.is_active() {
            return Err(StorageError::InvalidArgument(
                "transaction is not active".into(),
            ));
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Graph mutations
    // ---------------------------------------------------------------

    pub fn create_vertex(&self, txn: &mut Transaction) -> Result<Gid> {
        let gid = Gid::from_u64(self.next_gid.fetch_add(1, Ordering::AcqRel));
        self.create_vertex_with_gid(txn, gid)?;
        Ok(gid)
    }

    pub fn create_vertex_with_gid(&self, txn: &mut Transaction, gid: Gid) -> Result<()> {
        self.ensure_active(txn)?;
        self.next_gid.fetch_max(gid.as_u64() + 1, Ordering::AcqRel);
        let mut vertex = Vertex::new(gid);
        mvcc::create_and_link_delta(
            txn,
            &mut vertex.delta_head,
            DeltaAction::DeleteObject,
            OwnerRef::Vertex(gid),
        );
        match self.vertices.entry(gid) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                txn.deltas.pop();
                Err(StorageError::InvalidArgument(format!(
                    "vertex {gid} already exists"
                )))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(RwLock::new(vertex)));
                Ok(())
            }
        }
    }

    fn vertex_entry(&self, gid: Gid) -> Result<Arc<RwLock<Vertex>>> {
        self.vertices
            .get(&gid)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(StorageError::NonexistentObject("vertex"))
    }

    fn edge_entry(&self, gid: Gid) -> Result<Arc<RwLock<Edge>>> {
        self.edges
            .get(&gid)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(StorageError::NonexistentObject("edge"))
    }

    fn with_vertex_for_write<R>(
        &self,
        txn: &mut Transaction,
        gid: Gid,
        op: impl FnOnce(&Self, &mut Transaction, &mut Vertex) -> Result<R>,
    ) -> Result<R> {
        self.ensure_active(txn)?;
        let entry = self.vertex_entry(gid)?;
        let mut vertex = entry.write();
        if !mvcc::prepare_for_write(txn, &vertex.delta_head) {
            return Err(StorageError::Conflict);
        }
        if vertex.deleted {
            return Err(StorageError::DeletedObject("vertex"));
        }
        op(self, txn, &mut vertex)
    }

    /// Returns false when the vertex already carried the label.
    pub fn add_label(&self, txn: &mut Transaction, gid: Gid, label: LabelId) -> Result<bool> {
        self.with_vertex_for_write(txn, gid, |engine, txn, vertex| {
            if vertex.has_label(label) {
                return Ok(false);
            }
            mvcc::create_and_link_delta(
                txn,
                &mut vertex.delta_head,
                DeltaAction::RemoveLabel(label),
                OwnerRef::Vertex(gid),
            );
            vertex.add_label(label);
            for observer in engine.observers.read().iter() {
                observer.on_label_added(gid, label);
            }
            Ok(true)
        })
    }

    pub fn remove_label(&self, txn: &mut Transaction, gid: Gid, label: LabelId) -> Result<bool> {
        self.with_vertex_for_write(txn, gid, |engine, txn, vertex| {
            if !vertex.has_label(label) {
                return Ok(false);
            }
            mvcc::create_and_link_delta(
                txn,
                &mut vertex.delta_head,
                DeltaAction::AddLabel(label),
                OwnerRef::Vertex(gid),
            );
            vertex.remove_label(label);
            for observer in engine.observers.read().iter() {
                observer.on_label_removed(gid, label);
            }
            Ok(true)
        })
    }

    /// Sets (or clears, with `Null`) a vertex property. Returns the old
    /// value, `Null` when the key was absent.
    pub fn set_vertex_property(
        &self,
        txn: &mut Transaction,
        gid: Gid,
        key: PropertyKeyId,
        value: PropertyValue,
    ) -> Result<PropertyValue> {
        self.with_vertex_for_write(txn, gid, |engine, txn, vertex| {
            let old = vertex
                .properties
                .get(&key)
                .cloned()
                .unwrap_or(PropertyValue::Null);
            mvcc::create_and_link_delta(
                txn,
                &mut vertex.delta_head,
                DeltaAction::SetProperty {
                    key,
                    value: old.clone(),
                },
                OwnerRef::Vertex(gid),
            );
            if value.is_null() {
                vertex.properties.remove(&key);
            } else {
                vertex.properties.insert(key, value.clone());
            }
            for observer in engine.observers.read().iter() {
                observer.on_property_set(gid, key, &value);
            }
            Ok(old)
        })
    }

    /// Fails while the vertex still has incident edges; use
    /// [`Self::detach_delete_vertex`] to remove those too.
    pub fn delete_vertex(&self, txn: &mut Transaction, gid: Gid) -> Result<()> {
        self.with_vertex_for_write(txn, gid, |engine, txn, vertex| {
            if !vertex.in_edges.is_empty() || !vertex.out_edges.is_empty() {
                return Err(StorageError::VertexHasEdges);
            }
            mvcc::create_and_link_delta(
                txn,
                &mut vertex.delta_head,
                DeltaAction::RecreateObject,
                OwnerRef::Vertex(gid),
            );
            vertex.deleted = true;
            for observer in engine.observers.read().iter() {
                observer.on_vertex_deleted(gid);
            }
            Ok(())
        })
    }

    pub fn detach_delete_vertex(&self, txn: &mut Transaction, gid: Gid) -> Result<()> {
        self.ensure_active(txn)?;
        let incident: BTreeSet<Gid> = {
            let entry = self.vertex_entry(gid)?;
            let vertex = entry.read();
            if vertex.deleted {
                return Err(StorageError::DeletedObject("vertex"));
            }
            vertex
                .in_edges
                .iter()
                .chain(vertex.out_edges.iter())
                .map(|adjacency| adjacency.edge)
                .collect()
        };
        for edge in incident {
            self.delete_edge(txn, edge)?;
        }
        self.delete_vertex(txn, gid)
    }

    pub fn create_edge(
        &self,
        txn: &mut Transaction,
        from: Gid,
        to: Gid,
        edge_type: EdgeTypeId,
    ) -> Result<Gid> {
        let gid = Gid::from_u64(self.next_gid.fetch_add(1, Ordering::AcqRel));
        self.create_edge_with_gid(txn, gid, edge_type, from, to)?;
        Ok(gid)
    }

    pub fn create_edge_with_gid(
        &self,
        txn: &mut Transaction,
        gid: Gid,
        edge_type: EdgeTypeId,
        from: Gid,
        to: Gid,
    ) -> Result<()> {
        self.ensure_active(txn)?;
        self.next_gid.fetch_max(gid.as_u64() + 1, Ordering::AcqRel);
        let from_entry = self.vertex_entry(from)?;
        let to_entry = self.vertex_entry(to)?;

        let mut guards = VertexPair::lock(&from_entry, &to_entry, from, to);
        let (from_vertex, to_vertex) = guards.vertices();
        if !mvcc::prepare_for_write(txn, &from_vertex.delta_head) {
            return Err(StorageError::Conflict);
        }
        if from_vertex.deleted {
            return Err(StorageError::DeletedObject("vertex"));
        }
        if let Some(to_vertex) = &to_vertex {
            if !mvcc::prepare_for_write(txn, &to_vertex.delta_head) {
                return Err(StorageError::Conflict);
            }
            if to_vertex.deleted {
                return Err(StorageError::DeletedObject("vertex"));
            }
        }

        let mut edge = Edge::new(gid, edge_type, from, to);
        mvcc::create_and_link_delta(
            txn,
            &mut edge.delta_head,
            DeltaAction::DeleteObject,
            OwnerRef::Edge(gid),
        );
        match self.edges.entry(gid) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                txn.deltas.pop();
                return Err(StorageError::InvalidArgument(format!(
                    "edge {gid} already exists"
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(RwLock::new(edge)));
            }
        }

        let out_entry = AdjacencyEntry::new(edge_type, to, gid);
        let in_entry = AdjacencyEntry::new(edge_type, from, gid);
        let (from_vertex, to_vertex) = guards.vertices();
        mvcc::create_and_link_delta(
            txn,
            &mut from_vertex.delta_head,
            DeltaAction::RemoveOutEdge(out_entry),
            OwnerRef::Vertex(from),
        );
        from_vertex.out_edges.push(out_entry);
        let in_target = to_vertex.unwrap_or(from_vertex);
        mvcc::create_and_link_delta(
            txn,
            &mut in_target.delta_head,
            DeltaAction::RemoveInEdge(in_entry),
            OwnerRef::Vertex(to),
        );
        in_target.in_edges.push(in_entry);
        Ok(())
    }

    pub fn delete_edge(&self, txn: &mut Transaction, gid: Gid) -> Result<()> {
        self.ensure_active(txn)?;
        let edge_entry = self.edge_entry(gid)?;
        let (from, to, edge_type) = {
            let edge = edge_entry.read();
            (edge.from, edge.to, edge.edge_type)
        };
        let from_entry = self.vertex_entry(from)?;
        let to_entry = self.vertex_entry(to)?;

        let mut guards = VertexPair::lock(&from_entry, &to_entry, from, to);
        let mut edge = edge_entry.write();
        if !mvcc::prepare_for_write(txn, &edge.delta_head) {
            return Err(StorageError::Conflict);
        }
        if edge.deleted {
            return Err(StorageError::DeletedObject("edge"));
        }
        let (from_vertex, to_vertex) = guards.vertices();
        if !mvcc::prepare_for_write(txn, &from_vertex.delta_head) {
            return Err(StorageError::Conflict);
        }
        if let Some(to_vertex) = &to_vertex {
            if !mvcc::prepare_for_write(txn, &to_vertex.delta_head) {
                return Err(StorageError::Conflict);
            }
        }

        mvcc::create_and_link_delta(
            txn,
            &mut edge.delta_head,
            DeltaAction::RecreateObject,
            OwnerRef::Edge(gid),
        );
        edge.deleted = true;

        let out_entry = AdjacencyEntry::new(edge_type, to, gid);
        let in_entry = AdjacencyEntry::new(edge_type, from, gid);
        mvcc::create_and_link_delta(
            txn,
            &mut from_vertex.delta_head,
            DeltaAction::AddOutEdge(out_entry),
            OwnerRef::Vertex(from),
        );
        from_vertex.out_edges.retain(|entry| *entry != out_entry);
        let in_target = to_vertex.unwrap_or(from_vertex);
        mvcc::create_and_link_delta(
            txn,
            &mut in_target.delta_head,
            DeltaAction::AddInEdge(in_entry),
            OwnerRef::Vertex(to),
        );
        in_target.in_edges.retain(|entry| *entry != in_entry);
        Ok(())
    }

    pub fn set_edge_property(
        &self,
        txn: &mut Transaction,
        gid: Gid,
        key: PropertyKeyId,
        value: PropertyValue,
    ) -> Result<PropertyValue> {
        self.ensure_active(txn)?;
        if !self.config.items.properties_on_edges {
            return Err(StorageError::PropertiesDisabled);
        }
        let entry = self.edge_entry(gid)?;
        let mut edge = entry.write();
        if !mvcc::prepare_for_write(txn, &edge.delta_head) {
            return Err(StorageError::Conflict);
        }
        if edge.deleted {
            return Err(StorageError::DeletedObject("edge"));
        }
        let old = edge
            .properties
            .get(&key)
            .cloned()
            .unwrap_or(PropertyValue::Null);
        mvcc::create_and_link_delta(
            txn,
            &mut edge.delta_head,
            DeltaAction::SetProperty {
                key,
                value: old.clone(),
            },
            OwnerRef::Edge(gid),
        );
        if value.is_null() {
            edge.properties.remove(&key);
        } else {
            edge.properties.insert(key, value);
        }
        Ok(old)
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    /// The vertex as visible to `txn` under `view`, or `None` when it does
    /// not exist there. The returned record's chain head is cleared.
    pub fn find_vertex(&self, txn: &Transaction, gid: Gid, view: View) -> Option<Vertex> {
        let entry = self.vertices.get(&gid).map(|e| Arc::clone(e.value()))?;
        let mut record = entry.read().clone();
        let head = record.delta_head.take();
        mvcc::apply_deltas_for_read(txn, head, view, &mut record, mvcc::apply_to_vertex);
        (!record.deleted).then_some(record)
    }

    pub fn find_edge(&self, txn: &Transaction, gid: Gid, view: View) -> Option<Edge> {
        let entry = self.edges.get(&gid).map(|e| Arc::clone(e.value()))?;
        let mut record = entry.read().clone();
        let head = record.delta_head.take();
        mvcc::apply_deltas_for_read(txn, head, view, &mut record, mvcc::apply_to_edge);
        (!record.deleted).then_some(record)
    }

    pub fn visible_vertices(&self, txn: &Transaction, view: View) -> Vec<Vertex> {
        let entries: Vec<(Gid, Arc<RwLock<Vertex>>)> = self
            .vertices
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        let mut result = Vec::new();
        for (_, entry) in entries {
            let mut record = entry.read().clone();
            let head = record.delta_head.take();
            mvcc::apply_deltas_for_read(txn, head, view, &mut record, mvcc::apply_to_vertex);
            if !record.deleted {
                result.push(record);
            }
        }
        result.sort_by_key(|vertex| vertex.gid);
        result
    }

    pub fn visible_edges(&self, txn: &Transaction, view: View) -> Vec<Edge> {
        let entries: Vec<(Gid, Arc<RwLock<Edge>>)> = self
            .edges
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        let mut result = Vec::new();
        for (_, entry) in entries {
            let mut record = entry.read().clone();
            let head = record.delta_head.take();
            mvcc::apply_deltas_for_read(txn, head, view, &mut record, mvcc::apply_to_edge);
            if !record.deleted {
                result.push(record);
            }
        }
        result.sort_by_key(|edge| edge.gid);
        result
    }

    // ---------------------------------------------------------------
    // Durability
    // ---------------------------------------------------------------

    /// Maps the transaction's undo deltas to the forward operations the
    /// WAL and replicas receive. Adjacency deltas collapse onto the
    /// out-vertex so every edge mutation ships exactly once; property
    /// deltas ship the final committed value.
    fn derive_wire_ops(&self, txn: &Transaction) -> Result<Vec<WalDeltaOp>> {
        let mut ops = Vec::with_capacity(txn.deltas.len());
        for delta in &txn.deltas {
            match (&delta.owner, &delta.action) {
                (OwnerRef::Vertex(gid), DeltaAction::DeleteObject) => {
                    ops.push(WalDeltaOp::CreateVertex { gid: *gid });
                }
                (OwnerRef::Vertex(gid), DeltaAction::RecreateObject) => {
                    ops.push(WalDeltaOp::DeleteVertex { gid: *gid });
                }
                (OwnerRef::Vertex(gid), DeltaAction::RemoveLabel(label)) => {
                    ops.push(WalDeltaOp::AddLabel {
                        gid: *gid,
                        label: self.name_mapper.label_name(*label)?,
                    });
                }
                (OwnerRef::Vertex(gid), DeltaAction::AddLabel(label)) => {
                    ops.push(WalDeltaOp::RemoveLabel {
                        gid: *gid,
                        label: self.name_mapper.label_name(*label)?,
                    });
                }
                (OwnerRef::Vertex(gid), DeltaAction::SetProperty { key, .. }) => {
                    let value = {
                        let entry = self.vertex_entry(*gid)?;
                        let vertex = entry.read();
                        vertex
                            .properties
                            .get(key)
                            .cloned()
                            .unwrap_or(PropertyValue::Null)
                    };
                    ops.push(WalDeltaOp::SetVertexProperty {
                        gid: *gid,
                        key: self.name_mapper.property_key_name(*key)?,
                        value,
                    });
                }
                (OwnerRef::Vertex(gid), DeltaAction::RemoveOutEdge(entry)) => {
                    ops.push(WalDeltaOp::CreateEdge {
                        gid: entry.edge,
                        edge_type: self.name_mapper.edge_type_name(entry.edge_type)?,
                        from: *gid,
                        to: entry.peer,
                    });
                }
                (OwnerRef::Vertex(gid), DeltaAction::AddOutEdge(entry)) => {
                    ops.push(WalDeltaOp::DeleteEdge {
                        gid: entry.edge,
                        edge_type: self.name_mapper.edge_type_name(entry.edge_type)?,
                        from: *gid,
                        to: entry.peer,
                    });
                }
                // The in-side mirrors the out-side; shipping both would
                // apply each edge twice.
                (OwnerRef::Vertex(_), DeltaAction::RemoveInEdge(_))
                | (OwnerRef::Vertex(_), DeltaAction::AddInEdge(_)) => {}
                (OwnerRef::Edge(gid), DeltaAction::SetProperty { key, .. }) => {
                    let value = {
                        let entry = self.edge_entry(*gid)?;
                        let edge = entry.read();
                        edge.properties
                            .get(key)
                            .cloned()
                            .unwrap_or(PropertyValue::Null)
                    };
                    ops.push(WalDeltaOp::SetEdgeProperty {
                        gid: *gid,
                        key: self.name_mapper.property_key_name(*key)?,
                        value,
                    });
                }
                // Edge creation and deletion already ship via the
                // out-vertex adjacency deltas.
                (OwnerRef::Edge(_), _) => {}
            }
        }
        Ok(ops)
    }

    /// Appends the transaction to the current segment, creating or
    /// rotating it as needed. Returns the sequence number the records
    /// landed in.
    fn append_to_wal(
        &self,
        state: &mut EngineState,
        commit_timestamp: u64,
        ops: &[WalDeltaOp],
    ) -> Result<u64> {
        if !self.durability_enabled.load(Ordering::Acquire) {
            return Ok(state.next_wal_seq_num);
        }
        if state.wal.is_none() {
            let seq_num = state.next_wal_seq_num;
            state.next_wal_seq_num += 1;
            state.wal = Some(WalFile::create(
                &self.config.durability.wal_directory,
                &self.uuid,
                seq_num,
            )?);
        }
        let wal = state.wal.as_mut().expect("wal just ensured");
        let seq_num = wal.seq_num();
        wal.append_transaction(commit_timestamp, ops);
        wal.flush()?;

        if wal.size()? >= self.config.durability.wal_file_size_limit {
            let full = state.wal.take().expect("wal present");
            full.finalize()?;
        }
        Ok(seq_num)
    }

    /// Writes a snapshot of the committed state and rotates the WAL so
    /// the new snapshot starts a clean chain.
    pub fn create_snapshot(&self) -> Result<PathBuf> {
        let (mut txn, last_commit) = self.begin_internal(IsolationLevel::SnapshotIsolation);
        let vertices = self.visible_vertices(&txn, View::Old);
        let edges = self.visible_edges(&txn, View::Old);
        self.abort(&mut txn);

        let data = SnapshotData {
            uuid: self.uuid.clone(),
            epoch_id: self.epoch_id(),
            start_timestamp: last_commit,
            names: self.name_mapper.entries(),
            vertices: vertices
                .into_iter()
                .map(|vertex| SnapshotVertex {
                    gid: vertex.gid,
                    labels: vertex.labels.iter().map(|label| label.0).collect(),
                    properties: vertex
                        .properties
                        .into_iter()
                        .map(|(key, value)| (key.0, value))
                        .collect(),
                    in_edges: vertex.in_edges,
                    out_edges: vertex.out_edges,
                })
                .collect(),
            edges: edges
                .into_iter()
                .map(|edge| SnapshotEdge {
                    gid: edge.gid,
                    edge_type: edge.edge_type.0,
                    from: edge.from,
                    to: edge.to,
                    properties: edge
                        .properties
                        .into_iter()
                        .map(|(key, value)| (key.0, value))
                        .collect(),
                })
                .collect(),
        };
        let path = snapshot::write_snapshot(&self.config.durability.snapshot_directory, &data)?;

        let mut state = self.state.lock();
        if let Some(wal) = state.wal.take() {
            wal.finalize()?;
        }
        drop(state);
        info!(start_timestamp = last_commit, path = %path.display(), "snapshot created");
        Ok(path)
    }

    /// Fast-forwards the commit clock without moving any data; used when
    /// a replica is told only the timestamp of the primary's snapshot.
    pub(crate) fn fast_forward_commit_timestamp(&self, timestamp: u64) {
        self.timestamp.fetch_max(timestamp + 1, Ordering::AcqRel);
        self.last_commit_timestamp
            .fetch_max(timestamp, Ordering::AcqRel);
    }

    /// Sequence number of the segment currently receiving appends.
    pub fn current_wal_seq_num(&self) -> Option<u64> {
        self.state.lock().wal.as_ref().map(|wal| wal.seq_num())
    }

    /// A consistent image of the current WAL: name, flushed file bytes
    /// and the append buffer, provided its sequence number still matches.
    pub(crate) fn current_wal_image(
        &self,
        expected_seq_num: u64,
    ) -> Result<Option<(String, Vec<u8>, Vec<u8>)>> {
        let state = self.state.lock();
        let Some(wal) = state.wal.as_ref() else {
            return Ok(None);
        };
        if wal.seq_num() != expected_seq_num {
            return Ok(None);
        }
        let filename = wal
            .path()
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_owned();
        let file_bytes = wal.file_bytes()?;
        let buffer = wal.buffered().to_vec();
        Ok(Some((filename, file_bytes, buffer)))
    }

    fn apply_recovered_state(&self, recovered: recovery::RecoveredState) -> Result<()> {
        self.durability_enabled.store(false, Ordering::Release);
        if let Some(snapshot) = &recovered.snapshot {
            self.load_snapshot_data(snapshot);
        }
        for (commit_timestamp, ops) in &recovered.transactions {
            self.apply_replicated_transaction(*commit_timestamp, ops)?;
        }
        self.durability_enabled.store(true, Ordering::Release);

        self.timestamp
            .fetch_max(recovered.last_commit_timestamp + 1, Ordering::AcqRel);
        self.last_commit_timestamp
            .store(recovered.last_commit_timestamp, Ordering::Release);

        let mut state = self.state.lock();
        state.next_wal_seq_num = recovered.next_wal_seq_num;
        if !recovered.epoch_id.is_empty() && recovered.epoch_id != state.epoch_id {
            state
                .epoch_history
                .push((recovered.epoch_id.clone(), recovered.last_commit_timestamp));
        }
        Ok(())
    }

    /// Replaces the object stores with a snapshot's contents. Used at
    /// boot and when a replica receives a snapshot transfer.
    pub(crate) fn load_snapshot_data(&self, data: &SnapshotData) {
        self.vertices.clear();
        self.edges.clear();
        for (id, name) in &data.names {
            self.name_mapper.register(*id, name);
        }
        let mut max_gid = 0;
        for vertex_data in &data.vertices {
            let mut vertex = Vertex::new(vertex_data.gid);
            for label in &vertex_data.labels {
                vertex.add_label(LabelId(*label));
            }
            for (key, value) in &vertex_data.properties {
                vertex.properties.insert(PropertyKeyId(*key), value.clone());
            }
            vertex.in_edges = vertex_data.in_edges.clone();
            vertex.out_edges = vertex_data.out_edges.clone();
            max_gid = max_gid.max(vertex_data.gid.as_u64());
            self.vertices
                .insert(vertex_data.gid, Arc::new(RwLock::new(vertex)));
        }
        for edge_data in &data.edges {
            let mut edge = Edge::new(
                edge_data.gid,
                EdgeTypeId(edge_data.edge_type),
                edge_data.from,
                edge_data.to,
            );
            for (key, value) in &edge_data.properties {
                edge.properties.insert(PropertyKeyId(*key), value.clone());
            }
            max_gid = max_gid.max(edge_data.gid.as_u64());
            self.edges
                .insert(edge_data.gid, Arc::new(RwLock::new(edge)));
        }
        self.next_gid.fetch_max(max_gid + 1, Ordering::AcqRel);
        self.timestamp
            .fetch_max(data.start_timestamp + 1, Ordering::AcqRel);
        self.last_commit_timestamp
            .fetch_max(data.start_timestamp, Ordering::AcqRel);
    }

    /// Replays one committed transaction at the primary's timestamp.
    pub(crate) fn apply_replicated_transaction(
        &self,
        commit_timestamp: u64,
        ops: &[WalDeltaOp],
    ) -> Result<()> {
        let mut txn = self.begin(IsolationLevel::SnapshotIsolation);
        let result = self.apply_wire_ops(&mut txn, ops).and_then(|()| {
            self.commit_with_timestamp(&mut txn, Some(commit_timestamp))
                .map(|_| ())
        });
        if result.is_err() {
            self.abort(&mut txn);
        }
        result
    }

    fn apply_wire_ops(&self, txn: &mut Transaction, ops: &[WalDeltaOp]) -> Result<()> {
        for op in ops {
            match op {
                WalDeltaOp::CreateVertex { gid } => self.create_vertex_with_gid(txn, *gid)?,
                WalDeltaOp::DeleteVertex { gid } => self.delete_vertex(txn, *gid)?,
                WalDeltaOp::AddLabel { gid, label } => {
                    self.add_label(txn, *gid, self.name_mapper.label(label))
                        .map(|_| ())?
                }
                WalDeltaOp::RemoveLabel { gid, label } => {
                    self.remove_label(txn, *gid, self.name_mapper.label(label))
                        .map(|_| ())?
                }
                WalDeltaOp::SetVertexProperty { gid, key, value } => {
                    self.set_vertex_property(
                        txn,
                        *gid,
                        self.name_mapper.property_key(key),
                        value.clone(),
                    )
                    .map(|_| ())?
                }
                WalDeltaOp::CreateEdge {
                    gid,
                    edge_type,
                    from,
                    to,
                } => self.create_edge_with_gid(
                    txn,
                    *gid,
                    self.name_mapper.edge_type(edge_type),
                    *from,
                    *to,
                )?,
                WalDeltaOp::DeleteEdge { gid, .. } => self.delete_edge(txn, *gid)?,
                WalDeltaOp::SetEdgeProperty { gid, key, value } => {
                    self.set_edge_property(
                        txn,
                        *gid,
                        self.name_mapper.property_key(key),
                        value.clone(),
                    )
                    .map(|_| ())?
                }
                WalDeltaOp::TransactionEnd => {}
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Replication registry
    // ---------------------------------------------------------------

    pub fn register_replica(
        self: &Arc<Self>,
        config: ReplicaConfig,
        transport: Arc<dyn ReplicaTransport>,
    ) -> Result<Arc<ReplicationClient>> {
        config.validate()?;
        {
            let clients = self.replication_clients.read();
            if clients.iter().any(|client| client.name() == config.name) {
                return Err(StorageError::InvalidArgument(format!(
                    "replica '{}' is already registered",
                    config.name
                )));
            }
        }
        let client = ReplicationClient::new(config, transport, Arc::downgrade(self));
        client.try_initialize();
        self.replication_clients.write().push(Arc::clone(&client));
        if let Err(err) = self.persist_replicas() {
            warn!(error = %err, "failed to persist replica registry");
        }
        Ok(client)
    }

    pub fn unregister_replica(&self, name: &str) -> bool {
        let mut clients = self.replication_clients.write();
        let before = clients.len();
        clients.retain(|client| client.name() != name);
        let removed = clients.len() != before;
        drop(clients);
        if removed {
            if let Err(err) = self.persist_replicas() {
                warn!(error = %err, "failed to persist replica registry");
            }
        }
        removed
    }

    pub fn replicas_info(&self) -> Vec<ReplicaInfo> {
        self.replication_clients
            .read()
            .iter()
            .map(|client| ReplicaInfo {
                name: client.name().to_owned(),
                endpoint: client.replica_config().endpoint.clone(),
                state: client.state(),
                config: client.replica_config(),
            })
            .collect()
    }

    fn persist_replicas(&self) -> Result<()> {
        let configs: Vec<ReplicaConfig> = self
            .replication_clients
            .read()
            .iter()
            .map(|client| client.replica_config())
            .collect();
        let path = &self.config.durability.replication_file;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&configs)
            .map_err(|err| StorageError::InvalidArgument(err.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }

    /// The replica set persisted by a previous run.
    pub fn stored_replicas(&self) -> Result<Vec<ReplicaConfig>> {
        let path = &self.config.durability.replication_file;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|err| StorageError::Corruption(format!("replica registry: {err}")))
    }

    /// Re-registers every stored replica, building transports with the
    /// supplied factory (wire transports live outside this crate).
    pub fn restore_replicas(
        self: &Arc<Self>,
        transport_factory: impl Fn(&ReplicaConfig) -> Result<Arc<dyn ReplicaTransport>>,
    ) -> Result<()> {
        for config in self.stored_replicas()? {
            let transport = transport_factory(&config)?;
            self.register_replica(config, transport)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Garbage collection
    // ---------------------------------------------------------------

    pub fn run_gc(&self) -> GcStats {
        gc::run_gc(self)
    }

    pub(crate) fn oldest_active_start_timestamp(&self) -> u64 {
        let state = self.state.lock();
        state
            .active
            .values()
            .copied()
            .min()
            .unwrap_or_else(|| self.timestamp.load(Ordering::Acquire))
    }

    pub(crate) fn take_reclaimable_transactions(
        &self,
        oldest_active: u64,
    ) -> Vec<CommittedTransaction> {
        let mut committed = self.committed.lock();
        let mut reclaimable = Vec::new();
        while let Some(front) = committed.front() {
            if front.commit_timestamp < oldest_active {
                reclaimable.push(committed.pop_front().expect("front checked"));
            } else {
                break;
            }
        }
        reclaimable
    }

    pub(crate) fn truncate_vertex_chain(&self, gid: Gid, oldest_active: u64) -> bool {
        let Some(entry) = self.vertices.get(&gid).map(|e| Arc::clone(e.value())) else {
            return false;
        };
        let mut vertex = entry.write();
        gc::truncate_chain(&mut vertex.delta_head, oldest_active);
        let reclaim = vertex.deleted && vertex.delta_head.is_none();
        drop(vertex);
        if reclaim {
            self.vertices.remove(&gid);
        }
        reclaim
    }

    pub(crate) fn truncate_edge_chain(&self, gid: Gid, oldest_active: u64) -> bool {
        let Some(entry) = self.edges.get(&gid).map(|e| Arc::clone(e.value())) else {
            return false;
        };
        let mut edge = entry.write();
        gc::truncate_chain(&mut edge.delta_head, oldest_active);
        let reclaim = edge.deleted && edge.delta_head.is_none();
        drop(edge);
        if reclaim {
            self.edges.remove(&gid);
        }
        reclaim
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.gc_handle.lock().take() {
            handle.shutdown();
        }
        let mut state = self.state.lock();
        if let Some(wal) = state.wal.take() {
            if let Err(err) = wal.finalize() {
                error!(error = %err, "failed to finalize wal on shutdown");
            }
        }
    }
}

/// Write guards over the two endpoints of an edge, taken in gid order so
/// concurrent edge operations cannot deadlock. A self-loop takes one.
struct VertexPair<'a> {
    first: parking_lot::RwLockWriteGuard<'a, Vertex>,
    second: Option<parking_lot::RwLockWriteGuard<'a, Vertex>>,
    from_is_first: bool,
}

impl<'a> VertexPair<'a> {
    fn lock(
        from_entry: &'a Arc<RwLock<Vertex>>,
        to_entry: &'a Arc<RwLock<Vertex>>,
        from: Gid,
        to: Gid,
    ) -> Self {
        if from == to {
            Self {
                first: from_entry.write(),
                second: None,
                from_is_first: true,
            }
        } else if from < to {
            Self {
                first: from_entry.write(),
                second: Some(to_entry.write()),
                from_is_first: true,
            }
        } else {
            Self {
                first: to_entry.write(),
                second: Some(from_entry.write()),
                from_is_first: false,
            }
        }
    }

    /// `(from, Some(to))`, or `(from, None)` for a self-loop.
    fn vertices(&mut self) -> (&mut Vertex, Option<&mut Vertex>) {
        match (&mut self.second, self.from_is_first) {
            (None, _) => (&mut *self.first, None),
            (Some(second), true) => (&mut *self.first, Some(&mut **second)),
            (Some(second), false) => (&mut **second, Some(&mut *self.first)),
        }
    }
}
