//! Transaction object: snapshot, command id, and the owned delta arena.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::delta::Delta;
use crate::types::IsolationLevel;

/// What a transaction is allowed to see: everything committed at or before
/// `start_timestamp`, except transactions that were still active when the
/// snapshot was taken.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub start_timestamp: u64,
    pub active: BTreeSet<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug)]
pub struct Transaction {
    id: u64,
    pub snapshot: Snapshot,
    pub command_id: u64,
    isolation: IsolationLevel,
    /// Shared with every delta this transaction creates; rewritten to the
    /// commit timestamp when the transaction commits.
    timestamp_cell: Arc<AtomicU64>,
    pub(crate) deltas: Vec<Arc<Delta>>,
    pub(crate) state: TxState,
    commit_timestamp: Option<u64>,
}

impl Transaction {
    pub(crate) fn new(id: u64, snapshot: Snapshot, isolation: IsolationLevel) -> Self {
        Self {
            id,
            snapshot,
            command_id: 0,
            isolation,
            timestamp_cell: Arc::new(AtomicU64::new(id)),
            deltas: Vec::new(),
            state: TxState::Active,
            commit_timestamp: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TxState::Active
    }

    /// Set once commit succeeds.
    pub fn commit_timestamp(&self) -> Option<u64> {
        self.commit_timestamp
    }

    pub(crate) fn timestamp_cell(&self) -> &Arc<AtomicU64> {
        &self.timestamp_cell
    }

    /// Publishes every delta of this transaction at `commit_timestamp`.
    pub(crate) fn publish(&mut self, commit_timestamp: u64) {
        self.timestamp_cell
            .store(commit_timestamp, Ordering::Release);
        self.commit_timestamp = Some(commit_timestamp);
        self.state = TxState::Committed;
    }

    pub(crate) fn refresh_snapshot(&mut self, snapshot: Snapshot) {
        self.snapshot = snapshot;
    }
}
