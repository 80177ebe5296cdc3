//! Undo records forming the MVCC version chains.
//!
//! Every mutation prepends a [`Delta`] describing how to reverse it. A
//! reader walks the chain from the head, applying reverse effects until it
//! reaches the state its snapshot is allowed to see. Deltas share one
//! timestamp cell per transaction: it holds the transaction id while the
//! transaction is active and is swapped to the commit timestamp when the
//! transaction commits, which publishes every delta at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::property::PropertyValue;
use crate::types::{AdjacencyEntry, Gid, LabelId, PropertyKeyId};

/// Which object a delta belongs to.
///
/// The chain itself only links deltas; abort and GC need to find the
/// owning record to fix its head pointer, and the action alone does not
/// say whether the owner is a vertex or an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerRef {
    Vertex(Gid),
    Edge(Gid),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeltaAction {
    /// Undo of a create: the object did not exist before.
    DeleteObject,
    /// Undo of a delete: the object existed before.
    RecreateObject,
    /// Undo of a property write: `value` is the previous value, `Null`
    /// meaning the key was absent.
    SetProperty {
        key: PropertyKeyId,
        value: PropertyValue,
    },
    AddLabel(LabelId),
    RemoveLabel(LabelId),
    AddInEdge(AdjacencyEntry),
    AddOutEdge(AdjacencyEntry),
    RemoveInEdge(AdjacencyEntry),
    RemoveOutEdge(AdjacencyEntry),
}

#[derive(Debug)]
pub struct Delta {
    pub action: DeltaAction,
    /// Shared with every other delta of the same transaction.
    timestamp: Arc<AtomicU64>,
    pub command_id: u64,
    pub owner: OwnerRef,
    /// Next older delta in the owner's chain.
    next: RwLock<Option<Arc<Delta>>>,
}

impl Delta {
    pub fn new(
        action: DeltaAction,
        timestamp: Arc<AtomicU64>,
        command_id: u64,
        owner: OwnerRef,
    ) -> Self {
        Self {
            action,
            timestamp,
            command_id,
            owner,
            next: RwLock::new(None),
        }
    }

    /// The transaction id while the owning transaction is active, the
    /// commit timestamp afterwards.
    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    pub fn next(&self) -> Option<Arc<Delta>> {
        self.next.read().clone()
    }

    /// Links this delta in front of `older`. Called once, while the owner
    /// record's lock is held, before the delta becomes the new head.
    pub fn set_next(&self, older: Option<Arc<Delta>>) {
        *self.next.write() = older;
    }

    /// Cuts the chain below this delta. GC calls this once no snapshot can
    /// reach the suffix; dropping the returned `Arc` frees it.
    pub fn take_next(&self) -> Option<Arc<Delta>> {
        self.next.write().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TRANSACTION_INITIAL_ID;

    fn delta(action: DeltaAction, cell: &Arc<AtomicU64>) -> Arc<Delta> {
        Arc::new(Delta::new(
            action,
            Arc::clone(cell),
            0,
            OwnerRef::Vertex(Gid::from_u64(1)),
        ))
    }

    #[test]
    fn test_commit_publishes_every_delta() {
        let cell = Arc::new(AtomicU64::new(TRANSACTION_INITIAL_ID + 7));
        let a = delta(DeltaAction::DeleteObject, &cell);
        let b = delta(DeltaAction::AddLabel(LabelId(3)), &cell);
        assert_eq!(a.timestamp(), TRANSACTION_INITIAL_ID + 7);

        cell.store(42, Ordering::Release);
        assert_eq!(a.timestamp(), 42);
        assert_eq!(b.timestamp(), 42);
    }

    #[test]
    fn test_chain_linking() {
        let cell = Arc::new(AtomicU64::new(5));
        let older = delta(DeltaAction::DeleteObject, &cell);
        let newer = delta(DeltaAction::RemoveLabel(LabelId(1)), &cell);

        newer.set_next(Some(Arc::clone(&older)));
        let walked = newer.next().expect("chain should link");
        assert_eq!(walked.action, DeltaAction::DeleteObject);

        assert!(newer.take_next().is_some());
        assert!(newer.next().is_none());
    }
}
