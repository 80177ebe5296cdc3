//! Visibility evaluation and write admission over delta chains.
//!
//! Readers clone the current record under its lock, then walk the chain
//! without any lock, undoing deltas until they reach the state their
//! snapshot may see. Writers are admitted only when the chain head is
//! their own or belongs to a transaction that committed before they
//! started; anything else is a write-write conflict.

use std::sync::Arc;

use crate::delta::{Delta, DeltaAction, OwnerRef};
use crate::edge::Edge;
use crate::transaction::Transaction;
use crate::types::{View, TRANSACTION_INITIAL_ID};
use crate::vertex::Vertex;

/// Returns true when `timestamp` is a commit timestamp rather than the id
/// of a still-uncommitted transaction.
#[inline]
pub(crate) fn is_committed(timestamp: u64) -> bool {
    timestamp < TRANSACTION_INITIAL_ID
}

/// Decides whether the walk stops *before* applying the delta, i.e. the
/// record state reached so far is the one visible to `txn`.
fn stops_walk(txn: &Transaction, view: View, timestamp: u64, command_id: u64) -> bool {
    if timestamp == txn.id() {
        // Own deltas: NEW shows the current command's effects, OLD only
        // strictly older commands'.
        return match view {
            View::New => command_id <= txn.command_id,
            View::Old => command_id < txn.command_id,
        };
    }
    is_committed(timestamp)
        && timestamp <= txn.snapshot.start_timestamp
        && !txn.snapshot.active.contains(&timestamp)
}

/// Walks the chain from `head`, applying each delta's reverse effect via
/// `apply` until the visible state is reached.
pub(crate) fn apply_deltas_for_read<T>(
    txn: &Transaction,
    head: Option<Arc<Delta>>,
    view: View,
    record: &mut T,
    apply: fn(&mut T, &DeltaAction),
) {
    let mut current = head;
    while let Some(delta) = current {
        if stops_walk(txn, view, delta.timestamp(), delta.command_id) {
            break;
        }
        apply(record, &delta.action);
        current = delta.next();
    }
}

/// Write admission: the head delta must be ours or committed before our
/// snapshot. A `false` result is a serialization conflict and the caller's
/// transaction must abort.
pub(crate) fn prepare_for_write(txn: &Transaction, head: &Option<Arc<Delta>>) -> bool {
    match head {
        None => true,
        Some(delta) => {
            let timestamp = delta.timestamp();
            timestamp == txn.id()
                || (is_committed(timestamp)
                    && timestamp <= txn.snapshot.start_timestamp
                    && !txn.snapshot.active.contains(&timestamp))
        }
    }
}

/// Creates a delta owned by `txn` and prepends it to the chain whose head
/// lives in `head`. The owner record's lock must be held.
pub(crate) fn create_and_link_delta(
    txn: &mut Transaction,
    head: &mut Option<Arc<Delta>>,
    action: DeltaAction,
    owner: OwnerRef,
) {
    let delta = Arc::new(Delta::new(
        action,
        Arc::clone(txn.timestamp_cell()),
        txn.command_id,
        owner,
    ));
    delta.set_next(head.take());
    *head = Some(Arc::clone(&delta));
    txn.deltas.push(delta);
}

/// Reverse effect of a delta on a vertex record.
pub(crate) fn apply_to_vertex(vertex: &mut Vertex, action: &DeltaAction) {
    match action {
        DeltaAction::DeleteObject => vertex.deleted = true,
        DeltaAction::RecreateObject => vertex.deleted = false,
        DeltaAction::SetProperty { key, value } => {
            if value.is_null() {
                vertex.properties.remove(key);
            } else {
                vertex.properties.insert(*key, value.clone());
            }
        }
        DeltaAction::AddLabel(label) => {
            vertex.add_label(*label);
        }
        DeltaAction::RemoveLabel(label) => {
            vertex.remove_label(*label);
        }
        DeltaAction::AddInEdge(entry) => vertex.in_edges.push(*entry),
        DeltaAction::AddOutEdge(entry) => vertex.out_edges.push(*entry),
        DeltaAction::RemoveInEdge(entry) => {
            vertex.in_edges.retain(|existing| existing != entry);
        }
        DeltaAction::RemoveOutEdge(entry) => {
            vertex.out_edges.retain(|existing| existing != entry);
        }
    }
}

/// Reverse effect of a delta on an edge record. Adjacency and label
/// actions never target edges.
pub(crate) fn apply_to_edge(edge: &mut Edge, action: &DeltaAction) {
    match action {
        DeltaAction::DeleteObject => edge.deleted = true,
        DeltaAction::RecreateObject => edge.deleted = false,
        DeltaAction::SetProperty { key, value } => {
            if value.is_null() {
                edge.properties.remove(key);
            } else {
                edge.properties.insert(*key, value.clone());
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Snapshot;
    use crate::types::{Gid, IsolationLevel, LabelId};

    fn txn(id_offset: u64, start: u64) -> Transaction {
        Transaction::new(
            TRANSACTION_INITIAL_ID + id_offset,
            Snapshot {
                start_timestamp: start,
                active: Default::default(),
            },
            IsolationLevel::default(),
        )
    }

    #[test]
    fn test_committed_before_start_is_visible() {
        let mut writer = txn(1, 5);
        let mut head = None;
        create_and_link_delta(
            &mut writer,
            &mut head,
            DeltaAction::RemoveLabel(LabelId(9)),
            OwnerRef::Vertex(Gid::from_u64(1)),
        );
        writer.publish(6);

        // Reader that started before the commit undoes the delta.
        let early_reader = txn(2, 5);
        let mut vertex = Vertex::new(Gid::from_u64(1));
        vertex.add_label(LabelId(9));
        apply_deltas_for_read(
            &early_reader,
            head.clone(),
            View::New,
            &mut vertex,
            apply_to_vertex,
        );
        assert!(!vertex.has_label(LabelId(9)));

        // Reader that started after the commit stops at the head.
        let late_reader = txn(3, 10);
        let mut vertex = Vertex::new(Gid::from_u64(1));
        vertex.add_label(LabelId(9));
        apply_deltas_for_read(
            &late_reader,
            head,
            View::New,
            &mut vertex,
            apply_to_vertex,
        );
        assert!(vertex.has_label(LabelId(9)));
    }

    #[test]
    fn test_own_deltas_respect_command_id() {
        let mut writer = txn(1, 5);
        let mut head = None;
        create_and_link_delta(
            &mut writer,
            &mut head,
            DeltaAction::RemoveLabel(LabelId(3)),
            OwnerRef::Vertex(Gid::from_u64(1)),
        );

        // Same command: visible in NEW, undone in OLD.
        let mut vertex = Vertex::new(Gid::from_u64(1));
        vertex.add_label(LabelId(3));
        apply_deltas_for_read(&writer, head.clone(), View::New, &mut vertex, apply_to_vertex);
        assert!(vertex.has_label(LabelId(3)));

        let mut vertex = Vertex::new(Gid::from_u64(1));
        vertex.add_label(LabelId(3));
        apply_deltas_for_read(&writer, head.clone(), View::Old, &mut vertex, apply_to_vertex);
        assert!(!vertex.has_label(LabelId(3)));

        // After advancing the command the write shows in OLD as well.
        writer.command_id += 1;
        let mut vertex = Vertex::new(Gid::from_u64(1));
        vertex.add_label(LabelId(3));
        apply_deltas_for_read(&writer, head, View::Old, &mut vertex, apply_to_vertex);
        assert!(vertex.has_label(LabelId(3)));
    }

    #[test]
    fn test_conflict_on_foreign_uncommitted_head() {
        let mut owner = txn(1, 5);
        let mut head = None;
        create_and_link_delta(
            &mut owner,
            &mut head,
            DeltaAction::DeleteObject,
            OwnerRef::Vertex(Gid::from_u64(1)),
        );

        let intruder = txn(2, 5);
        assert!(!prepare_for_write(&intruder, &head));
        assert!(prepare_for_write(&owner, &head));

        // Once committed after the intruder's start it still conflicts.
        owner.publish(9);
        assert!(!prepare_for_write(&intruder, &head));

        // A transaction that started after the commit may write.
        let late = txn(3, 12);
        assert!(prepare_for_write(&late, &head));
    }
}
