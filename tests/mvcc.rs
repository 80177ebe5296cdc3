use lamina::{
    Config, IsolationLevel, PropertyValue, StorageEngine, StorageError, View,
};
use std::sync::Arc;
use tempfile::TempDir;

fn engine(tmp: &TempDir) -> Arc<StorageEngine> {
    StorageEngine::open(Config::at(tmp.path()).with_gc_cycle(None)).unwrap()
}

#[test]
fn state_delta_create_then_remove_vertex() {
    // Applying a create and a delete in consecutive transactions flips
    // the vertex's existence exactly once each way.
    let tmp = TempDir::new().unwrap();
    let db = engine(&tmp);

    let mut txn = db.begin(IsolationLevel::SnapshotIsolation);
    let gid = db.create_vertex(&mut txn).unwrap();
    db.commit(&mut txn).unwrap();

    let txn = db.begin(IsolationLevel::SnapshotIsolation);
    assert!(db.find_vertex(&txn, gid, View::New).is_some());
    drop(txn);

    let mut txn = db.begin(IsolationLevel::SnapshotIsolation);
    db.delete_vertex(&mut txn, gid).unwrap();
    db.commit(&mut txn).unwrap();

    let txn = db.begin(IsolationLevel::SnapshotIsolation);
    assert!(db.find_vertex(&txn, gid, View::New).is_none());
}

#[test]
fn snapshot_isolation_hides_later_commits() {
    let tmp = TempDir::new().unwrap();
    let db = engine(&tmp);

    let reader = db.begin(IsolationLevel::SnapshotIsolation);

    let mut writer = db.begin(IsolationLevel::SnapshotIsolation);
    let gid = db.create_vertex(&mut writer).unwrap();
    db.commit(&mut writer).unwrap();

    // The reader's snapshot predates the commit.
    assert!(db.find_vertex(&reader, gid, View::New).is_none());
    assert!(db.find_vertex(&reader, gid, View::Old).is_none());

    let late_reader = db.begin(IsolationLevel::SnapshotIsolation);
    assert!(db.find_vertex(&late_reader, gid, View::New).is_some());
}

#[test]
fn own_writes_respect_command_boundaries() {
    let tmp = TempDir::new().unwrap();
    let db = engine(&tmp);

    let mut setup = db.begin(IsolationLevel::SnapshotIsolation);
    let gid = db.create_vertex(&mut setup).unwrap();
    db.commit(&mut setup).unwrap();

    let key = db.name_mapper().property_key("score");
    let mut txn = db.begin(IsolationLevel::SnapshotIsolation);
    db.set_vertex_property(&mut txn, gid, key, PropertyValue::Int(9))
        .unwrap();

    // Same command: the write shows in NEW, not in OLD.
    let new_view = db.find_vertex(&txn, gid, View::New).unwrap();
    assert_eq!(new_view.properties.get(&key), Some(&PropertyValue::Int(9)));
    let old_view = db.find_vertex(&txn, gid, View::Old).unwrap();
    assert!(old_view.properties.get(&key).is_none());

    // After advancing, the previous command's write shows in OLD too.
    db.advance_command(&mut txn);
    let old_view = db.find_vertex(&txn, gid, View::Old).unwrap();
    assert_eq!(old_view.properties.get(&key), Some(&PropertyValue::Int(9)));
    db.commit(&mut txn).unwrap();
}

#[test]
fn second_writer_conflicts_and_aborts_cleanly() {
    // Two transactions label the same vertex; the second mutation fails
    // with a conflict and its abort leaves no trace on the chain.
    let tmp = TempDir::new().unwrap();
    let db = engine(&tmp);

    let mut setup = db.begin(IsolationLevel::SnapshotIsolation);
    let gid = db.create_vertex(&mut setup).unwrap();
    db.commit(&mut setup).unwrap();

    let label = db.name_mapper().label("Hot");
    let mut first = db.begin(IsolationLevel::SnapshotIsolation);
    let mut second = db.begin(IsolationLevel::SnapshotIsolation);

    assert!(db.add_label(&mut first, gid, label).unwrap());
    let err = db.add_label(&mut second, gid, label).unwrap_err();
    assert!(err.is_conflict(), "expected conflict, got {err:?}");
    db.abort(&mut second);

    db.commit(&mut first).unwrap();

    // The aborted transaction left nothing behind; a fresh writer
    // proceeds without conflicts and sees exactly one label.
    let mut third = db.begin(IsolationLevel::SnapshotIsolation);
    let vertex = db.find_vertex(&third, gid, View::New).unwrap();
    assert_eq!(vertex.labels.as_slice(), &[label]);
    assert!(!db.add_label(&mut third, gid, label).unwrap());
    db.commit(&mut third).unwrap();
}

#[test]
fn conflict_with_transaction_committed_after_start() {
    let tmp = TempDir::new().unwrap();
    let db = engine(&tmp);

    let mut setup = db.begin(IsolationLevel::SnapshotIsolation);
    let gid = db.create_vertex(&mut setup).unwrap();
    db.commit(&mut setup).unwrap();

    let label = db.name_mapper().label("L");
    let mut early = db.begin(IsolationLevel::SnapshotIsolation);

    let mut racer = db.begin(IsolationLevel::SnapshotIsolation);
    db.add_label(&mut racer, gid, label).unwrap();
    db.commit(&mut racer).unwrap();

    // The racer committed after `early` started, so first-committer wins.
    let err = db.remove_label(&mut early, gid, label).unwrap_err();
    assert!(err.is_conflict());
    db.abort(&mut early);
}

#[test]
fn abort_reverts_forward_effects() {
    let tmp = TempDir::new().unwrap();
    let db = engine(&tmp);

    let mut setup = db.begin(IsolationLevel::SnapshotIsolation);
    let gid = db.create_vertex(&mut setup).unwrap();
    db.commit(&mut setup).unwrap();

    let label = db.name_mapper().label("Gone");
    let mut txn = db.begin(IsolationLevel::SnapshotIsolation);
    db.add_label(&mut txn, gid, label).unwrap();
    let extra = db.create_vertex(&mut txn).unwrap();
    db.abort(&mut txn);

    let reader = db.begin(IsolationLevel::SnapshotIsolation);
    let vertex = db.find_vertex(&reader, gid, View::New).unwrap();
    assert!(vertex.labels.is_empty());
    assert!(db.find_vertex(&reader, extra, View::New).is_none());
}

#[test]
fn edges_maintain_symmetric_adjacency() {
    let tmp = TempDir::new().unwrap();
    let db = engine(&tmp);

    let mut txn = db.begin(IsolationLevel::SnapshotIsolation);
    let a = db.create_vertex(&mut txn).unwrap();
    let b = db.create_vertex(&mut txn).unwrap();
    let knows = db.name_mapper().edge_type("KNOWS");
    let edge = db.create_edge(&mut txn, a, b, knows).unwrap();
    db.commit(&mut txn).unwrap();

    let reader = db.begin(IsolationLevel::SnapshotIsolation);
    let from = db.find_vertex(&reader, a, View::New).unwrap();
    let to = db.find_vertex(&reader, b, View::New).unwrap();
    assert_eq!(from.out_edges.len(), 1);
    assert_eq!(from.out_edges[0].edge, edge);
    assert_eq!(from.out_edges[0].peer, b);
    assert_eq!(to.in_edges.len(), 1);
    assert_eq!(to.in_edges[0].peer, a);
    assert!(from.in_edges.is_empty());
    drop(reader);

    // Deleting the edge restores both adjacency lists; aborting the
    // delete restores them back again.
    let mut txn = db.begin(IsolationLevel::SnapshotIsolation);
    db.delete_edge(&mut txn, edge).unwrap();
    let mid = db.find_vertex(&txn, a, View::New).unwrap();
    assert!(mid.out_edges.is_empty());
    db.abort(&mut txn);

    let reader = db.begin(IsolationLevel::SnapshotIsolation);
    let from = db.find_vertex(&reader, a, View::New).unwrap();
    assert_eq!(from.out_edges.len(), 1);
}

#[test]
fn vertex_with_edges_needs_detach_delete() {
    let tmp = TempDir::new().unwrap();
    let db = engine(&tmp);

    let mut txn = db.begin(IsolationLevel::SnapshotIsolation);
    let a = db.create_vertex(&mut txn).unwrap();
    let b = db.create_vertex(&mut txn).unwrap();
    let edge_type = db.name_mapper().edge_type("REL");
    let edge = db.create_edge(&mut txn, a, b, edge_type).unwrap();
    db.commit(&mut txn).unwrap();

    let mut txn = db.begin(IsolationLevel::SnapshotIsolation);
    let err = db.delete_vertex(&mut txn, a).unwrap_err();
    assert!(matches!(err, StorageError::VertexHasEdges));

    db.detach_delete_vertex(&mut txn, a).unwrap();
    assert!(db.find_vertex(&txn, a, View::New).is_none());
    assert!(db.find_edge(&txn, edge, View::New).is_none());
    // The peer survives with a cleaned adjacency list.
    let peer = db.find_vertex(&txn, b, View::New).unwrap();
    assert!(peer.in_edges.is_empty());
    db.commit(&mut txn).unwrap();
}

#[test]
fn edge_properties_follow_configuration() {
    let tmp = TempDir::new().unwrap();
    let disabled = StorageEngine::open(Config::at(tmp.path()).with_gc_cycle(None)).unwrap();

    let mut txn = disabled.begin(IsolationLevel::SnapshotIsolation);
    let a = disabled.create_vertex(&mut txn).unwrap();
    let b = disabled.create_vertex(&mut txn).unwrap();
    let edge_type = disabled.name_mapper().edge_type("REL");
    let edge = disabled.create_edge(&mut txn, a, b, edge_type).unwrap();
    let key = disabled.name_mapper().property_key("weight");
    let err = disabled
        .set_edge_property(&mut txn, edge, key, PropertyValue::Double(0.5))
        .unwrap_err();
    assert!(matches!(err, StorageError::PropertiesDisabled));
    disabled.abort(&mut txn);
    drop(disabled);

    let tmp = TempDir::new().unwrap();
    let enabled = StorageEngine::open(
        Config::at(tmp.path())
            .with_gc_cycle(None)
            .with_properties_on_edges(true),
    )
    .unwrap();
    let mut txn = enabled.begin(IsolationLevel::SnapshotIsolation);
    let a = enabled.create_vertex(&mut txn).unwrap();
    let b = enabled.create_vertex(&mut txn).unwrap();
    let edge_type = enabled.name_mapper().edge_type("REL");
    let edge = enabled.create_edge(&mut txn, a, b, edge_type).unwrap();
    let key = enabled.name_mapper().property_key("weight");
    enabled
        .set_edge_property(&mut txn, edge, key, PropertyValue::Double(0.5))
        .unwrap();
    enabled.commit(&mut txn).unwrap();

    let reader = enabled.begin(IsolationLevel::SnapshotIsolation);
    let record = enabled.find_edge(&reader, edge, View::New).unwrap();
    assert_eq!(record.properties.get(&key), Some(&PropertyValue::Double(0.5)));
}

#[test]
fn read_committed_sees_new_commits_at_command_boundaries() {
    let tmp = TempDir::new().unwrap();
    let db = engine(&tmp);

    let mut reader = db.begin(IsolationLevel::ReadCommitted);

    let mut writer = db.begin(IsolationLevel::SnapshotIsolation);
    let gid = db.create_vertex(&mut writer).unwrap();
    db.commit(&mut writer).unwrap();

    // Invisible within the current command, visible after the boundary.
    assert!(db.find_vertex(&reader, gid, View::New).is_none());
    db.advance_command(&mut reader);
    assert!(db.find_vertex(&reader, gid, View::New).is_some());
}

#[test]
fn concurrent_writers_on_distinct_vertices_all_commit() {
    use std::thread;

    let tmp = TempDir::new().unwrap();
    let db = engine(&tmp);

    let mut setup = db.begin(IsolationLevel::SnapshotIsolation);
    let gids: Vec<_> = (0..8)
        .map(|_| db.create_vertex(&mut setup).unwrap())
        .collect();
    db.commit(&mut setup).unwrap();

    let handles: Vec<_> = gids
        .iter()
        .map(|gid| {
            let db = Arc::clone(&db);
            let gid = *gid;
            thread::spawn(move || {
                let label = db.name_mapper().label("Mine");
                let mut txn = db.begin(IsolationLevel::SnapshotIsolation);
                db.add_label(&mut txn, gid, label).unwrap();
                db.commit(&mut txn).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let reader = db.begin(IsolationLevel::SnapshotIsolation);
    let label = db.name_mapper().label("Mine");
    for gid in gids {
        let vertex = db.find_vertex(&reader, gid, View::New).unwrap();
        assert!(vertex.has_label(label));
    }
}
