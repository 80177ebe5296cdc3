use std::time::Duration;

use lamina::{Config, Gid, IsolationLevel, StorageEngine, View};
use tempfile::TempDir;

#[test]
fn sanity_gc_with_periodic_collection() {
    let tmp = TempDir::new().unwrap();
    let db = StorageEngine::open(
        Config::at(tmp.path()).with_gc_cycle(Some(Duration::from_millis(100))),
    )
    .unwrap();

    let mut setup = db.begin(IsolationLevel::SnapshotIsolation);
    let gids: Vec<Gid> = (0..1000)
        .map(|_| db.create_vertex(&mut setup).unwrap())
        .collect();
    db.commit(&mut setup).unwrap();

    let mut txn = db.begin(IsolationLevel::SnapshotIsolation);
    for gid in gids.iter().step_by(5) {
        db.delete_vertex(&mut txn, *gid).unwrap();
    }
    for (index, gid) in gids.iter().enumerate() {
        let new_view = db.find_vertex(&txn, *gid, View::New);
        assert_eq!(new_view.is_some(), index % 5 != 0, "vertex {index} in NEW");
        // The deletions happened in the current command, so OLD still
        // sees every vertex.
        assert!(db.find_vertex(&txn, *gid, View::Old).is_some(), "vertex {index} in OLD");
    }
    db.advance_command(&mut txn);
    db.commit(&mut txn).unwrap();

    std::thread::sleep(Duration::from_millis(300));

    let mut txn = db.begin(IsolationLevel::SnapshotIsolation);
    for (index, gid) in gids.iter().enumerate() {
        assert_eq!(
            db.find_vertex(&txn, *gid, View::New).is_some(),
            index % 5 != 0,
            "vertex {index} after gc"
        );
    }

    // Survivors accept three fresh labels each and report exactly them.
    for (index, gid) in gids.iter().enumerate() {
        if index % 5 == 0 {
            continue;
        }
        let expected: Vec<_> = (0..3)
            .map(|offset| db.name_mapper().label(&format!("label{}", 3 * index + offset)))
            .collect();
        for label in &expected {
            assert!(db.add_label(&mut txn, *gid, *label).unwrap());
        }
        let vertex = db.find_vertex(&txn, *gid, View::New).unwrap();
        let mut seen: Vec<_> = vertex.labels.to_vec();
        seen.sort();
        let mut expected_sorted = expected.clone();
        expected_sorted.sort();
        assert_eq!(seen, expected_sorted);
    }
    db.commit(&mut txn).unwrap();
}

#[test]
fn gc_never_reclaims_state_visible_to_open_snapshot() {
    let tmp = TempDir::new().unwrap();
    let db = StorageEngine::open(Config::at(tmp.path()).with_gc_cycle(None)).unwrap();

    let mut setup = db.begin(IsolationLevel::SnapshotIsolation);
    let gid = db.create_vertex(&mut setup).unwrap();
    db.commit(&mut setup).unwrap();

    // A reader pins the pre-delete state.
    let mut reader = db.begin(IsolationLevel::SnapshotIsolation);

    let mut deleter = db.begin(IsolationLevel::SnapshotIsolation);
    db.delete_vertex(&mut deleter, gid).unwrap();
    db.commit(&mut deleter).unwrap();

    let stats = db.run_gc();
    assert_eq!(stats.objects_reclaimed, 0);
    assert!(db.find_vertex(&reader, gid, View::New).is_some());
    db.abort(&mut reader);

    // With the pinning snapshot gone the delete becomes collectable.
    let stats = db.run_gc();
    assert_eq!(stats.objects_reclaimed, 1);
    let fresh = db.begin(IsolationLevel::SnapshotIsolation);
    assert!(db.find_vertex(&fresh, gid, View::New).is_none());
}

#[test]
fn gc_reclaims_deleted_vertices_once_snapshots_close() {
    let tmp = TempDir::new().unwrap();
    let db = StorageEngine::open(Config::at(tmp.path()).with_gc_cycle(None)).unwrap();

    let mut setup = db.begin(IsolationLevel::SnapshotIsolation);
    let gids: Vec<Gid> = (0..10)
        .map(|_| db.create_vertex(&mut setup).unwrap())
        .collect();
    db.commit(&mut setup).unwrap();

    let mut deleter = db.begin(IsolationLevel::SnapshotIsolation);
    for gid in &gids {
        db.delete_vertex(&mut deleter, *gid).unwrap();
    }
    db.commit(&mut deleter).unwrap();

    let stats = db.run_gc();
    assert_eq!(stats.objects_reclaimed, 10);
    assert!(stats.transactions_collected >= 2);

    // A second cycle finds nothing left to do.
    let stats = db.run_gc();
    assert_eq!(stats.transactions_collected, 0);
    assert_eq!(stats.objects_reclaimed, 0);
}

#[test]
fn gc_truncates_long_version_chains() {
    let tmp = TempDir::new().unwrap();
    let db = StorageEngine::open(Config::at(tmp.path()).with_gc_cycle(None)).unwrap();

    let mut setup = db.begin(IsolationLevel::SnapshotIsolation);
    let gid = db.create_vertex(&mut setup).unwrap();
    db.commit(&mut setup).unwrap();

    let key = db.name_mapper().property_key("counter");
    for round in 0..50 {
        let mut txn = db.begin(IsolationLevel::SnapshotIsolation);
        db.set_vertex_property(&mut txn, gid, key, lamina::PropertyValue::Int(round))
            .unwrap();
        db.commit(&mut txn).unwrap();
    }

    let stats = db.run_gc();
    assert!(stats.transactions_collected >= 50);

    // The surviving head still resolves to the latest committed value.
    let reader = db.begin(IsolationLevel::SnapshotIsolation);
    let vertex = db.find_vertex(&reader, gid, View::New).unwrap();
    assert_eq!(
        vertex.properties.get(&key),
        Some(&lamina::PropertyValue::Int(49))
    );
}
