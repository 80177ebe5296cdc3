use std::sync::Arc;
use std::time::{Duration, Instant};

use lamina::{
    Config, InProcessTransport, IsolationLevel, PropertyValue, ReplicaConfig, ReplicaState,
    ReplicaTransport, RecoveryStep, ReplicationMode, ReplicationServer, StorageEngine, View,
};
use tempfile::TempDir;

fn open_engine(tmp: &TempDir) -> Arc<StorageEngine> {
    StorageEngine::open(
        Config::at(tmp.path())
            .with_gc_cycle(None)
            .with_properties_on_edges(true),
    )
    .unwrap()
}

fn replica_pair(tmp: &TempDir) -> (Arc<StorageEngine>, Arc<InProcessTransport>) {
    let replica = open_engine(tmp);
    let transport = InProcessTransport::new(ReplicationServer::new(Arc::clone(&replica)));
    (replica, transport)
}

fn sync_config(name: &str) -> ReplicaConfig {
    ReplicaConfig {
        name: name.into(),
        endpoint: "127.0.0.1:10000".into(),
        mode: ReplicationMode::Sync,
        timeout: None,
        ssl: None,
    }
}

fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn handshake_with_synced_replica_goes_ready() {
    let primary_tmp = TempDir::new().unwrap();
    let replica_tmp = TempDir::new().unwrap();
    let primary = open_engine(&primary_tmp);
    let (replica, transport) = replica_pair(&replica_tmp);

    let client = primary
        .register_replica(sync_config("replica1"), transport)
        .unwrap();

    // Same position on both sides: READY immediately, nothing shipped.
    assert_eq!(client.state(), ReplicaState::Ready);
    assert_eq!(replica.last_commit_timestamp(), 0);
}

#[test]
fn committed_transactions_stream_to_ready_replica() {
    let primary_tmp = TempDir::new().unwrap();
    let replica_tmp = TempDir::new().unwrap();
    let primary = open_engine(&primary_tmp);
    let (replica, transport) = replica_pair(&replica_tmp);
    primary
        .register_replica(sync_config("replica1"), transport)
        .unwrap();

    let mut txn = primary.begin(IsolationLevel::SnapshotIsolation);
    let a = primary.create_vertex(&mut txn).unwrap();
    let b = primary.create_vertex(&mut txn).unwrap();
    let label = primary.name_mapper().label("Person");
    primary.add_label(&mut txn, a, label).unwrap();
    let key = primary.name_mapper().property_key("name");
    primary
        .set_vertex_property(&mut txn, a, key, PropertyValue::String("ada".into()))
        .unwrap();
    let knows = primary.name_mapper().edge_type("KNOWS");
    let edge = primary.create_edge(&mut txn, a, b, knows).unwrap();
    let weight = primary.name_mapper().property_key("weight");
    primary
        .set_edge_property(&mut txn, edge, weight, PropertyValue::Double(2.5))
        .unwrap();
    primary.commit(&mut txn).unwrap();

    // SYNC replication finalizes on the committing thread.
    assert_eq!(replica.last_commit_timestamp(), primary.last_commit_timestamp());

    let reader = replica.begin(IsolationLevel::SnapshotIsolation);
    let vertex = replica.find_vertex(&reader, a, View::New).unwrap();
    let replica_label = replica.name_mapper().label("Person");
    assert!(vertex.has_label(replica_label));
    let replica_key = replica.name_mapper().property_key("name");
    assert_eq!(
        vertex.properties.get(&replica_key),
        Some(&PropertyValue::String("ada".into()))
    );
    let edge_record = replica.find_edge(&reader, edge, View::New).unwrap();
    let replica_weight = replica.name_mapper().property_key("weight");
    assert_eq!(
        edge_record.properties.get(&replica_weight),
        Some(&PropertyValue::Double(2.5))
    );

    // Visible object sets agree after every commit (deletion included).
    drop(reader);
    let mut txn = primary.begin(IsolationLevel::SnapshotIsolation);
    primary.delete_edge(&mut txn, edge).unwrap();
    primary.commit(&mut txn).unwrap();

    let primary_reader = primary.begin(IsolationLevel::SnapshotIsolation);
    let replica_reader = replica.begin(IsolationLevel::SnapshotIsolation);
    let primary_gids: Vec<_> = primary
        .visible_vertices(&primary_reader, View::New)
        .iter()
        .map(|vertex| vertex.gid)
        .collect();
    let replica_gids: Vec<_> = replica
        .visible_vertices(&replica_reader, View::New)
        .iter()
        .map(|vertex| vertex.gid)
        .collect();
    assert_eq!(primary_gids, replica_gids);
    assert!(replica.find_edge(&replica_reader, edge, View::New).is_none());
}

#[test]
fn lagging_replica_recovers_from_current_wal() {
    let primary_tmp = TempDir::new().unwrap();
    let replica_tmp = TempDir::new().unwrap();
    let primary = open_engine(&primary_tmp);

    // One commit lands before the replica exists; only the current WAL
    // holds it.
    let mut txn = primary.begin(IsolationLevel::SnapshotIsolation);
    let gid = primary.create_vertex(&mut txn).unwrap();
    primary.commit(&mut txn).unwrap();

    let (replica, transport) = replica_pair(&replica_tmp);
    let client = primary
        .register_replica(sync_config("replica1"), transport)
        .unwrap();

    wait_for(|| client.state() == ReplicaState::Ready, "replica recovery");

    let mut locker = primary.file_retainer().add_locker();
    let steps = client.get_recovery_steps(&primary, 0, &mut locker).unwrap();
    assert_eq!(
        steps,
        vec![RecoveryStep::CurrentWal(
            primary.current_wal_seq_num().unwrap()
        )]
    );

    let reader = replica.begin(IsolationLevel::SnapshotIsolation);
    assert!(replica.find_vertex(&reader, gid, View::New).is_some());
    assert_eq!(replica.last_commit_timestamp(), primary.last_commit_timestamp());
}

#[test]
fn diverged_replica_is_rejected_at_handshake() {
    let primary_tmp = TempDir::new().unwrap();
    let replica_tmp = TempDir::new().unwrap();
    let primary = open_engine(&primary_tmp);
    let (replica, transport) = replica_pair(&replica_tmp);

    // The replica lived a life of its own: commits under an epoch the
    // primary has never heard of.
    let mut txn = replica.begin(IsolationLevel::SnapshotIsolation);
    replica.create_vertex(&mut txn).unwrap();
    replica.commit(&mut txn).unwrap();

    let client = primary
        .register_replica(sync_config("replica1"), transport)
        .unwrap();
    assert_eq!(client.state(), ReplicaState::Invalid);

    // Nothing was shipped in either direction.
    assert_eq!(primary.last_commit_timestamp(), 0);

    // A commit on the primary keeps the replica parked in INVALID (the
    // reconnect heartbeat hits the same divergence).
    let mut txn = primary.begin(IsolationLevel::SnapshotIsolation);
    primary.create_vertex(&mut txn).unwrap();
    primary.commit(&mut txn).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(client.state(), ReplicaState::Invalid);
}

#[test]
fn rpc_failure_invalidates_then_reconnect_recovers() {
    let primary_tmp = TempDir::new().unwrap();
    let replica_tmp = TempDir::new().unwrap();
    let primary = open_engine(&primary_tmp);
    let (replica, transport) = replica_pair(&replica_tmp);
    let client = primary
        .register_replica(sync_config("replica1"), Arc::clone(&transport) as Arc<dyn ReplicaTransport>)
        .unwrap();
    assert_eq!(client.state(), ReplicaState::Ready);

    transport.set_failing(true);
    let mut txn = primary.begin(IsolationLevel::SnapshotIsolation);
    let first = primary.create_vertex(&mut txn).unwrap();
    primary.commit(&mut txn).unwrap();
    wait_for(|| client.state() == ReplicaState::Invalid, "invalid state");

    transport.set_failing(false);
    // The next commit notices the dead connection and schedules the
    // reconnect, which finds the replica behind and recovers it.
    let mut txn = primary.begin(IsolationLevel::SnapshotIsolation);
    let second = primary.create_vertex(&mut txn).unwrap();
    primary.commit(&mut txn).unwrap();

    wait_for(|| client.state() == ReplicaState::Ready, "reconnect");
    wait_for(
        || replica.last_commit_timestamp() == primary.last_commit_timestamp(),
        "replica catch-up",
    );
    let reader = replica.begin(IsolationLevel::SnapshotIsolation);
    assert!(replica.find_vertex(&reader, first, View::New).is_some());
    assert!(replica.find_vertex(&reader, second, View::New).is_some());
}

#[test]
fn unresponsive_sync_replica_demotes_to_async() {
    let primary_tmp = TempDir::new().unwrap();
    let replica_tmp = TempDir::new().unwrap();
    let primary = open_engine(&primary_tmp);
    let (replica, transport) = replica_pair(&replica_tmp);

    let mut config = sync_config("replica1");
    config.timeout = Some(1.0);
    let client = primary
        .register_replica(config, Arc::clone(&transport) as Arc<dyn ReplicaTransport>)
        .unwrap();
    assert_eq!(client.state(), ReplicaState::Ready);

    transport.set_stalled(true);
    let started = Instant::now();
    let mut txn = primary.begin(IsolationLevel::SnapshotIsolation);
    let gid = primary.create_vertex(&mut txn).unwrap();
    primary.commit(&mut txn).unwrap();
    let elapsed = started.elapsed();

    // The commit waited out the timeout, not the replica.
    assert!(elapsed >= Duration::from_millis(900), "commit returned in {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "commit blocked for {elapsed:?}");
    assert_eq!(client.mode(), ReplicationMode::Async);
    assert!(client.replica_config().timeout.is_none());

    // Once the replica answers again, the stale response is discarded
    // and reconciliation brings it back up to date.
    transport.set_stalled(false);
    wait_for(|| client.state() == ReplicaState::Ready, "reconciliation");
    wait_for(
        || replica.last_commit_timestamp() == primary.last_commit_timestamp(),
        "replica catch-up",
    );
    let reader = replica.begin(IsolationLevel::SnapshotIsolation);
    assert!(replica.find_vertex(&reader, gid, View::New).is_some());

    // Later commits no longer block on the demoted replica.
    let started = Instant::now();
    let mut txn = primary.begin(IsolationLevel::SnapshotIsolation);
    primary.create_vertex(&mut txn).unwrap();
    primary.commit(&mut txn).unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn planner_prefers_contiguous_wal_chain() {
    let primary_tmp = TempDir::new().unwrap();
    let mut cfg = Config::at(primary_tmp.path())
        .with_gc_cycle(None)
        .with_properties_on_edges(true);
    // Rotate after every commit so each transaction gets its own
    // finalized segment.
    cfg.durability.wal_file_size_limit = 1;
    let primary = StorageEngine::open(cfg).unwrap();

    for _ in 0..4 {
        let mut txn = primary.begin(IsolationLevel::SnapshotIsolation);
        primary.create_vertex(&mut txn).unwrap();
        primary.commit(&mut txn).unwrap();
    }

    // A quiet client for planning only.
    let replica_tmp = TempDir::new().unwrap();
    let (_replica, transport) = replica_pair(&replica_tmp);
    transport.set_failing(true);
    let client = primary
        .register_replica(sync_config("planner"), Arc::clone(&transport) as Arc<dyn ReplicaTransport>)
        .unwrap();

    let mut locker = primary.file_retainer().add_locker();
    let steps = client.get_recovery_steps(&primary, 0, &mut locker).unwrap();
    match &steps[..] {
        [RecoveryStep::Wals(chain)] => assert_eq!(chain.len(), 4),
        other => panic!("expected a single wal chain step, got {other:?}"),
    }

    // A replica that already holds the first two segments receives only
    // the remainder of the chain.
    let covered = 2;
    let second_commit = {
        let files =
            lamina::durability::wal::list_finalized_wal_files(
                &primary.config().durability.wal_directory,
                primary.uuid(),
            )
            .unwrap();
        files[covered - 1].to_timestamp
    };
    let steps = client
        .get_recovery_steps(&primary, second_commit, &mut locker)
        .unwrap();
    match &steps[..] {
        [RecoveryStep::Wals(chain)] => assert_eq!(chain.len(), 2),
        other => panic!("expected the chain tail, got {other:?}"),
    }
}

#[test]
fn planner_falls_back_to_snapshot_when_chain_is_broken() {
    let primary_tmp = TempDir::new().unwrap();
    let mut cfg = Config::at(primary_tmp.path()).with_gc_cycle(None);
    cfg.durability.wal_file_size_limit = 1;
    let primary = StorageEngine::open(cfg).unwrap();

    for _ in 0..2 {
        let mut txn = primary.begin(IsolationLevel::SnapshotIsolation);
        primary.create_vertex(&mut txn).unwrap();
        primary.commit(&mut txn).unwrap();
    }
    primary.create_snapshot().unwrap();
    for _ in 0..2 {
        let mut txn = primary.begin(IsolationLevel::SnapshotIsolation);
        primary.create_vertex(&mut txn).unwrap();
        primary.commit(&mut txn).unwrap();
    }

    // Break the chain below the snapshot.
    let wal_dir = primary.config().durability.wal_directory.clone();
    let oldest = lamina::durability::wal::list_finalized_wal_files(&wal_dir, primary.uuid())
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    std::fs::remove_file(&oldest.path).unwrap();

    let replica_tmp = TempDir::new().unwrap();
    let (_replica, transport) = replica_pair(&replica_tmp);
    transport.set_failing(true);
    let client = primary
        .register_replica(sync_config("planner"), Arc::clone(&transport) as Arc<dyn ReplicaTransport>)
        .unwrap();

    let mut locker = primary.file_retainer().add_locker();
    let steps = client.get_recovery_steps(&primary, 0, &mut locker).unwrap();
    match &steps[..] {
        [RecoveryStep::Snapshot(path), RecoveryStep::Wals(tail)] => {
            assert!(path.to_string_lossy().ends_with(".snapshot"));
            assert!(!tail.is_empty());
        }
        other => panic!("expected snapshot plus wal tail, got {other:?}"),
    }
}

#[test]
fn planner_sends_only_snapshot_timestamp_when_nothing_else_exists() {
    let primary_tmp = TempDir::new().unwrap();
    let primary = StorageEngine::open(Config::at(primary_tmp.path()).with_gc_cycle(None)).unwrap();

    let mut txn = primary.begin(IsolationLevel::SnapshotIsolation);
    primary.create_vertex(&mut txn).unwrap();
    primary.commit(&mut txn).unwrap();
    primary.create_snapshot().unwrap();

    // The retention sweep retires the finalized segment the snapshot
    // fully covers; no current segment is open after the rotation.
    primary.run_gc();
    assert!(primary.current_wal_seq_num().is_none());

    let replica_tmp = TempDir::new().unwrap();
    let (_replica, transport) = replica_pair(&replica_tmp);
    transport.set_failing(true);
    let client = primary
        .register_replica(sync_config("planner"), Arc::clone(&transport) as Arc<dyn ReplicaTransport>)
        .unwrap();

    let mut locker = primary.file_retainer().add_locker();
    let steps = client.get_recovery_steps(&primary, 0, &mut locker).unwrap();
    assert_eq!(
        steps,
        vec![RecoveryStep::OnlySnapshot(primary.last_commit_timestamp())]
    );
}

#[test]
fn pinned_durability_files_survive_the_retention_sweep() {
    let primary_tmp = TempDir::new().unwrap();
    let mut cfg = Config::at(primary_tmp.path()).with_gc_cycle(None);
    cfg.durability.snapshot_retention_count = 1;
    let primary = StorageEngine::open(cfg).unwrap();

    for _ in 0..2 {
        let mut txn = primary.begin(IsolationLevel::SnapshotIsolation);
        primary.create_vertex(&mut txn).unwrap();
        primary.commit(&mut txn).unwrap();
        primary.create_snapshot().unwrap();
    }
    let snapshots = lamina::durability::snapshot::list_snapshot_files(
        &primary.config().durability.snapshot_directory,
        Some(primary.uuid()),
    )
    .unwrap();
    assert_eq!(snapshots.len(), 2);

    let mut locker = primary.file_retainer().add_locker();
    locker.add_file(&snapshots[0].path);
    primary.run_gc();
    assert!(snapshots[0].path.exists(), "pinned snapshot was deleted");

    drop(locker);
    primary.run_gc();
    assert!(!snapshots[0].path.exists(), "retention kept an unpinned snapshot");
    assert!(snapshots[1].path.exists());
}
