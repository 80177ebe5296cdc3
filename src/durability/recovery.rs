//! Boot-time recovery: find the newest coherent snapshot + WAL chain and
//! turn it into a replayable state.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::durability::encoder::WalDeltaOp;
use crate::durability::snapshot::{self, SnapshotData};
use crate::durability::wal::{self, WalFileInfo};
use crate::error::{Result, StorageError};

/// Everything the engine needs to rebuild itself at startup.
#[derive(Debug)]
pub struct RecoveredState {
    pub uuid: String,
    pub epoch_id: String,
    pub snapshot: Option<SnapshotData>,
    /// Committed transactions newer than the snapshot, in commit order.
    pub transactions: Vec<(u64, Vec<WalDeltaOp>)>,
    pub last_commit_timestamp: u64,
    pub next_wal_seq_num: u64,
}

/// Scans the durability directories and loads the newest coherent state.
/// Returns `None` when there is nothing to recover.
pub fn recover(wal_directory: &Path, snapshot_directory: &Path) -> Result<Option<RecoveredState>> {
    let snapshot = load_newest_snapshot(snapshot_directory)?;

    let uuid = match &snapshot {
        Some(snapshot) => snapshot.uuid.clone(),
        None => match pick_wal_uuid(wal_directory)? {
            Some(uuid) => uuid,
            None => return Ok(None),
        },
    };

    let wal_files = wal::list_finalized_wal_files(wal_directory, &uuid)?;
    let snapshot_timestamp = snapshot.as_ref().map(|s| s.start_timestamp);
    let chain = build_chain(&wal_files, snapshot_timestamp)?;

    let mut transactions = Vec::new();
    let mut last_commit_timestamp = snapshot_timestamp.unwrap_or(0);
    let mut next_wal_seq_num = 0;
    for info in &chain {
        let contents = wal::load_wal(&info.path)?;
        for (commit_timestamp, ops) in contents.transactions {
            if commit_timestamp <= last_commit_timestamp {
                continue;
            }
            last_commit_timestamp = commit_timestamp;
            transactions.push((commit_timestamp, ops));
        }
        next_wal_seq_num = info.seq_num + 1;
    }

    // A crash may leave an unfinalized segment behind; its frames are
    // checksummed individually so the parseable prefix is still usable.
    if let Some((seq_num, current)) = load_leftover_current(wal_directory, &uuid)? {
        if seq_num == next_wal_seq_num || (chain.is_empty() && snapshot.is_some()) {
            for (commit_timestamp, ops) in current {
                if commit_timestamp <= last_commit_timestamp {
                    continue;
                }
                last_commit_timestamp = commit_timestamp;
                transactions.push((commit_timestamp, ops));
            }
            next_wal_seq_num = seq_num + 1;
        }
    }

    if snapshot.is_none() && transactions.is_empty() {
        return Ok(None);
    }

    let epoch_id = snapshot
        .as_ref()
        .map(|s| s.epoch_id.clone())
        .unwrap_or_default();

    info!(
        uuid = %uuid,
        last_commit_timestamp,
        replayed_transactions = transactions.len(),
        had_snapshot = snapshot.is_some(),
        "recovered durable state"
    );

    Ok(Some(RecoveredState {
        uuid,
        epoch_id,
        snapshot,
        transactions,
        last_commit_timestamp,
        next_wal_seq_num,
    }))
}

/// Newest snapshot that passes its checksum; older ones are fallbacks.
fn load_newest_snapshot(snapshot_directory: &Path) -> Result<Option<SnapshotData>> {
    let mut infos = snapshot::list_snapshot_files(snapshot_directory, None)?;
    while let Some(info) = infos.pop() {
        match snapshot::load_snapshot(&info.path) {
            Ok(data) => return Ok(Some(data)),
            Err(err) => {
                warn!(path = %info.path.display(), error = %err, "skipping unreadable snapshot");
            }
        }
    }
    Ok(None)
}

/// With no snapshot the uuid comes from the WAL files themselves; when
/// several histories share the directory the one reaching furthest wins.
fn pick_wal_uuid(wal_directory: &Path) -> Result<Option<String>> {
    if !wal_directory.exists() {
        return Ok(None);
    }
    let mut best: HashMap<String, u64> = HashMap::new();
    for entry in fs::read_dir(wal_directory)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let Some(stem) = name.strip_suffix(".wal") else {
            continue;
        };
        let Some(uuid) = stem.get(..36) else {
            continue;
        };
        let reach = best.entry(uuid.to_owned()).or_insert(0);
        if let Some(info) = wal::list_finalized_wal_files(wal_directory, uuid)?
            .into_iter()
            .last()
        {
            *reach = (*reach).max(info.to_timestamp);
        }
    }
    Ok(best
        .into_iter()
        .max_by_key(|(_, reach)| *reach)
        .map(|(uuid, _)| uuid))
}

/// The replayable chain: contiguous sequence numbers, starting either at
/// a segment that overlaps the snapshot or at sequence 0. A gap between
/// the snapshot and the first usable segment is a fatal recovery error.
fn build_chain(
    wal_files: &[WalFileInfo],
    snapshot_timestamp: Option<u64>,
) -> Result<Vec<WalFileInfo>> {
    let relevant: Vec<&WalFileInfo> = match snapshot_timestamp {
        Some(timestamp) => wal_files
            .iter()
            .filter(|info| info.to_timestamp > timestamp)
            .collect(),
        None => wal_files.iter().collect(),
    };
    let Some(first) = relevant.first() else {
        return Ok(Vec::new());
    };

    // Without a snapshot the chain must reach all the way back to the
    // first segment. With one, earlier segments may legitimately have
    // been retired by the retention sweep; contiguity of the relevant
    // ones below is the remaining integrity check.
    if snapshot_timestamp.is_none() && first.seq_num != 0 {
        return Err(StorageError::Recovery(format!(
            "no snapshot and wal chain starts at sequence {}",
            first.seq_num
        )));
    }

    let mut chain = Vec::new();
    let mut expected_seq = first.seq_num;
    for info in relevant {
        if info.seq_num != expected_seq {
            return Err(StorageError::Recovery(format!(
                "missing wal segment {expected_seq} in chain"
            )));
        }
        expected_seq += 1;
        chain.push(info.clone());
    }
    Ok(chain)
}

type CurrentWalContents = (u64, Vec<(u64, Vec<WalDeltaOp>)>);

fn load_leftover_current(
    wal_directory: &Path,
    uuid: &str,
) -> Result<Option<CurrentWalContents>> {
    if !wal_directory.exists() {
        return Ok(None);
    }
    for entry in fs::read_dir(wal_directory)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !name.starts_with(uuid) || !name.ends_with("_current.wal") {
            continue;
        }
        match wal::load_wal(&path) {
            Ok(contents) => return Ok(Some((contents.seq_num, contents.transactions))),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable current wal");
                return Ok(None);
            }
        }
    }
    Ok(None)
}
