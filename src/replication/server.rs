//! Replica-side application of shipped state.
//!
//! The server owns (a reference to) the follower engine and applies delta
//! streams, snapshot transfers and WAL transfers to it. Admission is
//! strict: a delta stream is accepted only when the replica's last commit
//! timestamp equals the stream's `previous_commit_timestamp` and the
//! epochs agree, otherwise the response demotes the primary's client into
//! recovery.

use std::fs;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::durability::encoder::Decoder;
use crate::durability::{encoder, snapshot, wal};
use crate::engine::StorageEngine;
use crate::error::Result;
use crate::replication::rpc::{
    AppendDeltasRequest, AppendDeltasResponse, CurrentWalRequest, HeartbeatRequest,
    HeartbeatResponse, OnlySnapshotRequest, SnapshotRequest, TransferResponse, WalFilesRequest,
};

pub struct ReplicationServer {
    engine: Arc<StorageEngine>,
}

impl ReplicationServer {
    pub fn new(engine: Arc<StorageEngine>) -> Arc<Self> {
        Arc::new(Self { engine })
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    pub fn heartbeat(&self, _request: HeartbeatRequest) -> Result<HeartbeatResponse> {
        Ok(HeartbeatResponse {
            current_commit_timestamp: self.engine.last_commit_timestamp(),
            epoch_id: self.engine.epoch_id(),
        })
    }

    pub fn append_deltas(&self, request: AppendDeltasRequest) -> Result<AppendDeltasResponse> {
        let last_commit = self.engine.last_commit_timestamp();
        if request.previous_commit_timestamp != last_commit {
            debug!(
                expected = last_commit,
                received = request.previous_commit_timestamp,
                "rejecting delta stream, timestamps diverge"
            );
            return Ok(AppendDeltasResponse {
                success: false,
                current_commit_timestamp: last_commit,
            });
        }
        if last_commit != 0 && self.engine.epoch_id() != request.epoch_id {
            debug!("rejecting delta stream, epoch changed");
            return Ok(AppendDeltasResponse {
                success: false,
                current_commit_timestamp: last_commit,
            });
        }

        match self.apply_batch(&request.batch) {
            Ok(()) => {
                self.engine.adopt_epoch(&request.epoch_id);
                Ok(AppendDeltasResponse {
                    success: true,
                    current_commit_timestamp: self.engine.last_commit_timestamp(),
                })
            }
            Err(err) => {
                warn!(error = %err, "failed to apply delta stream");
                Ok(AppendDeltasResponse {
                    success: false,
                    current_commit_timestamp: self.engine.last_commit_timestamp(),
                })
            }
        }
    }

    fn apply_batch(&self, batch: &[u8]) -> Result<()> {
        let mut decoder = Decoder::new(batch);
        let mut records = Vec::new();
        while decoder.remaining() > 0 {
            records.push(decoder.read_delta_record()?);
        }
        for (commit_timestamp, ops) in encoder::group_transactions(records)? {
            self.engine
                .apply_replicated_transaction(commit_timestamp, &ops)?;
        }
        Ok(())
    }

    pub fn apply_snapshot(&self, request: SnapshotRequest) -> Result<TransferResponse> {
        let data = match snapshot::decode_snapshot(&request.file.data) {
            Ok(data) => data,
            Err(err) => {
                warn!(error = %err, "received unreadable snapshot");
                return Ok(TransferResponse {
                    success: false,
                    current_commit_timestamp: self.engine.last_commit_timestamp(),
                });
            }
        };
        // Keep a durable copy so the replica itself can recover from it.
        let directory = &self.engine.config().durability.snapshot_directory;
        if let Err(err) = fs::create_dir_all(directory)
            .and_then(|()| fs::write(directory.join(&request.file.filename), &request.file.data))
        {
            warn!(error = %err, "could not persist received snapshot");
        }

        self.engine.load_snapshot_data(&data);
        self.engine.adopt_epoch(&request.epoch_id);
        debug!(
            start_timestamp = data.start_timestamp,
            vertices = data.vertices.len(),
            "applied snapshot transfer"
        );
        Ok(TransferResponse {
            success: true,
            current_commit_timestamp: self.engine.last_commit_timestamp(),
        })
    }

    pub fn apply_wal_files(&self, request: WalFilesRequest) -> Result<TransferResponse> {
        for file in &request.files {
            if let Err(err) = self.apply_wal_image(&file.data) {
                warn!(filename = %file.filename, error = %err, "failed to apply wal transfer");
                return Ok(TransferResponse {
                    success: false,
                    current_commit_timestamp: self.engine.last_commit_timestamp(),
                });
            }
        }
        self.engine.adopt_epoch(&request.epoch_id);
        Ok(TransferResponse {
            success: true,
            current_commit_timestamp: self.engine.last_commit_timestamp(),
        })
    }

    pub fn apply_current_wal(&self, request: CurrentWalRequest) -> Result<TransferResponse> {
        let mut image = request.file_data;
        image.extend_from_slice(&request.buffer_data);
        if image.len() as u64 != request.size {
            warn!(
                expected = request.size,
                received = image.len(),
                "current wal transfer size mismatch"
            );
            return Ok(TransferResponse {
                success: false,
                current_commit_timestamp: self.engine.last_commit_timestamp(),
            });
        }
        if let Err(err) = self.apply_wal_image(&image) {
            warn!(error = %err, "failed to apply current wal transfer");
            return Ok(TransferResponse {
                success: false,
                current_commit_timestamp: self.engine.last_commit_timestamp(),
            });
        }
        self.engine.adopt_epoch(&request.epoch_id);
        Ok(TransferResponse {
            success: true,
            current_commit_timestamp: self.engine.last_commit_timestamp(),
        })
    }

    /// Replays every transaction in the segment image that the replica
    /// has not yet seen. Transfers overlap at chain boundaries, so
    /// already-covered commits are skipped rather than rejected.
    fn apply_wal_image(&self, image: &[u8]) -> Result<()> {
        let contents = wal::parse_wal_bytes(image)?;
        for (commit_timestamp, ops) in contents.transactions {
            if commit_timestamp <= self.engine.last_commit_timestamp() {
                continue;
            }
            self.engine
                .apply_replicated_transaction(commit_timestamp, &ops)?;
        }
        Ok(())
    }

    /// No data moved: the snapshot's own timestamp is the newest commit,
    /// the replica only fast-forwards its clock.
    pub fn apply_only_snapshot(&self, request: OnlySnapshotRequest) -> Result<TransferResponse> {
        self.engine
            .fast_forward_commit_timestamp(request.snapshot_timestamp);
        self.engine.adopt_epoch(&request.epoch_id);
        Ok(TransferResponse {
            success: true,
            current_commit_timestamp: self.engine.last_commit_timestamp(),
        })
    }
}
