//! Replication RPC payloads and the transport seam.
//!
//! Wire framing is out of scope here; a transport takes fully encoded
//! payloads (the encoder's bytes are the contract) and returns the
//! replica's response. The in-process transport couples a client directly
//! to a [`ReplicationServer`] and can inject failures and stalls, which
//! is how the failure-path tests drive the state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::{Result, StorageError};
use crate::replication::server::ReplicationServer;

#[derive(Debug, Clone)]
pub struct HeartbeatRequest {
    pub epoch_id: String,
    pub last_commit_timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct HeartbeatResponse {
    pub current_commit_timestamp: u64,
    pub epoch_id: String,
}

#[derive(Debug, Clone)]
pub struct AppendDeltasRequest {
    pub epoch_id: String,
    pub previous_commit_timestamp: u64,
    pub current_wal_seq_num: u64,
    /// Encoded delta records, ending in a `TransactionEnd`.
    pub batch: Vec<u8>,
    pub final_commit_timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct AppendDeltasResponse {
    pub success: bool,
    pub current_commit_timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct FileTransfer {
    pub filename: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub epoch_id: String,
    pub file: FileTransfer,
}

#[derive(Debug, Clone)]
pub struct WalFilesRequest {
    pub epoch_id: String,
    pub files: Vec<FileTransfer>,
}

#[derive(Debug, Clone)]
pub struct CurrentWalRequest {
    pub epoch_id: String,
    pub filename: String,
    pub size: u64,
    pub file_data: Vec<u8>,
    /// The primary's not-yet-flushed append buffer; appended to
    /// `file_data` it completes the segment image.
    pub buffer_data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct OnlySnapshotRequest {
    pub epoch_id: String,
    pub snapshot_timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct TransferResponse {
    pub success: bool,
    pub current_commit_timestamp: u64,
}

pub trait ReplicaTransport: Send + Sync {
    fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse>;
    fn append_deltas(&self, request: AppendDeltasRequest) -> Result<AppendDeltasResponse>;
    fn transfer_snapshot(&self, request: SnapshotRequest) -> Result<TransferResponse>;
    fn transfer_wal_files(&self, request: WalFilesRequest) -> Result<TransferResponse>;
    fn transfer_current_wal(&self, request: CurrentWalRequest) -> Result<TransferResponse>;
    fn transfer_only_snapshot(&self, request: OnlySnapshotRequest) -> Result<TransferResponse>;
}

/// Transport that calls a [`ReplicationServer`] in the same process.
pub struct InProcessTransport {
    server: Arc<ReplicationServer>,
    failing: AtomicBool,
    stalled: AtomicBool,
}

impl InProcessTransport {
    pub fn new(server: Arc<ReplicationServer>) -> Arc<Self> {
        Arc::new(Self {
            server,
            failing: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
        })
    }

    /// Every call fails with an RPC error until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Every call blocks until cleared, simulating an unresponsive
    /// replica; the call then proceeds normally.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::Release);
    }

    fn checkpoint(&self) -> Result<()> {
        while self.stalled.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(5));
        }
        if self.failing.load(Ordering::Acquire) {
            return Err(StorageError::Rpc("injected transport failure".into()));
        }
        Ok(())
    }
}

impl ReplicaTransport for InProcessTransport {
    fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse> {
        self.checkpoint()?;
        self.server.heartbeat(request)
    }

    fn append_deltas(&self, request: AppendDeltasRequest) -> Result<AppendDeltasResponse> {
        self.checkpoint()?;
        self.server.append_deltas(request)
    }

    fn transfer_snapshot(&self, request: SnapshotRequest) -> Result<TransferResponse> {
        self.checkpoint()?;
        self.server.apply_snapshot(request)
    }

    fn transfer_wal_files(&self, request: WalFilesRequest) -> Result<TransferResponse> {
        self.checkpoint()?;
        self.server.apply_wal_files(request)
    }

    fn transfer_current_wal(&self, request: CurrentWalRequest) -> Result<TransferResponse> {
        self.checkpoint()?;
        self.server.apply_current_wal(request)
    }

    fn transfer_only_snapshot(&self, request: OnlySnapshotRequest) -> Result<TransferResponse> {
        self.checkpoint()?;
        self.server.apply_only_snapshot(request)
    }
}
