//! Durability: the delta encoder, WAL segments, snapshots and the boot
//! recovery loader.

pub mod encoder;
pub mod recovery;
pub mod snapshot;
pub mod wal;

pub use encoder::{WalDeltaOp, WalDeltaRecord};
pub use recovery::{recover, RecoveredState};
pub use snapshot::{SnapshotData, SnapshotEdge, SnapshotFileInfo, SnapshotVertex};
pub use wal::{WalFile, WalFileInfo};
