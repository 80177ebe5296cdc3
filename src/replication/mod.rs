//! Primary/replica replication: the per-replica client state machine, the
//! transport seam, and the server that applies shipped state.

pub mod client;
pub mod rpc;
pub mod server;

pub use client::{RecoveryStep, ReplicaState, ReplicationClient};
pub use rpc::{InProcessTransport, ReplicaTransport};
pub use server::ReplicationServer;
