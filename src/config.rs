//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ItemsConfig {
    /// When false, `set_property` on edges fails and edge property maps
    /// stay empty everywhere, including durability and replication.
    pub properties_on_edges: bool,
}

#[derive(Debug, Clone)]
pub struct DurabilityConfig {
    /// Replay the newest coherent snapshot + WAL chain at startup.
    pub recover_on_startup: bool,
    pub snapshot_directory: PathBuf,
    pub wal_directory: PathBuf,
    /// Persisted set of registered replicas and their modes.
    pub replication_file: PathBuf,
    /// Finalized snapshots kept before the retention sweep deletes them.
    pub snapshot_retention_count: usize,
    /// A current WAL segment larger than this is finalized and rotated.
    pub wal_file_size_limit: u64,
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        Self {
            recover_on_startup: false,
            snapshot_directory: PathBuf::from("lamina_data/snapshots"),
            wal_directory: PathBuf::from("lamina_data/wal"),
            replication_file: PathBuf::from("lamina_data/replication.json"),
            snapshot_retention_count: 3,
            wal_file_size_limit: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub items: ItemsConfig,
    pub durability: DurabilityConfig,
    /// Interval of the background GC worker; `None` disables it.
    pub gc_cycle: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            items: ItemsConfig::default(),
            durability: DurabilityConfig::default(),
            gc_cycle: Some(Duration::from_secs(1)),
        }
    }
}

impl Config {
    /// Configuration rooted at `data_dir`, with the directory layout the
    /// engine expects (`wal/` and `snapshots/` beneath it).
    pub fn at(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            durability: DurabilityConfig {
                snapshot_directory: data_dir.join("snapshots"),
                wal_directory: data_dir.join("wal"),
                replication_file: data_dir.join("replication.json"),
                ..DurabilityConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn with_properties_on_edges(mut self, enabled: bool) -> Self {
        self.items.properties_on_edges = enabled;
        self
    }

    pub fn with_recovery(mut self, enabled: bool) -> Self {
        self.durability.recover_on_startup = enabled;
        self
    }

    pub fn with_gc_cycle(mut self, cycle: Option<Duration>) -> Self {
        self.gc_cycle = cycle;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMode {
    Sync,
    Async,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslConfig {
    pub key_file: PathBuf,
    pub cert_file: PathBuf,
}

/// Registration-time description of a replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    pub name: String,
    /// `host:port` of the replica's replication server.
    pub endpoint: String,
    pub mode: ReplicationMode,
    /// Seconds a SYNC replica may hold up a commit before being demoted
    /// to ASYNC. Only valid with `ReplicationMode::Sync`.
    pub timeout: Option<f64>,
    pub ssl: Option<SslConfig>,
}

impl ReplicaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(StorageError::InvalidArgument(
                "replica name must not be empty".into(),
            ));
        }
        match self.endpoint.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                port.parse::<u16>().map_err(|_| {
                    StorageError::InvalidArgument(format!(
                        "invalid replica port in endpoint '{}'",
                        self.endpoint
                    ))
                })?;
            }
            _ => {
                return Err(StorageError::InvalidArgument(format!(
                    "replica endpoint '{}' is not host:port",
                    self.endpoint
                )));
            }
        }
        match (self.mode, self.timeout) {
            (ReplicationMode::Async, Some(_)) => Err(StorageError::InvalidArgument(
                "timeout is only valid for SYNC replicas".into(),
            )),
            (_, Some(timeout)) if timeout <= 0.0 => Err(StorageError::InvalidArgument(
                "replica timeout must be positive".into(),
            )),
            _ => Ok(()),
        }
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs_f64)
    }
}
