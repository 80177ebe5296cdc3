use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("serialization conflict: concurrent transaction wrote the same object")]
    Conflict,
    #[error("{0} does not exist")]
    NonexistentObject(&'static str),
    #[error("{0} was deleted")]
    DeletedObject(&'static str),
    #[error("vertex still has incident edges")]
    VertexHasEdges,
    #[error("edge properties are disabled in this configuration")]
    PropertiesDisabled,
    #[error("property is {actual}, expected {expected}")]
    PropertyType {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("replication rpc failed: {0}")]
    Rpc(String),
    #[error("recovery failed: {0}")]
    Recovery(String),
}

impl StorageError {
    /// Serialization conflicts are the only errors a caller should handle by
    /// aborting and re-running the whole transaction.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict)
    }
}
