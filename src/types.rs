use std::fmt;

/// Stable 64-bit id assigned to every vertex and edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gid(pub u64);

impl Gid {
    pub const fn from_u64(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LabelId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropertyKeyId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeTypeId(pub u64);

/// Which state of the database a read observes.
///
/// `Old` hides the effects of the reader's current command; `New` shows
/// them. Both respect the transaction snapshot for everyone else's writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Old,
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// The snapshot is fixed at `begin` for the transaction's lifetime.
    SnapshotIsolation,
    /// The snapshot is refreshed at every command boundary.
    ReadCommitted,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::SnapshotIsolation
    }
}

/// One slot in a vertex adjacency list: edge type, the vertex on the other
/// side, and the edge object itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AdjacencyEntry {
    pub edge_type: EdgeTypeId,
    pub peer: Gid,
    pub edge: Gid,
}

impl AdjacencyEntry {
    pub const fn new(edge_type: EdgeTypeId, peer: Gid, edge: Gid) -> Self {
        Self {
            edge_type,
            peer,
            edge,
        }
    }
}

/// Commit timestamps start here; 0 is never a valid commit timestamp so it
/// can act as a sentinel in durability metadata.
pub const TIMESTAMP_INITIAL_ID: u64 = 0;

/// Transaction ids live in the upper half of the u64 space so a delta
/// timestamp cell always tells apart "still owned by a transaction" from
/// "committed at this timestamp" without consulting any registry.
pub const TRANSACTION_INITIAL_ID: u64 = 1 << 63;
