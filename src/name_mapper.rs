//! Bidirectional mapping between textual names and numeric ids.
//!
//! Objects store labels, edge types and property keys only as ids;
//! everything user-facing resolves through this mapper. Reads are
//! lock-free via the sharded maps, writes only happen the first time a
//! name is seen.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::error::{Result, StorageError};
use crate::types::{EdgeTypeId, LabelId, PropertyKeyId};

#[derive(Debug, Default)]
pub struct NameIdMapper {
    name_to_id: DashMap<String, u64>,
    id_to_name: DashMap<u64, String>,
    next_id: AtomicU64,
}

impl NameIdMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id for `name`, allocating one on first use.
    pub fn name_to_id(&self, name: &str) -> u64 {
        if let Some(id) = self.name_to_id.get(name) {
            return *id;
        }
        // Two racing inserters may both allocate; the entry API keeps the
        // first one and the loser's id is simply never referenced.
        let id = *self
            .name_to_id
            .entry(name.to_owned())
            .or_insert_with(|| self.next_id.fetch_add(1, Ordering::AcqRel));
        self.id_to_name.entry(id).or_insert_with(|| name.to_owned());
        id
    }

    pub fn id_to_name(&self, id: u64) -> Result<String> {
        self.id_to_name
            .get(&id)
            .map(|name| name.clone())
            .ok_or(StorageError::NonexistentObject("name id"))
    }

    /// Registers a name under a fixed id, used when replaying a WAL or a
    /// replication stream that already carries the primary's mapping.
    pub fn register(&self, id: u64, name: &str) {
        self.name_to_id.insert(name.to_owned(), id);
        self.id_to_name.insert(id, name.to_owned());
        self.next_id.fetch_max(id + 1, Ordering::AcqRel);
    }

    pub fn label(&self, name: &str) -> LabelId {
        LabelId(self.name_to_id(name))
    }

    pub fn property_key(&self, name: &str) -> PropertyKeyId {
        PropertyKeyId(self.name_to_id(name))
    }

    pub fn edge_type(&self, name: &str) -> EdgeTypeId {
        EdgeTypeId(self.name_to_id(name))
    }

    pub fn label_name(&self, id: LabelId) -> Result<String> {
        self.id_to_name(id.0)
    }

    pub fn property_key_name(&self, id: PropertyKeyId) -> Result<String> {
        self.id_to_name(id.0)
    }

    pub fn edge_type_name(&self, id: EdgeTypeId) -> Result<String> {
        self.id_to_name(id.0)
    }

    /// All `(id, name)` pairs, used by the snapshot writer.
    pub fn entries(&self) -> Vec<(u64, String)> {
        let mut entries: Vec<_> = self
            .id_to_name
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }
}
