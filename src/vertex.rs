//! Current-version vertex record plus the head of its delta chain.

use std::collections::BTreeMap;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::delta::Delta;
use crate::property::PropertyValue;
use crate::types::{AdjacencyEntry, Gid, LabelId, PropertyKeyId};

#[derive(Debug, Clone)]
pub struct Vertex {
    pub gid: Gid,
    /// Kept sorted so label membership is a binary search.
    pub labels: SmallVec<[LabelId; 4]>,
    pub properties: BTreeMap<PropertyKeyId, PropertyValue>,
    pub in_edges: Vec<AdjacencyEntry>,
    pub out_edges: Vec<AdjacencyEntry>,
    pub deleted: bool,
    pub delta_head: Option<Arc<Delta>>,
}

impl Vertex {
    pub fn new(gid: Gid) -> Self {
        Self {
            gid,
            labels: SmallVec::new(),
            properties: BTreeMap::new(),
            in_edges: Vec::new(),
            out_edges: Vec::new(),
            deleted: false,
            delta_head: None,
        }
    }

    pub fn has_label(&self, label: LabelId) -> bool {
        self.labels.binary_search(&label).is_ok()
    }

    /// Inserts keeping the sort order; returns false if already present.
    pub fn add_label(&mut self, label: LabelId) -> bool {
        match self.labels.binary_search(&label) {
            Ok(_) => false,
            Err(pos) => {
                self.labels.insert(pos, label);
                true
            }
        }
    }

    pub fn remove_label(&mut self, label: LabelId) -> bool {
        match self.labels.binary_search(&label) {
            Ok(pos) => {
                self.labels.remove(pos);
                true
            }
            Err(_) => false,
        }
    }
}
