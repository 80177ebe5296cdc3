//! Current-version edge record plus the head of its delta chain.
//!
//! The property map is only populated when the engine is configured with
//! `items.properties_on_edges`; endpoints live in the vertices' adjacency
//! lists, not here.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::delta::Delta;
use crate::property::PropertyValue;
use crate::types::{EdgeTypeId, Gid, PropertyKeyId};

#[derive(Debug, Clone)]
pub struct Edge {
    pub gid: Gid,
    pub edge_type: EdgeTypeId,
    pub from: Gid,
    pub to: Gid,
    pub properties: BTreeMap<PropertyKeyId, PropertyValue>,
    pub deleted: bool,
    pub delta_head: Option<Arc<Delta>>,
}

impl Edge {
    pub fn new(gid: Gid, edge_type: EdgeTypeId, from: Gid, to: Gid) -> Self {
        Self {
            gid,
            edge_type,
            from,
            to,
            properties: BTreeMap::new(),
            deleted: false,
            delta_head: None,
        }
    }
}
