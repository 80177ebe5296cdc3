//! Narrow callback surface through which label/property indexes observe
//! vertex mutations. The index implementations themselves live outside
//! this crate.

use std::sync::Arc;

use crate::property::PropertyValue;
use crate::types::{Gid, LabelId, PropertyKeyId};

/// Called synchronously inside the mutating operation, with the vertex
/// lock held. Implementations must be quick and must not call back into
/// the engine.
pub trait IndexObserver: Send + Sync {
    fn on_label_added(&self, _vertex: Gid, _label: LabelId) {}
    fn on_label_removed(&self, _vertex: Gid, _label: LabelId) {}
    fn on_property_set(&self, _vertex: Gid, _key: PropertyKeyId, _value: &PropertyValue) {}
    fn on_vertex_deleted(&self, _vertex: Gid) {}
}

pub type ObserverList = Vec<Arc<dyn IndexObserver>>;
