//! # Caller Object Graph
//!
//! Caller-level values handed to the write-plan builder and produced by
//! materialization. Instances live in an arena and refer to each other by
//! [`ObjectId`], so shared references and cycles need no back-pointers.

use crate::key::MeshKey;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Index of an instance inside an [`ObjectGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub usize);

/// Value of one instance field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum FieldValue {
    #[default]
    Null,
    Scalar(Value),
    /// Single domain-typed reference.
    Ref(ObjectId),
    /// Collection of domain-typed references.
    Refs(Vec<ObjectId>),
    /// Collection of scalars.
    Values(Vec<Value>),
    /// String-keyed map of scalars or references.
    Entries(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    /// Every reference reachable through this field, in order.
    #[must_use]
    pub fn refs(&self) -> Vec<ObjectId> {
        match self {
            Self::Ref(id) => vec![*id],
            Self::Refs(ids) => ids.clone(),
            Self::Entries(entries) => entries.values().flat_map(Self::refs).collect(),
            Self::Null | Self::Scalar(_) | Self::Values(_) => Vec::new(),
        }
    }
}

/// One caller-level object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Instance {
    /// Registered source type name.
    pub type_name: String,
    /// Persisted identity, once known.
    pub key: Option<MeshKey>,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Instance {
    #[must_use]
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ..Self::default()
        }
    }

    /// Builder-style scalar field.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), FieldValue::Scalar(value.into()));
        self
    }

    /// Builder-style field of any shape.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Scalar field value.
    #[must_use]
    pub fn scalar(&self, name: &str) -> Option<&Value> {
        match self.fields.get(name) {
            Some(FieldValue::Scalar(value)) => Some(value),
            _ => None,
        }
    }
}

/// Arena of instances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectGraph {
    instances: Vec<Instance>,
}

impl ObjectGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance and return its id.
    pub fn add(&mut self, instance: Instance) -> ObjectId {
        self.instances.push(instance);
        ObjectId(self.instances.len() - 1)
    }

    #[must_use]
    pub fn get(&self, id: ObjectId) -> Option<&Instance> {
        self.instances.get(id.0)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Instance> {
        self.instances.get_mut(id.0)
    }

    /// Set a field on an existing instance. Returns `false` for an unknown id.
    pub fn set(&mut self, id: ObjectId, field: impl Into<String>, value: FieldValue) -> bool {
        match self.instances.get_mut(id.0) {
            Some(instance) => {
                instance.fields.insert(field.into(), value);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Ids and instances in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &Instance)> {
        self.instances.iter().enumerate().map(|(i, inst)| (ObjectId(i), inst))
    }

    /// First instance carrying the given key.
    #[must_use]
    pub fn find(&self, key: &MeshKey) -> Option<ObjectId> {
        self.iter()
            .find(|(_, inst)| inst.key.as_ref() == Some(key))
            .map(|(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_ids_are_stable() {
        let mut graph = ObjectGraph::new();
        let tag = graph.add(Instance::new("Tag").with("label", "vip"));
        let person = graph.add(
            Instance::new("Person")
                .with("name", "Alice")
                .with_field("tags", FieldValue::Refs(vec![tag])),
        );
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.get(person).and_then(|p| p.field("tags")).map(FieldValue::refs), Some(vec![tag]));
        assert_eq!(graph.get(tag).and_then(|t| t.scalar("label")), Some(&Value::str("vip")));
    }

    #[test]
    fn cycles_are_representable() {
        let mut graph = ObjectGraph::new();
        let a = graph.add(Instance::new("Node"));
        let b = graph.add(Instance::new("Node").with_field("next", FieldValue::Ref(a)));
        assert!(graph.set(a, "next", FieldValue::Ref(b)));
        assert!(!graph.set(ObjectId(9), "next", FieldValue::Null));
        assert_eq!(graph.get(a).and_then(|n| n.field("next")), Some(&FieldValue::Ref(b)));
    }

    #[test]
    fn entries_expose_nested_refs() {
        let entries = FieldValue::Entries(BTreeMap::from([
            ("a".to_string(), FieldValue::Ref(ObjectId(1))),
            ("b".to_string(), FieldValue::Scalar(Value::I32(2))),
            ("c".to_string(), FieldValue::Ref(ObjectId(3))),
        ]));
        assert_eq!(entries.refs(), vec![ObjectId(1), ObjectId(3)]);
    }

    #[test]
    fn find_by_key() {
        let mut graph = ObjectGraph::new();
        let key = MeshKey::with_part("Unique", "x");
        let mut instance = Instance::new("Tag");
        instance.key = Some(key.clone());
        let id = graph.add(instance);
        assert_eq!(graph.find(&key), Some(id));
    }
}
