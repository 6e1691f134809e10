//! # Materialization
//!
//! Re-attaches an [`AggregateResult`] to caller-visible instances, guided by
//! the op-link graph of the requested type. Each `(op node, key)` pair
//! becomes one instance, so shared and cyclic references come back as
//! shared ids. Domains with a mechanic rebuild their own field shape.

use crate::aggregate::AggregateResult;
use crate::domain::{Catalog, Multiplicity};
use crate::key::MeshKey;
use crate::mechanic::Mechanics;
use crate::object::{FieldValue, Instance, ObjectGraph, ObjectId};
use crate::oplink::{OpLinkGraph, OpLinkNode, OpNodeId};
use crate::types::{DomainLinker, DomainObject, MeshError};
use crate::value::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Builds an [`ObjectGraph`] out of one result.
pub struct Materializer<'a> {
    shape: &'a OpLinkGraph,
    result: &'a AggregateResult,
    catalog: &'a Catalog,
    mechanics: &'a Mechanics,
    graph: ObjectGraph,
    identity: BTreeMap<(OpNodeId, MeshKey), ObjectId>,
}

impl<'a> Materializer<'a> {
    #[must_use]
    pub fn new(
        shape: &'a OpLinkGraph,
        result: &'a AggregateResult,
        catalog: &'a Catalog,
        mechanics: &'a Mechanics,
    ) -> Self {
        Self {
            shape,
            result,
            catalog,
            mechanics,
            graph: ObjectGraph::new(),
            identity: BTreeMap::new(),
        }
    }

    /// Materialize every root. Returns the graph and the root ids in order.
    pub fn run(mut self) -> Result<(ObjectGraph, Vec<ObjectId>), MeshError> {
        let result = self.result;
        let root = self.shape.root();
        let mut roots = Vec::with_capacity(result.roots.len());
        for key in &result.roots {
            if let Some(id) = self.instance(root, key)? {
                roots.push(id);
            }
        }
        debug!(roots = roots.len(), instances = self.graph.len(), "Materialized result");
        Ok((self.graph, roots))
    }

    #[must_use]
    pub fn shape(&self) -> &'a OpLinkGraph {
        self.shape
    }

    /// Linkers of `key` through an op-graph step.
    #[must_use]
    pub fn linkers(&self, key: &MeshKey, link: &OpLinkNode) -> Vec<&'a DomainLinker> {
        let result = self.result;
        result
            .linkers
            .iter()
            .filter(|l| l.s_member == link.member && l.endpoint(link.direction.parent_side()) == key)
            .collect()
    }

    /// Keys linked to `key` through an op-graph step.
    #[must_use]
    pub fn linked_keys(&self, key: &MeshKey, link: &OpLinkNode) -> Vec<MeshKey> {
        self.result.linked(key, &link.member, link.direction)
    }

    /// Instance for `key` as op node `node`, built on first request.
    /// `None` when the result holds no object for the key.
    pub fn instance(&mut self, node: OpNodeId, key: &MeshKey) -> Result<Option<ObjectId>, MeshError> {
        if let Some(id) = self.identity.get(&(node, key.clone())) {
            return Ok(Some(*id));
        }
        let result = self.result;
        let shape = self.shape;
        let Some(object) = result.object(key) else {
            return Ok(None);
        };
        let domain = shape.domain(node)?;
        let type_name = domain
            .source
            .clone()
            .unwrap_or_else(|| domain.realized.name().to_string());

        let id = self.graph.add(Instance {
            type_name: type_name.clone(),
            key: Some(key.clone()),
            fields: BTreeMap::new(),
        });
        self.identity.insert((node, key.clone()), id);

        for member in &domain.scalars {
            let field = match object.values.get(&member.name) {
                Some(Value::List(values)) if member.multiplicity == Multiplicity::Many => {
                    FieldValue::Values(values.clone())
                }
                Some(value) => FieldValue::Scalar(value.clone()),
                None => FieldValue::Null,
            };
            self.graph.set(id, member.name.as_str(), field);
        }
        self.write_roles(id, &type_name, object)?;

        for link_id in &domain.links {
            let link = shape.link(*link_id)?;
            let field = self.link_field(object, link)?;
            self.graph.set(id, link.property.as_str(), field);
        }
        Ok(Some(id))
    }

    fn link_field(&mut self, object: &DomainObject, link: &OpLinkNode) -> Result<FieldValue, MeshError> {
        let result = self.result;
        let targets = result.linked(&object.key, &link.member, link.direction);

        let shape = self.shape;
        let target_domain = &shape.domain(link.to)?.realized.domain.key;
        if let Some(mechanic) = self.mechanics.get(target_domain)? {
            return match targets.first().and_then(|k| result.object(k)) {
                Some(synthetic) => mechanic.attach(self, link.to, synthetic),
                None => Ok(FieldValue::Null),
            };
        }

        let mut ids = Vec::with_capacity(targets.len());
        for target in &targets {
            if let Some(id) = self.instance(link.to, target)? {
                ids.push(id);
            }
        }
        Ok(match link.multiplicity {
            Multiplicity::One => ids.first().map_or(FieldValue::Null, |id| FieldValue::Ref(*id)),
            Multiplicity::Many => FieldValue::Refs(ids),
        })
    }

    /// Copy key and metadata into the members the source type maps them to.
    fn write_roles(&mut self, id: ObjectId, type_name: &str, object: &DomainObject) -> Result<(), MeshError> {
        let roles = self.catalog.roles(type_name)?;
        let assignments = [
            (roles.key, Some(Value::Key(object.key.clone()))),
            (roles.created_at, object.meta.created_at.map(Value::Timestamp)),
            (roles.created_by, object.meta.created_by.clone().map(Value::Str)),
            (roles.updated_at, object.meta.updated_at.map(Value::Timestamp)),
            (roles.updated_by, object.meta.updated_by.clone().map(Value::Str)),
        ];
        for (member, value) in assignments {
            if let (Some(member), Some(value)) = (member, value) {
                self.graph.set(id, member, FieldValue::Scalar(value));
            }
        }
        Ok(())
    }
}
