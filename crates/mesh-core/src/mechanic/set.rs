//! Unique sets.
//!
//! A `Set<T>` field is stored as one synthetic object owned by the
//! referencing object. Domain elements hang off it through the hidden
//! `$items` role; scalar elements are kept, deduplicated, in its `$items`
//! list property.

use super::Mechanic;
use crate::domain::{Binding, Multiplicity, RealizedDomain};
use crate::materialize::Materializer;
use crate::object::FieldValue;
use crate::oplink::{OpLinkBuilder, OpLinkGraph, OpLinkNode, OpNodeId};
use crate::primitives::{SET_DOMAIN, SET_ITEMS};
use crate::savelink::{PlanBuilder, PlanLink, PlanNodeId, check_scalar};
use crate::types::{Direction, DomainObject, MeshError};
use crate::value::Value;
use std::sync::Arc;

fn element(realized: &RealizedDomain) -> Result<Binding, MeshError> {
    realized
        .argument(0)
        .cloned()
        .ok_or_else(|| MeshError::UnresolvedGeneric {
            domain: SET_DOMAIN.to_string(),
            param: "T".to_string(),
        })
}

/// Keep the first occurrence of each value.
fn dedup(values: &[Value]) -> Vec<Value> {
    let mut unique: Vec<Value> = Vec::with_capacity(values.len());
    for value in values {
        if !unique.contains(value) {
            unique.push(value.clone());
        }
    }
    unique
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SetMechanic;

impl Mechanic for SetMechanic {
    fn name(&self) -> &'static str {
        "set"
    }

    fn expand(
        &self,
        builder: &mut OpLinkBuilder<'_>,
        node: OpNodeId,
        realized: &Arc<RealizedDomain>,
    ) -> Result<(), MeshError> {
        match element(realized)? {
            Binding::Scalar(ty) => builder.add_scalar(node, SET_ITEMS, ty, Multiplicity::Many),
            Binding::Domain(target) => {
                let to = builder.expand_target(target)?;
                builder.add_link(OpLinkNode {
                    property: SET_ITEMS.to_string(),
                    member: SET_ITEMS.to_string(),
                    t_member: String::new(),
                    direction: Direction::Forward,
                    multiplicity: Multiplicity::Many,
                    from: node,
                    to,
                });
            }
        }
        Ok(())
    }

    fn plan(
        &self,
        planner: &mut PlanBuilder<'_>,
        owner: PlanNodeId,
        shape: &Arc<OpLinkGraph>,
        link: &OpLinkNode,
        value: &FieldValue,
    ) -> Result<(), MeshError> {
        if *value == FieldValue::Null {
            return Ok(());
        }
        let set_node = shape.domain(link.to)?;
        let set = planner.add_derived(Arc::clone(&set_node.realized), owner, &link.property);
        planner.connect(set, PlanLink::through(owner, link))?;

        if let Some(items) = shape.link_for(link.to, SET_ITEMS)? {
            let items = shape.link(items)?;
            planner.reset(set, shape, items)?;
            if !matches!(value, FieldValue::Ref(_) | FieldValue::Refs(_)) {
                return Err(MeshError::InvalidValue {
                    member: link.property.clone(),
                    reason: format!("expected set elements by reference, found {value:?}"),
                });
            }
            for id in value.refs() {
                let child = planner.add_object(id, shape, items.to)?;
                planner.connect(child, PlanLink::through(set, items))?;
            }
            return Ok(());
        }

        let FieldValue::Values(values) = value else {
            return Err(MeshError::InvalidValue {
                member: link.property.clone(),
                reason: format!("expected scalar set elements, found {value:?}"),
            });
        };
        if let Some(member) = set_node.scalars.iter().find(|s| s.name == SET_ITEMS) {
            for v in values {
                check_scalar(&link.property, member.ty, v)?;
            }
        }
        planner.set_value(set, SET_ITEMS, Value::List(dedup(values)))
    }

    fn attach(
        &self,
        materializer: &mut Materializer<'_>,
        node: OpNodeId,
        object: &DomainObject,
    ) -> Result<FieldValue, MeshError> {
        let shape = materializer.shape();
        let Some(items) = shape.link_for(node, SET_ITEMS)? else {
            return Ok(match object.values.get(SET_ITEMS) {
                Some(Value::List(values)) => FieldValue::Values(values.clone()),
                _ => FieldValue::Values(Vec::new()),
            });
        };
        let items = shape.link(items)?;
        let mut ids = Vec::new();
        for key in materializer.linked_keys(&object.key, items) {
            if let Some(id) = materializer.instance(items.to, &key)? {
                ids.push(id);
            }
        }
        Ok(FieldValue::Refs(ids))
    }
}
