//! String-keyed maps.
//!
//! A `Map<V>` field is stored as one synthetic object owned by the
//! referencing object. Domain values are linked through the hidden
//! `$entries` role with the entry name in the linker's `LinkExtra`; scalar
//! values live in the parallel `$keys` / `$values` list properties.

use super::Mechanic;
use crate::domain::{Binding, Multiplicity, RealizedDomain};
use crate::materialize::Materializer;
use crate::object::FieldValue;
use crate::oplink::{OpLinkBuilder, OpLinkGraph, OpLinkNode, OpNodeId};
use crate::primitives::{MAP_DOMAIN, MAP_ENTRIES, MAP_KEYS, MAP_VALUES};
use crate::savelink::{PlanBuilder, PlanLink, PlanNodeId, check_scalar};
use crate::types::{Direction, DomainObject, MeshError};
use crate::value::{ScalarType, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct MapMechanic;

impl Mechanic for MapMechanic {
    fn name(&self) -> &'static str {
        "map"
    }

    fn expand(
        &self,
        builder: &mut OpLinkBuilder<'_>,
        node: OpNodeId,
        realized: &Arc<RealizedDomain>,
    ) -> Result<(), MeshError> {
        let value = realized
            .argument(0)
            .cloned()
            .ok_or_else(|| MeshError::UnresolvedGeneric {
                domain: MAP_DOMAIN.to_string(),
                param: "V".to_string(),
            })?;
        match value {
            Binding::Scalar(ty) => {
                builder.add_scalar(node, MAP_KEYS, ScalarType::Str, Multiplicity::Many);
                builder.add_scalar(node, MAP_VALUES, ty, Multiplicity::Many);
            }
            Binding::Domain(target) => {
                let to = builder.expand_target(target)?;
                builder.add_link(OpLinkNode {
                    property: MAP_ENTRIES.to_string(),
                    member: MAP_ENTRIES.to_string(),
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
        let entries = match value {
            FieldValue::Null => return Ok(()),
            FieldValue::Entries(entries) => entries,
            other => {
                return Err(MeshError::InvalidValue {
                    member: link.property.clone(),
                    reason: format!("expected map entries, found {other:?}"),
                });
            }
        };
        let map_node = shape.domain(link.to)?;
        let map = planner.add_derived(Arc::clone(&map_node.realized), owner, &link.property);
        planner.connect(map, PlanLink::through(owner, link))?;

        if let Some(entry_link) = shape.link_for(link.to, MAP_ENTRIES)? {
            let entry_link = shape.link(entry_link)?;
            planner.reset(map, shape, entry_link)?;
            for (name, entry) in entries {
                let FieldValue::Ref(id) = entry else {
                    return Err(MeshError::InvalidValue {
                        member: format!("{}[{name}]", link.property),
                        reason: format!("expected a reference, found {entry:?}"),
                    });
                };
                let child = planner.add_object(*id, shape, entry_link.to)?;
                let mut plan_link = PlanLink::through(map, entry_link);
                plan_link.extra = Some(name.clone());
                planner.connect(child, plan_link)?;
            }
            return Ok(());
        }

        let value_type = map_node
            .scalars
            .iter()
            .find(|s| s.name == MAP_VALUES)
            .map(|s| s.ty);
        let mut keys = Vec::with_capacity(entries.len());
        let mut values = Vec::with_capacity(entries.len());
        for (name, entry) in entries {
            let FieldValue::Scalar(v) = entry else {
                return Err(MeshError::InvalidValue {
                    member: format!("{}[{name}]", link.property),
                    reason: format!("expected a scalar, found {entry:?}"),
                });
            };
            if let Some(ty) = value_type {
                check_scalar(&link.property, ty, v)?;
            }
            keys.push(Value::Str(name.clone()));
            values.push(v.clone());
        }
        planner.set_value(map, MAP_KEYS, Value::List(keys))?;
        planner.set_value(map, MAP_VALUES, Value::List(values))
    }

    fn attach(
        &self,
        materializer: &mut Materializer<'_>,
        node: OpNodeId,
        object: &DomainObject,
    ) -> Result<FieldValue, MeshError> {
        let shape = materializer.shape();
        let mut entries = BTreeMap::new();
        let Some(entry_link) = shape.link_for(node, MAP_ENTRIES)? else {
            if let (Some(Value::List(keys)), Some(Value::List(values))) =
                (object.values.get(MAP_KEYS), object.values.get(MAP_VALUES))
            {
                for (name, value) in keys.iter().zip(values) {
                    if let Some(name) = name.as_str() {
                        entries.insert(name.to_string(), FieldValue::Scalar(value.clone()));
                    }
                }
            }
            return Ok(FieldValue::Entries(entries));
        };

        let entry_link = shape.link(entry_link)?;
        for linker in materializer.linkers(&object.key, entry_link) {
            let Some(name) = linker.extra.clone() else {
                continue;
            };
            if let Some(id) = materializer.instance(entry_link.to, &linker.t_key)? {
                entries.insert(name, FieldValue::Ref(id));
            }
        }
        Ok(FieldValue::Entries(entries))
    }
}
