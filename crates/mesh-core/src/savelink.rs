//! # Write Plans
//!
//! Flattens a caller object graph into an ordered [`WritePlan`]: one
//! [`PlanNode`] per distinct instance (plus any synthetic nodes mechanics
//! introduce), each carrying its property values and the links that attach
//! it to the node that referenced it.
//!
//! ## Identity
//!
//! Instances are registered by [`ObjectId`] before their fields are walked.
//! A second reference to the same instance, including one reached through a
//! cycle, returns the existing node and only records another link.
//!
//! ## Execution
//!
//! The plan decides nothing about create versus update beyond what a key
//! already says. The repository executes it in two phases: node writes
//! first, then resets and links, since links reference keys that must
//! already exist.

use crate::domain::{Catalog, RealizedDomain};
use crate::key::MeshKey;
use crate::mechanic::Mechanics;
use crate::object::{FieldValue, ObjectGraph, ObjectId};
use crate::oplink::{OpLinkGraph, OpLinkNode, OpNodeId, ScalarMember};
use crate::types::{Direction, MeshError};
use crate::value::{ScalarType, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlanNodeId(pub usize);

/// How a node's key is obtained at execution time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanKey {
    /// Caller supplied; insert or update after an existence check.
    Existing(MeshKey),
    /// Assigned by the value service on create.
    Fresh,
    /// Synthetic object keyed by its owner and the owner's member.
    Derived { owner: PlanNodeId, member: String },
}

/// Link from a node to the node that referenced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanLink {
    pub parent: PlanNodeId,
    /// S-side role.
    pub member: String,
    pub t_member: String,
    pub direction: Direction,
    pub exclusive: bool,
    pub extra: Option<String>,
}

impl PlanLink {
    /// Link mirroring an op-graph step.
    #[must_use]
    pub fn through(parent: PlanNodeId, link: &OpLinkNode) -> Self {
        Self {
            parent,
            member: link.member.clone(),
            t_member: link.t_member.clone(),
            direction: link.direction,
            exclusive: link.exclusive(),
            extra: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanNode {
    pub realized: Arc<RealizedDomain>,
    /// Caller instance this node writes back to.
    pub source: Option<ObjectId>,
    pub key: PlanKey,
    pub values: BTreeMap<String, Value>,
    /// Scalar members explicitly set to null on a stored object.
    pub cleared: BTreeSet<String>,
    /// First node that referenced this one.
    pub parent: Option<PlanNodeId>,
    pub links: Vec<PlanLink>,
}

/// Remove every stored link of `node` through `member` before relinking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanReset {
    pub node: PlanNodeId,
    pub member: String,
    pub direction: Direction,
    /// Realized domain on the other end.
    pub other: MeshKey,
}

/// A flattened write plan.
#[derive(Debug, Clone, Default)]
pub struct WritePlan {
    pub nodes: Vec<PlanNode>,
    pub resets: Vec<PlanReset>,
    pub roots: Vec<PlanNodeId>,
}

impl WritePlan {
    pub fn node(&self, id: PlanNodeId) -> Result<&PlanNode, MeshError> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| MeshError::InvalidRequest(format!("no plan node {}", id.0)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Caller instances covered by the plan, in node order.
    pub fn sources(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.nodes.iter().filter_map(|n| n.source)
    }

    /// Total number of link operations.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.nodes.iter().map(|n| n.links.len()).sum()
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Accept a scalar for a member or explain why not.
pub(crate) fn check_scalar(member: &str, ty: ScalarType, value: &Value) -> Result<(), MeshError> {
    if ty.accepts(value) {
        Ok(())
    } else {
        Err(MeshError::InvalidValue {
            member: member.to_string(),
            reason: format!("expected {ty}, found {value:?}"),
        })
    }
}

/// Builds a [`WritePlan`] over one caller object graph.
pub struct PlanBuilder<'a> {
    objects: &'a ObjectGraph,
    catalog: &'a Catalog,
    mechanics: &'a Mechanics,
    plan: WritePlan,
    identity: BTreeMap<ObjectId, PlanNodeId>,
}

impl<'a> PlanBuilder<'a> {
    #[must_use]
    pub fn new(objects: &'a ObjectGraph, catalog: &'a Catalog, mechanics: &'a Mechanics) -> Self {
        Self {
            objects,
            catalog,
            mechanics,
            plan: WritePlan::default(),
            identity: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn objects(&self) -> &'a ObjectGraph {
        self.objects
    }

    /// Plan a root instance against its shape.
    pub fn add_root(&mut self, id: ObjectId, shape: &Arc<OpLinkGraph>) -> Result<PlanNodeId, MeshError> {
        let node = self.add_object(id, shape, shape.root())?;
        if !self.plan.roots.contains(&node) {
            self.plan.roots.push(node);
        }
        Ok(node)
    }

    /// Plan an instance as op node `op`, reusing its node if already planned.
    pub fn add_object(
        &mut self,
        id: ObjectId,
        shape: &Arc<OpLinkGraph>,
        op: OpNodeId,
    ) -> Result<PlanNodeId, MeshError> {
        if let Some(existing) = self.identity.get(&id) {
            return Ok(*existing);
        }
        let objects = self.objects;
        let instance = objects
            .get(id)
            .ok_or_else(|| MeshError::InvalidRequest(format!("no instance {}", id.0)))?;
        let domain = shape.domain(op)?;

        let roles = self.catalog.roles(&instance.type_name)?;
        let key = match (&instance.key, roles.key.as_deref().and_then(|m| instance.scalar(m))) {
            (Some(key), _) => PlanKey::Existing(key.clone()),
            (None, Some(Value::Key(key))) if !key.is_null() => PlanKey::Existing(key.clone()),
            (None, Some(Value::Str(text))) if !text.is_empty() => PlanKey::Existing(MeshKey::from_str(text)?),
            _ => PlanKey::Fresh,
        };
        let fresh = key == PlanKey::Fresh;

        let node = PlanNodeId(self.plan.nodes.len());
        self.plan.nodes.push(PlanNode {
            realized: Arc::clone(&domain.realized),
            source: Some(id),
            key,
            values: BTreeMap::new(),
            cleared: BTreeSet::new(),
            parent: None,
            links: Vec::new(),
        });
        self.identity.insert(id, node);

        for member in &domain.scalars {
            let field = instance.field(&member.name);
            if let Some(value) = scalar_field(member, field)? {
                self.set_value(node, &member.name, value)?;
            } else if !fresh && matches!(field, Some(FieldValue::Null)) {
                self.node_mut(node)?.cleared.insert(member.name.clone());
            }
        }

        for link_id in &domain.links {
            let link = shape.link(*link_id)?;
            let Some(field) = instance.field(&link.property) else {
                continue;
            };
            if !fresh {
                self.reset(node, shape, link)?;
            }
            let target = shape.domain(link.to)?;
            if let Some(mechanic) = self.mechanics.get(&target.realized.domain.key)? {
                mechanic.plan(self, node, shape, link, field)?;
                continue;
            }
            match field {
                FieldValue::Null | FieldValue::Ref(_) | FieldValue::Refs(_) => {}
                other => {
                    return Err(MeshError::InvalidValue {
                        member: link.property.clone(),
                        reason: format!("expected a reference, found {other:?}"),
                    });
                }
            }
            for child in field.refs() {
                let child = self.add_object(child, shape, link.to)?;
                self.connect(child, PlanLink::through(node, link))?;
            }
        }
        Ok(node)
    }

    /// A synthetic node whose key derives from `owner` and `member`.
    pub fn add_derived(
        &mut self,
        realized: Arc<RealizedDomain>,
        owner: PlanNodeId,
        member: &str,
    ) -> PlanNodeId {
        let node = PlanNodeId(self.plan.nodes.len());
        self.plan.nodes.push(PlanNode {
            realized,
            source: None,
            key: PlanKey::Derived {
                owner,
                member: member.to_string(),
            },
            values: BTreeMap::new(),
            cleared: BTreeSet::new(),
            parent: None,
            links: Vec::new(),
        });
        node
    }

    pub fn set_value(&mut self, node: PlanNodeId, member: &str, value: Value) -> Result<(), MeshError> {
        self.node_mut(node)?.values.insert(member.to_string(), value);
        Ok(())
    }

    /// Attach `child` to `link.parent`.
    pub fn connect(&mut self, child: PlanNodeId, link: PlanLink) -> Result<(), MeshError> {
        let node = self.node_mut(child)?;
        if node.parent.is_none() {
            node.parent = Some(link.parent);
        }
        if !node.links.contains(&link) {
            node.links.push(link);
        }
        Ok(())
    }

    /// Schedule removal of `node`'s stored links through `link`.
    pub fn reset(&mut self, node: PlanNodeId, shape: &OpLinkGraph, link: &OpLinkNode) -> Result<(), MeshError> {
        let reset = PlanReset {
            node,
            member: link.member.clone(),
            direction: link.direction,
            other: shape.domain(link.to)?.realized.key.clone(),
        };
        if !self.plan.resets.contains(&reset) {
            self.plan.resets.push(reset);
        }
        Ok(())
    }

    #[must_use]
    pub fn finish(self) -> WritePlan {
        debug!(
            nodes = self.plan.nodes.len(),
            resets = self.plan.resets.len(),
            links = self.plan.link_count(),
            "Built write plan"
        );
        self.plan
    }

    fn node_mut(&mut self, id: PlanNodeId) -> Result<&mut PlanNode, MeshError> {
        self.plan
            .nodes
            .get_mut(id.0)
            .ok_or_else(|| MeshError::InvalidRequest(format!("no plan node {}", id.0)))
    }
}

/// Stored value of a scalar member, checked against its type.
fn scalar_field(member: &ScalarMember, field: Option<&FieldValue>) -> Result<Option<Value>, MeshError> {
    match field {
        None | Some(FieldValue::Null) => Ok(None),
        Some(FieldValue::Scalar(value)) => {
            check_scalar(&member.name, member.ty, value)?;
            Ok(Some(value.clone()))
        }
        Some(FieldValue::Values(values)) => {
            for value in values {
                check_scalar(&member.name, member.ty, value)?;
            }
            Ok(Some(Value::List(values.clone())))
        }
        Some(other) => Err(MeshError::InvalidValue {
            member: member.name.clone(),
            reason: format!("expected a scalar, found {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Domain, Property, TypeMapping, TypeRef};
    use crate::object::Instance;
    use crate::oplink::OpLinkBuilder;

    fn setup() -> (Catalog, Mechanics, Arc<OpLinkGraph>) {
        let catalog = Catalog::new();
        let mechanics = Mechanics::with_builtins();
        catalog
            .register_type(
                TypeMapping::builder("Person")
                    .scalar("name", ScalarType::Str)
                    .many("friends", TypeRef::domain("Person"))
                    .key("id")
                    .build()
                    .expect("person"),
            )
            .expect("register");
        let root = catalog.realize_type("Person").expect("realize");
        let shape = OpLinkBuilder::build(&catalog, &mechanics, root, Some("Person".into())).expect("shape");
        (catalog, mechanics, Arc::new(shape))
    }

    #[test]
    fn shared_references_plan_once() {
        let (catalog, mechanics, shape) = setup();
        let mut objects = ObjectGraph::new();
        let carol = objects.add(Instance::new("Person").with("name", "Carol"));
        let alice = objects.add(
            Instance::new("Person")
                .with("name", "Alice")
                .with_field("friends", FieldValue::Refs(vec![carol])),
        );
        let bob = objects.add(
            Instance::new("Person")
                .with("name", "Bob")
                .with_field("friends", FieldValue::Refs(vec![carol, alice])),
        );

        let mut planner = PlanBuilder::new(&objects, &catalog, &mechanics);
        planner.add_root(alice, &shape).expect("alice");
        planner.add_root(bob, &shape).expect("bob");
        let plan = planner.finish();

        assert_eq!(plan.len(), 3);
        assert_eq!(plan.roots.len(), 2);
        let carol_node = plan.nodes.iter().find(|n| n.source == Some(carol)).expect("carol");
        assert_eq!(carol_node.links.len(), 2);
        assert!(plan.resets.is_empty());
    }

    #[test]
    fn cycles_terminate() {
        let (catalog, mechanics, shape) = setup();
        let mut objects = ObjectGraph::new();
        let a = objects.add(Instance::new("Person").with("name", "A"));
        let b = objects.add(
            Instance::new("Person")
                .with("name", "B")
                .with_field("friends", FieldValue::Refs(vec![a])),
        );
        objects.set(a, "friends", FieldValue::Refs(vec![b]));

        let mut planner = PlanBuilder::new(&objects, &catalog, &mechanics);
        planner.add_root(a, &shape).expect("plan");
        let plan = planner.finish();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.link_count(), 2);
    }

    #[test]
    fn known_keys_are_existing_and_reset() {
        let (catalog, mechanics, shape) = setup();
        let mut objects = ObjectGraph::new();
        let key = MeshKey::with_part("Unique", "alice");
        let alice = objects.add(
            Instance::new("Person")
                .with("name", "Alice")
                .with("id", Value::Key(key.clone()))
                .with_field("friends", FieldValue::Refs(vec![])),
        );
        let mut planner = PlanBuilder::new(&objects, &catalog, &mechanics);
        let node = planner.add_root(alice, &shape).expect("plan");
        let plan = planner.finish();
        assert_eq!(plan.node(node).expect("node").key, PlanKey::Existing(key));
        assert_eq!(plan.resets.len(), 1);
        assert_eq!(plan.resets[0].member, "friends");
    }

    #[test]
    fn null_scalars_clear_stored_objects_only() {
        let (catalog, mechanics, shape) = setup();
        let mut objects = ObjectGraph::new();
        let known = objects.add(
            Instance::new("Person")
                .with("id", Value::Key(MeshKey::with_part("Unique", "alice")))
                .with_field("name", FieldValue::Null),
        );
        let fresh = objects.add(Instance::new("Person").with_field("name", FieldValue::Null));

        let mut planner = PlanBuilder::new(&objects, &catalog, &mechanics);
        let known = planner.add_root(known, &shape).expect("known");
        let fresh = planner.add_root(fresh, &shape).expect("fresh");
        let plan = planner.finish();

        let known = plan.node(known).expect("node");
        assert!(known.cleared.contains("name"));
        assert!(!known.values.contains_key("name"));
        assert!(plan.node(fresh).expect("node").cleared.is_empty());
    }

    #[test]
    fn scalar_types_are_checked() {
        let (catalog, mechanics, shape) = setup();
        let mut objects = ObjectGraph::new();
        let bad = objects.add(Instance::new("Person").with("name", 42_i64));
        let mut planner = PlanBuilder::new(&objects, &catalog, &mechanics);
        assert!(matches!(
            planner.add_root(bad, &shape),
            Err(MeshError::InvalidValue { .. })
        ));
    }

    #[test]
    fn set_fields_plan_a_derived_node() {
        let catalog = Catalog::new();
        let mechanics = Mechanics::with_builtins();
        catalog
            .register_domain(Domain::new("Tagged").with_property(Property::one(
                "labels",
                TypeRef::generic_domain("Set", vec![TypeRef::Scalar(ScalarType::Str)]),
            )))
            .expect("domain");
        let root = catalog.realize("Tagged", vec![]).expect("realize");
        let shape = Arc::new(OpLinkBuilder::build(&catalog, &mechanics, root, None).expect("shape"));

        let mut objects = ObjectGraph::new();
        let id = objects.add(Instance::new("Tagged").with_field(
            "labels",
            FieldValue::Values(vec![Value::str("a"), Value::str("b"), Value::str("a")]),
        ));
        let mut planner = PlanBuilder::new(&objects, &catalog, &mechanics);
        let owner = planner.add_root(id, &shape).expect("plan");
        let plan = planner.finish();

        assert_eq!(plan.len(), 2);
        let set = &plan.nodes[1];
        assert_eq!(
            set.key,
            PlanKey::Derived {
                owner,
                member: "labels".into()
            }
        );
        assert_eq!(
            set.values.get(crate::primitives::SET_ITEMS),
            Some(&Value::List(vec![Value::str("a"), Value::str("b")]))
        );
        assert!(set.links[0].exclusive);
    }
}
