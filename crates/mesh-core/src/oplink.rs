//! # Operation-Link Graph
//!
//! The static traversal shape of a realized domain: which members lead to
//! which linked realized domains, and which members are plain scalars.
//!
//! The graph is an arena addressed by [`OpNodeId`] / [`OpLinkId`]. Each
//! realized-domain key maps to exactly one domain node; reaching a key that
//! is already present reuses its node and stops expanding, which is what
//! terminates self- and mutually-referential shapes. Domains owned by a
//! mechanic delegate their expansion to it.
//!
//! Graphs are built once per root and cached by the repository.

use crate::domain::{Binding, Catalog, Multiplicity, RealizedDomain};
use crate::key::MeshKey;
use crate::mechanic::Mechanics;
use crate::types::{Direction, MeshError};
use crate::value::ScalarType;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpNodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpLinkId(pub usize);

/// A scalar member of a domain node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalarMember {
    pub name: String,
    pub ty: ScalarType,
    pub multiplicity: Multiplicity,
}

/// One realized domain in the shape.
#[derive(Debug, Clone)]
pub struct OpDomainNode {
    pub realized: Arc<RealizedDomain>,
    /// Source type hint, when one is registered for this domain.
    pub source: Option<String>,
    pub scalars: Vec<ScalarMember>,
    pub links: Vec<OpLinkId>,
}

/// One traversal step between two domain nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpLinkNode {
    /// Member name on the `from` domain.
    pub property: String,
    /// S-side role of the stored relationship.
    pub member: String,
    /// T-side role of the stored relationship (empty when undeclared).
    pub t_member: String,
    pub direction: Direction,
    pub multiplicity: Multiplicity,
    pub from: OpNodeId,
    pub to: OpNodeId,
}

impl OpLinkNode {
    /// Single-valued owning links replace any previous target.
    #[must_use]
    pub fn exclusive(&self) -> bool {
        self.multiplicity == Multiplicity::One && self.direction == Direction::Forward
    }
}

/// Arena of domain and link nodes reachable from one root.
#[derive(Debug, Clone)]
pub struct OpLinkGraph {
    root: OpNodeId,
    domains: Vec<OpDomainNode>,
    links: Vec<OpLinkNode>,
    index: BTreeMap<MeshKey, OpNodeId>,
}

impl OpLinkGraph {
    #[must_use]
    pub fn root(&self) -> OpNodeId {
        self.root
    }

    pub fn domain(&self, id: OpNodeId) -> Result<&OpDomainNode, MeshError> {
        self.domains
            .get(id.0)
            .ok_or_else(|| MeshError::InvalidRequest(format!("no operation node {}", id.0)))
    }

    pub fn link(&self, id: OpLinkId) -> Result<&OpLinkNode, MeshError> {
        self.links
            .get(id.0)
            .ok_or_else(|| MeshError::InvalidRequest(format!("no operation link {}", id.0)))
    }

    /// Node for a realized-domain key.
    #[must_use]
    pub fn find(&self, realized: &MeshKey) -> Option<OpNodeId> {
        self.index.get(realized).copied()
    }

    /// Link leaving `node` through `property`.
    pub fn link_for(&self, node: OpNodeId, property: &str) -> Result<Option<OpLinkId>, MeshError> {
        Ok(self
            .domain(node)?
            .links
            .iter()
            .copied()
            .find(|id| self.links.get(id.0).is_some_and(|l| l.property == property)))
    }

    /// Node ids in creation order (root first).
    pub fn node_ids(&self) -> impl Iterator<Item = OpNodeId> {
        (0..self.domains.len()).map(OpNodeId)
    }

    /// Link ids in creation order.
    pub fn link_ids(&self) -> impl Iterator<Item = OpLinkId> {
        (0..self.links.len()).map(OpLinkId)
    }

    #[must_use]
    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Expands realized domains into an [`OpLinkGraph`].
pub struct OpLinkBuilder<'a> {
    catalog: &'a Catalog,
    mechanics: &'a Mechanics,
    domains: Vec<OpDomainNode>,
    links: Vec<OpLinkNode>,
    index: BTreeMap<MeshKey, OpNodeId>,
}

impl<'a> OpLinkBuilder<'a> {
    /// Build the graph rooted at `root`.
    pub fn build(
        catalog: &'a Catalog,
        mechanics: &'a Mechanics,
        root: Arc<RealizedDomain>,
        source: Option<String>,
    ) -> Result<OpLinkGraph, MeshError> {
        let mut builder = Self {
            catalog,
            mechanics,
            domains: Vec::new(),
            links: Vec::new(),
            index: BTreeMap::new(),
        };
        let root_id = builder.expand(Arc::clone(&root), source)?;
        debug!(
            root = %root,
            domains = builder.domains.len(),
            links = builder.links.len(),
            "Built operation-link graph"
        );
        Ok(OpLinkGraph {
            root: root_id,
            domains: builder.domains,
            links: builder.links,
            index: builder.index,
        })
    }

    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        self.catalog
    }

    /// Node for `realized`, expanding it on first sight.
    pub fn expand(
        &mut self,
        realized: Arc<RealizedDomain>,
        source: Option<String>,
    ) -> Result<OpNodeId, MeshError> {
        if let Some(existing) = self.index.get(&realized.key) {
            return Ok(*existing);
        }

        let id = OpNodeId(self.domains.len());
        self.index.insert(realized.key.clone(), id);
        self.domains.push(OpDomainNode {
            realized: Arc::clone(&realized),
            source,
            scalars: Vec::new(),
            links: Vec::new(),
        });

        match self.mechanics.get(&realized.domain.key)? {
            Some(mechanic) => mechanic.expand(self, id, &realized)?,
            None => self.expand_properties(id, &realized)?,
        }
        Ok(id)
    }

    /// Expand a realized domain's target, with its registered source type.
    pub fn expand_target(&mut self, target: Arc<RealizedDomain>) -> Result<OpNodeId, MeshError> {
        if let Some(existing) = self.index.get(&target.key) {
            return Ok(*existing);
        }
        let source = self.catalog.source_type(&target)?;
        self.expand(target, source)
    }

    /// Default property walk.
    fn expand_properties(&mut self, id: OpNodeId, realized: &RealizedDomain) -> Result<(), MeshError> {
        for property in &realized.domain.properties {
            match self.catalog.resolve(&property.ty, Some(realized))? {
                Binding::Scalar(ty) => self.add_scalar(id, &property.name, ty, property.multiplicity),
                Binding::Domain(target) => {
                    let (member, t_member, direction) = match &property.inverse {
                        Some(role) => (role.clone(), property.name.clone(), Direction::Reverse),
                        None => {
                            let t_member = target
                                .domain
                                .properties
                                .iter()
                                .find(|p| p.inverse.as_deref() == Some(property.name.as_str()))
                                .map(|p| p.name.clone())
                                .unwrap_or_default();
                            (property.name.clone(), t_member, Direction::Forward)
                        }
                    };
                    let child = self.expand_target(target)?;
                    self.add_link(OpLinkNode {
                        property: property.name.clone(),
                        member,
                        t_member,
                        direction,
                        multiplicity: property.multiplicity,
                        from: id,
                        to: child,
                    });
                }
            }
        }
        Ok(())
    }

    /// Record a scalar member.
    pub fn add_scalar(&mut self, node: OpNodeId, name: &str, ty: ScalarType, multiplicity: Multiplicity) {
        if let Some(domain) = self.domains.get_mut(node.0) {
            domain.scalars.push(ScalarMember {
                name: name.to_string(),
                ty,
                multiplicity,
            });
        }
    }

    /// Record a link under its `from` node.
    pub fn add_link(&mut self, link: OpLinkNode) -> OpLinkId {
        let id = OpLinkId(self.links.len());
        if let Some(domain) = self.domains.get_mut(link.from.0) {
            domain.links.push(id);
        }
        self.links.push(link);
        id
    }
}
