//! # Aggregate Queries
//!
//! A tree-shaped request spanning several domains connected by links,
//! resolved in one logical call.
//!
//! ## Shape
//!
//! The request is an arena of [`DomainRequest`] nodes and [`LinkRequest`]
//! edges. Every node except the root is created by exactly one link (its
//! tree parent). Further links may point back at an existing node; those
//! re-entries are how recursive shapes are expressed, and the engine stops
//! them once no new keys turn up.
//!
//! ## Impositions
//!
//! `impose(imposed, imposer)` states that a key of `imposed` only qualifies
//! when `imposer`, reached through the tree path between them, has at least
//! one qualifying key. The imposer must be a descendant of the imposed node.
//!
//! ## Modules
//!
//! - `imposition` - normalizes declared impositions into the shadow map
//! - `engine` - `QueryKeyMap`, the key-set walk
//! - `result` - the loaded objects and linkers

pub mod engine;
pub mod imposition;
pub mod result;

pub use engine::{QueryConfig, QueryKeyMap, QueryKeys};
pub use imposition::{Imposition, ImpositionMap};
pub use result::AggregateResult;

use crate::key::MeshKey;
use crate::predicate::Predicate;
use crate::types::{Direction, MeshError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueryNodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueryLinkId(pub usize);

/// One domain in the request tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRequest {
    /// Realized-domain key.
    pub domain: MeshKey,
    pub filter: Option<Predicate>,
    /// Applied the first time the node is reached only.
    pub first_filter: Option<Predicate>,
    /// Link that created this node. `None` for the root.
    pub parent: Option<QueryLinkId>,
    pub links: Vec<QueryLinkId>,
    /// Nodes whose existence this node's keys must not violate.
    pub impositions: Vec<QueryNodeId>,
}

impl DomainRequest {
    fn new(domain: MeshKey, parent: Option<QueryLinkId>) -> Self {
        Self {
            domain,
            filter: None,
            first_filter: None,
            parent,
            links: Vec::new(),
            impositions: Vec::new(),
        }
    }
}

/// One link hop in the request tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRequest {
    /// S-side role.
    pub member: String,
    pub direction: Direction,
    /// Evaluated against each linker.
    pub linker_filter: Option<Predicate>,
    /// Inherited by the child's read.
    pub filter: Option<Predicate>,
    pub parent: QueryNodeId,
    pub child: QueryNodeId,
}

/// A request tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateQuery {
    root: QueryNodeId,
    nodes: Vec<DomainRequest>,
    links: Vec<LinkRequest>,
}

impl AggregateQuery {
    /// A request rooted at one realized domain.
    #[must_use]
    pub fn new(domain: MeshKey) -> Self {
        Self {
            root: QueryNodeId(0),
            nodes: vec![DomainRequest::new(domain, None)],
            links: Vec::new(),
        }
    }

    #[must_use]
    pub fn root(&self) -> QueryNodeId {
        self.root
    }

    pub fn node(&self, id: QueryNodeId) -> Result<&DomainRequest, MeshError> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| MeshError::InvalidRequest(format!("no query node {}", id.0)))
    }

    pub fn link(&self, id: QueryLinkId) -> Result<&LinkRequest, MeshError> {
        self.links
            .get(id.0)
            .ok_or_else(|| MeshError::InvalidRequest(format!("no query link {}", id.0)))
    }

    fn node_mut(&mut self, id: QueryNodeId) -> Result<&mut DomainRequest, MeshError> {
        self.nodes
            .get_mut(id.0)
            .ok_or_else(|| MeshError::InvalidRequest(format!("no query node {}", id.0)))
    }

    fn link_mut(&mut self, id: QueryLinkId) -> Result<&mut LinkRequest, MeshError> {
        self.links
            .get_mut(id.0)
            .ok_or_else(|| MeshError::InvalidRequest(format!("no query link {}", id.0)))
    }

    pub fn node_ids(&self) -> impl Iterator<Item = QueryNodeId> {
        (0..self.nodes.len()).map(QueryNodeId)
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // --- building -----------------------------------------------------------

    /// AND `filter` into a node's filter.
    pub fn filter(&mut self, node: QueryNodeId, filter: Predicate) -> Result<(), MeshError> {
        let slot = &mut self.node_mut(node)?.filter;
        *slot = Predicate::and_all([slot.take(), Some(filter)]);
        Ok(())
    }

    /// AND `filter` into a node's first-visit filter.
    pub fn first_filter(&mut self, node: QueryNodeId, filter: Predicate) -> Result<(), MeshError> {
        let slot = &mut self.node_mut(node)?.first_filter;
        *slot = Predicate::and_all([slot.take(), Some(filter)]);
        Ok(())
    }

    /// Add a link from `parent` to a new node over `domain`.
    pub fn add_link(
        &mut self,
        parent: QueryNodeId,
        member: impl Into<String>,
        direction: Direction,
        domain: MeshKey,
    ) -> Result<QueryNodeId, MeshError> {
        self.node(parent)?;
        let child = QueryNodeId(self.nodes.len());
        let link = QueryLinkId(self.links.len());
        self.nodes.push(DomainRequest::new(domain, Some(link)));
        self.push_link(parent, member.into(), direction, child);
        Ok(child)
    }

    /// Add a link from `parent` back to an existing node.
    pub fn add_link_to(
        &mut self,
        parent: QueryNodeId,
        member: impl Into<String>,
        direction: Direction,
        child: QueryNodeId,
    ) -> Result<QueryLinkId, MeshError> {
        self.node(parent)?;
        self.node(child)?;
        Ok(self.push_link(parent, member.into(), direction, child))
    }

    fn push_link(&mut self, parent: QueryNodeId, member: String, direction: Direction, child: QueryNodeId) -> QueryLinkId {
        let id = QueryLinkId(self.links.len());
        self.links.push(LinkRequest {
            member,
            direction,
            linker_filter: None,
            filter: None,
            parent,
            child,
        });
        if let Some(node) = self.nodes.get_mut(parent.0) {
            node.links.push(id);
        }
        id
    }

    /// The link that created `node`.
    pub fn parent_link(&self, node: QueryNodeId) -> Result<Option<QueryLinkId>, MeshError> {
        Ok(self.node(node)?.parent)
    }

    /// AND `filter` into the filter a link passes to its child.
    pub fn link_filter(&mut self, link: QueryLinkId, filter: Predicate) -> Result<(), MeshError> {
        let slot = &mut self.link_mut(link)?.filter;
        *slot = Predicate::and_all([slot.take(), Some(filter)]);
        Ok(())
    }

    /// AND `filter` into a link's linker filter.
    pub fn linker_filter(&mut self, link: QueryLinkId, filter: Predicate) -> Result<(), MeshError> {
        let slot = &mut self.link_mut(link)?.linker_filter;
        *slot = Predicate::and_all([slot.take(), Some(filter)]);
        Ok(())
    }

    /// Require `imposer` to have a qualifying key under each key of `imposed`.
    pub fn impose(&mut self, imposed: QueryNodeId, imposer: QueryNodeId) -> Result<(), MeshError> {
        self.node(imposer)?;
        self.node_mut(imposed)?.impositions.push(imposer);
        Ok(())
    }

    // --- checks -------------------------------------------------------------

    /// Tree parent of a node, `None` for the root.
    pub fn tree_parent(&self, node: QueryNodeId) -> Result<Option<QueryNodeId>, MeshError> {
        match self.node(node)?.parent {
            Some(link) => Ok(Some(self.link(link)?.parent)),
            None => Ok(None),
        }
    }

    /// Tree links from `ancestor` down to `node`, or `None` if `ancestor` is
    /// not on `node`'s tree path.
    pub fn path(&self, ancestor: QueryNodeId, node: QueryNodeId) -> Result<Option<Vec<QueryLinkId>>, MeshError> {
        let mut path = Vec::new();
        let mut current = node;
        while current != ancestor {
            let Some(link) = self.node(current)?.parent else {
                return Ok(None);
            };
            path.push(link);
            current = self.link(link)?.parent;
        }
        path.reverse();
        Ok(Some(path))
    }

    /// Reject dangling ids and malformed predicates.
    pub fn validate(&self) -> Result<(), MeshError> {
        for node in &self.nodes {
            for filter in [&node.filter, &node.first_filter].into_iter().flatten() {
                filter.validate()?;
            }
            for link in &node.links {
                self.link(*link)?;
            }
            for imposer in &node.impositions {
                self.node(*imposer)?;
            }
        }
        for link in &self.links {
            self.node(link.parent)?;
            self.node(link.child)?;
            for filter in [&link.filter, &link.linker_filter].into_iter().flatten() {
                filter.validate()?;
            }
        }
        Ok(())
    }

    // --- wire ---------------------------------------------------------------

    pub fn to_json(&self) -> Result<String, MeshError> {
        serde_json::to_string(self).map_err(|e| MeshError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, MeshError> {
        let query: Self = serde_json::from_str(json).map_err(|e| MeshError::Serialization(e.to_string()))?;
        query.validate()?;
        Ok(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> MeshKey {
        MeshKey::with_part("Domain", "Person")
    }

    fn tag() -> MeshKey {
        MeshKey::with_part("Domain", "Tag")
    }

    #[test]
    fn tree_paths() {
        let mut query = AggregateQuery::new(person());
        let root = query.root();
        let tags = query.add_link(root, "tags", Direction::Forward, tag()).expect("link");
        let people = query.add_link(tags, "tags", Direction::Reverse, person()).expect("link");

        assert_eq!(query.tree_parent(people).expect("node"), Some(tags));
        assert_eq!(query.path(root, people).expect("path").map(|p| p.len()), Some(2));
        assert_eq!(query.path(people, root).expect("path"), None);
        assert_eq!(query.path(tags, tags).expect("path"), Some(vec![]));
    }

    #[test]
    fn re_entry_links_do_not_reparent() {
        let mut query = AggregateQuery::new(person());
        let root = query.root();
        let friends = query.add_link_to(root, "friends", Direction::Forward, root).expect("link");
        assert_eq!(query.node(root).expect("root").parent, None);
        assert_eq!(query.link(friends).expect("link").child, root);
    }

    #[test]
    fn filters_accumulate() {
        let mut query = AggregateQuery::new(person());
        let root = query.root();
        query.filter(root, Predicate::equal("name", "Alice")).expect("filter");
        query.filter(root, Predicate::greater("age", 3_i64)).expect("filter");
        assert!(matches!(
            query.node(root).expect("root").filter,
            Some(Predicate::Binary { .. })
        ));
    }

    #[test]
    fn json_round_trip_validates() {
        let mut query = AggregateQuery::new(person());
        let root = query.root();
        let tags = query.add_link(root, "tags", Direction::Forward, tag()).expect("link");
        query.impose(root, tags).expect("impose");
        let json = query.to_json().expect("json");
        assert_eq!(AggregateQuery::from_json(&json).expect("parse"), query);
    }

    #[test]
    fn dangling_ids_are_rejected() {
        let mut query = AggregateQuery::new(person());
        assert!(query.impose(query.root(), QueryNodeId(9)).is_err());
        assert!(query.add_link(QueryNodeId(4), "x", Direction::Forward, tag()).is_err());
    }
}
