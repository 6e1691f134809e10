//! # QueryKeyMap
//!
//! Resolves an [`AggregateQuery`] into key sets by walking it depth-first
//! against the abstract stores.
//!
//! ## Walk
//!
//! 1. At a domain node, read keys matching the node filter, the filter
//!    inherited from the link that led here, the entry keys handed down by
//!    that link and, on the first visit only, the first-visit filter. An
//!    imposed node also ANDs in the keys its imposers permit.
//! 2. At a link, look up linkers from the parent's keys and recurse into the
//!    child with the linked keys that node has not resolved yet. A node
//!    reached with no entry keys is skipped.
//! 3. The root's keys are the result.
//!
//! ## Reverse chains
//!
//! For an imposed node, imposers are ordered by an independent count query
//! (stable, so ties keep declaration order). The cheapest imposer's reverse
//! chain seeds the running set and remembered chains of the others prune
//! it. The node is then re-read against the running set, and every imposer
//! without a remembered chain runs forward from the survivors and back
//! again. Chains are remembered per request only.

use super::imposition::{Imposition, ImpositionMap};
use super::{AggregateQuery, LinkRequest, QueryNodeId};
use crate::key::MeshKey;
use crate::predicate::Predicate;
use crate::primitives::DEFAULT_MAX_DEPTH;
use crate::service::{LinkQuery, Stores, ValueQuery};
use crate::types::{DomainLinker, MeshError};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Tunables of one walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryConfig {
    /// Link hops below the root before expansion stops.
    pub max_depth: usize,
    /// Order reverse chains by candidate count instead of declaration.
    pub order_by_count: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            order_by_count: true,
        }
    }
}

/// Keys resolved by one walk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryKeys {
    /// Root keys in store order.
    pub roots: Vec<MeshKey>,
    pub node_keys: BTreeMap<QueryNodeId, BTreeSet<MeshKey>>,
    /// Realized-domain key -> every key resolved in it.
    pub domains: BTreeMap<MeshKey, BTreeSet<MeshKey>>,
    /// Discovered edges by identity.
    pub linkers: BTreeMap<MeshKey, DomainLinker>,
    /// Set when the depth bound cut the walk short.
    pub truncated: bool,
}

impl QueryKeys {
    /// Keys resolved at a node.
    #[must_use]
    pub fn keys(&self, node: QueryNodeId) -> BTreeSet<MeshKey> {
        self.node_keys.get(&node).cloned().unwrap_or_default()
    }
}

/// One execution of an aggregate query.
pub struct QueryKeyMap<'a> {
    stores: &'a dyn Stores,
    query: &'a AggregateQuery,
    config: QueryConfig,
    shadow: ImpositionMap,
    entered: BTreeSet<QueryNodeId>,
    reverse_memo: BTreeMap<QueryNodeId, BTreeSet<MeshKey>>,
    out: QueryKeys,
}

impl<'a> QueryKeyMap<'a> {
    pub fn new(stores: &'a dyn Stores, query: &'a AggregateQuery, config: QueryConfig) -> Result<Self, MeshError> {
        query.validate()?;
        let shadow = ImpositionMap::build(query)?;
        Ok(Self {
            stores,
            query,
            config,
            shadow,
            entered: BTreeSet::new(),
            reverse_memo: BTreeMap::new(),
            out: QueryKeys::default(),
        })
    }

    /// Walk the whole request.
    pub fn run(mut self) -> Result<QueryKeys, MeshError> {
        let root = self.query.root();
        self.out.roots = self.visit(root, None, None, 0)?;
        debug!(
            roots = self.out.roots.len(),
            linkers = self.out.linkers.len(),
            "Resolved aggregate query"
        );
        Ok(self.out)
    }

    // =========================================================================
    // WALK
    // =========================================================================

    fn visit(
        &mut self,
        node: QueryNodeId,
        entry: Option<&BTreeSet<MeshKey>>,
        inherited: Option<&Predicate>,
        depth: usize,
    ) -> Result<Vec<MeshKey>, MeshError> {
        if depth > self.config.max_depth {
            warn!(node = node.0, depth, "Depth bound reached, truncating query");
            self.out.truncated = true;
            return Ok(Vec::new());
        }
        if entry.is_some_and(BTreeSet::is_empty) {
            return Ok(Vec::new());
        }

        let query = self.query;
        let request = query.node(node)?;
        let first = if self.entered.insert(node) {
            request.first_filter.clone()
        } else {
            None
        };
        let mut filter = Predicate::and_all([
            request.filter.clone(),
            inherited.cloned(),
            first,
            entry.map(Predicate::keys_in),
        ]);

        if self.shadow.is_imposed(node) {
            let allowed = self.imposed_keys(node, filter.as_ref())?;
            if allowed.is_empty() {
                debug!(node = node.0, "Imposition left no keys");
                return Ok(Vec::new());
            }
            filter = Predicate::and_all([filter, Some(Predicate::keys_in(&allowed))]);
        }

        let keys = self
            .stores
            .values(&request.domain)?
            .query(&ValueQuery::keys(filter))?
            .into_keys();
        debug!(node = node.0, domain = %request.domain, keys = keys.len(), "Resolved query node");

        self.out
            .node_keys
            .entry(node)
            .or_default()
            .extend(keys.iter().cloned());
        self.out
            .domains
            .entry(request.domain.clone())
            .or_default()
            .extend(keys.iter().cloned());

        let parents: BTreeSet<MeshKey> = keys.iter().cloned().collect();
        for &link in &request.links {
            self.follow(query.link(link)?, &parents, depth)?;
        }
        Ok(keys)
    }

    fn follow(&mut self, link: &LinkRequest, parents: &BTreeSet<MeshKey>, depth: usize) -> Result<(), MeshError> {
        if parents.is_empty() {
            return Ok(());
        }
        let linkers = self.lookup(link, parents, true)?;
        let child_side = link.direction.parent_side().opposite();
        let resolved = self.out.node_keys.get(&link.child);
        let fresh: BTreeSet<MeshKey> = linkers
            .iter()
            .map(|l| l.endpoint(child_side))
            .filter(|k| !resolved.is_some_and(|r| r.contains(*k)))
            .cloned()
            .collect();
        debug!(member = %link.member, linkers = linkers.len(), fresh = fresh.len(), "Followed link");

        for linker in linkers {
            self.out.linkers.insert(linker.key(), linker);
        }
        if fresh.is_empty() {
            return Ok(());
        }
        self.visit(link.child, Some(&fresh), link.filter.as_ref(), depth + 1)
            .map(|_| ())
    }

    /// Linkers of `link` touching `from`, walking toward the child or back
    /// toward the parent.
    fn lookup(
        &self,
        link: &LinkRequest,
        from: &BTreeSet<MeshKey>,
        downward: bool,
    ) -> Result<Vec<DomainLinker>, MeshError> {
        let parent = &self.query.node(link.parent)?.domain;
        let child = &self.query.node(link.child)?.domain;
        let (s, t) = link.direction.pair(parent, child);
        let side = if downward {
            link.direction.parent_side()
        } else {
            link.direction.parent_side().opposite()
        };
        let request = LinkQuery::from_keys(side, from)
            .with_member(link.member.clone())
            .with_linker(link.linker_filter.clone());
        Ok(self.stores.links(s, t)?.query(&request)?.into_linkers())
    }

    // =========================================================================
    // IMPOSITIONS
    // =========================================================================

    /// Keys of `node` matching `base` that every imposer permits.
    fn imposed_keys(&mut self, node: QueryNodeId, base: Option<&Predicate>) -> Result<BTreeSet<MeshKey>, MeshError> {
        let mut ordered: Vec<(usize, Imposition)> = Vec::new();
        for imposition in self.shadow.imposers(node).to_vec() {
            let count = if self.config.order_by_count {
                self.count(imposition.imposer)?
            } else {
                0
            };
            ordered.push((count, imposition));
        }
        ordered.sort_by_key(|(count, _)| *count);

        let mut impositions = ordered.into_iter().map(|(_, i)| i);
        let Some(cheapest) = impositions.next() else {
            return self.keys_of(node, base.cloned());
        };
        let mut running = self.reverse_full(&cheapest)?;

        let mut pending = Vec::new();
        for imposition in impositions {
            match self.reverse_memo.get(&imposition.imposer) {
                Some(permitted) => running.retain(|k| permitted.contains(k)),
                None => pending.push(imposition),
            }
        }
        if running.is_empty() {
            return Ok(running);
        }

        running = self.keys_of(
            node,
            Predicate::and_all([base.cloned(), Some(Predicate::keys_in(&running))]),
        )?;

        for imposition in pending {
            if running.is_empty() {
                break;
            }
            let reached = self.forward(&imposition, &running)?;
            let permitted = self.reverse(&imposition, reached)?;
            running.retain(|k| permitted.contains(k));
        }
        debug!(node = node.0, keys = running.len(), "Applied impositions");
        Ok(running)
    }

    /// Reverse chain from every qualifying imposer key, remembered.
    fn reverse_full(&mut self, imposition: &Imposition) -> Result<BTreeSet<MeshKey>, MeshError> {
        if let Some(hit) = self.reverse_memo.get(&imposition.imposer) {
            return Ok(hit.clone());
        }
        let start = self.restricted(imposition.imposer, None)?;
        let keys = self.reverse(imposition, start)?;
        self.reverse_memo.insert(imposition.imposer, keys.clone());
        Ok(keys)
    }

    /// Walk from imposer keys back up to the imposed node.
    fn reverse(&mut self, imposition: &Imposition, start: BTreeSet<MeshKey>) -> Result<BTreeSet<MeshKey>, MeshError> {
        let query = self.query;
        let mut keys = start;
        for (step, link_id) in imposition.path.iter().enumerate().rev() {
            if keys.is_empty() {
                break;
            }
            let link = query.link(*link_id)?;
            let side = link.direction.parent_side();
            let reached: BTreeSet<MeshKey> = self
                .lookup(link, &keys, false)?
                .iter()
                .map(|l| l.endpoint(side).clone())
                .collect();
            // the imposed node itself is re-read by the caller
            keys = if step == 0 {
                reached
            } else {
                self.restricted(link.parent, Some(&reached))?
            };
        }
        Ok(keys)
    }

    /// Walk from imposed-node keys down to the imposer.
    fn forward(&mut self, imposition: &Imposition, start: &BTreeSet<MeshKey>) -> Result<BTreeSet<MeshKey>, MeshError> {
        let query = self.query;
        let mut keys = start.clone();
        for link_id in &imposition.path {
            if keys.is_empty() {
                break;
            }
            let link = query.link(*link_id)?;
            let side = link.direction.parent_side().opposite();
            let reached: BTreeSet<MeshKey> = self
                .lookup(link, &keys, true)?
                .iter()
                .map(|l| l.endpoint(side).clone())
                .collect();
            keys = self.restricted(link.child, Some(&reached))?;
        }
        Ok(keys)
    }

    /// Keys of `node` matching its own and inherited filters, its own
    /// impositions and, when given, `within`.
    fn restricted(&mut self, node: QueryNodeId, within: Option<&BTreeSet<MeshKey>>) -> Result<BTreeSet<MeshKey>, MeshError> {
        if within.is_some_and(BTreeSet::is_empty) {
            return Ok(BTreeSet::new());
        }
        let filter = Predicate::and_all([
            self.own_filter(node)?,
            within.map(Predicate::keys_in),
        ]);
        if self.shadow.is_imposed(node) {
            return self.imposed_keys(node, filter.as_ref());
        }
        self.keys_of(node, filter)
    }

    /// Node filter ANDed with the filter of the link that created it.
    fn own_filter(&self, node: QueryNodeId) -> Result<Option<Predicate>, MeshError> {
        let request = self.query.node(node)?;
        let inherited = match request.parent {
            Some(link) => self.query.link(link)?.filter.clone(),
            None => None,
        };
        Ok(Predicate::and_all([request.filter.clone(), inherited]))
    }

    fn count(&self, node: QueryNodeId) -> Result<usize, MeshError> {
        let domain = &self.query.node(node)?.domain;
        let reply = self
            .stores
            .values(domain)?
            .query(&ValueQuery::count(self.own_filter(node)?))?;
        Ok(reply.count())
    }

    fn keys_of(&self, node: QueryNodeId, filter: Option<Predicate>) -> Result<BTreeSet<MeshKey>, MeshError> {
        let domain = &self.query.node(node)?.domain;
        Ok(self
            .stores
            .values(domain)?
            .query(&ValueQuery::keys(filter))?
            .into_keys()
            .into_iter()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TypeMapping, TypeRef};
    use crate::object::{FieldValue, Instance, ObjectGraph};
    use crate::repository::Repository;
    use crate::types::Direction;
    use crate::value::ScalarType;

    struct Fixture {
        repo: Repository,
        person: MeshKey,
        tag: MeshKey,
        alice: MeshKey,
        bob: MeshKey,
        vip: MeshKey,
        new: MeshKey,
    }

    /// Alice and Bob are friends of each other. Alice is tagged vip and new,
    /// Bob vip and old, Carol new.
    fn fixture() -> Fixture {
        let repo = Repository::in_memory().expect("repo");
        repo.register_type(
            TypeMapping::builder("Tag")
                .scalar("label", ScalarType::Str)
                .build()
                .expect("tag"),
        )
        .expect("register");
        repo.register_type(
            TypeMapping::builder("Person")
                .scalar("name", ScalarType::Str)
                .many("friends", TypeRef::domain("Person"))
                .many("tags", TypeRef::domain("Tag"))
                .build()
                .expect("person"),
        )
        .expect("register");

        let mut objects = ObjectGraph::new();
        let vip = objects.add(Instance::new("Tag").with("label", "vip"));
        let new = objects.add(Instance::new("Tag").with("label", "new"));
        let old = objects.add(Instance::new("Tag").with("label", "old"));
        let alice = objects.add(
            Instance::new("Person")
                .with("name", "Alice")
                .with_field("tags", FieldValue::Refs(vec![vip, new])),
        );
        let bob = objects.add(
            Instance::new("Person")
                .with("name", "Bob")
                .with_field("friends", FieldValue::Refs(vec![alice]))
                .with_field("tags", FieldValue::Refs(vec![vip, old])),
        );
        objects.set(alice, "friends", FieldValue::Refs(vec![bob]));
        let carol = objects.add(
            Instance::new("Person")
                .with("name", "Carol")
                .with_field("tags", FieldValue::Refs(vec![new])),
        );
        repo.save(&mut objects, &[alice, bob, carol]).expect("save");

        let key = |id| objects.get(id).and_then(|i| i.key.clone()).expect("key");
        Fixture {
            person: repo.catalog().realize_type("Person").expect("person").key.clone(),
            tag: repo.catalog().realize_type("Tag").expect("tag").key.clone(),
            alice: key(alice),
            bob: key(bob),
            vip: key(vip),
            new: key(new),
            repo,
        }
    }

    /// Tags owned by Alice and by Bob, walking `tags` against its stored
    /// direction. Returns the query and the two owner nodes.
    fn shared_tags(f: &Fixture) -> (AggregateQuery, QueryNodeId, QueryNodeId) {
        let mut query = AggregateQuery::new(f.tag.clone());
        let root = query.root();
        let alice = query
            .add_link(root, "tags", Direction::Reverse, f.person.clone())
            .expect("link");
        query.filter(alice, Predicate::equal("name", "Alice")).expect("filter");
        let bob = query
            .add_link(root, "tags", Direction::Reverse, f.person.clone())
            .expect("link");
        query.filter(bob, Predicate::equal("name", "Bob")).expect("filter");
        query.impose(root, alice).expect("impose");
        query.impose(root, bob).expect("impose");
        (query, alice, bob)
    }

    fn config(order_by_count: bool) -> QueryConfig {
        QueryConfig {
            order_by_count,
            ..QueryConfig::default()
        }
    }

    #[test]
    fn followed_links_skip_resolved_keys() {
        let f = fixture();
        let mut query = AggregateQuery::new(f.person.clone());
        let root = query.root();
        query.first_filter(root, Predicate::equal("name", "Alice")).expect("filter");
        query
            .add_link_to(root, "friends", Direction::Forward, root)
            .expect("link");

        let keys = QueryKeyMap::new(&f.repo, &query, QueryConfig::default())
            .expect("walk")
            .run()
            .expect("run");
        assert_eq!(keys.roots, vec![f.alice.clone()]);
        assert_eq!(keys.keys(root), BTreeSet::from([f.alice.clone(), f.bob.clone()]));
        assert_eq!(keys.linkers.len(), 2);
        assert!(!keys.truncated);
    }

    #[test]
    fn reverse_links_carry_impositions() {
        let f = fixture();
        let (query, _, _) = shared_tags(&f);
        for order_by_count in [true, false] {
            let keys = QueryKeyMap::new(&f.repo, &query, config(order_by_count))
                .expect("walk")
                .run()
                .expect("run");
            assert_eq!(keys.roots, vec![f.vip.clone()]);
        }
    }

    #[test]
    fn single_reverse_imposer() {
        let f = fixture();
        let mut query = AggregateQuery::new(f.tag.clone());
        let root = query.root();
        let owner = query
            .add_link(root, "tags", Direction::Reverse, f.person.clone())
            .expect("link");
        query.filter(owner, Predicate::equal("name", "Alice")).expect("filter");
        query.impose(root, owner).expect("impose");

        let keys = QueryKeyMap::new(&f.repo, &query, QueryConfig::default())
            .expect("walk")
            .run()
            .expect("run");
        let roots: BTreeSet<MeshKey> = keys.roots.into_iter().collect();
        assert_eq!(roots, BTreeSet::from([f.vip.clone(), f.new.clone()]));
    }

    #[test]
    fn remembered_chains_prune_without_a_walk() {
        let f = fixture();
        let (query, _, bob) = shared_tags(&f);
        let mut map = QueryKeyMap::new(&f.repo, &query, config(false)).expect("walk");
        map.reverse_memo.insert(bob, BTreeSet::from([f.new.clone()]));

        let allowed = map.imposed_keys(query.root(), None).expect("impose");
        assert_eq!(allowed, BTreeSet::from([f.new.clone()]));
    }

    #[test]
    fn forward_chains_reach_imposers_over_reverse_links() {
        let f = fixture();
        let (query, alice, _) = shared_tags(&f);
        let mut map = QueryKeyMap::new(&f.repo, &query, QueryConfig::default()).expect("walk");
        let imposition = map
            .shadow
            .imposers(query.root())
            .iter()
            .find(|i| i.imposer == alice)
            .cloned()
            .expect("imposition");

        let reached = map
            .forward(&imposition, &BTreeSet::from([f.vip.clone(), f.new.clone()]))
            .expect("forward");
        assert_eq!(reached, BTreeSet::from([f.alice.clone()]));
        let back = map.reverse(&imposition, reached).expect("reverse");
        assert_eq!(back, BTreeSet::from([f.vip.clone(), f.new.clone()]));
    }
}
