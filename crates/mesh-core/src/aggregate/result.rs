//! Aggregate results.
//!
//! The resolved key sets of a walk plus the objects behind them. Objects are
//! loaded for every resolved key and for both endpoints of every discovered
//! linker, so an owner's links attach in full even when the linked node's
//! filter excluded some of them.

use super::QueryNodeId;
use super::engine::QueryKeys;
use crate::key::{KeyPart, MeshKey};
use crate::predicate::Predicate;
use crate::service::{Stores, ValueQuery};
use crate::types::{Direction, DomainLinker, DomainObject, MeshError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    /// Root keys in store order.
    pub roots: Vec<MeshKey>,
    pub node_keys: BTreeMap<QueryNodeId, BTreeSet<MeshKey>>,
    /// Realized-domain key -> keys loaded from it.
    pub domains: BTreeMap<MeshKey, BTreeSet<MeshKey>>,
    pub objects: BTreeMap<MeshKey, DomainObject>,
    /// Discovered edges, ordered by identity.
    pub linkers: Vec<DomainLinker>,
    pub truncated: bool,
}

impl AggregateResult {
    /// Load the objects behind a walk's keys.
    pub fn load(stores: &dyn Stores, keys: QueryKeys) -> Result<Self, MeshError> {
        let mut domains = keys.domains;
        for linker in keys.linkers.values() {
            for endpoint in [&linker.s_key, &linker.t_key] {
                let domain = endpoint.get(KeyPart::Domain)?;
                if !domain.is_null() {
                    domains.entry(domain).or_default().insert(endpoint.clone());
                }
            }
        }

        let mut objects = BTreeMap::new();
        for (domain, wanted) in &domains {
            if wanted.is_empty() {
                continue;
            }
            let reply = stores
                .values(domain)?
                .query(&ValueQuery::objects(Some(Predicate::keys_in(wanted))))?;
            for object in reply.into_objects() {
                objects.insert(object.key.clone(), object);
            }
        }
        debug!(domains = domains.len(), objects = objects.len(), "Loaded aggregate result");

        Ok(Self {
            roots: keys.roots,
            node_keys: keys.node_keys,
            domains,
            objects,
            linkers: keys.linkers.into_values().collect(),
            truncated: keys.truncated,
        })
    }

    #[must_use]
    pub fn object(&self, key: &MeshKey) -> Option<&DomainObject> {
        self.objects.get(key)
    }

    /// Root objects in root order.
    pub fn root_objects(&self) -> impl Iterator<Item = &DomainObject> {
        self.roots.iter().filter_map(|k| self.objects.get(k))
    }

    /// Keys resolved at a request node.
    #[must_use]
    pub fn keys(&self, node: QueryNodeId) -> BTreeSet<MeshKey> {
        self.node_keys.get(&node).cloned().unwrap_or_default()
    }

    /// Linkers leaving `key` through S-side role `member`.
    pub fn linkers_from<'s>(
        &'s self,
        key: &'s MeshKey,
        member: &'s str,
        direction: Direction,
    ) -> impl Iterator<Item = &'s DomainLinker> + 's {
        let side = direction.parent_side();
        self.linkers
            .iter()
            .filter(move |l| l.s_member == member && l.endpoint(side) == key)
    }

    /// Keys linked to `key` through `member`, deduplicated in linker order.
    #[must_use]
    pub fn linked(&self, key: &MeshKey, member: &str, direction: Direction) -> Vec<MeshKey> {
        let other = direction.parent_side().opposite();
        let mut out: Vec<MeshKey> = Vec::new();
        for linker in self.linkers_from(key, member, direction) {
            let target = linker.endpoint(other);
            if !out.contains(target) {
                out.push(target.clone());
            }
        }
        out
    }

    pub fn to_json(&self) -> Result<String, MeshError> {
        serde_json::to_string(self).map_err(|e| MeshError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, MeshError> {
        serde_json::from_str(json).map_err(|e| MeshError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> MeshKey {
        MeshKey::with_part("Unique", id)
    }

    fn sample() -> AggregateResult {
        let alice = key("alice");
        AggregateResult {
            roots: vec![alice.clone()],
            linkers: vec![
                DomainLinker::new(alice.clone(), key("vip"), "tags", "people"),
                DomainLinker::new(alice.clone(), key("new"), "tags", "people"),
                DomainLinker::new(alice.clone(), key("vip"), "tags", "people").with_extra("dup"),
                DomainLinker::new(key("bob"), alice, "friends", ""),
            ],
            ..AggregateResult::default()
        }
    }

    #[test]
    fn linked_follows_direction() {
        let result = sample();
        let alice = key("alice");
        assert_eq!(
            result.linked(&alice, "tags", Direction::Forward),
            vec![key("vip"), key("new")]
        );
        assert_eq!(result.linked(&alice, "friends", Direction::Reverse), vec![key("bob")]);
        assert!(result.linked(&alice, "friends", Direction::Forward).is_empty());
    }

    #[test]
    fn json_round_trip() {
        let result = sample();
        let json = result.to_json().expect("json");
        assert_eq!(AggregateResult::from_json(&json).expect("parse"), result);
    }
}
