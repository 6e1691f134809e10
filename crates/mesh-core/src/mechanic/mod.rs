//! # Mechanics
//!
//! Strategy objects for domains whose stored shape differs from their
//! caller-visible shape. A mechanic is looked up by domain key and, when
//! present, replaces the default behaviour at three points:
//!
//! | Hook     | Default behaviour                                  |
//! |----------|----------------------------------------------------|
//! | `expand` | walk the domain's properties into the op graph     |
//! | `plan`   | one plan node per referenced instance              |
//! | `attach` | one instance per linked object                     |
//!
//! The built-in `Set` and `Map` mechanics are registered by
//! [`Mechanics::with_builtins`].

pub mod map;
pub mod set;

pub use map::MapMechanic;
pub use set::SetMechanic;

use crate::domain::{RealizedDomain, map_domain, set_domain};
use crate::key::{KeyPart, MeshKey};
use crate::materialize::Materializer;
use crate::object::FieldValue;
use crate::oplink::{OpLinkBuilder, OpLinkGraph, OpLinkNode, OpNodeId};
use crate::primitives::{PART_MEMBER, PART_OWNER};
use crate::savelink::{PlanBuilder, PlanNodeId};
use crate::types::{DomainObject, MeshError};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Shape override for one domain.
pub trait Mechanic: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Populate `node` (already registered for `realized`) with its members.
    fn expand(
        &self,
        builder: &mut OpLinkBuilder<'_>,
        node: OpNodeId,
        realized: &Arc<RealizedDomain>,
    ) -> Result<(), MeshError>;

    /// Plan the field `value` held by `owner` through `link`, whose target
    /// is this mechanic's domain.
    fn plan(
        &self,
        planner: &mut PlanBuilder<'_>,
        owner: PlanNodeId,
        shape: &Arc<OpLinkGraph>,
        link: &OpLinkNode,
        value: &FieldValue,
    ) -> Result<(), MeshError>;

    /// Rebuild the caller-visible field from the stored synthetic `object`.
    fn attach(
        &self,
        materializer: &mut Materializer<'_>,
        node: OpNodeId,
        object: &DomainObject,
    ) -> Result<FieldValue, MeshError>;
}

/// Key of the synthetic object `member` of `owner` stores its collection in.
#[must_use]
pub fn derived_key(domain: &MeshKey, owner: &MeshKey, member: &str) -> MeshKey {
    let mut key = MeshKey::with_part(PART_MEMBER, member);
    key.set_key_part(KeyPart::Domain.name(), domain);
    key.set_key_part(PART_OWNER, owner);
    key
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Mechanics by domain key.
#[derive(Default)]
pub struct Mechanics {
    by_domain: RwLock<BTreeMap<MeshKey, Arc<dyn Mechanic>>>,
}

impl Mechanics {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `Set` and `Map` installed.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut by_domain: BTreeMap<MeshKey, Arc<dyn Mechanic>> = BTreeMap::new();
        by_domain.insert(set_domain().key, Arc::new(SetMechanic));
        by_domain.insert(map_domain().key, Arc::new(MapMechanic));
        Self {
            by_domain: RwLock::new(by_domain),
        }
    }

    /// Install or replace the mechanic for a domain.
    pub fn register(&self, domain: MeshKey, mechanic: Arc<dyn Mechanic>) -> Result<(), MeshError> {
        info!(domain = %domain, mechanic = mechanic.name(), "Registered mechanic");
        self.by_domain
            .write()
            .map_err(|_| MeshError::LockPoisoned("mechanics"))?
            .insert(domain, mechanic);
        Ok(())
    }

    pub fn get(&self, domain: &MeshKey) -> Result<Option<Arc<dyn Mechanic>>, MeshError> {
        Ok(self
            .by_domain
            .read()
            .map_err(|_| MeshError::LockPoisoned("mechanics"))?
            .get(domain)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_cover_set_and_map() {
        let mechanics = Mechanics::with_builtins();
        let set = mechanics.get(&set_domain().key).expect("lock").expect("set");
        assert_eq!(set.name(), "set");
        let map = mechanics.get(&map_domain().key).expect("lock").expect("map");
        assert_eq!(map.name(), "map");
        assert!(Mechanics::new().get(&set_domain().key).expect("lock").is_none());
    }

    #[test]
    fn derived_keys_are_deterministic() {
        let domain = MeshKey::with_part("Domain", "Set");
        let owner = MeshKey::with_part("Unique", "a");
        let a = derived_key(&domain, &owner, "labels");
        assert_eq!(a, derived_key(&domain, &owner, "labels"));
        assert_ne!(a, derived_key(&domain, &owner, "other"));
        assert_eq!(a.get_key_part(PART_OWNER).expect("owner"), owner);
        assert_eq!(a.get(KeyPart::Domain).expect("domain"), domain);
    }
}
