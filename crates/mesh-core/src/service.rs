//! # Store Contracts
//!
//! The two abstract per-domain services every backend implements, and the
//! [`Backend`] trait that provisions them.
//!
//! Services see nothing but keyed reads, writes and relationship lookups.
//! They define their own timeout and retry behaviour; the engine treats each
//! call as one atomic, synchronous step and surfaces failures unchanged.

use crate::domain::RealizedDomain;
use crate::key::{KeyPart, MeshKey};
use crate::predicate::Predicate;
use crate::primitives::PART_UNIQUE;
use crate::types::{DomainLinker, DomainObject, MeshError, Side};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

// =============================================================================
// VALUE SERVICE
// =============================================================================

/// What a value query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadShape {
    Keys,
    Objects,
    Count,
}

/// A read against one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueQuery {
    /// `None` matches every row.
    pub filter: Option<Predicate>,
    pub shape: ReadShape,
}

impl ValueQuery {
    #[must_use]
    pub fn keys(filter: Option<Predicate>) -> Self {
        Self {
            filter,
            shape: ReadShape::Keys,
        }
    }

    #[must_use]
    pub fn objects(filter: Option<Predicate>) -> Self {
        Self {
            filter,
            shape: ReadShape::Objects,
        }
    }

    #[must_use]
    pub fn count(filter: Option<Predicate>) -> Self {
        Self {
            filter,
            shape: ReadShape::Count,
        }
    }
}

/// Result of a value query, shaped by [`ReadShape`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueReply {
    Keys(Vec<MeshKey>),
    Objects(Vec<DomainObject>),
    Count(usize),
}

impl ValueReply {
    /// Keys of the reply, whatever its shape. Counts have none.
    #[must_use]
    pub fn into_keys(self) -> Vec<MeshKey> {
        match self {
            Self::Keys(keys) => keys,
            Self::Objects(objects) => objects.into_iter().map(|o| o.key).collect(),
            Self::Count(_) => Vec::new(),
        }
    }

    /// Objects of the reply. Keys-only and count replies have none.
    #[must_use]
    pub fn into_objects(self) -> Vec<DomainObject> {
        match self {
            Self::Objects(objects) => objects,
            Self::Keys(_) | Self::Count(_) => Vec::new(),
        }
    }

    /// Number of matches.
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Keys(keys) => keys.len(),
            Self::Objects(objects) => objects.len(),
            Self::Count(n) => *n,
        }
    }
}

/// One write against a value service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AffectItem {
    /// Assign a fresh key and stamp creation metadata.
    Create(DomainObject),
    /// Store under the caller-supplied key, stamping creation metadata.
    Insert(DomainObject),
    /// Partial patch. `None` clears a property.
    Update {
        key: MeshKey,
        patch: BTreeMap<String, Option<Value>>,
    },
    /// Remove every row matching the predicate.
    Delete(Predicate),
}

/// Per-item outcome of [`ValueService::affect`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AffectResult {
    /// The stored object, with its assigned key and metadata.
    Created(DomainObject),
    Inserted(DomainObject),
    /// The updated object, `None` if the key did not exist.
    Updated(Option<DomainObject>),
    Deleted(Vec<MeshKey>),
}

/// Per-domain value store.
pub trait ValueService: Send + Sync {
    /// Realized-domain key this service stores.
    fn domain(&self) -> &MeshKey;

    /// Read rows matching a filter.
    fn query(&self, query: &ValueQuery) -> Result<ValueReply, MeshError>;

    /// Apply writes in order.
    fn affect(&self, actor: &str, items: Vec<AffectItem>) -> Result<Vec<AffectResult>, MeshError>;
}

/// A fresh object key inside a realized domain.
#[must_use]
pub fn fresh_key(domain: &MeshKey) -> MeshKey {
    let mut key = MeshKey::with_part(PART_UNIQUE, Uuid::new_v4().to_string());
    key.set_key_part(KeyPart::Domain.name(), domain);
    key
}

// =============================================================================
// LINK SERVICE
// =============================================================================

/// What a link query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkShape {
    Linkers,
    Count,
}

/// A relationship lookup between the two domains of a link service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkQuery {
    /// Side the subject keys sit on.
    pub side: Side,
    /// S-side role filter.
    pub member: Option<String>,
    /// Evaluated against the subject endpoint key.
    pub subject: Option<Predicate>,
    /// Evaluated against the linker itself.
    pub linker: Option<Predicate>,
    /// Evaluated against the opposite endpoint key.
    pub linked: Option<Predicate>,
    pub shape: LinkShape,
}

impl LinkQuery {
    /// Linkers whose `side` endpoint is one of `keys`.
    #[must_use]
    pub fn from_keys<'a>(side: Side, keys: impl IntoIterator<Item = &'a MeshKey>) -> Self {
        Self {
            side,
            member: None,
            subject: Some(Predicate::keys_in(keys)),
            linker: None,
            linked: None,
            shape: LinkShape::Linkers,
        }
    }

    #[must_use]
    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    #[must_use]
    pub fn with_linker(mut self, filter: Option<Predicate>) -> Self {
        self.linker = filter;
        self
    }

    #[must_use]
    pub fn with_linked(mut self, filter: Option<Predicate>) -> Self {
        self.linked = filter;
        self
    }

    #[must_use]
    pub fn counting(mut self) -> Self {
        self.shape = LinkShape::Count;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkReply {
    Linkers(Vec<DomainLinker>),
    Count(usize),
}

impl LinkReply {
    #[must_use]
    pub fn into_linkers(self) -> Vec<DomainLinker> {
        match self {
            Self::Linkers(linkers) => linkers,
            Self::Count(_) => Vec::new(),
        }
    }
}

/// One write against a link service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkItem {
    /// Add an edge. Exclusive links first remove every edge with the same
    /// S endpoint, S role and discriminator.
    Link { linker: DomainLinker, exclusive: bool },
    /// Remove one edge by identity.
    Unlink(DomainLinker),
    /// Remove every edge matching a linker predicate.
    UnlinkWhere(Predicate),
}

/// Per-ordered-pair relationship store.
pub trait LinkService: Send + Sync {
    /// `(S domain, T domain)`.
    fn pair(&self) -> (&MeshKey, &MeshKey);

    fn query(&self, query: &LinkQuery) -> Result<LinkReply, MeshError>;

    /// Apply link writes in order. Returns the number of edges touched per item.
    fn affect(&self, actor: &str, items: Vec<LinkItem>) -> Result<Vec<usize>, MeshError>;
}

// =============================================================================
// SERVICE LOOKUP
// =============================================================================

/// Resolves services by realized-domain key. Implemented by the repository;
/// the query engine and write executor only ever see this.
pub trait Stores {
    fn values(&self, domain: &MeshKey) -> Result<Arc<dyn ValueService>, MeshError>;

    fn links(&self, s: &MeshKey, t: &MeshKey) -> Result<Arc<dyn LinkService>, MeshError>;
}

// =============================================================================
// BACKEND
// =============================================================================

/// Provisions services for realized domains and domain pairs.
pub trait Backend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    fn open_values(&self, domain: &RealizedDomain) -> Result<Arc<dyn ValueService>, MeshError>;

    fn open_links(
        &self,
        s: &RealizedDomain,
        t: &RealizedDomain,
    ) -> Result<Arc<dyn LinkService>, MeshError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_keys_are_unique_and_scoped() {
        let domain = MeshKey::with_part("Domain", "Tag");
        let a = fresh_key(&domain);
        let b = fresh_key(&domain);
        assert_ne!(a, b);
        assert_eq!(a.get(KeyPart::Domain).expect("domain"), domain);
    }

    #[test]
    fn reply_views() {
        let object = DomainObject::new(MeshKey::with_part("Unique", "1"));
        let reply = ValueReply::Objects(vec![object.clone()]);
        assert_eq!(reply.count(), 1);
        assert_eq!(reply.clone().into_keys(), vec![object.key.clone()]);
        assert_eq!(ValueReply::Count(4).count(), 4);
        assert!(ValueReply::Count(4).into_objects().is_empty());
    }

    #[test]
    fn link_query_builder() {
        let key = MeshKey::with_part("Unique", "1");
        let query = LinkQuery::from_keys(Side::S, [&key]).with_member("tags").counting();
        assert_eq!(query.member.as_deref(), Some("tags"));
        assert_eq!(query.shape, LinkShape::Count);
        assert_eq!(
            query.subject.and_then(|p| p.key_restriction()),
            Some([key].into_iter().collect())
        );
    }
}
