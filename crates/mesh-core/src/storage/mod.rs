//! # Storage Backends
//!
//! Two implementations of the [`Backend`](crate::service::Backend) contract:
//!
//! - `memory` - `RwLock`-guarded `BTreeMap` tables, for tests and embedding
//! - `redb_store` - one redb table per realized domain and per link pair,
//!   postcard-encoded rows, one ACID write transaction per `affect` call
//!
//! Both evaluate predicates in process with the shared helpers below, so a
//! filter means the same thing whichever backend runs it.

pub mod memory;
pub mod redb_store;

pub use memory::MemoryBackend;
pub use redb_store::RedbBackend;

use crate::key::{KeyPart, MeshKey};
use crate::predicate::{LinkerSubject, Predicate};
use crate::service::{LinkQuery, LinkReply, LinkShape, ReadShape, ValueReply, fresh_key};
use crate::types::{DomainLinker, DomainObject, MeshError, Metadata};
use crate::value::Value;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

// =============================================================================
// VALUE ROWS
// =============================================================================

/// Rows matching a filter, cloned out of the table.
pub(crate) fn select<'a>(
    rows: impl Iterator<Item = &'a DomainObject>,
    filter: Option<&Predicate>,
) -> Result<Vec<DomainObject>, MeshError> {
    let mut out = Vec::new();
    for row in rows {
        if Predicate::accepts(filter, row)? {
            out.push(row.clone());
        }
    }
    Ok(out)
}

/// Shape selected rows into a reply.
pub(crate) fn reply(rows: Vec<DomainObject>, shape: ReadShape) -> ValueReply {
    match shape {
        ReadShape::Keys => ValueReply::Keys(rows.into_iter().map(|r| r.key).collect()),
        ReadShape::Objects => ValueReply::Objects(rows),
        ReadShape::Count => ValueReply::Count(rows.len()),
    }
}

/// Prepare a row for a create (`fresh`) or insert.
///
/// Inserted keys keep every caller part; a missing `Domain` part is filled
/// in so the row is addressable by domain.
pub(crate) fn stamp_new(
    domain: &MeshKey,
    mut object: DomainObject,
    actor: &str,
    now: DateTime<Utc>,
    fresh: bool,
) -> Result<DomainObject, MeshError> {
    if fresh || object.key.is_null() {
        object.key = fresh_key(domain);
    } else if object.key.get(KeyPart::Domain)?.is_null() {
        object.key.set_key_part(KeyPart::Domain.name(), domain);
    }
    object.meta = Metadata::created(actor, now);
    Ok(object)
}

/// Apply a partial patch and stamp the updater.
pub(crate) fn apply_patch(
    object: &mut DomainObject,
    patch: BTreeMap<String, Option<Value>>,
    actor: &str,
    now: DateTime<Utc>,
) {
    for (property, value) in patch {
        match value {
            Some(value) => {
                object.values.insert(property, value);
            }
            None => {
                object.values.remove(&property);
            }
        }
    }
    object.meta.touch(actor, now);
}

// =============================================================================
// LINK ROWS
// =============================================================================

/// Whether a linker satisfies every part of a link query.
pub(crate) fn link_matches(linker: &DomainLinker, query: &LinkQuery) -> Result<bool, MeshError> {
    if let Some(member) = &query.member
        && linker.s_member != *member
    {
        return Ok(false);
    }
    Ok(Predicate::accepts(query.subject.as_ref(), linker.endpoint(query.side))?
        && Predicate::accepts(query.linked.as_ref(), linker.endpoint(query.side.opposite()))?
        && Predicate::accepts(query.linker.as_ref(), &LinkerSubject::new(linker))?)
}

/// Whether `existing` is displaced by an exclusive `incoming` link.
pub(crate) fn competes(existing: &DomainLinker, incoming: &DomainLinker) -> bool {
    existing.s_key == incoming.s_key
        && existing.s_member == incoming.s_member
        && existing.extra == incoming.extra
}

/// Stamp creation fields the caller left empty.
pub(crate) fn stamp_link(mut linker: DomainLinker, actor: &str, now: DateTime<Utc>) -> DomainLinker {
    if linker.created_by.is_none() {
        linker.created_by = Some(actor.to_string());
    }
    if linker.created_at.is_none() {
        linker.created_at = Some(now);
    }
    linker
}

pub(crate) fn link_reply(linkers: Vec<DomainLinker>, shape: LinkShape) -> LinkReply {
    match shape {
        LinkShape::Linkers => LinkReply::Linkers(linkers),
        LinkShape::Count => LinkReply::Count(linkers.len()),
    }
}

/// Whether a linker matches an unlink predicate.
pub(crate) fn unlink_matches(linker: &DomainLinker, filter: &Predicate) -> Result<bool, MeshError> {
    filter.evaluate(&LinkerSubject::new(linker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn key(unique: &str) -> MeshKey {
        MeshKey::with_part("Unique", unique)
    }

    #[test]
    fn insert_keeps_caller_parts_and_fills_domain() {
        let domain = MeshKey::with_part("Domain", "Set");
        let object = DomainObject::new(MeshKey::null().and("Owner", "x").and("Member", "tags"));
        let stamped = stamp_new(&domain, object, "tester", Utc::now(), false).expect("stamp");
        assert_eq!(stamped.key.part("Owner"), Some("x"));
        assert_eq!(stamped.domain().expect("domain"), domain);
        assert_eq!(stamped.meta.created_by.as_deref(), Some("tester"));
    }

    #[test]
    fn patch_sets_and_clears() {
        let mut object = DomainObject::new(key("1")).with("a", 1).with("b", 2);
        let patch = BTreeMap::from([
            ("a".to_string(), Some(Value::I32(10))),
            ("b".to_string(), None),
        ]);
        apply_patch(&mut object, patch, "bob", Utc::now());
        assert_eq!(object.values.get("a"), Some(&Value::I32(10)));
        assert!(!object.values.contains_key("b"));
        assert_eq!(object.meta.updated_by.as_deref(), Some("bob"));
    }

    #[test]
    fn link_query_respects_side_and_member() {
        let linker = DomainLinker::new(key("s"), key("t"), "tags", "");
        let by_s = LinkQuery::from_keys(Side::S, [&key("s")]);
        let by_t = LinkQuery::from_keys(Side::T, [&key("s")]);
        assert!(link_matches(&linker, &by_s).expect("eval"));
        assert!(!link_matches(&linker, &by_t).expect("eval"));
        assert!(!link_matches(&linker, &by_s.with_member("other")).expect("eval"));
    }

    #[test]
    fn exclusivity_is_per_role_and_discriminator() {
        let a = DomainLinker::new(key("s"), key("t1"), "owner", "");
        let b = DomainLinker::new(key("s"), key("t2"), "owner", "");
        let c = DomainLinker::new(key("s"), key("t2"), "owner", "").with_extra("x");
        assert!(competes(&a, &b));
        assert!(!competes(&a, &c));
    }
}
