//! # In-Memory Backend
//!
//! `BTreeMap` tables behind `RwLock`s. Value tables read candidate rows
//! straight from the map when a filter is a conjunction with a positive
//! `key in (...)` leaf; link tables keep per-side endpoint indexes so
//! subject-restricted lookups never scan.

use crate::domain::RealizedDomain;
use crate::key::MeshKey;
use crate::service::{
    AffectItem, AffectResult, Backend, LinkItem, LinkQuery, LinkReply, LinkService, ValueQuery,
    ValueReply, ValueService,
};
use crate::storage::{
    apply_patch, competes, link_matches, link_reply, reply, select, stamp_link, stamp_new,
    unlink_matches,
};
use crate::types::{DomainLinker, DomainObject, MeshError, Side};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tracing::debug;

fn poisoned<T>(_: T) -> MeshError {
    MeshError::LockPoisoned("memory table")
}

// =============================================================================
// VALUES
// =============================================================================

/// One realized domain's rows.
#[derive(Debug)]
pub struct MemoryValues {
    domain: MeshKey,
    rows: RwLock<BTreeMap<MeshKey, DomainObject>>,
}

impl MemoryValues {
    #[must_use]
    pub fn new(domain: MeshKey) -> Self {
        Self {
            domain,
            rows: RwLock::new(BTreeMap::new()),
        }
    }
}

impl ValueService for MemoryValues {
    fn domain(&self) -> &MeshKey {
        &self.domain
    }

    fn query(&self, query: &ValueQuery) -> Result<ValueReply, MeshError> {
        let rows = self.rows.read().map_err(poisoned)?;
        let filter = query.filter.as_ref();
        let selected = match filter.and_then(|f| f.key_restriction()) {
            Some(keys) => select(keys.iter().filter_map(|k| rows.get(k)), filter)?,
            None => select(rows.values(), filter)?,
        };
        Ok(reply(selected, query.shape))
    }

    fn affect(&self, actor: &str, items: Vec<AffectItem>) -> Result<Vec<AffectResult>, MeshError> {
        let now = Utc::now();
        let mut rows = self.rows.write().map_err(poisoned)?;
        let mut results = Vec::with_capacity(items.len());

        for item in items {
            results.push(match item {
                AffectItem::Create(object) => {
                    let object = stamp_new(&self.domain, object, actor, now, true)?;
                    rows.insert(object.key.clone(), object.clone());
                    AffectResult::Created(object)
                }
                AffectItem::Insert(object) => {
                    let object = stamp_new(&self.domain, object, actor, now, false)?;
                    rows.insert(object.key.clone(), object.clone());
                    AffectResult::Inserted(object)
                }
                AffectItem::Update { key, patch } => match rows.get_mut(&key) {
                    Some(object) => {
                        apply_patch(object, patch, actor, now);
                        AffectResult::Updated(Some(object.clone()))
                    }
                    None => AffectResult::Updated(None),
                },
                AffectItem::Delete(filter) => {
                    let doomed: Vec<MeshKey> = select(rows.values(), Some(&filter))?
                        .into_iter()
                        .map(|o| o.key)
                        .collect();
                    for key in &doomed {
                        rows.remove(key);
                    }
                    AffectResult::Deleted(doomed)
                }
            });
        }
        Ok(results)
    }
}

// =============================================================================
// LINKS
// =============================================================================

#[derive(Debug, Default)]
struct LinkTable {
    rows: BTreeMap<MeshKey, DomainLinker>,
    by_s: BTreeMap<MeshKey, BTreeSet<MeshKey>>,
    by_t: BTreeMap<MeshKey, BTreeSet<MeshKey>>,
}

impl LinkTable {
    fn index(&self, side: Side) -> &BTreeMap<MeshKey, BTreeSet<MeshKey>> {
        match side {
            Side::S => &self.by_s,
            Side::T => &self.by_t,
        }
    }

    fn insert(&mut self, linker: DomainLinker) {
        let key = linker.key();
        self.by_s
            .entry(linker.s_key.clone())
            .or_default()
            .insert(key.clone());
        self.by_t
            .entry(linker.t_key.clone())
            .or_default()
            .insert(key.clone());
        self.rows.insert(key, linker);
    }

    fn remove(&mut self, key: &MeshKey) -> bool {
        let Some(linker) = self.rows.remove(key) else {
            return false;
        };
        for (index, endpoint) in [(&mut self.by_s, &linker.s_key), (&mut self.by_t, &linker.t_key)] {
            if let Some(keys) = index.get_mut(endpoint) {
                keys.remove(key);
                if keys.is_empty() {
                    index.remove(endpoint);
                }
            }
        }
        true
    }

    fn candidates(&self, side: Side, endpoints: Option<&BTreeSet<MeshKey>>) -> Vec<&DomainLinker> {
        match endpoints {
            Some(endpoints) => endpoints
                .iter()
                .filter_map(|e| self.index(side).get(e))
                .flatten()
                .filter_map(|k| self.rows.get(k))
                .collect(),
            None => self.rows.values().collect(),
        }
    }
}

/// Links between one ordered pair of realized domains.
#[derive(Debug)]
pub struct MemoryLinks {
    s: MeshKey,
    t: MeshKey,
    table: RwLock<LinkTable>,
}

impl MemoryLinks {
    #[must_use]
    pub fn new(s: MeshKey, t: MeshKey) -> Self {
        Self {
            s,
            t,
            table: RwLock::new(LinkTable::default()),
        }
    }
}

impl LinkService for MemoryLinks {
    fn pair(&self) -> (&MeshKey, &MeshKey) {
        (&self.s, &self.t)
    }

    fn query(&self, query: &LinkQuery) -> Result<LinkReply, MeshError> {
        let table = self.table.read().map_err(poisoned)?;
        let restriction = query.subject.as_ref().and_then(|p| p.key_restriction());
        let mut matched = Vec::new();
        for linker in table.candidates(query.side, restriction.as_ref()) {
            if link_matches(linker, query)? {
                matched.push(linker.clone());
            }
        }
        Ok(link_reply(matched, query.shape))
    }

    fn affect(&self, actor: &str, items: Vec<LinkItem>) -> Result<Vec<usize>, MeshError> {
        let now = Utc::now();
        let mut table = self.table.write().map_err(poisoned)?;
        let mut touched = Vec::with_capacity(items.len());

        for item in items {
            touched.push(match item {
                LinkItem::Link { linker, exclusive } => {
                    let linker = stamp_link(linker, actor, now);
                    if exclusive {
                        let displaced: Vec<MeshKey> = table
                            .candidates(Side::S, Some(&BTreeSet::from([linker.s_key.clone()])))
                            .into_iter()
                            .filter(|existing| competes(existing, &linker))
                            .map(DomainLinker::key)
                            .collect();
                        for key in &displaced {
                            table.remove(key);
                        }
                    }
                    table.insert(linker);
                    1
                }
                LinkItem::Unlink(linker) => usize::from(table.remove(&linker.key())),
                LinkItem::UnlinkWhere(filter) => {
                    let mut doomed = Vec::new();
                    for linker in table.rows.values() {
                        if unlink_matches(linker, &filter)? {
                            doomed.push(linker.key());
                        }
                    }
                    for key in &doomed {
                        table.remove(key);
                    }
                    doomed.len()
                }
            });
        }
        Ok(touched)
    }
}

// =============================================================================
// BACKEND
// =============================================================================

/// Process-local backend. Services are created on first use and shared.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    values: RwLock<BTreeMap<MeshKey, Arc<MemoryValues>>>,
    links: RwLock<BTreeMap<(MeshKey, MeshKey), Arc<MemoryLinks>>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open_values(&self, domain: &RealizedDomain) -> Result<Arc<dyn ValueService>, MeshError> {
        if let Some(hit) = self.values.read().map_err(poisoned)?.get(&domain.key) {
            return Ok(Arc::clone(hit) as Arc<dyn ValueService>);
        }
        let mut values = self.values.write().map_err(poisoned)?;
        let service = values
            .entry(domain.key.clone())
            .or_insert_with(|| {
                debug!(domain = %domain, "Opened memory value table");
                Arc::new(MemoryValues::new(domain.key.clone()))
            });
        Ok(Arc::clone(service) as Arc<dyn ValueService>)
    }

    fn open_links(
        &self,
        s: &RealizedDomain,
        t: &RealizedDomain,
    ) -> Result<Arc<dyn LinkService>, MeshError> {
        let pair = (s.key.clone(), t.key.clone());
        if let Some(hit) = self.links.read().map_err(poisoned)?.get(&pair) {
            return Ok(Arc::clone(hit) as Arc<dyn LinkService>);
        }
        let mut links = self.links.write().map_err(poisoned)?;
        let service = links.entry(pair).or_insert_with(|| {
            debug!(s = %s, t = %t, "Opened memory link table");
            Arc::new(MemoryLinks::new(s.key.clone(), t.key.clone()))
        });
        Ok(Arc::clone(service) as Arc<dyn LinkService>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::Predicate;
    use crate::service::LinkShape;
    use crate::value::Value;

    fn domain() -> MeshKey {
        MeshKey::with_part("Domain", "Person")
    }

    #[test]
    fn create_query_update_delete() {
        let values = MemoryValues::new(domain());
        let created = values
            .affect(
                "tester",
                vec![
                    AffectItem::Create(DomainObject::default().with("name", "Alice").with("age", 25)),
                    AffectItem::Create(DomainObject::default().with("name", "Bob").with("age", 35)),
                ],
            )
            .expect("create");
        let AffectResult::Created(alice) = &created[0] else {
            unreachable!("create yields Created");
        };
        assert_eq!(alice.domain().expect("domain"), domain());

        let older = values
            .query(&ValueQuery::keys(Some(Predicate::greater("age", 30))))
            .expect("query");
        assert_eq!(older.count(), 1);

        let patch = BTreeMap::from([("age".to_string(), Some(Value::I32(40)))]);
        values
            .affect("tester", vec![AffectItem::Update { key: alice.key.clone(), patch }])
            .expect("update");
        let older = values
            .query(&ValueQuery::count(Some(Predicate::greater("age", 30))))
            .expect("query");
        assert_eq!(older, ValueReply::Count(2));

        let deleted = values
            .affect("tester", vec![AffectItem::Delete(Predicate::equal("name", "Bob"))])
            .expect("delete");
        assert!(matches!(&deleted[0], AffectResult::Deleted(keys) if keys.len() == 1));
        assert_eq!(values.query(&ValueQuery::count(None)).expect("count").count(), 1);
    }

    #[test]
    fn key_fast_path_matches_scan() {
        let values = MemoryValues::new(domain());
        let results = values
            .affect(
                "tester",
                (0..5)
                    .map(|i| AffectItem::Create(DomainObject::default().with("n", i)))
                    .collect(),
            )
            .expect("create");
        let keys: Vec<MeshKey> = results
            .into_iter()
            .filter_map(|r| match r {
                AffectResult::Created(o) => Some(o.key),
                _ => None,
            })
            .collect();
        let filter = Predicate::keys_in(&keys[..2]).and(Predicate::greater("n", 0));
        let fast = values.query(&ValueQuery::keys(Some(filter))).expect("query");
        assert_eq!(fast.count(), 1);
    }

    #[test]
    fn exclusive_link_replaces_competitors() {
        let links = MemoryLinks::new(domain(), MeshKey::with_part("Domain", "Tag"));
        let s = MeshKey::with_part("Unique", "s");
        let t1 = MeshKey::with_part("Unique", "t1");
        let t2 = MeshKey::with_part("Unique", "t2");
        links
            .affect(
                "tester",
                vec![LinkItem::Link {
                    linker: DomainLinker::new(s.clone(), t1, "best", ""),
                    exclusive: false,
                }],
            )
            .expect("link");
        links
            .affect(
                "tester",
                vec![LinkItem::Link {
                    linker: DomainLinker::new(s.clone(), t2.clone(), "best", ""),
                    exclusive: true,
                }],
            )
            .expect("link");

        let found = links
            .query(&LinkQuery::from_keys(Side::S, [&s]))
            .expect("query")
            .into_linkers();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].t_key, t2);
        assert_eq!(found[0].created_by.as_deref(), Some("tester"));
    }

    #[test]
    fn reverse_lookup_and_unlink_where() {
        let links = MemoryLinks::new(domain(), MeshKey::with_part("Domain", "Tag"));
        let t = MeshKey::with_part("Unique", "t");
        let items = (0..3)
            .map(|i| LinkItem::Link {
                linker: DomainLinker::new(MeshKey::with_part("Unique", format!("s{i}")), t.clone(), "tags", ""),
                exclusive: false,
            })
            .collect();
        links.affect("tester", items).expect("link");

        let count = links
            .query(&LinkQuery::from_keys(Side::T, [&t]).counting())
            .expect("count");
        assert_eq!(count, LinkReply::Count(3));
        assert_eq!(
            LinkQuery::from_keys(Side::T, [&t]).counting().shape,
            LinkShape::Count
        );

        let removed = links
            .affect(
                "tester",
                vec![LinkItem::UnlinkWhere(Predicate::equal(
                    "SKey",
                    Value::Key(MeshKey::with_part("Unique", "s1")),
                ))],
            )
            .expect("unlink");
        assert_eq!(removed, vec![1]);
    }

    #[test]
    fn backend_shares_services() {
        let backend = MemoryBackend::new();
        let person = RealizedDomain::new(
            Arc::new(crate::domain::Domain::new("Person")),
            vec![],
        )
        .expect("realize");
        let a = backend.open_values(&person).expect("open");
        let b = backend.open_values(&person).expect("open");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(backend.name(), "memory");
    }
}
