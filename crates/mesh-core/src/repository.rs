//! # Repository
//!
//! The engine context: one per process (or per test). It owns the type
//! catalog, the mechanic registry, the storage backend and the three
//! process-lifetime caches (services, operation-link graphs and, through the
//! catalog, realized domains).
//!
//! ## Writes
//!
//! [`Repository::save`] executes a write plan in two phases:
//!
//! 1. Node writes. Fresh nodes are created per domain in bulk; derived keys
//!    are computed from their owners; every other node is checked for
//!    existence in bulk and inserted or updated.
//! 2. Relationship writes. Resets unlink stale edges, then every plan link
//!    is written, batched per domain pair.
//!
//! Keys and metadata are then written back to the caller's instances
//! through their type's role mapping. Steps are not transactional across
//! domains: a failure leaves earlier steps in place.

use crate::aggregate::{AggregateQuery, AggregateResult, QueryKeyMap, QueryKeys};
use crate::config::{EngineConfig, StorageConfig};
use crate::domain::{Binding, Catalog, Domain, RealizedDomain, TypeMapping, TypeRef};
use crate::key::{KeyPart, MeshKey};
use crate::materialize::Materializer;
use crate::mechanic::{Mechanic, Mechanics, derived_key};
use crate::object::{FieldValue, ObjectGraph, ObjectId};
use crate::oplink::{OpLinkBuilder, OpLinkGraph, OpNodeId};
use crate::predicate::Predicate;
use crate::primitives::{PART_SKEY, PART_SMEMBER, PART_TKEY};
use crate::savelink::{PlanBuilder, PlanKey, PlanNode, WritePlan};
use crate::service::{
    AffectItem, AffectResult, Backend, LinkItem, LinkService, Stores, ValueQuery, ValueService,
};
use crate::storage::{MemoryBackend, RedbBackend};
use crate::types::{Direction, DomainLinker, DomainObject, MeshError};
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

fn poisoned<T>(_: T) -> MeshError {
    MeshError::LockPoisoned("repository")
}

type ShapeKey = (MeshKey, Option<String>);

pub struct Repository {
    config: EngineConfig,
    catalog: Catalog,
    mechanics: Mechanics,
    backend: Option<Arc<dyn Backend>>,
    value_services: RwLock<BTreeMap<MeshKey, Arc<dyn ValueService>>>,
    link_services: RwLock<BTreeMap<(MeshKey, MeshKey), Arc<dyn LinkService>>>,
    shapes: RwLock<BTreeMap<ShapeKey, Arc<OpLinkGraph>>>,
}

impl Repository {
    /// A repository over `backend`. With no backend every service must be
    /// registered explicitly.
    pub fn new(config: EngineConfig, backend: Option<Arc<dyn Backend>>) -> Result<Self, MeshError> {
        config.validate()?;
        info!(
            backend = backend.as_ref().map_or("none", |b| b.name()),
            actor = %config.actor,
            "Opened repository"
        );
        Ok(Self {
            config,
            catalog: Catalog::new(),
            mechanics: Mechanics::with_builtins(),
            backend,
            value_services: RwLock::new(BTreeMap::new()),
            link_services: RwLock::new(BTreeMap::new()),
            shapes: RwLock::new(BTreeMap::new()),
        })
    }

    /// Default configuration over a fresh in-memory backend.
    pub fn in_memory() -> Result<Self, MeshError> {
        Self::new(EngineConfig::default(), Some(Arc::new(MemoryBackend::new())))
    }

    /// Open the backend a configuration names.
    pub fn from_config(config: EngineConfig) -> Result<Self, MeshError> {
        config.validate()?;
        let backend: Arc<dyn Backend> = match &config.storage {
            StorageConfig::Memory => Arc::new(MemoryBackend::new()),
            StorageConfig::Redb { path } => Arc::new(RedbBackend::open(path)?),
        };
        Self::new(config, Some(backend))
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    // =========================================================================
    // REGISTRATION
    // =========================================================================

    pub fn register_type(&self, mapping: TypeMapping) -> Result<Arc<TypeMapping>, MeshError> {
        self.catalog.register_type(mapping)
    }

    pub fn register_domain(&self, domain: Domain) -> Result<Arc<Domain>, MeshError> {
        self.catalog.register_domain(domain)
    }

    /// Install a mechanic for a registered domain. Shapes already built keep
    /// the previous behaviour, so register mechanics before first use.
    pub fn register_mechanic(&self, domain: &str, mechanic: Arc<dyn Mechanic>) -> Result<(), MeshError> {
        let domain = self.catalog.domain(domain)?;
        self.mechanics.register(domain.key.clone(), mechanic)
    }

    /// Serve a realized domain from `service` instead of the backend.
    pub fn register_value_service(&self, service: Arc<dyn ValueService>) -> Result<(), MeshError> {
        let domain = service.domain().clone();
        info!(domain = %domain, "Registered value service");
        self.value_services
            .write()
            .map_err(poisoned)?
            .insert(domain, service);
        Ok(())
    }

    /// Serve a domain pair from `service` instead of the backend.
    pub fn register_link_service(&self, service: Arc<dyn LinkService>) -> Result<(), MeshError> {
        let (s, t) = service.pair();
        let pair = (s.clone(), t.clone());
        info!(s = %pair.0, t = %pair.1, "Registered link service");
        self.link_services
            .write()
            .map_err(poisoned)?
            .insert(pair, service);
        Ok(())
    }

    // =========================================================================
    // SHAPES
    // =========================================================================

    /// Realize a registered domain with concrete type arguments.
    pub fn realize(&self, domain: &str, args: &[TypeRef]) -> Result<Arc<RealizedDomain>, MeshError> {
        let bindings = args
            .iter()
            .map(|arg| self.catalog.resolve(arg, None))
            .collect::<Result<Vec<Binding>, _>>()?;
        self.catalog.realize(domain, bindings)
    }

    /// Every instantiation of `domain` discovered so far.
    pub fn instantiations(&self, domain: &str) -> Result<Vec<Arc<RealizedDomain>>, MeshError> {
        self.catalog.instantiations(domain)
    }

    /// The cached operation-link graph of a realized domain.
    pub fn operation_links(
        &self,
        realized: &Arc<RealizedDomain>,
        source: Option<&str>,
    ) -> Result<Arc<OpLinkGraph>, MeshError> {
        let key = (realized.key.clone(), source.map(str::to_string));
        if let Some(hit) = self.shapes.read().map_err(poisoned)?.get(&key) {
            return Ok(Arc::clone(hit));
        }
        let built = Arc::new(OpLinkBuilder::build(
            &self.catalog,
            &self.mechanics,
            Arc::clone(realized),
            key.1.clone(),
        )?);
        let mut shapes = self.shapes.write().map_err(poisoned)?;
        Ok(Arc::clone(shapes.entry(key).or_insert(built)))
    }

    /// Shape of a registered type, or of a bare non-generic domain.
    pub fn shape_of(&self, type_name: &str) -> Result<Arc<OpLinkGraph>, MeshError> {
        match self.catalog.type_mapping(type_name) {
            Ok(_) => {
                let realized = self.catalog.realize_type(type_name)?;
                self.operation_links(&realized, Some(type_name))
            }
            Err(MeshError::UnknownType(_)) => {
                let realized = self.catalog.realize(type_name, Vec::new())?;
                self.operation_links(&realized, None)
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Resolve the keys of an aggregate query without loading objects.
    pub fn query_keys(&self, query: &AggregateQuery) -> Result<QueryKeys, MeshError> {
        QueryKeyMap::new(self, query, self.config.query())?.run()
    }

    /// Run an aggregate query and load every object it reaches.
    pub fn query(&self, query: &AggregateQuery) -> Result<AggregateResult, MeshError> {
        let keys = self.query_keys(query)?;
        AggregateResult::load(self, keys)
    }

    /// The full request tree of a type's shape. `filter` selects the roots
    /// only; recursive re-entries into the root node are not filtered.
    pub fn query_shape(&self, type_name: &str, filter: Option<Predicate>) -> Result<AggregateQuery, MeshError> {
        let shape = self.shape_of(type_name)?;
        let root = shape.root();
        let mut query = AggregateQuery::new(shape.domain(root)?.realized.key.clone());
        if let Some(filter) = filter {
            query.first_filter(query.root(), filter)?;
        }

        let mut nodes = BTreeMap::from([(root, query.root())]);
        let mut pending: Vec<OpNodeId> = vec![root];
        while let Some(op) = pending.pop() {
            let parent = nodes
                .get(&op)
                .copied()
                .ok_or_else(|| MeshError::InvalidRequest(format!("unmapped operation node {}", op.0)))?;
            for link_id in &shape.domain(op)?.links {
                let link = shape.link(*link_id)?;
                match nodes.get(&link.to) {
                    Some(existing) => {
                        query.add_link_to(parent, link.member.clone(), link.direction, *existing)?;
                    }
                    None => {
                        let domain = shape.domain(link.to)?.realized.key.clone();
                        let child = query.add_link(parent, link.member.clone(), link.direction, domain)?;
                        nodes.insert(link.to, child);
                        pending.push(link.to);
                    }
                }
            }
        }
        Ok(query)
    }

    /// Re-attach a result as instances of `type_name`.
    pub fn materialize(
        &self,
        result: &AggregateResult,
        type_name: &str,
    ) -> Result<(ObjectGraph, Vec<ObjectId>), MeshError> {
        let shape = self.shape_of(type_name)?;
        let root_domain = &shape.domain(shape.root())?.realized.key;
        for key in &result.roots {
            if key.get(KeyPart::Domain)? != *root_domain {
                return Err(MeshError::InvalidRequest(format!(
                    "result root {key} is not a {type_name}"
                )));
            }
        }
        Materializer::new(&shape, result, &self.catalog, &self.mechanics).run()
    }

    /// Query a type's full shape and materialize it.
    pub fn load(
        &self,
        type_name: &str,
        filter: Option<Predicate>,
    ) -> Result<(ObjectGraph, Vec<ObjectId>), MeshError> {
        let query = self.query_shape(type_name, filter)?;
        let result = self.query(&query)?;
        self.materialize(&result, type_name)
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Flatten `roots` and everything they reference into a write plan.
    pub fn plan(&self, objects: &ObjectGraph, roots: &[ObjectId]) -> Result<WritePlan, MeshError> {
        let mut planner = PlanBuilder::new(objects, &self.catalog, &self.mechanics);
        for &id in roots {
            let instance = objects
                .get(id)
                .ok_or_else(|| MeshError::InvalidRequest(format!("no instance {}", id.0)))?;
            let shape = self.shape_of(&instance.type_name)?;
            planner.add_root(id, &shape)?;
        }
        Ok(planner.finish())
    }

    /// Persist `roots` and everything they reference. Returns the root keys.
    pub fn save(&self, objects: &mut ObjectGraph, roots: &[ObjectId]) -> Result<Vec<MeshKey>, MeshError> {
        let plan = self.plan(objects, roots)?;
        let mut keys: Vec<Option<MeshKey>> = vec![None; plan.len()];
        let mut stored: BTreeMap<usize, DomainObject> = BTreeMap::new();

        self.create_fresh(&plan, &mut keys, &mut stored)?;
        for (i, node) in plan.nodes.iter().enumerate() {
            if let PlanKey::Derived { owner, member } = &node.key {
                let owner_key = key_at(&keys, owner.0)?.clone();
                keys[i] = Some(derived_key(&node.realized.key, &owner_key, member));
            }
        }
        self.upsert_known(&plan, &keys, &mut stored)?;
        debug!(nodes = plan.len(), "Wrote plan nodes");

        self.write_links(&plan, &keys)?;
        debug!(resets = plan.resets.len(), links = plan.link_count(), "Wrote plan links");

        for (i, node) in plan.nodes.iter().enumerate() {
            if let Some(source) = node.source {
                self.write_back(objects, source, key_at(&keys, i)?, stored.get(&i))?;
            }
        }
        plan.roots.iter().map(|r| key_at(&keys, r.0).cloned()).collect()
    }

    fn create_fresh(
        &self,
        plan: &WritePlan,
        keys: &mut [Option<MeshKey>],
        stored: &mut BTreeMap<usize, DomainObject>,
    ) -> Result<(), MeshError> {
        let mut batches: BTreeMap<MeshKey, Vec<(usize, &PlanNode)>> = BTreeMap::new();
        for (i, node) in plan.nodes.iter().enumerate() {
            match &node.key {
                PlanKey::Fresh => batches.entry(node.realized.key.clone()).or_default().push((i, node)),
                PlanKey::Existing(key) => {
                    let mut key = key.clone();
                    if key.get(KeyPart::Domain)?.is_null() {
                        key.set_key_part(KeyPart::Domain.name(), &node.realized.key);
                    }
                    keys[i] = Some(key);
                }
                PlanKey::Derived { .. } => {}
            }
        }
        for (domain, batch) in batches {
            let items = batch
                .iter()
                .map(|(_, node)| AffectItem::Create(row(MeshKey::null(), node)))
                .collect();
            let results = self.values(&domain)?.affect(&self.config.actor, items)?;
            for ((i, _), result) in batch.iter().zip(results) {
                if let AffectResult::Created(object) = result {
                    keys[*i] = Some(object.key.clone());
                    stored.insert(*i, object);
                }
            }
        }
        Ok(())
    }

    fn upsert_known(
        &self,
        plan: &WritePlan,
        keys: &[Option<MeshKey>],
        stored: &mut BTreeMap<usize, DomainObject>,
    ) -> Result<(), MeshError> {
        let mut batches: BTreeMap<MeshKey, Vec<(usize, &PlanNode)>> = BTreeMap::new();
        for (i, node) in plan.nodes.iter().enumerate() {
            if node.key != PlanKey::Fresh {
                batches.entry(node.realized.key.clone()).or_default().push((i, node));
            }
        }
        for (domain, batch) in batches {
            let service = self.values(&domain)?;
            let wanted = batch
                .iter()
                .map(|(i, _)| key_at(keys, *i).cloned())
                .collect::<Result<Vec<_>, _>>()?;
            let present: BTreeSet<MeshKey> = service
                .query(&ValueQuery::keys(Some(Predicate::keys_in(&wanted))))?
                .into_keys()
                .into_iter()
                .collect();

            let items = batch
                .iter()
                .zip(&wanted)
                .map(|((_, node), key)| {
                    if present.contains(key) {
                        AffectItem::Update {
                            key: key.clone(),
                            patch: node
                                .values
                                .iter()
                                .map(|(k, v)| (k.clone(), Some(v.clone())))
                                .chain(node.cleared.iter().map(|k| (k.clone(), None)))
                                .collect(),
                        }
                    } else {
                        AffectItem::Insert(row(key.clone(), node))
                    }
                })
                .collect();
            let results = service.affect(&self.config.actor, items)?;
            for ((i, _), result) in batch.iter().zip(results) {
                if let AffectResult::Inserted(object) | AffectResult::Updated(Some(object)) = result {
                    stored.insert(*i, object);
                }
            }
        }
        Ok(())
    }

    fn write_links(&self, plan: &WritePlan, keys: &[Option<MeshKey>]) -> Result<(), MeshError> {
        for reset in &plan.resets {
            let node = plan.node(reset.node)?;
            let key = key_at(keys, reset.node.0)?;
            let (s, t) = reset.direction.pair(&node.realized.key, &reset.other);
            let anchor = match reset.direction {
                Direction::Forward => PART_SKEY,
                Direction::Reverse => PART_TKEY,
            };
            let filter = Predicate::equal(anchor, Value::Key(key.clone()))
                .and(Predicate::equal(PART_SMEMBER, reset.member.as_str()));
            self.links(s, t)?
                .affect(&self.config.actor, vec![LinkItem::UnlinkWhere(filter)])?;
        }

        let mut batches: BTreeMap<(MeshKey, MeshKey), Vec<LinkItem>> = BTreeMap::new();
        for (i, node) in plan.nodes.iter().enumerate() {
            let child_key = key_at(keys, i)?;
            for link in &node.links {
                let parent = plan.node(link.parent)?;
                let parent_key = key_at(keys, link.parent.0)?;
                let (s_domain, t_domain) = link.direction.pair(&parent.realized.key, &node.realized.key);
                let (s_key, t_key) = link.direction.pair(parent_key, child_key);
                let mut linker = DomainLinker::new(
                    s_key.clone(),
                    t_key.clone(),
                    link.member.as_str(),
                    link.t_member.as_str(),
                );
                linker.extra = link.extra.clone();
                batches
                    .entry((s_domain.clone(), t_domain.clone()))
                    .or_default()
                    .push(LinkItem::Link {
                        linker,
                        exclusive: link.exclusive,
                    });
            }
        }
        for ((s, t), items) in batches {
            self.links(&s, &t)?.affect(&self.config.actor, items)?;
        }
        Ok(())
    }

    /// Store the key and metadata on the caller's instance.
    fn write_back(
        &self,
        objects: &mut ObjectGraph,
        id: ObjectId,
        key: &MeshKey,
        stored: Option<&DomainObject>,
    ) -> Result<(), MeshError> {
        let type_name = objects
            .get(id)
            .map(|i| i.type_name.clone())
            .ok_or_else(|| MeshError::InvalidRequest(format!("no instance {}", id.0)))?;
        let roles = self.catalog.roles(&type_name)?;
        if let Some(instance) = objects.get_mut(id) {
            instance.key = Some(key.clone());
        }
        if let Some(member) = roles.key {
            objects.set(id, member, FieldValue::Scalar(Value::Key(key.clone())));
        }
        let Some(stored) = stored else {
            return Ok(());
        };
        let meta = &stored.meta;
        let stamps = [
            (roles.created_at, meta.created_at.map(Value::Timestamp)),
            (roles.created_by, meta.created_by.clone().map(Value::Str)),
            (roles.updated_at, meta.updated_at.map(Value::Timestamp)),
            (roles.updated_by, meta.updated_by.clone().map(Value::Str)),
        ];
        for (member, value) in stamps {
            if let (Some(member), Some(value)) = (member, value) {
                objects.set(id, member, FieldValue::Scalar(value));
            }
        }
        Ok(())
    }

    /// Remove objects of a realized domain matching `filter`, and every
    /// link touching them. Returns the removed keys.
    pub fn delete(&self, domain: &MeshKey, filter: &Predicate) -> Result<Vec<MeshKey>, MeshError> {
        let service = self.values(domain)?;
        let doomed = service
            .query(&ValueQuery::keys(Some(filter.clone())))?
            .into_keys();
        if doomed.is_empty() {
            return Ok(doomed);
        }

        let mut pairs: BTreeSet<(MeshKey, MeshKey)> = self
            .link_services
            .read()
            .map_err(poisoned)?
            .keys()
            .filter(|(s, t)| s == domain || t == domain)
            .cloned()
            .collect();
        if let Some(realized) = self.catalog.lookup(domain)? {
            let source = self.catalog.source_type(&realized)?;
            let shape = self.operation_links(&realized, source.as_deref())?;
            for link_id in &shape.domain(shape.root())?.links {
                let link = shape.link(*link_id)?;
                let other = &shape.domain(link.to)?.realized.key;
                let (s, t) = link.direction.pair(domain, other);
                pairs.insert((s.clone(), t.clone()));
            }
        }

        let listed: Vec<Value> = doomed.iter().cloned().map(Value::Key).collect();
        for (s, t) in pairs {
            let mut items = Vec::new();
            if s == *domain {
                items.push(LinkItem::UnlinkWhere(Predicate::is_in(PART_SKEY, listed.clone())));
            }
            if t == *domain {
                items.push(LinkItem::UnlinkWhere(Predicate::is_in(PART_TKEY, listed.clone())));
            }
            self.links(&s, &t)?.affect(&self.config.actor, items)?;
        }
        service.affect(
            &self.config.actor,
            vec![AffectItem::Delete(Predicate::keys_in(&doomed))],
        )?;
        info!(domain = %domain, removed = doomed.len(), "Deleted objects");
        Ok(doomed)
    }
}

fn key_at(keys: &[Option<MeshKey>], index: usize) -> Result<&MeshKey, MeshError> {
    keys.get(index)
        .and_then(Option::as_ref)
        .ok_or_else(|| MeshError::InvalidRequest(format!("plan node {index} has no key")))
}

fn row(key: MeshKey, node: &PlanNode) -> DomainObject {
    DomainObject {
        key,
        values: node.values.clone(),
        ..DomainObject::default()
    }
}

// =============================================================================
// SERVICE LOOKUP
// =============================================================================

impl Stores for Repository {
    fn values(&self, domain: &MeshKey) -> Result<Arc<dyn ValueService>, MeshError> {
        if let Some(hit) = self.value_services.read().map_err(poisoned)?.get(domain) {
            return Ok(Arc::clone(hit));
        }
        let not_found = || MeshError::ServiceNotFound(domain.clone());
        let backend = self.backend.as_ref().ok_or_else(not_found)?;
        let realized = self.catalog.lookup(domain)?.ok_or_else(not_found)?;
        let opened = backend.open_values(&realized)?;

        let mut cache = self.value_services.write().map_err(poisoned)?;
        Ok(Arc::clone(cache.entry(domain.clone()).or_insert(opened)))
    }

    fn links(&self, s: &MeshKey, t: &MeshKey) -> Result<Arc<dyn LinkService>, MeshError> {
        let pair = (s.clone(), t.clone());
        if let Some(hit) = self.link_services.read().map_err(poisoned)?.get(&pair) {
            return Ok(Arc::clone(hit));
        }
        let not_found = || MeshError::LinkServiceNotFound(s.clone(), t.clone());
        let backend = self.backend.as_ref().ok_or_else(not_found)?;
        let s_domain = self.catalog.lookup(s)?.ok_or_else(not_found)?;
        let t_domain = self.catalog.lookup(t)?.ok_or_else(not_found)?;
        let opened = backend.open_links(&s_domain, &t_domain)?;

        let mut cache = self.link_services.write().map_err(poisoned)?;
        Ok(Arc::clone(cache.entry(pair).or_insert(opened)))
    }
}
