//! # Domain Model
//!
//! Domains are named type descriptors: a property list plus optional generic
//! parameters. The [`Catalog`] owns every registered domain and type mapping
//! and caches realized domains for the lifetime of the repository.
//!
//! ## Caching
//!
//! The realized-domain cache and the instantiation-discovery index grow
//! monotonically. Lookups take a read lock and return on hit; a miss builds
//! the entry outside any lock, then takes the write lock and inserts only if
//! no other request won the race.

pub mod mapping;
pub mod realized;

pub use mapping::{Roles, TypeMapping, TypeMappingBuilder};
pub use realized::{Binding, RealizedDomain};

use crate::key::MeshKey;
use crate::primitives::{MAP_DOMAIN, MAP_ENTRIES, MAP_KEYS, MAP_VALUES, PART_DOMAIN, SET_DOMAIN, SET_ITEMS};
use crate::types::MeshError;
use crate::value::ScalarType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

// =============================================================================
// DESCRIPTORS
// =============================================================================

/// How many values a property holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Multiplicity {
    One,
    Many,
}

/// Declared type of a property or generic argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeRef {
    Scalar(ScalarType),
    /// A generic parameter of the enclosing domain.
    Generic(String),
    /// Another domain, with its own type arguments.
    Domain { name: String, args: Vec<TypeRef> },
}

impl TypeRef {
    /// Reference to a non-generic domain.
    #[must_use]
    pub fn domain(name: impl Into<String>) -> Self {
        Self::Domain {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Reference to a generic domain instantiation.
    #[must_use]
    pub fn generic_domain(name: impl Into<String>, args: Vec<TypeRef>) -> Self {
        Self::Domain {
            name: name.into(),
            args,
        }
    }

    fn generics_used<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Scalar(_) => {}
            Self::Generic(param) => out.push(param),
            Self::Domain { args, .. } => args.iter().for_each(|arg| arg.generics_used(out)),
        }
    }
}

/// A named, typed member of a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub multiplicity: Multiplicity,
    pub ty: TypeRef,
    /// For domain-typed properties: the S-side role of the relationship this
    /// property views from the T side. `None` means this property owns the
    /// relationship (it is the S-side role itself).
    pub inverse: Option<String>,
}

impl Property {
    /// Single scalar value.
    #[must_use]
    pub fn scalar(name: impl Into<String>, ty: ScalarType) -> Self {
        Self::one(name, TypeRef::Scalar(ty))
    }

    /// Single value of any type.
    #[must_use]
    pub fn one(name: impl Into<String>, ty: TypeRef) -> Self {
        Self {
            name: name.into(),
            multiplicity: Multiplicity::One,
            ty,
            inverse: None,
        }
    }

    /// Collection of values.
    #[must_use]
    pub fn many(name: impl Into<String>, ty: TypeRef) -> Self {
        Self {
            multiplicity: Multiplicity::Many,
            ..Self::one(name, ty)
        }
    }

    /// Mark as the reverse view of an S-side role.
    #[must_use]
    pub fn with_inverse(mut self, role: impl Into<String>) -> Self {
        self.inverse = Some(role.into());
        self
    }
}

/// Placeholder type parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericParam {
    pub name: String,
    pub position: usize,
}

/// A named type descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    /// `{Domain: name}`.
    pub key: MeshKey,
    pub name: String,
    pub generics: Vec<GenericParam>,
    pub properties: Vec<Property>,
}

impl Domain {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            key: MeshKey::with_part(PART_DOMAIN, name.as_str()),
            name,
            generics: Vec::new(),
            properties: Vec::new(),
        }
    }

    /// Append a generic parameter.
    #[must_use]
    pub fn with_generic(mut self, name: impl Into<String>) -> Self {
        let position = self.generics.len();
        self.generics.push(GenericParam {
            name: name.into(),
            position,
        });
        self
    }

    /// Append a property.
    #[must_use]
    pub fn with_property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    #[must_use]
    pub fn generic_position(&self, name: &str) -> Option<usize> {
        self.generics
            .iter()
            .find(|g| g.name == name)
            .map(|g| g.position)
    }

    /// Every generic used by a property must be declared.
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.name.trim().is_empty() {
            return Err(MeshError::UnnamedType);
        }
        for property in &self.properties {
            let mut used = Vec::new();
            property.ty.generics_used(&mut used);
            if let Some(param) = used.into_iter().find(|p| self.generic_position(p).is_none()) {
                return Err(MeshError::UnresolvedGeneric {
                    domain: self.name.clone(),
                    param: param.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// The built-in unique-set domain `Set<T>`.
#[must_use]
pub fn set_domain() -> Domain {
    Domain::new(SET_DOMAIN)
        .with_generic("T")
        .with_property(Property::many(SET_ITEMS, TypeRef::Generic("T".into())))
}

/// The built-in string-keyed map domain `Map<V>`.
#[must_use]
pub fn map_domain() -> Domain {
    Domain::new(MAP_DOMAIN)
        .with_generic("V")
        .with_property(Property::many(MAP_ENTRIES, TypeRef::Generic("V".into())))
        .with_property(Property::many(MAP_KEYS, TypeRef::Scalar(ScalarType::Str)))
        .with_property(Property::many(MAP_VALUES, TypeRef::Generic("V".into())))
}

// =============================================================================
// CATALOG
// =============================================================================

fn poisoned<T>(_: T) -> MeshError {
    MeshError::LockPoisoned("domain catalog")
}

/// Registry of domains and type mappings plus the realized-domain caches.
#[derive(Debug)]
pub struct Catalog {
    domains: RwLock<BTreeMap<String, Arc<Domain>>>,
    types: RwLock<BTreeMap<String, Arc<TypeMapping>>>,
    realized: RwLock<BTreeMap<MeshKey, Arc<RealizedDomain>>>,
    instantiations: RwLock<BTreeMap<String, BTreeSet<MeshKey>>>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    /// A catalog holding only the built-in `Set` and `Map` domains.
    #[must_use]
    pub fn new() -> Self {
        let builtins = [set_domain(), map_domain()]
            .into_iter()
            .map(|d| (d.name.clone(), Arc::new(d)))
            .collect();
        Self {
            domains: RwLock::new(builtins),
            types: RwLock::new(BTreeMap::new()),
            realized: RwLock::new(BTreeMap::new()),
            instantiations: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a domain. Re-registering an identical domain is a no-op.
    pub fn register_domain(&self, domain: Domain) -> Result<Arc<Domain>, MeshError> {
        domain.validate()?;
        let mut domains = self.domains.write().map_err(poisoned)?;
        if let Some(existing) = domains.get(&domain.name) {
            if **existing == domain {
                return Ok(Arc::clone(existing));
            }
            return Err(MeshError::DuplicateAlias { alias: domain.name });
        }
        info!(domain = %domain.name, properties = domain.properties.len(), "Registered domain");
        let domain = Arc::new(domain);
        domains.insert(domain.name.clone(), Arc::clone(&domain));
        Ok(domain)
    }

    /// Register a source type and the domain it maps to.
    pub fn register_type(&self, mapping: TypeMapping) -> Result<Arc<TypeMapping>, MeshError> {
        {
            let types = self.types.read().map_err(poisoned)?;
            if let Some(existing) = types.get(&mapping.type_name) {
                if **existing == mapping {
                    return Ok(Arc::clone(existing));
                }
                return Err(MeshError::DuplicateAlias {
                    alias: mapping.type_name.clone(),
                });
            }
        }
        self.register_domain(mapping.domain.clone())?;

        let mut types = self.types.write().map_err(poisoned)?;
        let mapping = Arc::new(mapping);
        let entry = types
            .entry(mapping.type_name.clone())
            .or_insert_with(|| Arc::clone(&mapping));
        if **entry != *mapping {
            return Err(MeshError::DuplicateAlias {
                alias: mapping.type_name.clone(),
            });
        }
        info!(source_type = %mapping.type_name, domain = %mapping.domain.name, "Registered type");
        Ok(Arc::clone(entry))
    }

    pub fn domain(&self, name: &str) -> Result<Arc<Domain>, MeshError> {
        self.domains
            .read()
            .map_err(poisoned)?
            .get(name)
            .cloned()
            .ok_or_else(|| MeshError::UnknownDomain(name.to_string()))
    }

    pub fn type_mapping(&self, type_name: &str) -> Result<Arc<TypeMapping>, MeshError> {
        self.types
            .read()
            .map_err(poisoned)?
            .get(type_name)
            .cloned()
            .ok_or_else(|| MeshError::UnknownType(type_name.to_string()))
    }

    /// Role members of a source type. Bare domain names have none.
    pub fn roles(&self, type_name: &str) -> Result<Roles, MeshError> {
        Ok(self
            .types
            .read()
            .map_err(poisoned)?
            .get(type_name)
            .map(|m| m.roles.clone())
            .unwrap_or_default())
    }

    /// Names of every registered domain.
    pub fn domain_names(&self) -> Result<Vec<String>, MeshError> {
        Ok(self.domains.read().map_err(poisoned)?.keys().cloned().collect())
    }

    /// Bind a domain's generics, reusing the cached instance if one exists.
    pub fn realize(&self, name: &str, bindings: Vec<Binding>) -> Result<Arc<RealizedDomain>, MeshError> {
        let candidate = RealizedDomain::new(self.domain(name)?, bindings)?;
        if let Some(hit) = self.realized.read().map_err(poisoned)?.get(&candidate.key) {
            return Ok(Arc::clone(hit));
        }

        let realized = {
            let mut cache = self.realized.write().map_err(poisoned)?;
            Arc::clone(
                cache
                    .entry(candidate.key.clone())
                    .or_insert_with(|| Arc::new(candidate)),
            )
        };
        let mut discovered = self.instantiations.write().map_err(poisoned)?;
        if discovered
            .entry(realized.domain.name.clone())
            .or_default()
            .insert(realized.key.clone())
        {
            debug!(realized = %realized, "Discovered instantiation");
        }
        Ok(realized)
    }

    /// Resolve a type reference, binding generics from `context`.
    pub fn resolve(&self, ty: &TypeRef, context: Option<&RealizedDomain>) -> Result<Binding, MeshError> {
        match ty {
            TypeRef::Scalar(t) => Ok(Binding::Scalar(*t)),
            TypeRef::Generic(param) => match context {
                Some(realized) => realized.binding(param).cloned(),
                None => Err(MeshError::UnresolvedGeneric {
                    domain: String::new(),
                    param: param.clone(),
                }),
            },
            TypeRef::Domain { name, args } => {
                let bindings = args
                    .iter()
                    .map(|arg| self.resolve(arg, context))
                    .collect::<Result<Vec<_>, _>>()?;
                self.realize(name, bindings).map(Binding::Domain)
            }
        }
    }

    /// Resolve a type reference that must name a domain.
    pub fn realize_ref(&self, ty: &TypeRef, context: Option<&RealizedDomain>) -> Result<Arc<RealizedDomain>, MeshError> {
        match self.resolve(ty, context)? {
            Binding::Domain(realized) => Ok(realized),
            Binding::Scalar(t) => Err(MeshError::InvalidRequest(format!(
                "expected a domain type, found scalar {t}"
            ))),
        }
    }

    /// The realized domain a registered source type maps to.
    pub fn realize_type(&self, type_name: &str) -> Result<Arc<RealizedDomain>, MeshError> {
        let mapping = self.type_mapping(type_name)?;
        let bindings = mapping
            .args
            .iter()
            .map(|arg| self.resolve(arg, None))
            .collect::<Result<Vec<_>, _>>()?;
        self.realize(&mapping.domain.name, bindings)
    }

    /// The first registered source type that maps onto `realized`.
    pub fn source_type(&self, realized: &RealizedDomain) -> Result<Option<String>, MeshError> {
        let candidates: Vec<Arc<TypeMapping>> = self
            .types
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|m| m.domain.name == realized.domain.name)
            .cloned()
            .collect();
        for mapping in candidates {
            if self.realize_type(&mapping.type_name)?.key == realized.key {
                return Ok(Some(mapping.type_name.clone()));
            }
        }
        Ok(None)
    }

    /// A previously realized domain, by key.
    pub fn lookup(&self, key: &MeshKey) -> Result<Option<Arc<RealizedDomain>>, MeshError> {
        Ok(self.realized.read().map_err(poisoned)?.get(key).cloned())
    }

    /// Every instantiation of a domain realized so far.
    pub fn instantiations(&self, name: &str) -> Result<Vec<Arc<RealizedDomain>>, MeshError> {
        let keys = self
            .instantiations
            .read()
            .map_err(poisoned)?
            .get(name)
            .cloned()
            .unwrap_or_default();
        let cache = self.realized.read().map_err(poisoned)?;
        Ok(keys.iter().filter_map(|k| cache.get(k).cloned()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> Domain {
        Domain::new("Person")
            .with_property(Property::scalar("name", ScalarType::Str))
            .with_property(Property::many("tags", TypeRef::domain("Tag")))
    }

    #[test]
    fn undeclared_generic_is_rejected() {
        let broken = Domain::new("Box").with_property(Property::one("item", TypeRef::Generic("T".into())));
        assert!(matches!(
            broken.validate(),
            Err(MeshError::UnresolvedGeneric { .. })
        ));
    }

    #[test]
    fn conflicting_domain_registration() {
        let catalog = Catalog::new();
        catalog.register_domain(person()).expect("first");
        catalog.register_domain(person()).expect("identical is fine");
        let err = catalog
            .register_domain(Domain::new("Person"))
            .expect_err("different shape");
        assert!(matches!(err, MeshError::DuplicateAlias { .. }));
    }

    #[test]
    fn realize_is_cached_and_discovered() {
        let catalog = Catalog::new();
        catalog.register_domain(Domain::new("Tag")).expect("tag");
        let set_of_tags = TypeRef::generic_domain(SET_DOMAIN, vec![TypeRef::domain("Tag")]);
        let a = catalog.realize_ref(&set_of_tags, None).expect("realize");
        let b = catalog.realize_ref(&set_of_tags, None).expect("realize");
        assert!(Arc::ptr_eq(&a, &b));

        let strings = TypeRef::generic_domain(SET_DOMAIN, vec![TypeRef::Scalar(ScalarType::Str)]);
        catalog.realize_ref(&strings, None).expect("realize");
        assert_eq!(catalog.instantiations(SET_DOMAIN).expect("list").len(), 2);
        assert_eq!(catalog.lookup(&a.key).expect("lookup").map(|r| r.key.clone()), Some(a.key.clone()));
    }

    #[test]
    fn generic_without_context_is_unresolved() {
        let catalog = Catalog::new();
        let err = catalog
            .resolve(&TypeRef::Generic("T".into()), None)
            .expect_err("no context");
        assert!(matches!(err, MeshError::UnresolvedGeneric { .. }));
    }

    #[test]
    fn unknown_domain() {
        let catalog = Catalog::new();
        assert!(matches!(
            catalog.realize("Nope", vec![]),
            Err(MeshError::UnknownDomain(_))
        ));
    }
}
