//! # Realized Domains
//!
//! A realized domain binds every generic parameter of a domain to either a
//! scalar type or another realized domain. The binding is folded into the
//! key as `Arg{n}` parts, so each instantiation is its own storage shape.

use crate::domain::{Domain, Property, TypeRef};
use crate::key::MeshKey;
use crate::primitives::{PART_ARG_PREFIX, PART_DOMAIN};
use crate::types::MeshError;
use crate::value::ScalarType;
use std::fmt;
use std::sync::Arc;

/// What a generic parameter (or a property type) resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Scalar(ScalarType),
    Domain(Arc<RealizedDomain>),
}

impl Binding {
    /// Text stored in the realized key for this binding.
    fn key_text(&self) -> &str {
        match self {
            Self::Scalar(t) => t.name(),
            Self::Domain(realized) => realized.key.as_str(),
        }
    }

    /// The realized domain, if this is a domain binding.
    #[must_use]
    pub fn as_domain(&self) -> Option<&Arc<RealizedDomain>> {
        match self {
            Self::Domain(realized) => Some(realized),
            Self::Scalar(_) => None,
        }
    }
}

/// A domain with its generic parameters bound.
#[derive(Debug, Clone, PartialEq)]
pub struct RealizedDomain {
    pub key: MeshKey,
    pub domain: Arc<Domain>,
    /// One binding per generic parameter, by position.
    pub bindings: Vec<Binding>,
}

impl RealizedDomain {
    /// Bind a domain. The argument count must match its generic parameters.
    pub fn new(domain: Arc<Domain>, bindings: Vec<Binding>) -> Result<Self, MeshError> {
        if bindings.len() != domain.generics.len() {
            return Err(MeshError::MissingTypeArguments {
                domain: domain.name.clone(),
                expected: domain.generics.len(),
                actual: bindings.len(),
            });
        }
        Ok(Self {
            key: realized_key(&domain, &bindings),
            domain,
            bindings,
        })
    }

    /// Domain name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.domain.name
    }

    /// Binding of a named generic parameter.
    pub fn binding(&self, param: &str) -> Result<&Binding, MeshError> {
        self.domain
            .generic_position(param)
            .and_then(|pos| self.bindings.get(pos))
            .ok_or_else(|| MeshError::UnresolvedGeneric {
                domain: self.domain.name.clone(),
                param: param.to_string(),
            })
    }

    /// Binding at a position.
    #[must_use]
    pub fn argument(&self, position: usize) -> Option<&Binding> {
        self.bindings.get(position)
    }

    /// Property by name.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.domain.property(name)
    }

    /// Whether a property type refers (directly or through a generic) to a
    /// scalar under this binding.
    pub fn is_scalar(&self, ty: &TypeRef) -> Result<bool, MeshError> {
        Ok(match ty {
            TypeRef::Scalar(_) => true,
            TypeRef::Generic(param) => matches!(self.binding(param)?, Binding::Scalar(_)),
            TypeRef::Domain { .. } => false,
        })
    }
}

/// Domain key plus one `Arg{n}` part per binding.
fn realized_key(domain: &Domain, bindings: &[Binding]) -> MeshKey {
    let mut key = MeshKey::with_part(PART_DOMAIN, domain.name.as_str());
    for (position, binding) in bindings.iter().enumerate() {
        key.set_part(format!("{PART_ARG_PREFIX}{position}"), binding.key_text());
    }
    key
}

impl fmt::Display for RealizedDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.domain.name)?;
        if self.bindings.is_empty() {
            return Ok(());
        }
        f.write_str("<")?;
        for (i, binding) in self.bindings.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match binding {
                Binding::Scalar(t) => write!(f, "{t}")?,
                Binding::Domain(realized) => write!(f, "{realized}")?,
            }
        }
        f.write_str(">")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Domain, Property};

    fn set_domain() -> Arc<Domain> {
        Arc::new(
            Domain::new("Set")
                .with_generic("T")
                .with_property(Property::many("$items", TypeRef::Generic("T".into()))),
        )
    }

    #[test]
    fn non_generic_key_equals_domain_key() {
        let person = Arc::new(Domain::new("Person"));
        let realized = RealizedDomain::new(Arc::clone(&person), vec![]).expect("realize");
        assert_eq!(realized.key, person.key);
        assert_eq!(realized.to_string(), "Person");
    }

    #[test]
    fn instantiations_have_distinct_keys() {
        let tag = Arc::new(
            RealizedDomain::new(Arc::new(Domain::new("Tag")), vec![]).expect("realize"),
        );
        let strings =
            RealizedDomain::new(set_domain(), vec![Binding::Scalar(ScalarType::Str)]).expect("set");
        let tags = RealizedDomain::new(set_domain(), vec![Binding::Domain(tag)]).expect("set");
        assert_ne!(strings.key, tags.key);
        assert_eq!(strings.to_string(), "Set<string>");
        assert_eq!(tags.to_string(), "Set<Tag>");
    }

    #[test]
    fn wrong_argument_count_is_rejected() {
        let err = RealizedDomain::new(set_domain(), vec![]).expect_err("missing args");
        assert!(matches!(
            err,
            MeshError::MissingTypeArguments {
                expected: 1,
                actual: 0,
                ..
            }
        ));
    }

    #[test]
    fn generic_binding_lookup() {
        let realized =
            RealizedDomain::new(set_domain(), vec![Binding::Scalar(ScalarType::I64)]).expect("set");
        assert_eq!(
            realized.binding("T").expect("bound"),
            &Binding::Scalar(ScalarType::I64)
        );
        assert!(realized.binding("U").is_err());
        assert!(realized.is_scalar(&TypeRef::Generic("T".into())).expect("known"));
    }
}
