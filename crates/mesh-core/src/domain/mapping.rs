//! # Type Mappings
//!
//! Explicit registration table for caller-level types. A mapping names the
//! domain a type persists as, the properties it carries and which of its
//! members play a semantic role (key, creation/update stamps). It is resolved
//! once, at registration.
//!
//! ```ignore
//! let person = TypeMapping::builder("app::Person")
//!     .alias("Person")
//!     .scalar("name", ScalarType::Str)
//!     .many("tags", TypeRef::domain("Tag"))
//!     .key("id")
//!     .created_at("created")
//!     .build()?;
//! ```

use crate::domain::{Domain, Property, TypeRef};
use crate::types::MeshError;
use crate::value::ScalarType;

/// Members that receive engine-managed values after a save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roles {
    pub key: Option<String>,
    pub created_at: Option<String>,
    pub created_by: Option<String>,
    pub updated_at: Option<String>,
    pub updated_by: Option<String>,
}

impl Roles {
    fn members(&self) -> impl Iterator<Item = &str> {
        [
            &self.key,
            &self.created_at,
            &self.created_by,
            &self.updated_at,
            &self.updated_by,
        ]
        .into_iter()
        .filter_map(|m| m.as_deref())
    }
}

/// A registered source type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMapping {
    pub type_name: String,
    /// The domain this type persists as.
    pub domain: Domain,
    /// Concrete arguments for the domain's generic parameters.
    pub args: Vec<TypeRef>,
    pub roles: Roles,
}

impl TypeMapping {
    #[must_use]
    pub fn builder(type_name: impl Into<String>) -> TypeMappingBuilder {
        TypeMappingBuilder {
            type_name: type_name.into(),
            alias: None,
            domain: None,
            args: Vec::new(),
            roles: Roles::default(),
        }
    }
}

/// Builder for [`TypeMapping`].
#[derive(Debug, Clone)]
pub struct TypeMappingBuilder {
    type_name: String,
    alias: Option<String>,
    domain: Option<Domain>,
    args: Vec<TypeRef>,
    roles: Roles,
}

impl TypeMappingBuilder {
    fn take_domain(&mut self) -> Domain {
        let name = self.alias.as_deref().unwrap_or(&self.type_name);
        self.domain.take().unwrap_or_else(|| Domain::new(name))
    }

    /// Persist under this domain name instead of the type name.
    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        let alias = alias.into();
        if let Some(domain) = self.domain.take() {
            let mut renamed = Domain::new(alias.as_str());
            renamed.generics = domain.generics;
            renamed.properties = domain.properties;
            self.domain = Some(renamed);
        }
        self.alias = Some(alias);
        self
    }

    /// Declare a generic parameter of the domain.
    #[must_use]
    pub fn generic(mut self, name: impl Into<String>) -> Self {
        let domain = self.take_domain();
        self.domain = Some(domain.with_generic(name));
        self
    }

    #[must_use]
    pub fn property(mut self, property: Property) -> Self {
        let domain = self.take_domain();
        self.domain = Some(domain.with_property(property));
        self
    }

    #[must_use]
    pub fn scalar(self, name: impl Into<String>, ty: ScalarType) -> Self {
        self.property(Property::scalar(name, ty))
    }

    #[must_use]
    pub fn one(self, name: impl Into<String>, ty: TypeRef) -> Self {
        self.property(Property::one(name, ty))
    }

    #[must_use]
    pub fn many(self, name: impl Into<String>, ty: TypeRef) -> Self {
        self.property(Property::many(name, ty))
    }

    /// Concrete type arguments for the domain's generics.
    #[must_use]
    pub fn args(mut self, args: Vec<TypeRef>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn key(mut self, member: impl Into<String>) -> Self {
        self.roles.key = Some(member.into());
        self
    }

    #[must_use]
    pub fn created_at(mut self, member: impl Into<String>) -> Self {
        self.roles.created_at = Some(member.into());
        self
    }

    #[must_use]
    pub fn created_by(mut self, member: impl Into<String>) -> Self {
        self.roles.created_by = Some(member.into());
        self
    }

    #[must_use]
    pub fn updated_at(mut self, member: impl Into<String>) -> Self {
        self.roles.updated_at = Some(member.into());
        self
    }

    #[must_use]
    pub fn updated_by(mut self, member: impl Into<String>) -> Self {
        self.roles.updated_by = Some(member.into());
        self
    }

    /// Resolve the mapping.
    ///
    /// # Errors
    ///
    /// - `UnnamedType` if the type or alias name is blank
    /// - `UnresolvedGeneric` if a property or argument uses an undeclared
    ///   (or any, for arguments) generic parameter
    /// - `MissingTypeArguments` if the argument count does not match
    /// - `Config` if a role member collides with a property
    pub fn build(mut self) -> Result<TypeMapping, MeshError> {
        if self.type_name.trim().is_empty() || self.alias.as_deref().is_some_and(|a| a.trim().is_empty()) {
            return Err(MeshError::UnnamedType);
        }
        let domain = self.take_domain();
        domain.validate()?;

        if self.args.len() != domain.generics.len() {
            return Err(MeshError::MissingTypeArguments {
                domain: domain.name.clone(),
                expected: domain.generics.len(),
                actual: self.args.len(),
            });
        }
        if let Some(TypeRef::Generic(param)) = self.args.iter().find(|a| matches!(a, TypeRef::Generic(_))) {
            return Err(MeshError::UnresolvedGeneric {
                domain: domain.name.clone(),
                param: param.clone(),
            });
        }
        if let Some(member) = self.roles.members().find(|m| domain.property(m).is_some()) {
            return Err(MeshError::Config(format!(
                "role member '{member}' of '{}' is also a property",
                self.type_name
            )));
        }

        Ok(TypeMapping {
            type_name: self.type_name,
            domain,
            args: self.args,
            roles: self.roles,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::PART_DOMAIN;

    #[test]
    fn alias_names_the_domain() {
        let mapping = TypeMapping::builder("app::Person")
            .scalar("name", ScalarType::Str)
            .alias("Person")
            .key("id")
            .build()
            .expect("build");
        assert_eq!(mapping.domain.name, "Person");
        assert_eq!(mapping.domain.key.part(PART_DOMAIN), Some("Person"));
        assert_eq!(mapping.domain.properties.len(), 1);
        assert_eq!(mapping.roles.key.as_deref(), Some("id"));
    }

    #[test]
    fn blank_names_are_rejected() {
        assert!(matches!(
            TypeMapping::builder("  ").build(),
            Err(MeshError::UnnamedType)
        ));
        assert!(matches!(
            TypeMapping::builder("T").alias("").build(),
            Err(MeshError::UnnamedType)
        ));
    }

    #[test]
    fn generic_type_needs_arguments() {
        let err = TypeMapping::builder("IntBox")
            .alias("Box")
            .generic("T")
            .one("item", TypeRef::Generic("T".into()))
            .build()
            .expect_err("no args");
        assert!(matches!(err, MeshError::MissingTypeArguments { .. }));

        let ok = TypeMapping::builder("IntBox")
            .alias("Box")
            .generic("T")
            .one("item", TypeRef::Generic("T".into()))
            .args(vec![TypeRef::Scalar(ScalarType::I32)])
            .build()
            .expect("build");
        assert_eq!(ok.domain.generics.len(), 1);
    }

    #[test]
    fn arguments_must_be_concrete() {
        let err = TypeMapping::builder("Open")
            .generic("T")
            .args(vec![TypeRef::Generic("T".into())])
            .build()
            .expect_err("generic arg");
        assert!(matches!(err, MeshError::UnresolvedGeneric { .. }));
    }

    #[test]
    fn role_members_cannot_be_properties() {
        let err = TypeMapping::builder("Person")
            .scalar("id", ScalarType::Str)
            .key("id")
            .build()
            .expect_err("collision");
        assert!(matches!(err, MeshError::Config(_)));
    }
}
