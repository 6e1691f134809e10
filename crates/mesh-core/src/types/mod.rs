//! # Core Type Definitions
//!
//! This module contains the record types every layer exchanges:
//! - Persisted instances (`DomainObject`, `Metadata`)
//! - Relationship edges (`DomainLinker`, `Side`)
//! - Error types (`MeshError`)
//!
//! Objects and linkers are created per request (read from a store or built
//! by a write plan) and have no lifecycle beyond it.

use crate::key::{KeyPart, MeshKey};
use crate::primitives::{
    META_CREATED_AT, META_CREATED_BY, META_UPDATED_AT, META_UPDATED_BY, PART_LINK_EXTRA,
    PART_SKEY, PART_SMEMBER, PART_TKEY, PART_TMEMBER,
};
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

// =============================================================================
// METADATA
// =============================================================================

/// Creation/update bookkeeping stamped by value services.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metadata {
    pub created_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
}

impl Metadata {
    /// Stamp both creation and update fields.
    #[must_use]
    pub fn created(actor: &str, at: DateTime<Utc>) -> Self {
        Self {
            created_at: Some(at),
            created_by: Some(actor.to_string()),
            updated_at: Some(at),
            updated_by: Some(actor.to_string()),
        }
    }

    /// Stamp the update fields, keeping creation fields.
    pub fn touch(&mut self, actor: &str, at: DateTime<Utc>) {
        self.updated_at = Some(at);
        self.updated_by = Some(actor.to_string());
    }

    /// Look up a metadata field by its meta name.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<Value> {
        match field {
            META_CREATED_AT => self.created_at.map(Value::Timestamp),
            META_CREATED_BY => self.created_by.clone().map(Value::Str),
            META_UPDATED_AT => self.updated_at.map(Value::Timestamp),
            META_UPDATED_BY => self.updated_by.clone().map(Value::Str),
            _ => None,
        }
    }
}

// =============================================================================
// DOMAIN OBJECT
// =============================================================================

/// One persisted instance of a realized domain.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DomainObject {
    /// Object key. Its `Domain` part is the realized-domain key.
    pub key: MeshKey,
    /// Creation/update bookkeeping.
    pub meta: Metadata,
    /// Property name -> value.
    pub values: BTreeMap<String, Value>,
}

impl DomainObject {
    /// Create an object with the given key and no values.
    #[must_use]
    pub fn new(key: MeshKey) -> Self {
        Self {
            key,
            ..Self::default()
        }
    }

    /// Builder-style value setter.
    #[must_use]
    pub fn with(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(property.into(), value.into());
        self
    }

    /// The realized domain this object belongs to.
    pub fn domain(&self) -> Result<MeshKey, MeshError> {
        self.key.get(KeyPart::Domain)
    }
}

// =============================================================================
// LINKS
// =============================================================================

/// Which endpoint of a relationship a key sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Side {
    /// Subject (owner of the S-side role).
    S,
    /// Target.
    T,
}

impl Side {
    /// The other endpoint.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::S => Self::T,
            Self::T => Self::S,
        }
    }
}

/// Orientation of a traversal step relative to the stored relationship.
///
/// The member named by a step is always the S-side role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Parent is the S endpoint.
    Forward,
    /// Parent is the T endpoint.
    Reverse,
}

impl Direction {
    /// Side the parent sits on.
    #[must_use]
    pub const fn parent_side(self) -> Side {
        match self {
            Self::Forward => Side::S,
            Self::Reverse => Side::T,
        }
    }

    /// Order `(parent, child)` into `(s, t)`.
    #[must_use]
    pub fn pair<'a, T: ?Sized>(self, parent: &'a T, child: &'a T) -> (&'a T, &'a T) {
        match self {
            Self::Forward => (parent, child),
            Self::Reverse => (child, parent),
        }
    }
}

/// One edge of a many-to-many relationship.
///
/// For self-referential relationships (S domain == T domain) the `Side` of a
/// lookup decides which endpoint is the one being queried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainLinker {
    pub s_key: MeshKey,
    pub t_key: MeshKey,
    pub s_member: String,
    pub t_member: String,
    /// Discriminator (map entry name) for multiple links between one pair.
    pub extra: Option<String>,
    pub created_by: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl DomainLinker {
    /// Create an unstamped linker.
    #[must_use]
    pub fn new(
        s_key: MeshKey,
        t_key: MeshKey,
        s_member: impl Into<String>,
        t_member: impl Into<String>,
    ) -> Self {
        Self {
            s_key,
            t_key,
            s_member: s_member.into(),
            t_member: t_member.into(),
            extra: None,
            created_by: None,
            created_at: None,
        }
    }

    /// Builder-style discriminator setter.
    #[must_use]
    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = Some(extra.into());
        self
    }

    /// Identity of this edge.
    #[must_use]
    pub fn key(&self) -> MeshKey {
        let mut key = MeshKey::null();
        key.set_key_part(PART_SKEY, &self.s_key);
        key.set_key_part(PART_TKEY, &self.t_key);
        key.set_part(PART_SMEMBER, self.s_member.as_str());
        key.set_part(PART_TMEMBER, self.t_member.as_str());
        if let Some(extra) = &self.extra {
            key.set_part(PART_LINK_EXTRA, extra.as_str());
        }
        key
    }

    /// Key on the given side.
    #[must_use]
    pub fn endpoint(&self, side: Side) -> &MeshKey {
        match side {
            Side::S => &self.s_key,
            Side::T => &self.t_key,
        }
    }

    /// Role name on the given side.
    #[must_use]
    pub fn member(&self, side: Side) -> &str {
        match side {
            Side::S => &self.s_member,
            Side::T => &self.t_member,
        }
    }

    /// Field view used when evaluating link predicates.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            PART_SKEY => Some(Value::Key(self.s_key.clone())),
            PART_TKEY => Some(Value::Key(self.t_key.clone())),
            PART_SMEMBER => Some(Value::Str(self.s_member.clone())),
            PART_TMEMBER => Some(Value::Str(self.t_member.clone())),
            PART_LINK_EXTRA => self.extra.clone().map(Value::Str),
            _ => None,
        }
    }

    /// Metadata view used when evaluating link predicates.
    #[must_use]
    pub fn meta(&self, name: &str) -> Option<Value> {
        match name {
            META_CREATED_AT => self.created_at.map(Value::Timestamp),
            META_CREATED_BY => self.created_by.clone().map(Value::Str),
            _ => None,
        }
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors raised by the engine, its registries and its stores.
///
/// - Configuration errors fail fast at registration
/// - Request errors fail the specific call
/// - Store errors surface unchanged; the engine never retries
#[derive(Debug, Error)]
pub enum MeshError {
    // --- configuration -----------------------------------------------------
    /// A generic parameter was used where a concrete type is required.
    #[error("Unresolved generic parameter '{param}' of domain '{domain}'")]
    UnresolvedGeneric { domain: String, param: String },

    /// A generic domain was referenced with the wrong number of arguments.
    #[error("Domain '{domain}' expects {expected} type arguments, got {actual}")]
    MissingTypeArguments {
        domain: String,
        expected: usize,
        actual: usize,
    },

    /// The same alias was assigned to two different domains.
    #[error("Alias '{alias}' is already assigned to another domain")]
    DuplicateAlias { alias: String },

    /// A type was declared for registration without a resolvable unique name.
    #[error("Type declared without a resolvable unique name")]
    UnnamedType,

    /// Reference to a domain that was never registered.
    #[error("Unknown domain: {0}")]
    UnknownDomain(String),

    /// Reference to a source type that was never registered.
    #[error("Unknown type: {0}")]
    UnknownType(String),

    /// Invalid engine configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    // --- request -----------------------------------------------------------
    /// A predicate cannot be evaluated as written.
    #[error("Malformed predicate: {0}")]
    MalformedPredicate(String),

    /// A comparison was requested between values that have no ordering.
    #[error("Cannot compare {literal} with {actual} using {kind}")]
    IncomparableValues {
        literal: String,
        actual: String,
        kind: String,
    },

    /// No value service is registered for a domain.
    #[error("No value service registered for domain {0}")]
    ServiceNotFound(MeshKey),

    /// No link service is registered for an ordered domain pair.
    #[error("No link service registered for {0} -> {1}")]
    LinkServiceNotFound(MeshKey, MeshKey),

    /// The request tree is inconsistent.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A caller value does not fit the declared property type.
    #[error("Invalid value for '{member}': {reason}")]
    InvalidValue { member: String, reason: String },

    /// A serialized key could not be parsed.
    #[error("Key parse error: {0}")]
    KeyParse(String),

    // --- storage -----------------------------------------------------------
    /// A backend reported a failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A row or request could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A process-wide cache lock was poisoned by a panicking thread.
    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

// =============================================================================
// TESTS
// =============================================================================
