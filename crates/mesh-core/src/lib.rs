//! # mesh-core
//!
//! Storage-agnostic object/relationship mapping with aggregate queries.
//!
//! Applications describe their object types as domains, persist whole object
//! graphs as flat keyed rows plus relationship rows (linkers), and fetch
//! aggregates (a root set with all linked descendants) in a bounded number
//! of batched store round trips.
//!
//! ## Layers
//!
//! - `key`, `value`, `predicate`: the algebra every layer speaks
//! - `domain`, `oplink`, `mechanic`: type shapes and their expansion
//! - `aggregate`, `savelink`, `materialize`: query and write planning
//! - `service`, `storage`: abstract stores plus memory and redb backends
//! - `repository`: the context object that ties them together
//!
//! ## Architectural Constraints
//!
//! - Synchronous: every store call is one blocking step
//! - Deterministic: ordered maps and sets wherever iteration order is visible
//! - Storage-agnostic: backends only see keyed reads, writes and link lookups
//! - Closed engine: non-standard shapes plug in through mechanics

// =============================================================================
// MODULES
// =============================================================================

pub mod aggregate;
pub mod config;
pub mod domain;
pub mod key;
pub mod materialize;
pub mod mechanic;
pub mod object;
pub mod oplink;
pub mod predicate;
pub mod primitives;
pub mod repository;
pub mod savelink;
pub mod service;
pub mod storage;
pub mod types;
pub mod value;

// =============================================================================
// RE-EXPORTS: Algebra
// =============================================================================

pub use key::{KeyPart, MeshKey};
pub use predicate::{BinaryOp, CompareKind, Comparison, Predicate, Target, ValueProvider};
pub use types::{Direction, DomainLinker, DomainObject, MeshError, Metadata, Side};
pub use value::{ScalarType, Value};

// =============================================================================
// RE-EXPORTS: Shapes
// =============================================================================

pub use domain::{
    Binding, Catalog, Domain, Multiplicity, Property, RealizedDomain, Roles, TypeMapping, TypeRef,
};
pub use mechanic::{MapMechanic, Mechanic, Mechanics, SetMechanic};
pub use object::{FieldValue, Instance, ObjectGraph, ObjectId};
pub use oplink::{OpLinkBuilder, OpLinkGraph, OpLinkNode, OpNodeId};

// =============================================================================
// RE-EXPORTS: Queries and Writes
// =============================================================================

pub use aggregate::{AggregateQuery, AggregateResult, QueryConfig, QueryKeys, QueryLinkId, QueryNodeId};
pub use materialize::Materializer;
pub use savelink::{PlanBuilder, PlanKey, WritePlan};

// =============================================================================
// RE-EXPORTS: Stores
// =============================================================================

pub use config::{EngineConfig, StorageConfig};
pub use repository::Repository;
pub use service::{
    AffectItem, AffectResult, Backend, LinkItem, LinkQuery, LinkService, Stores, ValueQuery,
    ValueService,
};
pub use storage::{MemoryBackend, RedbBackend};
