//! # Engine Primitives
//!
//! Hardcoded constants shared by every layer of the engine.
//!
//! Key part names are part of the persisted format: a key serialized by one
//! build must parse back to an equal key in the next. Renaming any of them is
//! a breaking change to stored data.

// =============================================================================
// KEY PARTS
// =============================================================================

/// Identifies the (realized) domain an entity belongs to.
pub const PART_DOMAIN: &str = "Domain";

/// Per-object unique tag assigned by a value service on create.
pub const PART_UNIQUE: &str = "Unique";

/// Subject endpoint of a relationship key.
pub const PART_SKEY: &str = "SKey";

/// Target endpoint of a relationship key.
pub const PART_TKEY: &str = "TKey";

/// Role name of the relationship on the subject side.
pub const PART_SMEMBER: &str = "SMember";

/// Role name of the relationship on the target side.
pub const PART_TMEMBER: &str = "TMember";

/// Extra discriminator for links (map entry names).
pub const PART_LINK_EXTRA: &str = "LinkExtra";

/// Owner of a synthetic (mechanic-managed) object.
pub const PART_OWNER: &str = "Owner";

/// Owner member that holds a synthetic object.
pub const PART_MEMBER: &str = "Member";

/// Prefix for generic argument parts of a realized-domain key.
///
/// Argument `n` is stored under `Arg{n}`.
pub const PART_ARG_PREFIX: &str = "Arg";

// =============================================================================
// KEY SERIALIZATION
// =============================================================================

/// Separates `name:value` pairs in a serialized key.
pub const KEY_PAIR_SEPARATOR: char = ';';

/// Separates a part name from its value.
pub const KEY_NAME_SEPARATOR: char = ':';

/// Escape character for separators occurring inside names or values.
pub const KEY_ESCAPE: char = '\\';

// =============================================================================
// METADATA FIELDS
// =============================================================================

/// Meta field: creation timestamp.
pub const META_CREATED_AT: &str = "CreatedAt";

/// Meta field: creator identity.
pub const META_CREATED_BY: &str = "CreatedBy";

/// Meta field: last update timestamp.
pub const META_UPDATED_AT: &str = "UpdatedAt";

/// Meta field: last updater identity.
pub const META_UPDATED_BY: &str = "UpdatedBy";

// =============================================================================
// MECHANIC MEMBERS
// =============================================================================

/// Hidden role/property used by the unique-set mechanic.
pub const SET_ITEMS: &str = "$items";

/// Hidden role used by the map mechanic for domain-valued entries.
pub const MAP_ENTRIES: &str = "$entries";

/// Hidden property holding map entry names for scalar-valued maps.
pub const MAP_KEYS: &str = "$keys";

/// Hidden property holding map entry values for scalar-valued maps.
pub const MAP_VALUES: &str = "$values";

/// Name of the built-in unique-set domain.
pub const SET_DOMAIN: &str = "Set";

/// Name of the built-in map domain.
pub const MAP_DOMAIN: &str = "Map";

// =============================================================================
// LIMITS
// =============================================================================

/// Default maximum traversal depth for aggregate queries.
///
/// Recursive request trees stop expanding at this depth; the visited-set
/// already prevents cycles, this bounds long chains.
pub const DEFAULT_MAX_DEPTH: usize = 100;

/// Compiled `like` patterns kept before the pattern cache is emptied.
pub const MAX_LIKE_PATTERNS: usize = 256;

/// Default identity stamped on created/updated rows.
pub const DEFAULT_ACTOR: &str = "mesh";
