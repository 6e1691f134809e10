//! # Engine Configuration
//!
//! TOML-backed settings for a [`Repository`](crate::repository::Repository):
//!
//! ```toml
//! actor = "importer"
//! max_depth = 32
//!
//! [imposition]
//! order_by_count = true
//!
//! [storage]
//! kind = "redb"
//! path = "data/mesh.redb"
//! ```
//!
//! Every field is optional; missing fields take their defaults.

use crate::aggregate::QueryConfig;
use crate::primitives::{DEFAULT_ACTOR, DEFAULT_MAX_DEPTH};
use crate::types::MeshError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Identity stamped on created and updated rows and links.
    pub actor: String,
    /// Link hops below a query root before expansion stops.
    pub max_depth: usize,
    pub imposition: ImpositionConfig,
    pub storage: StorageConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            actor: DEFAULT_ACTOR.to_string(),
            max_depth: DEFAULT_MAX_DEPTH,
            imposition: ImpositionConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImpositionConfig {
    /// Run reverse chains cheapest-first by candidate count. When `false`
    /// they run in declaration order and no count queries are issued.
    pub order_by_count: bool,
}

impl Default for ImpositionConfig {
    fn default() -> Self {
        Self { order_by_count: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConfig {
    /// No persistent store; services live in process memory.
    #[default]
    Memory,
    /// A redb database file.
    Redb { path: PathBuf },
}

impl EngineConfig {
    /// Parse and validate TOML text.
    pub fn from_toml(text: &str) -> Result<Self, MeshError> {
        let config: Self = toml::from_str(text).map_err(|e| MeshError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, MeshError> {
        let text = fs::read_to_string(path)
            .map_err(|e| MeshError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), MeshError> {
        if self.actor.trim().is_empty() {
            return Err(MeshError::Config("actor must not be empty".to_string()));
        }
        if self.max_depth == 0 {
            return Err(MeshError::Config("max_depth must be at least 1".to_string()));
        }
        if let StorageConfig::Redb { path } = &self.storage
            && path.as_os_str().is_empty()
        {
            return Err(MeshError::Config("redb storage needs a path".to_string()));
        }
        Ok(())
    }

    /// Walk settings for the query engine.
    #[must_use]
    pub fn query(&self) -> QueryConfig {
        QueryConfig {
            max_depth: self.max_depth,
            order_by_count: self.imposition.order_by_count,
        }
    }
}
