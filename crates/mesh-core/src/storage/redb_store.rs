//! # redb-backed Storage
//!
//! A disk-backed backend using the redb embedded database.
//!
//! Layout:
//! - one table per realized domain, `values/<domain key>`: object key text
//!   -> postcard-encoded `DomainObject`
//! - one table per ordered domain pair, `links/<s key>/<t key>`: linker key
//!   text -> postcard-encoded `DomainLinker`
//!
//! Every `affect` call runs in a single write transaction, so a batch of
//! items against one service commits or fails as a unit. Batches against
//! different services are independent transactions.

use crate::domain::RealizedDomain;
use crate::key::MeshKey;
use crate::service::{
    AffectItem, AffectResult, Backend, LinkItem, LinkQuery, LinkReply, LinkService, ValueQuery,
    ValueReply, ValueService,
};
use crate::predicate::Predicate;
use crate::storage::{
    apply_patch, competes, link_matches, link_reply, reply, stamp_link, stamp_new, unlink_matches,
};
use crate::types::{DomainLinker, DomainObject, MeshError};
use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

type Rows<'a> = TableDefinition<'a, &'static str, &'static [u8]>;

fn storage(e: impl std::fmt::Display) -> MeshError {
    MeshError::Storage(e.to_string())
}

fn encode<T: Serialize>(row: &T) -> Result<Vec<u8>, MeshError> {
    postcard::to_allocvec(row).map_err(|e| MeshError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MeshError> {
    postcard::from_bytes(bytes).map_err(|e| MeshError::Serialization(e.to_string()))
}

/// Create a table if it does not exist yet.
fn ensure_table(db: &Database, name: &str) -> Result<(), MeshError> {
    let write_txn = db.begin_write().map_err(storage)?;
    {
        let _ = write_txn
            .open_table(Rows::new(name))
            .map_err(storage)?;
    }
    write_txn.commit().map_err(storage)
}

/// Decode every row of a table, or only the rows under `keys`.
fn load<T: DeserializeOwned>(
    db: &Database,
    name: &str,
    keys: Option<&BTreeSet<MeshKey>>,
) -> Result<Vec<T>, MeshError> {
    let read_txn = db.begin_read().map_err(storage)?;
    let table = read_txn.open_table(Rows::new(name)).map_err(storage)?;
    let mut rows = Vec::new();
    match keys {
        Some(keys) => {
            for key in keys {
                if let Some(data) = table.get(key.as_str()).map_err(storage)? {
                    rows.push(decode(data.value())?);
                }
            }
        }
        None => {
            for entry in table.iter().map_err(storage)? {
                let (_, data) = entry.map_err(storage)?;
                rows.push(decode(data.value())?);
            }
        }
    }
    Ok(rows)
}

// =============================================================================
// VALUES
// =============================================================================

/// One realized domain's rows in redb.
pub struct RedbValues {
    db: Arc<Database>,
    domain: MeshKey,
    table: String,
}

impl std::fmt::Debug for RedbValues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbValues")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl ValueService for RedbValues {
    fn domain(&self) -> &MeshKey {
        &self.domain
    }

    fn query(&self, query: &ValueQuery) -> Result<ValueReply, MeshError> {
        let filter = query.filter.as_ref();
        let restriction = filter.and_then(|f| f.key_restriction());
        let rows: Vec<DomainObject> = load(&self.db, &self.table, restriction.as_ref())?;
        let mut selected = Vec::with_capacity(rows.len());
        for row in rows {
            if Predicate::accepts(filter, &row)? {
                selected.push(row);
            }
        }
        Ok(reply(selected, query.shape))
    }

    fn affect(&self, actor: &str, items: Vec<AffectItem>) -> Result<Vec<AffectResult>, MeshError> {
        let now = Utc::now();
        let write_txn = self.db.begin_write().map_err(storage)?;
        let mut results = Vec::with_capacity(items.len());
        {
            let mut table = write_txn
                .open_table(Rows::new(&self.table))
                .map_err(storage)?;

            for item in items {
                results.push(match item {
                    AffectItem::Create(object) => {
                        let object = stamp_new(&self.domain, object, actor, now, true)?;
                        table
                            .insert(object.key.as_str(), encode(&object)?.as_slice())
                            .map_err(storage)?;
                        AffectResult::Created(object)
                    }
                    AffectItem::Insert(object) => {
                        let object = stamp_new(&self.domain, object, actor, now, false)?;
                        table
                            .insert(object.key.as_str(), encode(&object)?.as_slice())
                            .map_err(storage)?;
                        AffectResult::Inserted(object)
                    }
                    AffectItem::Update { key, patch } => {
                        let existing: Option<DomainObject> = match table.get(key.as_str()).map_err(storage)? {
                            Some(data) => Some(decode(data.value())?),
                            None => None,
                        };
                        match existing {
                            Some(mut object) => {
                                apply_patch(&mut object, patch, actor, now);
                                table
                                    .insert(key.as_str(), encode(&object)?.as_slice())
                                    .map_err(storage)?;
                                AffectResult::Updated(Some(object))
                            }
                            None => AffectResult::Updated(None),
                        }
                    }
                    AffectItem::Delete(filter) => {
                        let mut doomed = Vec::new();
                        for entry in table.iter().map_err(storage)? {
                            let (_, data) = entry.map_err(storage)?;
                            let object: DomainObject = decode(data.value())?;
                            if filter.evaluate(&object)? {
                                doomed.push(object.key);
                            }
                        }
                        for key in &doomed {
                            table.remove(key.as_str()).map_err(storage)?;
                        }
                        AffectResult::Deleted(doomed)
                    }
                });
            }
        }
        write_txn.commit().map_err(storage)?;
        Ok(results)
    }
}

// =============================================================================
// LINKS
// =============================================================================

/// Links between one ordered pair of realized domains in redb.
///
/// Lookups scan the pair's table; subject restrictions are applied in
/// process.
pub struct RedbLinks {
    db: Arc<Database>,
    s: MeshKey,
    t: MeshKey,
    table: String,
}

impl std::fmt::Debug for RedbLinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbLinks")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl LinkService for RedbLinks {
    fn pair(&self) -> (&MeshKey, &MeshKey) {
        (&self.s, &self.t)
    }

    fn query(&self, query: &LinkQuery) -> Result<LinkReply, MeshError> {
        let rows: Vec<DomainLinker> = load(&self.db, &self.table, None)?;
        let mut matched = Vec::new();
        for linker in rows {
            if link_matches(&linker, query)? {
                matched.push(linker);
            }
        }
        Ok(link_reply(matched, query.shape))
    }

    fn affect(&self, actor: &str, items: Vec<LinkItem>) -> Result<Vec<usize>, MeshError> {
        let now = Utc::now();
        let write_txn = self.db.begin_write().map_err(storage)?;
        let mut touched = Vec::with_capacity(items.len());
        {
            let mut table = write_txn
                .open_table(Rows::new(&self.table))
                .map_err(storage)?;

            for item in items {
                // Collect keys to remove before mutating; iteration borrows the table.
                let mut doomed = Vec::new();
                let mut added = None;
                match item {
                    LinkItem::Link { linker, exclusive } => {
                        let linker = stamp_link(linker, actor, now);
                        if exclusive {
                            for entry in table.iter().map_err(storage)? {
                                let (_, data) = entry.map_err(storage)?;
                                let existing: DomainLinker = decode(data.value())?;
                                if competes(&existing, &linker) {
                                    doomed.push(existing.key());
                                }
                            }
                        }
                        added = Some(linker);
                    }
                    LinkItem::Unlink(linker) => doomed.push(linker.key()),
                    LinkItem::UnlinkWhere(filter) => {
                        for entry in table.iter().map_err(storage)? {
                            let (_, data) = entry.map_err(storage)?;
                            let existing: DomainLinker = decode(data.value())?;
                            if unlink_matches(&existing, &filter)? {
                                doomed.push(existing.key());
                            }
                        }
                    }
                }

                let mut count = 0;
                for key in &doomed {
                    if table.remove(key.as_str()).map_err(storage)?.is_some() {
                        count += 1;
                    }
                }
                if let Some(linker) = added {
                    table
                        .insert(linker.key().as_str(), encode(&linker)?.as_slice())
                        .map_err(storage)?;
                    count = 1;
                }
                touched.push(count);
            }
        }
        write_txn.commit().map_err(storage)?;
        Ok(touched)
    }
}

// =============================================================================
// BACKEND
// =============================================================================

/// Persistent backend over one redb database file.
#[derive(Clone)]
pub struct RedbBackend {
    db: Arc<Database>,
}

impl std::fmt::Debug for RedbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBackend").finish_non_exhaustive()
    }
}

impl RedbBackend {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MeshError> {
        let db = Database::create(path.as_ref()).map_err(storage)?;
        Ok(Self { db: Arc::new(db) })
    }
}

impl Backend for RedbBackend {
    fn name(&self) -> &'static str {
        "redb"
    }

    fn open_values(&self, domain: &RealizedDomain) -> Result<Arc<dyn ValueService>, MeshError> {
        let table = format!("values/{}", domain.key);
        ensure_table(&self.db, &table)?;
        debug!(domain = %domain, table = %table, "Opened redb value table");
        Ok(Arc::new(RedbValues {
            db: Arc::clone(&self.db),
            domain: domain.key.clone(),
            table,
        }))
    }

    fn open_links(
        &self,
        s: &RealizedDomain,
        t: &RealizedDomain,
    ) -> Result<Arc<dyn LinkService>, MeshError> {
        let table = format!("links/{}/{}", s.key, t.key);
        ensure_table(&self.db, &table)?;
        debug!(s = %s, t = %t, table = %table, "Opened redb link table");
        Ok(Arc::new(RedbLinks {
            db: Arc::clone(&self.db),
            s: s.key.clone(),
            t: t.key.clone(),
            table,
        }))
    }
}
