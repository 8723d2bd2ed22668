//! # redb-backed Version Store
//!
//! A disk-backed version store using the redb embedded database:
//! - ACID transactions (one per `VersionStore` call)
//! - Crash safety (copy-on-write B-trees)
//! - MVCC (concurrent readers, single writer)
//!
//! Rows are postcard-encoded (see [`crate::formats::rows`]). The version
//! indexes carry the creation time as their value so versions can be ordered
//! without decoding rows.
//!
//! Every write runs through [`RedbStore::write`], which commits when the
//! operation succeeds and aborts otherwise. A failed post-merge check
//! therefore leaves no trace.

use crate::formats::{EntityRow, RelationRow, decode_row, encode_row};
use crate::primitives::FORMAT_VERSION;
use crate::store::{
    MergeStats, StoreStats, VersionStore, connects, next_counter, sort_newest_first,
    storage_time, validate_entity, validate_merge, validate_relation,
};
use crate::{
    AbsoluteId, EntityId, EntityVersion, NewEntityVersion, NewRelationVersion, RelationId,
    RelationVersion, StrataError, canonical_endpoints,
};
use redb::{
    Database, ReadTransaction, ReadableDatabase, ReadableTable, ReadableTableMetadata,
    TableDefinition, WriteTransaction,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Entity rows: AbsoluteId(u64) -> serialized EntityRow
const ENTITIES: TableDefinition<u64, &[u8]> = TableDefinition::new("entities");

/// Entity version index: (entity_id, absolute_id) -> created_at µs
const ENTITY_VERSIONS: TableDefinition<(u64, u64), i64> = TableDefinition::new("entity_versions");

/// Relation rows: AbsoluteId(u64) -> serialized RelationRow
const RELATIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("relations");

/// Relation version index: (relation_id, absolute_id) -> created_at µs
const RELATION_VERSIONS: TableDefinition<(u64, u64), i64> =
    TableDefinition::new("relation_versions");

/// Endpoint index: (entity absolute_id, relation absolute_id) -> relation_id
const ENDPOINTS: TableDefinition<(u64, u64), u64> = TableDefinition::new("endpoints");

/// Metadata: key string -> value u64
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const NEXT_ABSOLUTE_ID: &str = "next_absolute_id";
const NEXT_ENTITY_ID: &str = "next_entity_id";
const NEXT_RELATION_ID: &str = "next_relation_id";
const FORMAT_KEY: &str = "format_version";

fn storage_err(e: impl std::fmt::Display) -> StrataError {
    StrataError::Storage(e.to_string())
}

/// A disk-backed version store using redb.
pub struct RedbStore {
    db: Database,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open or create a version database at the given path.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::Serialization` if the file was written by an
    /// incompatible format version.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StrataError> {
        let db = Database::create(path.as_ref()).map_err(storage_err)?;
        let store = Self { db };

        // Initialize tables if they don't exist and stamp the format.
        store.write(|txn| {
            txn.open_table(ENTITIES).map_err(storage_err)?;
            txn.open_table(ENTITY_VERSIONS).map_err(storage_err)?;
            txn.open_table(RELATIONS).map_err(storage_err)?;
            txn.open_table(RELATION_VERSIONS).map_err(storage_err)?;
            txn.open_table(ENDPOINTS).map_err(storage_err)?;
            let mut meta = txn.open_table(METADATA).map_err(storage_err)?;
            let stamped = meta
                .get(FORMAT_KEY)
                .map_err(storage_err)?
                .map(|v| v.value());
            match stamped {
                None => {
                    meta.insert(FORMAT_KEY, FORMAT_VERSION).map_err(storage_err)?;
                    Ok(())
                }
                Some(version) if version == FORMAT_VERSION => Ok(()),
                Some(version) => Err(StrataError::Serialization(format!(
                    "Unsupported format version: {} (expected {})",
                    version, FORMAT_VERSION
                ))),
            }
        })?;

        tracing::debug!(path = %path.as_ref().display(), "opened redb store");
        Ok(store)
    }

    /// Run `op` in a write transaction; commit on success, abort on error.
    fn write<T>(
        &self,
        op: impl FnOnce(&WriteTransaction) -> Result<T, StrataError>,
    ) -> Result<T, StrataError> {
        let txn = self.db.begin_write().map_err(storage_err)?;
        match op(&txn) {
            Ok(value) => {
                txn.commit().map_err(storage_err)?;
                Ok(value)
            }
            Err(e) => {
                txn.abort().map_err(storage_err)?;
                Err(e)
            }
        }
    }

    /// Run `op` in a read transaction.
    fn read<T>(
        &self,
        op: impl FnOnce(&ReadTransaction) -> Result<T, StrataError>,
    ) -> Result<T, StrataError> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        op(&txn)
    }
}

// =============================================================================
// TABLE HELPERS (shared by read and write transactions)
// =============================================================================

/// Row ids of one logical id, ordered by `(created_at, absolute_id)`.
fn versions_in<T: ReadableTable<(u64, u64), i64>>(
    index: &T,
    id: u64,
) -> Result<Vec<(i64, u64)>, StrataError> {
    let mut versions = Vec::new();
    for entry in index
        .range((id, 0u64)..=(id, u64::MAX))
        .map_err(storage_err)?
    {
        let (key, value) = entry.map_err(storage_err)?;
        versions.push((value.value(), key.value().1));
    }
    versions.sort_unstable();
    Ok(versions)
}

/// Row id of the current version of every logical id, ordered by logical id.
fn current_in<T: ReadableTable<(u64, u64), i64>>(
    index: &T,
) -> Result<BTreeMap<u64, u64>, StrataError> {
    let mut best: BTreeMap<u64, (i64, u64)> = BTreeMap::new();
    for entry in index.iter().map_err(storage_err)? {
        let (key, value) = entry.map_err(storage_err)?;
        let (id, abs) = key.value();
        let candidate = (value.value(), abs);
        let slot = best.entry(id).or_insert(candidate);
        if candidate > *slot {
            *slot = candidate;
        }
    }
    Ok(best.into_iter().map(|(id, (_, abs))| (id, abs)).collect())
}

fn load_entity<T: ReadableTable<u64, &'static [u8]>>(
    rows: &T,
    abs: u64,
) -> Result<Option<EntityVersion>, StrataError> {
    match rows.get(abs).map_err(storage_err)? {
        Some(bytes) => {
            let row: EntityRow = decode_row(bytes.value())?;
            row.into_version(AbsoluteId(abs)).map(Some)
        }
        None => Ok(None),
    }
}

fn load_relation<T: ReadableTable<u64, &'static [u8]>>(
    rows: &T,
    abs: u64,
) -> Result<Option<RelationVersion>, StrataError> {
    match rows.get(abs).map_err(storage_err)? {
        Some(bytes) => {
            let row: RelationRow = decode_row(bytes.value())?;
            row.into_version(AbsoluteId(abs)).map(Some)
        }
        None => Ok(None),
    }
}

/// `(relation absolute_id, relation_id)` of every relation row touching any
/// of the given entity rows.
fn touching<T: ReadableTable<(u64, u64), u64>>(
    endpoints: &T,
    entity_rows: &BTreeSet<AbsoluteId>,
) -> Result<BTreeSet<(u64, u64)>, StrataError> {
    let mut found = BTreeSet::new();
    for abs in entity_rows {
        for entry in endpoints
            .range((abs.0, 0u64)..=(abs.0, u64::MAX))
            .map_err(storage_err)?
        {
            let (key, value) = entry.map_err(storage_err)?;
            found.insert((key.value().1, value.value()));
        }
    }
    Ok(found)
}

fn row_ids<T: ReadableTable<(u64, u64), i64>>(
    index: &T,
    id: u64,
) -> Result<BTreeSet<AbsoluteId>, StrataError> {
    Ok(versions_in(index, id)?
        .into_iter()
        .map(|(_, abs)| AbsoluteId(abs))
        .collect())
}

fn rows_between<I, E, R>(
    entity_index: &I,
    endpoints: &E,
    relations: &R,
    a: EntityId,
    b: EntityId,
) -> Result<Vec<RelationVersion>, StrataError>
where
    I: ReadableTable<(u64, u64), i64>,
    E: ReadableTable<(u64, u64), u64>,
    R: ReadableTable<u64, &'static [u8]>,
{
    let a_ids = row_ids(entity_index, a.0)?;
    let b_ids = row_ids(entity_index, b.0)?;
    if a_ids.is_empty() || b_ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut result = Vec::new();
    for (rel_abs, _) in touching(endpoints, &a_ids)? {
        if let Some(relation) = load_relation(relations, rel_abs)? {
            if connects(&relation, &a_ids, &b_ids) {
                result.push(relation);
            }
        }
    }
    sort_newest_first(&mut result);
    Ok(result)
}

/// Take the next value of a counter.
fn bump(
    meta: &mut redb::Table<'_, &'static str, u64>,
    key: &str,
) -> Result<u64, StrataError> {
    let next = meta.get(key).map_err(storage_err)?.map(|v| v.value()).unwrap_or(1);
    meta.insert(key, next_counter(next, key)?).map_err(storage_err)?;
    Ok(next)
}

/// Make sure a counter will never hand out `used` again.
fn reserve(
    meta: &mut redb::Table<'_, &'static str, u64>,
    key: &str,
    used: u64,
) -> Result<(), StrataError> {
    let next = meta.get(key).map_err(storage_err)?.map(|v| v.value()).unwrap_or(1);
    if used >= next {
        meta.insert(key, next_counter(used, key)?).map_err(storage_err)?;
    }
    Ok(())
}

fn append_entity(
    txn: &WriteTransaction,
    new: NewEntityVersion,
) -> Result<EntityVersion, StrataError> {
    let mut meta = txn.open_table(METADATA).map_err(storage_err)?;
    let absolute_id = AbsoluteId(bump(&mut meta, NEXT_ABSOLUTE_ID)?);
    let entity_id = match new.entity_id {
        Some(id) => {
            reserve(&mut meta, NEXT_ENTITY_ID, id.0)?;
            id
        }
        None => EntityId(bump(&mut meta, NEXT_ENTITY_ID)?),
    };
    let version = EntityVersion {
        absolute_id,
        entity_id,
        name: new.name,
        content: new.content,
        created_at: storage_time(new.created_at),
        source_cache: new.source_cache,
        source_doc: new.source_doc,
        embedding: new.embedding,
    };
    let bytes = encode_row(&EntityRow::from_version(&version))?;

    let mut rows = txn.open_table(ENTITIES).map_err(storage_err)?;
    rows.insert(absolute_id.0, bytes.as_slice())
        .map_err(storage_err)?;
    let mut index = txn.open_table(ENTITY_VERSIONS).map_err(storage_err)?;
    index
        .insert(
            (entity_id.0, absolute_id.0),
            version.created_at.timestamp_micros(),
        )
        .map_err(storage_err)?;
    Ok(version)
}

fn delete_self_referential(txn: &WriteTransaction, entity: EntityId) -> Result<usize, StrataError> {
    let entity_index = txn.open_table(ENTITY_VERSIONS).map_err(storage_err)?;
    let mut endpoints = txn.open_table(ENDPOINTS).map_err(storage_err)?;
    let mut relations = txn.open_table(RELATIONS).map_err(storage_err)?;
    let mut relation_index = txn.open_table(RELATION_VERSIONS).map_err(storage_err)?;

    let doomed = rows_between(&entity_index, &endpoints, &relations, entity, entity)?;
    for relation in &doomed {
        let abs = relation.absolute_id.0;
        relations.remove(abs).map_err(storage_err)?;
        relation_index
            .remove((relation.relation_id.0, abs))
            .map_err(storage_err)?;
        endpoints
            .remove((relation.endpoint1.0, abs))
            .map_err(storage_err)?;
        endpoints
            .remove((relation.endpoint2.0, abs))
            .map_err(storage_err)?;
    }
    Ok(doomed.len())
}

// =============================================================================
// VERSIONSTORE TRAIT IMPLEMENTATION
// =============================================================================

impl VersionStore for RedbStore {
    fn put_entity_version(&self, new: NewEntityVersion) -> Result<EntityVersion, StrataError> {
        validate_entity(&new)?;
        self.write(|txn| append_entity(txn, new))
    }

    fn entity_versions(&self, entity: EntityId) -> Result<Vec<EntityVersion>, StrataError> {
        self.read(|txn| {
            let index = txn.open_table(ENTITY_VERSIONS).map_err(storage_err)?;
            let rows = txn.open_table(ENTITIES).map_err(storage_err)?;
            let mut versions = Vec::new();
            for (_, abs) in versions_in(&index, entity.0)? {
                let version = load_entity(&rows, abs)?.ok_or(StrataError::ConsistencyViolation(
                    format!("version index of {} names missing row {}", entity, abs),
                ))?;
                versions.push(version);
            }
            Ok(versions)
        })
    }

    fn entity_by_absolute_id(&self, id: AbsoluteId) -> Result<Option<EntityVersion>, StrataError> {
        self.read(|txn| {
            let rows = txn.open_table(ENTITIES).map_err(storage_err)?;
            load_entity(&rows, id.0)
        })
    }

    fn current_entities(&self) -> Result<Vec<EntityVersion>, StrataError> {
        self.read(|txn| {
            let index = txn.open_table(ENTITY_VERSIONS).map_err(storage_err)?;
            let rows = txn.open_table(ENTITIES).map_err(storage_err)?;
            let mut result = Vec::new();
            for abs in current_in(&index)?.into_values() {
                if let Some(version) = load_entity(&rows, abs)? {
                    result.push(version);
                }
            }
            Ok(result)
        })
    }

    fn put_relation_version(
        &self,
        new: NewRelationVersion,
    ) -> Result<RelationVersion, StrataError> {
        validate_relation(&new)?;
        self.write(|txn| {
            let (endpoint1, endpoint2) = {
                let rows = txn.open_table(ENTITIES).map_err(storage_err)?;
                let a = load_entity(&rows, new.endpoint_a.0)?
                    .ok_or(StrataError::AbsoluteIdNotFound(new.endpoint_a))?;
                let b = load_entity(&rows, new.endpoint_b.0)?
                    .ok_or(StrataError::AbsoluteIdNotFound(new.endpoint_b))?;
                canonical_endpoints(&a, &b)
            };

            let mut meta = txn.open_table(METADATA).map_err(storage_err)?;
            let absolute_id = AbsoluteId(bump(&mut meta, NEXT_ABSOLUTE_ID)?);
            let relation_id = match new.relation_id {
                Some(id) => {
                    reserve(&mut meta, NEXT_RELATION_ID, id.0)?;
                    id
                }
                None => RelationId(bump(&mut meta, NEXT_RELATION_ID)?),
            };
            let version = RelationVersion {
                absolute_id,
                relation_id,
                endpoint1,
                endpoint2,
                content: new.content,
                created_at: storage_time(new.created_at),
                source_cache: new.source_cache,
                source_doc: new.source_doc,
                embedding: new.embedding,
            };
            let bytes = encode_row(&RelationRow::from_version(&version))?;

            let mut relations = txn.open_table(RELATIONS).map_err(storage_err)?;
            relations
                .insert(absolute_id.0, bytes.as_slice())
                .map_err(storage_err)?;
            let mut index = txn.open_table(RELATION_VERSIONS).map_err(storage_err)?;
            index
                .insert(
                    (relation_id.0, absolute_id.0),
                    version.created_at.timestamp_micros(),
                )
                .map_err(storage_err)?;
            let mut endpoints = txn.open_table(ENDPOINTS).map_err(storage_err)?;
            for endpoint in [endpoint1, endpoint2] {
                endpoints
                    .insert((endpoint.0, absolute_id.0), relation_id.0)
                    .map_err(storage_err)?;
            }
            Ok(version)
        })
    }

    fn relation_versions(
        &self,
        relation: RelationId,
    ) -> Result<Vec<RelationVersion>, StrataError> {
        self.read(|txn| {
            let index = txn.open_table(RELATION_VERSIONS).map_err(storage_err)?;
            let rows = txn.open_table(RELATIONS).map_err(storage_err)?;
            let mut versions = Vec::new();
            for (_, abs) in versions_in(&index, relation.0)? {
                if let Some(version) = load_relation(&rows, abs)? {
                    versions.push(version);
                }
            }
            Ok(versions)
        })
    }

    fn relations_between(
        &self,
        a: EntityId,
        b: EntityId,
    ) -> Result<Vec<RelationVersion>, StrataError> {
        self.read(|txn| {
            let entity_index = txn.open_table(ENTITY_VERSIONS).map_err(storage_err)?;
            let endpoints = txn.open_table(ENDPOINTS).map_err(storage_err)?;
            let relations = txn.open_table(RELATIONS).map_err(storage_err)?;
            rows_between(&entity_index, &endpoints, &relations, a, b)
        })
    }

    fn relations_of_entity(&self, entity: EntityId) -> Result<Vec<RelationVersion>, StrataError> {
        self.read(|txn| {
            let entity_index = txn.open_table(ENTITY_VERSIONS).map_err(storage_err)?;
            let endpoints = txn.open_table(ENDPOINTS).map_err(storage_err)?;
            let relation_index = txn.open_table(RELATION_VERSIONS).map_err(storage_err)?;
            let relations = txn.open_table(RELATIONS).map_err(storage_err)?;

            let entity_rows = row_ids(&entity_index, entity.0)?;
            let relation_ids: BTreeSet<u64> = touching(&endpoints, &entity_rows)?
                .into_iter()
                .map(|(_, relation_id)| relation_id)
                .collect();

            let mut result = Vec::new();
            for relation_id in relation_ids {
                if let Some(&(_, abs)) = versions_in(&relation_index, relation_id)?.last() {
                    if let Some(version) = load_relation(&relations, abs)? {
                        result.push(version);
                    }
                }
            }
            Ok(result)
        })
    }

    fn all_current_relations(&self) -> Result<Vec<RelationVersion>, StrataError> {
        self.read(|txn| {
            let index = txn.open_table(RELATION_VERSIONS).map_err(storage_err)?;
            let rows = txn.open_table(RELATIONS).map_err(storage_err)?;
            let mut result = Vec::new();
            for abs in current_in(&index)?.into_values() {
                if let Some(version) = load_relation(&rows, abs)? {
                    result.push(version);
                }
            }
            Ok(result)
        })
    }

    fn merge_entity_ids(
        &self,
        target: EntityId,
        sources: &[EntityId],
    ) -> Result<MergeStats, StrataError> {
        let sources = validate_merge(target, sources)?;
        self.write(|txn| {
            let mut index = txn.open_table(ENTITY_VERSIONS).map_err(storage_err)?;
            let mut rows = txn.open_table(ENTITIES).map_err(storage_err)?;

            if versions_in(&index, target.0)?.is_empty() {
                return Err(StrataError::EntityNotFound(target));
            }

            let mut stats = MergeStats::default();
            for source in &sources {
                let owned = versions_in(&index, source.0)?;
                if owned.is_empty() {
                    continue;
                }
                stats.sources_merged += 1;
                for (created_at_us, abs) in owned {
                    let mut row: EntityRow = {
                        let bytes = rows
                            .get(abs)
                            .map_err(storage_err)?
                            .ok_or(StrataError::AbsoluteIdNotFound(AbsoluteId(abs)))?;
                        decode_row(bytes.value())?
                    };
                    row.entity_id = target.0;
                    let encoded = encode_row(&row)?;
                    rows.insert(abs, encoded.as_slice()).map_err(storage_err)?;
                    index.remove((source.0, abs)).map_err(storage_err)?;
                    index
                        .insert((target.0, abs), created_at_us)
                        .map_err(storage_err)?;
                    stats.versions_rewritten += 1;
                }
            }

            // Post-condition: no row may still carry a source id.
            for source in &sources {
                let remaining = versions_in(&index, source.0)?.len();
                if remaining != 0 {
                    return Err(StrataError::ConsistencyViolation(format!(
                        "{} rows still owned by {} after merge into {}",
                        remaining, source, target
                    )));
                }
            }
            Ok(stats)
        })
    }

    fn delete_self_referential_relations(&self, entity: EntityId) -> Result<usize, StrataError> {
        self.write(|txn| delete_self_referential(txn, entity))
    }

    fn fold_self_referential(
        &self,
        entity: EntityId,
        mut new: NewEntityVersion,
    ) -> Result<(EntityVersion, usize), StrataError> {
        validate_entity(&new)?;
        match new.entity_id {
            Some(id) if id != entity => {
                return Err(StrataError::MalformedInput(format!(
                    "folded version targets {} instead of {}",
                    id, entity
                )));
            }
            _ => new.entity_id = Some(entity),
        }
        self.write(|txn| {
            {
                let index = txn.open_table(ENTITY_VERSIONS).map_err(storage_err)?;
                if versions_in(&index, entity.0)?.is_empty() {
                    return Err(StrataError::EntityNotFound(entity));
                }
            }
            let version = append_entity(txn, new)?;
            let deleted = delete_self_referential(txn, entity)?;
            Ok((version, deleted))
        })
    }

    fn stats(&self) -> Result<StoreStats, StrataError> {
        self.read(|txn| {
            let entities = txn.open_table(ENTITIES).map_err(storage_err)?;
            let relations = txn.open_table(RELATIONS).map_err(storage_err)?;
            let entity_index = txn.open_table(ENTITY_VERSIONS).map_err(storage_err)?;
            let relation_index = txn.open_table(RELATION_VERSIONS).map_err(storage_err)?;
            Ok(StoreStats {
                entity_versions: entities.len().map_err(storage_err)? as usize,
                entities: current_in(&entity_index)?.len(),
                relation_versions: relations.len().map_err(storage_err)? as usize,
                relations: current_in(&relation_index)?.len(),
            })
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
