//! # Version Store
//!
//! The append-only storage seam of the engine.
//!
//! This module defines the `VersionStore` trait and the in-memory
//! `MemoryStore`. The persistent implementation lives in
//! [`crate::storage::RedbStore`]. All data structures use `BTreeMap` for
//! deterministic ordering.
//!
//! ## Invariants
//!
//! - Absolute ids are allocated from one counter shared by entity and relation
//!   rows and are never reused
//! - Entity rows are never deleted; only their `entity_id` is rewritten, and
//!   only by `merge_entity_ids`
//! - Relation rows are deleted only when they have become self-referential

use crate::primitives::{MAX_CONTENT_LENGTH, MAX_MERGE_SOURCES, MAX_NAME_LENGTH};
use crate::{
    AbsoluteId, EntityId, EntityVersion, NewEntityVersion, NewRelationVersion, RelationId,
    RelationVersion, StrataError, canonical_endpoints,
};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

// =============================================================================
// RESULT TYPES
// =============================================================================

/// Outcome of `merge_entity_ids`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    /// Number of version rows whose `entity_id` was rewritten.
    pub versions_rewritten: usize,
    /// Number of sources that owned at least one row.
    pub sources_merged: usize,
}

/// Row and logical counts of a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub entity_versions: usize,
    pub entities: usize,
    pub relation_versions: usize,
    pub relations: usize,
}

// =============================================================================
// VERSIONSTORE TRAIT
// =============================================================================

/// Append-only storage of entity and relation versions.
///
/// All fallible operations return `Result<T, StrataError>` so in-memory and
/// persistent backends behave uniformly. Every method takes `&self`; each call
/// is one isolated transaction.
pub trait VersionStore: Send + Sync {
    /// Append an entity version, allocating ids as needed.
    fn put_entity_version(&self, new: NewEntityVersion) -> Result<EntityVersion, StrataError>;

    /// All versions of a logical entity, oldest first.
    fn entity_versions(&self, entity: EntityId) -> Result<Vec<EntityVersion>, StrataError>;

    /// Resolve a version row to its (current) owner.
    fn entity_by_absolute_id(&self, id: AbsoluteId) -> Result<Option<EntityVersion>, StrataError>;

    /// Current version of every logical entity, ordered by entity id.
    fn current_entities(&self) -> Result<Vec<EntityVersion>, StrataError>;

    /// Append a relation version between two existing entity versions.
    fn put_relation_version(&self, new: NewRelationVersion)
    -> Result<RelationVersion, StrataError>;

    /// All versions of a logical relation, oldest first.
    fn relation_versions(&self, relation: RelationId)
    -> Result<Vec<RelationVersion>, StrataError>;

    /// Every relation row between any version of `a` and any version of `b`,
    /// in either endpoint order, newest first.
    fn relations_between(&self, a: EntityId, b: EntityId)
    -> Result<Vec<RelationVersion>, StrataError>;

    /// Current version of every relation touching any version of `entity`,
    /// ordered by relation id.
    fn relations_of_entity(&self, entity: EntityId) -> Result<Vec<RelationVersion>, StrataError>;

    /// Current version of every logical relation, ordered by relation id.
    fn all_current_relations(&self) -> Result<Vec<RelationVersion>, StrataError>;

    /// Atomically move every version owned by `sources` to `target`.
    fn merge_entity_ids(
        &self,
        target: EntityId,
        sources: &[EntityId],
    ) -> Result<MergeStats, StrataError>;

    /// Delete every relation row whose endpoints both belong to `entity`.
    fn delete_self_referential_relations(&self, entity: EntityId) -> Result<usize, StrataError>;

    /// Append a new version of `entity` and delete its self-referential
    /// relation rows in the same transaction.
    fn fold_self_referential(
        &self,
        entity: EntityId,
        new: NewEntityVersion,
    ) -> Result<(EntityVersion, usize), StrataError>;

    fn stats(&self) -> Result<StoreStats, StrataError>;

    // ===== DERIVED OPERATIONS =====

    /// The version with the greatest `(created_at, absolute_id)`.
    fn current_entity(&self, entity: EntityId) -> Result<Option<EntityVersion>, StrataError> {
        Ok(self.entity_versions(entity)?.pop())
    }

    /// The latest version with `created_at <= at`.
    fn entity_version_at(
        &self,
        entity: EntityId,
        at: DateTime<Utc>,
    ) -> Result<Option<EntityVersion>, StrataError> {
        Ok(self
            .entity_versions(entity)?
            .into_iter()
            .rev()
            .find(|v| v.created_at <= at))
    }

    fn entity_version_count(&self, entity: EntityId) -> Result<usize, StrataError> {
        Ok(self.entity_versions(entity)?.len())
    }

    /// For every logical entity, its version as of `at` (if it existed then).
    fn current_entities_before(
        &self,
        at: DateTime<Utc>,
    ) -> Result<Vec<EntityVersion>, StrataError> {
        let mut result = Vec::new();
        for current in self.current_entities()? {
            if let Some(version) = self.entity_version_at(current.entity_id, at)? {
                result.push(version);
            }
        }
        Ok(result)
    }

    fn current_relation(
        &self,
        relation: RelationId,
    ) -> Result<Option<RelationVersion>, StrataError> {
        Ok(self.relation_versions(relation)?.pop())
    }

    /// Relation rows whose endpoints both resolve to `entity`.
    fn self_referential_relations(
        &self,
        entity: EntityId,
    ) -> Result<Vec<RelationVersion>, StrataError> {
        self.relations_between(entity, entity)
    }
}

// =============================================================================
// SHARED VALIDATION
// =============================================================================

/// Timestamps are stored with microsecond precision by every backend.
pub(crate) fn storage_time(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}

/// The counter value after `used`, or `MalformedInput` once ids run out.
pub(crate) fn next_counter(used: u64, what: &str) -> Result<u64, StrataError> {
    used.checked_add(1).ok_or_else(|| {
        StrataError::MalformedInput(format!("{} {} leaves no room for new ids", what, used))
    })
}

pub(crate) fn validate_entity(new: &NewEntityVersion) -> Result<(), StrataError> {
    if new.name.trim().is_empty() {
        return Err(StrataError::MalformedInput(
            "entity name must not be empty".to_string(),
        ));
    }
    if new.name.len() > MAX_NAME_LENGTH {
        return Err(StrataError::MalformedInput(format!(
            "entity name exceeds {} bytes",
            MAX_NAME_LENGTH
        )));
    }
    validate_content(&new.content)
}

pub(crate) fn validate_relation(new: &NewRelationVersion) -> Result<(), StrataError> {
    validate_content(&new.content)
}

fn validate_content(content: &str) -> Result<(), StrataError> {
    if content.len() > MAX_CONTENT_LENGTH {
        return Err(StrataError::MalformedInput(format!(
            "content exceeds {} bytes",
            MAX_CONTENT_LENGTH
        )));
    }
    Ok(())
}

/// Validate a merge request and return the deduplicated sources.
pub(crate) fn validate_merge(
    target: EntityId,
    sources: &[EntityId],
) -> Result<BTreeSet<EntityId>, StrataError> {
    if sources.is_empty() {
        return Err(StrataError::MalformedInput(
            "merge requires at least one source".to_string(),
        ));
    }
    if sources.len() > MAX_MERGE_SOURCES {
        return Err(StrataError::MalformedInput(format!(
            "merge accepts at most {} sources",
            MAX_MERGE_SOURCES
        )));
    }
    if sources.contains(&target) {
        return Err(StrataError::MalformedInput(format!(
            "merge target {} is also listed as a source",
            target
        )));
    }
    Ok(sources.iter().copied().collect())
}

/// Whether a relation row connects the two absolute-id sets, in either order.
pub(crate) fn connects(
    relation: &RelationVersion,
    a: &BTreeSet<AbsoluteId>,
    b: &BTreeSet<AbsoluteId>,
) -> bool {
    (a.contains(&relation.endpoint1) && b.contains(&relation.endpoint2))
        || (b.contains(&relation.endpoint1) && a.contains(&relation.endpoint2))
}

/// Newest first by `(created_at, absolute_id)`.
pub(crate) fn sort_newest_first(relations: &mut [RelationVersion]) {
    relations.sort_by(|x, y| y.version_key().cmp(&x.version_key()));
}

// =============================================================================
// MEMORYSTORE IMPLEMENTATION
// =============================================================================

#[derive(Debug)]
struct Inner {
    next_absolute_id: u64,
    next_entity_id: u64,
    next_relation_id: u64,
    /// Entity rows: AbsoluteId -> version
    entities: BTreeMap<AbsoluteId, EntityVersion>,
    /// Version index: EntityId -> its row ids
    entity_index: BTreeMap<EntityId, BTreeSet<AbsoluteId>>,
    /// Relation rows: AbsoluteId -> version
    relations: BTreeMap<AbsoluteId, RelationVersion>,
    /// Version index: RelationId -> its row ids
    relation_index: BTreeMap<RelationId, BTreeSet<AbsoluteId>>,
    /// Endpoint index: entity row -> relation rows touching it
    endpoints: BTreeMap<AbsoluteId, BTreeSet<AbsoluteId>>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            next_absolute_id: 1,
            next_entity_id: 1,
            next_relation_id: 1,
            entities: BTreeMap::new(),
            entity_index: BTreeMap::new(),
            relations: BTreeMap::new(),
            relation_index: BTreeMap::new(),
            endpoints: BTreeMap::new(),
        }
    }
}

impl Inner {
    fn allocate_absolute(&mut self) -> Result<AbsoluteId, StrataError> {
        let id = AbsoluteId(self.next_absolute_id);
        self.next_absolute_id = next_counter(self.next_absolute_id, "absolute id")?;
        Ok(id)
    }

    fn resolve_entity_id(&mut self, requested: Option<EntityId>) -> Result<EntityId, StrataError> {
        match requested {
            Some(id) => {
                self.next_entity_id = self.next_entity_id.max(next_counter(id.0, "entity id")?);
                Ok(id)
            }
            None => {
                let id = EntityId(self.next_entity_id);
                self.next_entity_id = next_counter(self.next_entity_id, "entity id")?;
                Ok(id)
            }
        }
    }

    fn resolve_relation_id(
        &mut self,
        requested: Option<RelationId>,
    ) -> Result<RelationId, StrataError> {
        match requested {
            Some(id) => {
                self.next_relation_id =
                    self.next_relation_id.max(next_counter(id.0, "relation id")?);
                Ok(id)
            }
            None => {
                let id = RelationId(self.next_relation_id);
                self.next_relation_id = next_counter(self.next_relation_id, "relation id")?;
                Ok(id)
            }
        }
    }

    fn append_entity(&mut self, new: NewEntityVersion) -> Result<EntityVersion, StrataError> {
        let entity_id = self.resolve_entity_id(new.entity_id)?;
        let absolute_id = self.allocate_absolute()?;
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
        self.entities.insert(absolute_id, version.clone());
        self.entity_index
            .entry(entity_id)
            .or_default()
            .insert(absolute_id);
        Ok(version)
    }

    fn sorted_versions(&self, entity: EntityId) -> Vec<EntityVersion> {
        let mut versions: Vec<EntityVersion> = self
            .entity_index
            .get(&entity)
            .into_iter()
            .flatten()
            .filter_map(|abs| self.entities.get(abs).cloned())
            .collect();
        versions.sort_by_key(EntityVersion::version_key);
        versions
    }

    fn current_relation(&self, relation: RelationId) -> Option<&RelationVersion> {
        self.relation_index
            .get(&relation)
            .into_iter()
            .flatten()
            .filter_map(|abs| self.relations.get(abs))
            .max_by_key(|r| r.version_key())
    }

    fn rows_between(&self, a: EntityId, b: EntityId) -> Vec<RelationVersion> {
        let (Some(a_ids), Some(b_ids)) = (self.entity_index.get(&a), self.entity_index.get(&b))
        else {
            return Vec::new();
        };
        let mut result: Vec<RelationVersion> = a_ids
            .iter()
            .filter_map(|abs| self.endpoints.get(abs))
            .flatten()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter_map(|rel| self.relations.get(rel))
            .filter(|r| connects(r, a_ids, b_ids))
            .cloned()
            .collect();
        sort_newest_first(&mut result);
        result
    }

    fn remove_relation_row(&mut self, id: AbsoluteId) -> bool {
        let Some(row) = self.relations.remove(&id) else {
            return false;
        };
        for endpoint in [row.endpoint1, row.endpoint2] {
            if let Some(set) = self.endpoints.get_mut(&endpoint) {
                set.remove(&id);
                if set.is_empty() {
                    self.endpoints.remove(&endpoint);
                }
            }
        }
        if let Some(set) = self.relation_index.get_mut(&row.relation_id) {
            set.remove(&id);
            if set.is_empty() {
                self.relation_index.remove(&row.relation_id);
            }
        }
        true
    }

    fn delete_self_referential(&mut self, entity: EntityId) -> usize {
        let doomed: Vec<AbsoluteId> = self
            .rows_between(entity, entity)
            .into_iter()
            .map(|r| r.absolute_id)
            .collect();
        doomed
            .into_iter()
            .filter(|id| self.remove_relation_row(*id))
            .count()
    }
}

/// In-memory version store.
///
/// A single `RwLock` guards all tables; every mutating call holds the write
/// lock for its whole duration, which makes each call one transaction.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StrataError> {
        self.inner
            .read()
            .map_err(|_| StrataError::Storage("store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StrataError> {
        self.inner
            .write()
            .map_err(|_| StrataError::Storage("store lock poisoned".to_string()))
    }
}

impl VersionStore for MemoryStore {
    fn put_entity_version(&self, new: NewEntityVersion) -> Result<EntityVersion, StrataError> {
        validate_entity(&new)?;
        let mut inner = self.write()?;
        inner.append_entity(new)
    }

    fn entity_versions(&self, entity: EntityId) -> Result<Vec<EntityVersion>, StrataError> {
        Ok(self.read()?.sorted_versions(entity))
    }

    fn entity_by_absolute_id(&self, id: AbsoluteId) -> Result<Option<EntityVersion>, StrataError> {
        Ok(self.read()?.entities.get(&id).cloned())
    }

    fn current_entities(&self) -> Result<Vec<EntityVersion>, StrataError> {
        let inner = self.read()?;
        Ok(inner
            .entity_index
            .keys()
            .filter_map(|id| inner.sorted_versions(*id).pop())
            .collect())
    }

    fn put_relation_version(
        &self,
        new: NewRelationVersion,
    ) -> Result<RelationVersion, StrataError> {
        validate_relation(&new)?;
        let mut inner = self.write()?;
        let a = inner
            .entities
            .get(&new.endpoint_a)
            .ok_or(StrataError::AbsoluteIdNotFound(new.endpoint_a))?;
        let b = inner
            .entities
            .get(&new.endpoint_b)
            .ok_or(StrataError::AbsoluteIdNotFound(new.endpoint_b))?;
        let (endpoint1, endpoint2) = canonical_endpoints(a, b);

        let relation_id = inner.resolve_relation_id(new.relation_id)?;
        let absolute_id = inner.allocate_absolute()?;
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
        inner.relations.insert(absolute_id, version.clone());
        inner
            .relation_index
            .entry(relation_id)
            .or_default()
            .insert(absolute_id);
        for endpoint in [endpoint1, endpoint2] {
            inner.endpoints.entry(endpoint).or_default().insert(absolute_id);
        }
        Ok(version)
    }

    fn relation_versions(
        &self,
        relation: RelationId,
    ) -> Result<Vec<RelationVersion>, StrataError> {
        let inner = self.read()?;
        let mut versions: Vec<RelationVersion> = inner
            .relation_index
            .get(&relation)
            .into_iter()
            .flatten()
            .filter_map(|abs| inner.relations.get(abs).cloned())
            .collect();
        versions.sort_by_key(RelationVersion::version_key);
        Ok(versions)
    }

    fn relations_between(
        &self,
        a: EntityId,
        b: EntityId,
    ) -> Result<Vec<RelationVersion>, StrataError> {
        Ok(self.read()?.rows_between(a, b))
    }

    fn relations_of_entity(&self, entity: EntityId) -> Result<Vec<RelationVersion>, StrataError> {
        let inner = self.read()?;
        let relation_ids: BTreeSet<RelationId> = inner
            .entity_index
            .get(&entity)
            .into_iter()
            .flatten()
            .filter_map(|abs| inner.endpoints.get(abs))
            .flatten()
            .filter_map(|rel| inner.relations.get(rel))
            .map(|r| r.relation_id)
            .collect();
        Ok(relation_ids
            .into_iter()
            .filter_map(|id| inner.current_relation(id).cloned())
            .collect())
    }

    fn all_current_relations(&self) -> Result<Vec<RelationVersion>, StrataError> {
        let inner = self.read()?;
        Ok(inner
            .relation_index
            .keys()
            .filter_map(|id| inner.current_relation(*id).cloned())
            .collect())
    }

    fn merge_entity_ids(
        &self,
        target: EntityId,
        sources: &[EntityId],
    ) -> Result<MergeStats, StrataError> {
        let sources = validate_merge(target, sources)?;
        let mut inner = self.write()?;
        if !inner.entity_index.contains_key(&target) {
            return Err(StrataError::EntityNotFound(target));
        }

        // Stage the rewrite on a copy of the index, verify it, then apply.
        let mut index = inner.entity_index.clone();
        let mut moved: BTreeMap<AbsoluteId, EntityVersion> = BTreeMap::new();
        let mut stats = MergeStats::default();
        for source in &sources {
            let Some(rows) = index.remove(source) else {
                continue;
            };
            stats.sources_merged += 1;
            for abs in rows {
                let mut row = inner
                    .entities
                    .get(&abs)
                    .cloned()
                    .ok_or(StrataError::AbsoluteIdNotFound(abs))?;
                row.entity_id = target;
                index.entry(target).or_default().insert(abs);
                moved.insert(abs, row);
            }
        }
        stats.versions_rewritten = moved.len();

        // Post-condition: no index entry and no row still carries a source id.
        let indexed = sources.iter().filter(|s| index.contains_key(s)).count();
        let stranded = inner
            .entities
            .iter()
            .filter(|(abs, row)| sources.contains(&row.entity_id) && !moved.contains_key(abs))
            .count();
        if indexed != 0 || stranded != 0 {
            return Err(StrataError::ConsistencyViolation(format!(
                "merge into {} would leave {} source index entries and {} source rows",
                target, indexed, stranded
            )));
        }

        inner.entity_index = index;
        inner.entities.extend(moved);
        Ok(stats)
    }

    fn delete_self_referential_relations(&self, entity: EntityId) -> Result<usize, StrataError> {
        Ok(self.write()?.delete_self_referential(entity))
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
        let mut inner = self.write()?;
        if !inner.entity_index.contains_key(&entity) {
            return Err(StrataError::EntityNotFound(entity));
        }
        let version = inner.append_entity(new)?;
        let deleted = inner.delete_self_referential(entity);
        Ok((version, deleted))
    }

    fn stats(&self) -> Result<StoreStats, StrataError> {
        let inner = self.read()?;
        Ok(StoreStats {
            entity_versions: inner.entities.len(),
            entities: inner.entity_index.len(),
            relation_versions: inner.relations.len(),
            relations: inner.relation_index.len(),
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn entity(store: &MemoryStore, id: Option<EntityId>, name: &str) -> EntityVersion {
        store
            .put_entity_version(NewEntityVersion::new(id, name, format!("{} content", name)))
            .expect("put entity")
    }

    #[test]
    fn fresh_entity_gets_new_ids() {
        let store = MemoryStore::new();
        let a = entity(&store, None, "Alice");
        let b = entity(&store, None, "Bob");

        assert_ne!(a.entity_id, b.entity_id);
        assert!(b.absolute_id > a.absolute_id);
    }

    #[test]
    fn current_is_latest_created_at() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let later = store
            .put_entity_version(NewEntityVersion::new(None, "X", "new").at(now))
            .expect("put");
        let earlier = store
            .put_entity_version(
                NewEntityVersion::new(Some(later.entity_id), "X", "old")
                    .at(now - TimeDelta::seconds(10)),
            )
            .expect("put");

        let current = store
            .current_entity(later.entity_id)
            .expect("query")
            .expect("exists");
        assert_eq!(current.absolute_id, later.absolute_id);

        let versions = store.entity_versions(later.entity_id).expect("versions");
        assert_eq!(versions[0].absolute_id, earlier.absolute_id);
    }

    #[test]
    fn version_at_time() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let v1 = store
            .put_entity_version(NewEntityVersion::new(None, "X", "v1").at(t0))
            .expect("put");
        store
            .put_entity_version(
                NewEntityVersion::new(Some(v1.entity_id), "X", "v2").at(t0 + TimeDelta::hours(1)),
            )
            .expect("put");

        let at = store
            .entity_version_at(v1.entity_id, t0 + TimeDelta::minutes(5))
            .expect("query")
            .expect("exists");
        assert_eq!(at.content, "v1");
        assert!(
            store
                .entity_version_at(v1.entity_id, t0 - TimeDelta::minutes(5))
                .expect("query")
                .is_none()
        );
    }

    #[test]
    fn snapshot_skips_later_entities() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let old = store
            .put_entity_version(NewEntityVersion::new(None, "Old", "v1").at(t0))
            .expect("put");
        store
            .put_entity_version(
                NewEntityVersion::new(Some(old.entity_id), "Old", "v2").at(t0 + TimeDelta::hours(2)),
            )
            .expect("put");
        store
            .put_entity_version(NewEntityVersion::new(None, "New", "v1").at(t0 + TimeDelta::hours(3)))
            .expect("put");

        let snapshot = store
            .current_entities_before(t0 + TimeDelta::hours(1))
            .expect("snapshot");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].content, "v1");
        assert_eq!(store.current_entities_before(t0 - TimeDelta::hours(1)).expect("snapshot").len(), 0);
    }

    #[test]
    fn exhausted_explicit_id_rejected() {
        let store = MemoryStore::new();
        let a = entity(&store, None, "A");

        let result =
            store.put_entity_version(NewEntityVersion::new(Some(EntityId(u64::MAX)), "Max", "x"));
        assert!(matches!(result, Err(StrataError::MalformedInput(_))));
        let result = store.put_relation_version(NewRelationVersion::new(
            Some(RelationId(u64::MAX)),
            a.absolute_id,
            a.absolute_id,
            "loop",
        ));
        assert!(matches!(result, Err(StrataError::MalformedInput(_))));

        let stats = store.stats().expect("stats");
        assert_eq!((stats.entity_versions, stats.relation_versions), (1, 0));
        let b = entity(&store, None, "B");
        assert_eq!(b.entity_id, EntityId(a.entity_id.0 + 1));
        assert_eq!(b.absolute_id, AbsoluteId(a.absolute_id.0 + 1));
    }

    #[test]
    fn merge_detects_rows_missing_from_index() {
        let store = MemoryStore::new();
        let a = entity(&store, None, "A");
        let b = entity(&store, None, "B");
        // A row owned by B that the version index does not know about.
        {
            let mut inner = store.write().expect("lock");
            let mut stray = b.clone();
            stray.absolute_id = AbsoluteId(99);
            inner.entities.insert(stray.absolute_id, stray);
        }

        let result = store.merge_entity_ids(a.entity_id, &[b.entity_id]);
        assert!(matches!(result, Err(StrataError::ConsistencyViolation(_))));
        assert_eq!(store.entity_version_count(b.entity_id).expect("count"), 1);
        assert_eq!(store.entity_version_count(a.entity_id).expect("count"), 1);
    }

    #[test]
    fn empty_name_rejected() {
        let store = MemoryStore::new();
        let result = store.put_entity_version(NewEntityVersion::new(None, "  ", "x"));
        assert!(matches!(result, Err(StrataError::MalformedInput(_))));
    }

    #[test]
    fn relation_requires_existing_endpoints() {
        let store = MemoryStore::new();
        let a = entity(&store, None, "A");
        let result = store.put_relation_version(NewRelationVersion::new(
            None,
            a.absolute_id,
            AbsoluteId(999),
            "knows",
        ));
        assert!(matches!(result, Err(StrataError::AbsoluteIdNotFound(AbsoluteId(999)))));
    }

    #[test]
    fn relation_endpoints_canonicalized() {
        let store = MemoryStore::new();
        let zed = entity(&store, None, "Zed");
        let amy = entity(&store, None, "Amy");
        let rel = store
            .put_relation_version(NewRelationVersion::new(
                None,
                zed.absolute_id,
                amy.absolute_id,
                "friends",
            ))
            .expect("put relation");

        assert_eq!(rel.endpoint1, amy.absolute_id);
        assert_eq!(rel.endpoint2, zed.absolute_id);
    }

    #[test]
    fn relations_between_spans_history_and_order() {
        let store = MemoryStore::new();
        let a1 = entity(&store, None, "A");
        let b1 = entity(&store, None, "B");
        let a2 = entity(&store, Some(a1.entity_id), "A");
        store
            .put_relation_version(NewRelationVersion::new(None, a1.absolute_id, b1.absolute_id, "old"))
            .expect("put");
        store
            .put_relation_version(NewRelationVersion::new(None, b1.absolute_id, a2.absolute_id, "new"))
            .expect("put");

        let forward = store
            .relations_between(a1.entity_id, b1.entity_id)
            .expect("between");
        let backward = store
            .relations_between(b1.entity_id, a1.entity_id)
            .expect("between");
        assert_eq!(forward.len(), 2);
        assert_eq!(forward, backward);
        assert!(forward[0].absolute_id > forward[1].absolute_id);
    }

    #[test]
    fn merge_rewrites_and_reports() {
        let store = MemoryStore::new();
        let a = entity(&store, None, "A");
        let b = entity(&store, None, "B");
        entity(&store, Some(b.entity_id), "B");

        let stats = store
            .merge_entity_ids(a.entity_id, &[b.entity_id])
            .expect("merge");
        assert_eq!(stats, MergeStats { versions_rewritten: 2, sources_merged: 1 });
        assert!(store.entity_versions(b.entity_id).expect("q").is_empty());
        assert_eq!(store.entity_version_count(a.entity_id).expect("q"), 3);

        let again = store
            .merge_entity_ids(a.entity_id, &[b.entity_id])
            .expect("merge again");
        assert_eq!(again, MergeStats::default());
    }

    #[test]
    fn merge_rejects_bad_requests() {
        let store = MemoryStore::new();
        let a = entity(&store, None, "A");

        assert!(matches!(
            store.merge_entity_ids(a.entity_id, &[]),
            Err(StrataError::MalformedInput(_))
        ));
        assert!(matches!(
            store.merge_entity_ids(a.entity_id, &[a.entity_id]),
            Err(StrataError::MalformedInput(_))
        ));
        assert!(matches!(
            store.merge_entity_ids(EntityId(77), &[a.entity_id]),
            Err(StrataError::EntityNotFound(EntityId(77)))
        ));
    }

    #[test]
    fn fold_appends_and_deletes_in_one_step() {
        let store = MemoryStore::new();
        let a = entity(&store, None, "A");
        let b = entity(&store, None, "B");
        store
            .put_relation_version(NewRelationVersion::new(None, a.absolute_id, b.absolute_id, "alias"))
            .expect("put");
        store
            .merge_entity_ids(a.entity_id, &[b.entity_id])
            .expect("merge");
        assert_eq!(store.self_referential_relations(a.entity_id).expect("q").len(), 1);

        let (folded, deleted) = store
            .fold_self_referential(a.entity_id, NewEntityVersion::new(None, "A", "folded"))
            .expect("fold");
        assert_eq!(deleted, 1);
        assert_eq!(folded.entity_id, a.entity_id);
        assert!(store.self_referential_relations(a.entity_id).expect("q").is_empty());
        assert_eq!(store.stats().expect("stats").relation_versions, 0);
    }

    #[test]
    fn explicit_ids_advance_counters() {
        let store = MemoryStore::new();
        entity(&store, Some(EntityId(10)), "Ten");
        let fresh = entity(&store, None, "Fresh");
        assert_eq!(fresh.entity_id, EntityId(11));
    }
}
