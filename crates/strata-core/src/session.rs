//! # Session Module
//!
//! A session binds a storage backend to the capability providers, the engine
//! configuration and the provenance of whatever is being ingested right now.
//!
//! Provenance is explicit session state: every version written through the
//! session is tagged with the current memory cache and source document.
//!
//! ## Storage Backends
//!
//! - `InMemory`: [`MemoryStore`] (fast, volatile)
//! - `Persistent`: [`RedbStore`] (disk-backed, ACID)

use crate::capability::Capabilities;
use crate::config::EngineConfig;
use crate::consolidation::Consolidator;
use crate::merge::{KeywordSignal, MergeEngine, SameEntitySignal, current_per_relation};
use crate::path::PathSearch;
use crate::similarity::{SimilarityIndex, entity_embedding_text};
use crate::storage::RedbStore;
use crate::store::{MemoryStore, VersionStore};
use crate::{
    EntityId, EntityVersion, MemoryCacheId, NewEntityVersion, NewRelationVersion,
    RelationVersion, StrataError,
};
use chrono::{TimeDelta, Utc};
use std::path::Path;

/// Storage backend for a Session.
#[derive(Debug)]
pub enum StorageBackend {
    /// In-memory store (fast, volatile).
    InMemory(MemoryStore),
    /// Disk-backed store using redb (ACID, persistent).
    Persistent(RedbStore),
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::InMemory(MemoryStore::new())
    }
}

/// Where the versions currently being written came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provenance {
    pub cache: Option<MemoryCacheId>,
    pub source_doc: String,
}

impl Provenance {
    #[must_use]
    pub fn new(cache: Option<MemoryCacheId>, source_doc: impl Into<String>) -> Self {
        Self {
            cache,
            source_doc: source_doc.into(),
        }
    }
}

/// A storage backend plus everything needed to operate on it.
pub struct Session {
    backend: StorageBackend,
    caps: Capabilities,
    config: EngineConfig,
    signal: Box<dyn SameEntitySignal>,
    provenance: Provenance,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("backend", &self.backend)
            .field("caps", &self.caps)
            .field("provenance", &self.provenance)
            .finish_non_exhaustive()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::with_backend(StorageBackend::default())
    }
}

impl Session {
    /// Create a new empty session with in-memory storage.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Create a session with persistent redb storage.
    ///
    /// Opens or creates a redb database at the given path.
    pub fn with_redb(path: impl AsRef<Path>) -> Result<Self, StrataError> {
        Ok(Self::with_backend(StorageBackend::Persistent(RedbStore::open(
            path,
        )?)))
    }

    #[must_use]
    pub fn with_backend(backend: StorageBackend) -> Self {
        let config = EngineConfig::default();
        Self {
            backend,
            caps: Capabilities::none(),
            signal: Box::new(KeywordSignal::from_config(&config.merge)),
            config,
            provenance: Provenance::default(),
        }
    }

    #[must_use]
    pub fn with_capabilities(mut self, caps: Capabilities) -> Self {
        self.caps = caps;
        self
    }

    /// Replace the configuration; the keyword signal follows it.
    pub fn with_config(mut self, config: EngineConfig) -> Result<Self, StrataError> {
        config.validate()?;
        self.signal = Box::new(KeywordSignal::from_config(&config.merge));
        self.config = config;
        Ok(self)
    }

    /// Replace the same-entity signal used by the lexical guard.
    #[must_use]
    pub fn with_signal(mut self, signal: Box<dyn SameEntitySignal>) -> Self {
        self.signal = signal;
        self
    }

    /// The version store behind this session.
    #[must_use]
    pub fn store(&self) -> &dyn VersionStore {
        match &self.backend {
            StorageBackend::InMemory(store) => store,
            StorageBackend::Persistent(store) => store,
        }
    }

    /// Check if using persistent storage.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        matches!(self.backend, StorageBackend::Persistent(_))
    }

    #[must_use]
    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Switch to a new memory cache / source document.
    pub fn set_provenance(&mut self, provenance: Provenance) {
        tracing::debug!(
            cache = provenance.cache.as_ref().map(MemoryCacheId::as_str),
            doc = %provenance.source_doc,
            "provenance changed"
        );
        self.provenance = provenance;
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Create a new logical entity.
    pub fn add_entity(&self, name: &str, content: &str) -> Result<EntityVersion, StrataError> {
        self.write_entity(None, name, content)
    }

    /// Append a version to an existing logical entity.
    pub fn add_entity_version(
        &self,
        entity: EntityId,
        name: &str,
        content: &str,
    ) -> Result<EntityVersion, StrataError> {
        if self.store().entity_version_count(entity)? == 0 {
            return Err(StrataError::EntityNotFound(entity));
        }
        self.write_entity(Some(entity), name, content)
    }

    fn write_entity(
        &self,
        entity: Option<EntityId>,
        name: &str,
        content: &str,
    ) -> Result<EntityVersion, StrataError> {
        let embedding = self.caps.try_embed(&entity_embedding_text(name, content));
        let new = NewEntityVersion {
            source_cache: self.provenance.cache.clone(),
            source_doc: self.provenance.source_doc.clone(),
            ..NewEntityVersion::new(entity, name, content)
        }
        .with_embedding(embedding);
        self.store().put_entity_version(new)
    }

    /// Create a new logical relation between two entity versions.
    pub fn relate(
        &self,
        a: &EntityVersion,
        b: &EntityVersion,
        content: &str,
    ) -> Result<RelationVersion, StrataError> {
        let new = NewRelationVersion {
            source_cache: self.provenance.cache.clone(),
            source_doc: self.provenance.source_doc.clone(),
            embedding: self.caps.try_embed(content),
            ..NewRelationVersion::new(None, a.absolute_id, b.absolute_id, content)
        };
        self.store().put_relation_version(new)
    }

    /// Record `content` between two entities, extending an existing relation
    /// if the pair is already connected.
    pub fn upsert_relation(
        &self,
        a: EntityId,
        b: EntityId,
        content: &str,
    ) -> Result<RelationVersion, StrataError> {
        upsert_relation(self.store(), &self.caps, &self.provenance, a, b, content)
    }

    // =========================================================================
    // COMPONENTS
    // =========================================================================

    #[must_use]
    pub fn similarity(&self) -> SimilarityIndex<'_> {
        SimilarityIndex::new(self.store(), self.caps.embedder())
    }

    #[must_use]
    pub fn merge_engine(&self) -> MergeEngine<'_> {
        MergeEngine::new(self.store(), &self.caps, self.signal.as_ref())
    }

    #[must_use]
    pub fn path_search(&self) -> PathSearch<'_> {
        PathSearch::new(self.store())
    }

    #[must_use]
    pub fn consolidator(&self) -> Consolidator<'_> {
        Consolidator::new(
            self.store(),
            &self.caps,
            &self.config,
            self.signal.as_ref(),
            &self.provenance,
        )
    }
}

/// Record `content` between the current versions of `a` and `b`.
///
/// If a relation already connects the pair, its newest version is extended
/// with a synthesized content (identical content is a no-op). Otherwise a new
/// logical relation is created.
pub fn upsert_relation(
    store: &dyn VersionStore,
    caps: &Capabilities,
    provenance: &Provenance,
    a: EntityId,
    b: EntityId,
    content: &str,
) -> Result<RelationVersion, StrataError> {
    if a == b {
        return Err(StrataError::MalformedInput(format!(
            "cannot relate {} to itself",
            a
        )));
    }
    let first = store.current_entity(a)?.ok_or(StrataError::EntityNotFound(a))?;
    let second = store.current_entity(b)?.ok_or(StrataError::EntityNotFound(b))?;

    let existing = current_per_relation(store.relations_between(a, b)?)
        .into_iter()
        .max_by_key(RelationVersion::version_key);

    let (relation_id, content, created_at) = match existing {
        Some(existing) => {
            if existing.content.trim() == content.trim() {
                return Ok(existing);
            }
            let merged = caps
                .synthesizer()?
                .synthesize(&existing.content, &[content.to_string()])?;
            let at = Utc::now().max(existing.created_at + TimeDelta::microseconds(1));
            (Some(existing.relation_id), merged, at)
        }
        None => (None, content.to_string(), Utc::now()),
    };

    let new = NewRelationVersion {
        source_cache: provenance.cache.clone(),
        source_doc: provenance.source_doc.clone(),
        embedding: caps.try_embed(&content),
        ..NewRelationVersion::new(relation_id, first.absolute_id, second.absolute_id, content)
    }
    .at(created_at);
    let version = store.put_relation_version(new)?;
    tracing::debug!(
        relation = %version.relation_id,
        version = %version.absolute_id,
        "relation recorded"
    );
    Ok(version)
}

// =============================================================================
// TESTS
// =============================================================================
