//! # Core Type Definitions
//!
//! This module contains the core types of the versioned knowledge graph:
//! - Identifiers (`AbsoluteId`, `EntityId`, `RelationId`, `MemoryCacheId`)
//! - Version rows (`EntityVersion`, `RelationVersion`) and their append requests
//! - The error taxonomy (`StrataError`)
//!
//! ## Identity Model
//!
//! An `AbsoluteId` names exactly one version row and is never reused or
//! rewritten. An `EntityId` / `RelationId` is the logical identity shared by
//! every version of "the same thing over time". Merges rewrite the `EntityId`
//! of version rows; nothing else ever changes after an append.

use crate::capability::CapabilityError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Permanent identifier of one specific version row (entity or relation).
///
/// Allocated from a single monotonic counter, so a larger id always means a
/// later append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AbsoluteId(pub u64);

/// Logical identity of an entity, stable across its versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

/// Logical identity of a relation, stable across its versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationId(pub u64);

impl fmt::Display for AbsoluteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "abs_{}", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ent_{}", self.0)
    }
}

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rel_{}", self.0)
    }
}

/// Reference to an external memory-cache blob (provenance only).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemoryCacheId(pub String);

impl MemoryCacheId {
    /// Create a new cache reference.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// ENTITY VERSIONS
// =============================================================================

/// One immutable version of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityVersion {
    /// The version row identifier.
    pub absolute_id: AbsoluteId,
    /// The logical entity this version belongs to (rewritable by merge).
    pub entity_id: EntityId,
    /// Entity name as extracted.
    pub name: String,
    /// Free-text description.
    pub content: String,
    /// Creation time of this version.
    pub created_at: DateTime<Utc>,
    /// Memory cache the version was derived from.
    pub source_cache: Option<MemoryCacheId>,
    /// Source document name.
    pub source_doc: String,
    /// Optional embedding vector.
    pub embedding: Option<Vec<f32>>,
}

impl EntityVersion {
    /// Ordering key among versions of one logical entity.
    ///
    /// The current version is the maximum; equal timestamps fall back to the
    /// later append.
    #[must_use]
    pub fn version_key(&self) -> (DateTime<Utc>, AbsoluteId) {
        (self.created_at, self.absolute_id)
    }
}

/// Request to append a new entity version.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntityVersion {
    /// Existing logical id, or `None` to allocate a new entity.
    pub entity_id: Option<EntityId>,
    pub name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub source_cache: Option<MemoryCacheId>,
    pub source_doc: String,
    pub embedding: Option<Vec<f32>>,
}

impl NewEntityVersion {
    /// A version with no provenance and no embedding, created now.
    #[must_use]
    pub fn new(entity_id: Option<EntityId>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            entity_id,
            name: name.into(),
            content: content.into(),
            created_at: Utc::now(),
            source_cache: None,
            source_doc: String::new(),
            embedding: None,
        }
    }

    /// Override the creation time.
    #[must_use]
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Attach an embedding.
    #[must_use]
    pub fn with_embedding(mut self, embedding: Option<Vec<f32>>) -> Self {
        self.embedding = embedding;
        self
    }
}

// =============================================================================
// RELATION VERSIONS
// =============================================================================

/// One immutable version of an undirected relation.
///
/// `endpoint1`/`endpoint2` are stored in canonical order (by endpoint entity
/// name at creation time, then absolute id) and point at specific entity
/// versions, not at logical entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationVersion {
    pub absolute_id: AbsoluteId,
    pub relation_id: RelationId,
    pub endpoint1: AbsoluteId,
    pub endpoint2: AbsoluteId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub source_cache: Option<MemoryCacheId>,
    pub source_doc: String,
    pub embedding: Option<Vec<f32>>,
}

impl RelationVersion {
    /// Ordering key among versions of one logical relation.
    #[must_use]
    pub fn version_key(&self) -> (DateTime<Utc>, AbsoluteId) {
        (self.created_at, self.absolute_id)
    }

    /// Whether either endpoint is the given entity version.
    #[must_use]
    pub fn touches(&self, version: AbsoluteId) -> bool {
        self.endpoint1 == version || self.endpoint2 == version
    }
}

/// Request to append a new relation version.
///
/// The endpoint order given here is irrelevant; the store canonicalizes it.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRelationVersion {
    /// Existing logical id, or `None` to allocate a new relation.
    pub relation_id: Option<RelationId>,
    pub endpoint_a: AbsoluteId,
    pub endpoint_b: AbsoluteId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub source_cache: Option<MemoryCacheId>,
    pub source_doc: String,
    pub embedding: Option<Vec<f32>>,
}

impl NewRelationVersion {
    /// A relation version between two entity versions, created now.
    #[must_use]
    pub fn new(
        relation_id: Option<RelationId>,
        endpoint_a: AbsoluteId,
        endpoint_b: AbsoluteId,
        content: impl Into<String>,
    ) -> Self {
        Self {
            relation_id,
            endpoint_a,
            endpoint_b,
            content: content.into(),
            created_at: Utc::now(),
            source_cache: None,
            source_doc: String::new(),
            embedding: None,
        }
    }

    /// Override the creation time.
    #[must_use]
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Order two endpoint versions canonically.
///
/// Lexicographic by entity name, then by absolute id, so `(A, B)` and `(B, A)`
/// always produce the same stored pair.
#[must_use]
pub fn canonical_endpoints(a: &EntityVersion, b: &EntityVersion) -> (AbsoluteId, AbsoluteId) {
    if (a.name.as_str(), a.absolute_id) <= (b.name.as_str(), b.absolute_id) {
        (a.absolute_id, b.absolute_id)
    } else {
        (b.absolute_id, a.absolute_id)
    }
}

/// Truncate to at most `limit` characters (not bytes).
#[must_use]
pub fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the engine.
///
/// - Not-found errors mean "skip, do not fabricate"
/// - `ConsistencyViolation` is always fatal to the operation that raised it
/// - Storage errors always propagate to the immediate caller
#[derive(Debug, Error)]
pub enum StrataError {
    /// No version exists for the logical entity.
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    /// No version exists for the logical relation.
    #[error("Relation not found: {0}")]
    RelationNotFound(RelationId),

    /// No version row carries this absolute id.
    #[error("Version not found: {0}")]
    AbsoluteIdNotFound(AbsoluteId),

    /// A post-condition check failed; the operation was rolled back.
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    /// An external capability failed or is not configured.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(#[from] CapabilityError),

    /// The request was rejected before any work was performed.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// The storage layer failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A row or blob could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StrataError {
    /// Whether this error belongs to the not-found class.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::EntityNotFound(_) | Self::RelationNotFound(_) | Self::AbsoluteIdNotFound(_)
        )
    }
}

// =============================================================================
// TESTS
// =============================================================================
