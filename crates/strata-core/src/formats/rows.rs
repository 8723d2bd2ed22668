//! # Row Format
//!
//! Postcard-encoded version rows as stored in the `entities` and `relations`
//! tables. The absolute id is the table key and is not repeated in the row.
//!
//! Timestamps are stored as microseconds since the Unix epoch, the same value
//! used as the version-index payload, so the store can order versions without
//! decoding rows.
//!
//! ## Security
//!
//! Payload size is validated before deserialization to avoid allocating on
//! behalf of a corrupted database file.

use super::embedding::{embedding_from_bytes, embedding_to_bytes};
use crate::{
    AbsoluteId, EntityId, EntityVersion, MemoryCacheId, RelationId, RelationVersion, StrataError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Maximum size of a single encoded row.
pub const MAX_ROW_SIZE: usize = 16 * 1024 * 1024;

// =============================================================================
// ROWS
// =============================================================================

/// Stored form of an entity version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub entity_id: u64,
    pub name: String,
    pub content: String,
    pub created_at_us: i64,
    pub source_cache: Option<String>,
    pub source_doc: String,
    pub embedding: Option<Vec<u8>>,
}

impl EntityRow {
    /// Build the stored form of a version.
    #[must_use]
    pub fn from_version(version: &EntityVersion) -> Self {
        Self {
            entity_id: version.entity_id.0,
            name: version.name.clone(),
            content: version.content.clone(),
            created_at_us: version.created_at.timestamp_micros(),
            source_cache: version.source_cache.as_ref().map(|c| c.0.clone()),
            source_doc: version.source_doc.clone(),
            embedding: version.embedding.as_deref().map(embedding_to_bytes),
        }
    }

    /// Rebuild the version stored under `absolute_id`.
    pub fn into_version(self, absolute_id: AbsoluteId) -> Result<EntityVersion, StrataError> {
        Ok(EntityVersion {
            absolute_id,
            entity_id: EntityId(self.entity_id),
            name: self.name,
            content: self.content,
            created_at: micros_to_time(self.created_at_us)?,
            source_cache: self.source_cache.map(MemoryCacheId),
            source_doc: self.source_doc,
            embedding: self.embedding.as_deref().map(embedding_from_bytes).transpose()?,
        })
    }
}

/// Stored form of a relation version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationRow {
    pub relation_id: u64,
    pub endpoint1: u64,
    pub endpoint2: u64,
    pub content: String,
    pub created_at_us: i64,
    pub source_cache: Option<String>,
    pub source_doc: String,
    pub embedding: Option<Vec<u8>>,
}

impl RelationRow {
    /// Build the stored form of a version.
    #[must_use]
    pub fn from_version(version: &RelationVersion) -> Self {
        Self {
            relation_id: version.relation_id.0,
            endpoint1: version.endpoint1.0,
            endpoint2: version.endpoint2.0,
            content: version.content.clone(),
            created_at_us: version.created_at.timestamp_micros(),
            source_cache: version.source_cache.as_ref().map(|c| c.0.clone()),
            source_doc: version.source_doc.clone(),
            embedding: version.embedding.as_deref().map(embedding_to_bytes),
        }
    }

    /// Rebuild the version stored under `absolute_id`.
    pub fn into_version(self, absolute_id: AbsoluteId) -> Result<RelationVersion, StrataError> {
        Ok(RelationVersion {
            absolute_id,
            relation_id: RelationId(self.relation_id),
            endpoint1: AbsoluteId(self.endpoint1),
            endpoint2: AbsoluteId(self.endpoint2),
            content: self.content,
            created_at: micros_to_time(self.created_at_us)?,
            source_cache: self.source_cache.map(MemoryCacheId),
            source_doc: self.source_doc,
            embedding: self.embedding.as_deref().map(embedding_from_bytes).transpose()?,
        })
    }
}

// =============================================================================
// CODEC
// =============================================================================

/// Encode a row with postcard.
pub fn encode_row<T: Serialize>(row: &T) -> Result<Vec<u8>, StrataError> {
    postcard::to_allocvec(row).map_err(|e| StrataError::Serialization(e.to_string()))
}

/// Decode a row, validating its size first.
pub fn decode_row<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StrataError> {
    if bytes.len() > MAX_ROW_SIZE {
        return Err(StrataError::Serialization(format!(
            "Row size {} bytes exceeds maximum allowed {} bytes",
            bytes.len(),
            MAX_ROW_SIZE
        )));
    }
    postcard::from_bytes(bytes)
        .map_err(|e| StrataError::Serialization(format!("Failed to decode row: {}", e)))
}

/// Convert stored microseconds back into a timestamp.
pub fn micros_to_time(micros: i64) -> Result<DateTime<Utc>, StrataError> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| {
        StrataError::Serialization(format!("Timestamp out of range: {} µs", micros))
    })
}

// =============================================================================
// TESTS
// =============================================================================
