//! # Memory Cache Source
//!
//! Read-only access to the memory-cache blobs that entity and relation
//! versions cite as provenance. The engine never writes caches.

use crate::{MemoryCacheId, StrataError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A timestamped text blob produced by the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryCache {
    pub id: MemoryCacheId,
    pub content: String,
    pub physical_time: DateTime<Utc>,
    pub doc_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_type: Option<String>,
    /// The original source text the cache was distilled from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Lookup of memory caches by id.
pub trait CacheSource: Send + Sync {
    /// `Ok(None)` if no such cache exists.
    fn load(&self, id: &MemoryCacheId) -> Result<Option<MemoryCache>, StrataError>;
}

/// Caches stored as `<dir>/<id>.json`.
#[derive(Debug, Clone)]
pub struct DirCacheSource {
    dir: PathBuf,
}

impl DirCacheSource {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, id: &MemoryCacheId) -> Result<PathBuf, StrataError> {
        let raw = id.as_str();
        // Ids are file stems, never paths.
        if raw.is_empty() || raw.contains(['/', '\\']) || raw.starts_with('.') {
            return Err(StrataError::MalformedInput(format!(
                "invalid memory cache id: {:?}",
                raw
            )));
        }
        Ok(self.dir.join(format!("{}.json", raw)))
    }
}

impl CacheSource for DirCacheSource {
    fn load(&self, id: &MemoryCacheId) -> Result<Option<MemoryCache>, StrataError> {
        let path = self.path_of(id)?;
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StrataError::Storage(format!("{}: {}", path.display(), e))),
        };
        let cache: MemoryCache = serde_json::from_str(&raw)
            .map_err(|e| StrataError::Serialization(format!("{}: {}", path.display(), e)))?;
        if &cache.id != id {
            return Err(StrataError::ConsistencyViolation(format!(
                "cache file {} holds id {}",
                path.display(),
                cache.id.as_str()
            )));
        }
        Ok(Some(cache))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), body).expect("write cache");
    }

    #[test]
    fn loads_cache_file() {
        let dir = tempdir().expect("temp dir");
        write(
            dir.path(),
            "c1.json",
            r#"{"id":"c1","content":"Alice met Bob","physical_time":"2024-01-01T00:00:00Z","doc_name":"notes.md"}"#,
        );
        let source = DirCacheSource::new(dir.path());
        let cache = source
            .load(&MemoryCacheId::new("c1"))
            .expect("load")
            .expect("present");
        assert_eq!(cache.doc_name, "notes.md");
        assert_eq!(cache.activity_type, None);
    }

    #[test]
    fn missing_cache_is_none() {
        let dir = tempdir().expect("temp dir");
        let source = DirCacheSource::new(dir.path());
        assert_eq!(source.load(&MemoryCacheId::new("nope")).expect("load"), None);
    }

    #[test]
    fn path_like_ids_rejected() {
        let dir = tempdir().expect("temp dir");
        let source = DirCacheSource::new(dir.path());
        for bad in ["../etc", "a/b", ""] {
            assert!(matches!(
                source.load(&MemoryCacheId::new(bad)),
                Err(StrataError::MalformedInput(_))
            ));
        }
    }

    #[test]
    fn mismatched_id_rejected() {
        let dir = tempdir().expect("temp dir");
        write(
            dir.path(),
            "c1.json",
            r#"{"id":"c2","content":"","physical_time":"2024-01-01T00:00:00Z","doc_name":"d"}"#,
        );
        let source = DirCacheSource::new(dir.path());
        assert!(matches!(
            source.load(&MemoryCacheId::new("c1")),
            Err(StrataError::ConsistencyViolation(_))
        ));
    }

    #[test]
    fn garbage_is_serialization_error() {
        let dir = tempdir().expect("temp dir");
        write(dir.path(), "c1.json", "not json");
        let source = DirCacheSource::new(dir.path());
        assert!(matches!(
            source.load(&MemoryCacheId::new("c1")),
            Err(StrataError::Serialization(_))
        ));
    }
}
