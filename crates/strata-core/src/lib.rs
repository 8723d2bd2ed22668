//! # strata-core
//!
//! Versioned knowledge-graph storage and consolidation engine.
//!
//! Entities and undirected relations are recorded as immutable versions.
//! Every version has an absolute id; versions of the same thing share a
//! logical id, and the current version is the newest one. Merging entities
//! rewrites logical ids only, so history stays reachable.
//!
//! ## Components
//!
//! - [`store`]: the version store contract and an in-memory backend
//! - [`storage`]: the redb-backed store
//! - [`similarity`]: entity/relation search and batch candidate generation
//! - [`merge`]: entity merges, self-referential repair, the lexical guard
//! - [`path`]: bounded multi-hop path search
//! - [`consolidation`]: conflict-free concurrent deduplication passes
//! - [`capability`]: the embedder/classifier/synthesizer boundary
//!
//! ## Architectural Constraints
//!
//! - The engine never decides what is a duplicate; classifiers do
//! - No async: providers are called synchronously from worker threads
//! - Ordered collections (`BTreeMap`/`BTreeSet`) keep iteration deterministic

// =============================================================================
// MODULES
// =============================================================================

pub mod cache;
pub mod capability;
pub mod config;
pub mod consolidation;
pub mod formats;
pub mod merge;
pub mod path;
pub mod primitives;
pub mod session;
pub mod similarity;
pub mod stats;
pub mod storage;
pub mod store;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    AbsoluteId, EntityId, EntityVersion, MemoryCacheId, NewEntityVersion, NewRelationVersion,
    RelationId, RelationVersion, StrataError, canonical_endpoints, truncate_chars,
};

// =============================================================================
// RE-EXPORTS: Engine
// =============================================================================

pub use cache::{CacheSource, DirCacheSource, MemoryCache};
pub use capability::{
    Capabilities, CapabilityError, Classifier, ContentSynthesizer, DetailedVerdict, Embedder,
    LocalEmbedder, PreliminaryVerdict,
};
pub use config::EngineConfig;
pub use consolidation::{
    ConsolidationReport, ConsolidationUnit, Consolidator, PassControl, UnitFailure, UnitOutcome,
};
pub use merge::{GuardOutcome, KeywordSignal, MergeEngine, MergeReport, SameEntitySignal};
pub use path::{GraphPath, PathEdge, PathNode, PathQuery, PathSearch, PathSearchResult};
pub use session::{Provenance, Session, StorageBackend};
pub use similarity::{
    CandidateStrategy, SearchQuery, SimilarityHit, SimilarityIndex, SimilarityMethod, TextMode,
};
pub use stats::GraphMetrics;
pub use storage::RedbStore;
pub use store::{MemoryStore, MergeStats, StoreStats, VersionStore};
