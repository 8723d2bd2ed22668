//! # Engine Primitives
//!
//! Hardcoded runtime constants for the Strata engine.
//!
//! Tunable defaults live in [`crate::config::EngineConfig`]; the values here
//! are either hard caps that configuration may not exceed or fixed
//! presentation limits.

// =============================================================================
// FORMAT
// =============================================================================

/// Current on-disk format version.
///
/// Stored in the `metadata` table of a redb database and checked on open.
/// Increment this when making breaking changes to the row layout.
pub const FORMAT_VERSION: u64 = 1;

// =============================================================================
// PATH SEARCH
// =============================================================================

/// Hard upper bound on hops for path search.
///
/// Requests above this are rejected rather than clamped.
pub const MAX_HOPS: usize = 5;

/// Default hop bound when the caller does not specify one.
pub const DEFAULT_MAX_HOPS: usize = 3;

/// Default number of paths returned by a single search.
pub const DEFAULT_MAX_PATHS: usize = 5;

/// Node content is truncated to this many characters in path records.
pub const PATH_NODE_CONTENT_LIMIT: usize = 200;

/// Edge content is truncated to this many characters in path records.
pub const PATH_EDGE_CONTENT_LIMIT: usize = 300;

/// Edge content is truncated to this many characters in path descriptions.
pub const PATH_DESCRIPTION_EDGE_LIMIT: usize = 50;

// =============================================================================
// SIMILARITY
// =============================================================================

/// Default similarity threshold for ad-hoc searches.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.7;

/// Default similarity threshold for consolidation candidate generation.
pub const DEFAULT_CANDIDATE_THRESHOLD: f32 = 0.6;

/// Default number of candidates kept per entity.
pub const DEFAULT_MAX_CANDIDATES: usize = 5;

/// Default content prefix length used when composing comparison text.
pub const DEFAULT_SNIPPET_LENGTH: usize = 50;

/// Guard against division by zero when normalizing vectors.
pub const NORM_EPSILON: f32 = 1e-9;

// =============================================================================
// CONSOLIDATION
// =============================================================================

/// Default worker pool size.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Default content truncation for the preliminary classifier.
pub const DEFAULT_PRELIMINARY_SNIPPET: usize = 64;

// =============================================================================
// MERGE
// =============================================================================

/// Default relation phrases that indicate two entities are the same thing.
///
/// Matched case-insensitively as substrings of relation content. Single-word
/// copulas are deliberately absent: they appear in most relation sentences.
pub const DEFAULT_SAME_ENTITY_KEYWORDS: &[&str] = &[
    "同一实体",
    "同一个",
    "同一人",
    "同一物",
    "同一对象",
    "别名",
    "别称",
    "又称",
    "也叫",
    "亦称",
    "就是",
    "即是",
    "等同于",
    "指的是",
    "简称",
    "全称",
    "昵称",
    "绰号",
    "外号",
    "本名",
    "原名",
    "真名",
    "实名",
    "alias",
    "also known as",
    "a.k.a",
    "aka ",
    "nickname",
    "same entity",
    "same person",
];

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum length (in bytes) of an entity name.
pub const MAX_NAME_LENGTH: usize = 1024;

/// Maximum length (in bytes) of entity or relation content.
pub const MAX_CONTENT_LENGTH: usize = 1 << 20;

/// Maximum number of sources in a single merge request.
pub const MAX_MERGE_SOURCES: usize = 1000;
