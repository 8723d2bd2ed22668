//! # Engine Configuration
//!
//! Tunable parameters of the engine, grouped by component. Every section is
//! `#[serde(default)]`, so a configuration file only needs to name what it
//! changes. File loading lives in the binary; the core only validates.

use crate::StrataError;
use crate::primitives::{
    DEFAULT_CANDIDATE_THRESHOLD, DEFAULT_MAX_CANDIDATES, DEFAULT_MAX_HOPS, DEFAULT_MAX_PATHS,
    DEFAULT_POOL_SIZE, DEFAULT_PRELIMINARY_SNIPPET, DEFAULT_SAME_ENTITY_KEYWORDS,
    DEFAULT_SIMILARITY_THRESHOLD, DEFAULT_SNIPPET_LENGTH, MAX_HOPS,
};
use crate::similarity::{CandidateConfig, CandidateStrategy};
use serde::{Deserialize, Serialize};

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub similarity: SimilarityConfig,
    pub merge: MergeConfig,
    pub consolidation: ConsolidationConfig,
    pub path: PathConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    /// Threshold for ad-hoc searches.
    pub threshold: f32,
    /// Threshold for consolidation candidate generation.
    pub candidate_threshold: f32,
    /// Content prefix length used when composing comparison text.
    pub snippet_length: usize,
    /// Candidates kept per entity.
    pub max_candidates: usize,
    pub strategy: CandidateStrategy,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
            candidate_threshold: DEFAULT_CANDIDATE_THRESHOLD,
            snippet_length: DEFAULT_SNIPPET_LENGTH,
            max_candidates: DEFAULT_MAX_CANDIDATES,
            strategy: CandidateStrategy::default(),
        }
    }
}

impl SimilarityConfig {
    /// Parameters for batch candidate generation.
    #[must_use]
    pub fn candidate_config(&self) -> CandidateConfig {
        CandidateConfig {
            threshold: self.candidate_threshold,
            max_candidates: self.max_candidates,
            snippet_length: self.snippet_length,
            strategy: self.strategy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Relation phrases that mark two entities as the same thing.
    pub same_entity_keywords: Vec<String>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            same_entity_keywords: DEFAULT_SAME_ENTITY_KEYWORDS
                .iter()
                .map(|k| (*k).to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Number of worker threads.
    pub pool_size: usize,
    /// Content truncation applied before the preliminary classifier.
    pub preliminary_snippet: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            preliminary_snippet: DEFAULT_PRELIMINARY_SNIPPET,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    pub max_hops: usize,
    pub max_paths: usize,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
            max_paths: DEFAULT_MAX_PATHS,
        }
    }
}

impl EngineConfig {
    /// Check every value is usable.
    pub fn validate(&self) -> Result<(), StrataError> {
        for (name, value) in [
            ("similarity.threshold", self.similarity.threshold),
            (
                "similarity.candidate_threshold",
                self.similarity.candidate_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(StrataError::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.similarity.max_candidates == 0 {
            return Err(StrataError::Config(
                "similarity.max_candidates must be at least 1".to_string(),
            ));
        }
        if self.consolidation.pool_size == 0 {
            return Err(StrataError::Config(
                "consolidation.pool_size must be at least 1".to_string(),
            ));
        }
        if self.path.max_hops == 0 || self.path.max_hops > MAX_HOPS {
            return Err(StrataError::Config(format!(
                "path.max_hops must be within 1..={}",
                MAX_HOPS
            )));
        }
        if self.path.max_paths == 0 {
            return Err(StrataError::Config(
                "path.max_paths must be at least 1".to_string(),
            ));
        }
        if self
            .merge
            .same_entity_keywords
            .iter()
            .any(|k| k.trim().is_empty())
        {
            return Err(StrataError::Config(
                "merge.same_entity_keywords must not contain blank entries".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().expect("valid");
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"consolidation": {"pool_size": 8}}"#).expect("parse");
        assert_eq!(config.consolidation.pool_size, 8);
        assert_eq!(
            config.consolidation.preliminary_snippet,
            DEFAULT_PRELIMINARY_SNIPPET
        );
        assert_eq!(config.path, PathConfig::default());
    }

    #[test]
    fn hop_cap_enforced() {
        let mut config = EngineConfig::default();
        config.path.max_hops = MAX_HOPS + 1;
        assert!(matches!(config.validate(), Err(StrataError::Config(_))));
    }

    #[test]
    fn threshold_range_enforced() {
        let mut config = EngineConfig::default();
        config.similarity.threshold = 1.5;
        assert!(matches!(config.validate(), Err(StrataError::Config(_))));
    }
}
