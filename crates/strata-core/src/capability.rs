//! # Capability Interfaces
//!
//! The engine never judges meaning itself. Embedding, classification and
//! content synthesis are delegated to external providers through the narrow
//! traits defined here.
//!
//! Provider output is decoded once at this boundary into tagged unions
//! ([`PreliminaryVerdict`], [`DetailedVerdict`]). Malformed output gets one
//! repair attempt ([`decode`]) before it becomes terminal.

use crate::{EntityId, EntityVersion, RelationVersion};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;

// =============================================================================
// ERRORS
// =============================================================================

/// Failure of an external capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    /// No provider is configured for this capability.
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    /// The provider could not be reached or returned an error.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The provider answered, but the answer could not be decoded even after repair.
    #[error("unparseable provider output: {0}")]
    Unparseable(String),
}

// =============================================================================
// VERDICTS
// =============================================================================

/// Cheap first-pass judgement of an entity against one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreliminaryVerdict {
    PossibleMerge,
    PossibleRelation,
    NoAction,
}

impl PreliminaryVerdict {
    /// Whether the pair deserves a detailed look.
    #[must_use]
    pub fn is_flagged(self) -> bool {
        !matches!(self, Self::NoAction)
    }
}

/// Final judgement of an entity against one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DetailedVerdict {
    /// The two are the same entity; `target` keeps its identity.
    Merge { target: EntityId },
    /// The two are related; `content` describes the relation.
    CreateRelation { content: String },
    NoAction,
}

/// Wire shape of a preliminary classification answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreliminaryAnswer {
    pub results: Vec<PreliminaryItem>,
}

/// One candidate in a [`PreliminaryAnswer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreliminaryItem {
    pub entity_id: EntityId,
    pub verdict: PreliminaryVerdict,
}

impl From<PreliminaryAnswer> for Vec<(EntityId, PreliminaryVerdict)> {
    fn from(answer: PreliminaryAnswer) -> Self {
        answer
            .results
            .into_iter()
            .map(|item| (item.entity_id, item.verdict))
            .collect()
    }
}

// =============================================================================
// TRAITS
// =============================================================================

/// Produces embedding vectors for text.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError>;
}

/// Judges whether entities are duplicates or related.
pub trait Classifier: Send + Sync {
    /// Screen `candidates` against `entity`, usually on truncated content.
    fn classify_preliminary(
        &self,
        entity: &EntityVersion,
        candidates: &[EntityVersion],
    ) -> Result<Vec<(EntityId, PreliminaryVerdict)>, CapabilityError>;

    /// Decide on one pair, given the relations that already connect it.
    fn classify_detailed(
        &self,
        entity: &EntityVersion,
        candidate: &EntityVersion,
        existing_relations: &[RelationVersion],
    ) -> Result<DetailedVerdict, CapabilityError>;
}

/// Folds description fragments into one piece of content.
pub trait ContentSynthesizer: Send + Sync {
    fn synthesize(&self, old: &str, fragments: &[String]) -> Result<String, CapabilityError>;
}

/// The set of providers available to the engine.
#[derive(Clone, Default)]
pub struct Capabilities {
    pub embedder: Option<Arc<dyn Embedder>>,
    pub classifier: Option<Arc<dyn Classifier>>,
    pub synthesizer: Option<Arc<dyn ContentSynthesizer>>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("embedder", &self.embedder.is_some())
            .field("classifier", &self.classifier.is_some())
            .field("synthesizer", &self.synthesizer.is_some())
            .finish()
    }
}

impl Capabilities {
    /// No providers at all.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    #[must_use]
    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn ContentSynthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    #[must_use]
    pub fn embedder(&self) -> Option<&dyn Embedder> {
        self.embedder.as_deref()
    }

    pub fn classifier(&self) -> Result<&dyn Classifier, CapabilityError> {
        self.classifier
            .as_deref()
            .ok_or(CapabilityError::NotConfigured("classifier"))
    }

    pub fn synthesizer(&self) -> Result<&dyn ContentSynthesizer, CapabilityError> {
        self.synthesizer
            .as_deref()
            .ok_or(CapabilityError::NotConfigured("synthesizer"))
    }

    /// Embed `text` if an embedder is configured.
    ///
    /// Failure is non-fatal: it is logged and yields `None`.
    pub fn try_embed(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_deref()?;
        match embedder.embed(text) {
            Ok(vector) => Some(vector),
            Err(e) => {
                tracing::warn!(error = %e, "embedding failed, storing without vector");
                None
            }
        }
    }
}

// =============================================================================
// LOCAL EMBEDDER
// =============================================================================

/// Deterministic offline embedder.
///
/// Hashes lowercase character unigrams and bigrams into a fixed number of
/// buckets. It captures surface overlap only, which is enough to drive the
/// embedding code paths without a remote provider.
#[derive(Debug, Clone, Copy)]
pub struct LocalEmbedder {
    dimensions: usize,
}

impl LocalEmbedder {
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn bucket(&self, gram: &[char]) -> usize {
        let mut hasher = DefaultHasher::new();
        gram.hash(&mut hasher);
        (hasher.finish() % self.dimensions as u64) as usize
    }
}

impl Default for LocalEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Embedder for LocalEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        let chars: Vec<char> = text.to_lowercase().chars().filter(|c| !c.is_whitespace()).collect();
        let mut vector = vec![0.0_f32; self.dimensions];
        for c in &chars {
            vector[self.bucket(std::slice::from_ref(c))] += 1.0;
        }
        for pair in chars.windows(2) {
            vector[self.bucket(pair)] += 1.0;
        }
        Ok(vector)
    }
}

// =============================================================================
// BOUNDARY DECODING
// =============================================================================

/// First-pass decoding failed; the raw text may still be repairable.
#[derive(Debug)]
struct NeedsRepair(String);

fn parse_strict<T: DeserializeOwned>(raw: &str) -> Result<T, NeedsRepair> {
    serde_json::from_str(raw.trim()).map_err(|e| NeedsRepair(e.to_string()))
}

/// Decode provider output into `T`.
///
/// Strict JSON is tried first. On failure exactly one repair is attempted
/// (strip code fences, cut to the outermost JSON value, drop trailing commas);
/// if that still fails the result is `CapabilityError::Unparseable`.
pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, CapabilityError> {
    match parse_strict(raw) {
        Ok(value) => Ok(value),
        Err(NeedsRepair(first)) => {
            tracing::debug!(error = %first, "provider output needs repair");
            parse_strict(&repair(raw))
                .map_err(|NeedsRepair(second)| CapabilityError::Unparseable(second))
        }
    }
}

/// The single repair pass applied by [`decode`].
#[must_use]
pub fn repair(raw: &str) -> String {
    drop_trailing_commas(outermost_value(strip_fences(raw)))
}

fn strip_fences(raw: &str) -> &str {
    let Some(open) = raw.find("```") else {
        return raw;
    };
    let after_open = &raw[open + 3..];
    // Skip the language tag on the fence line.
    let body_start = after_open.find('\n').map_or(0, |i| i + 1);
    let body = &after_open[body_start..];
    match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    }
}

fn outermost_value(text: &str) -> &str {
    let start = text.find(['{', '[']);
    let end = text.rfind(['}', ']']);
    match (start, end) {
        (Some(s), Some(e)) if e > s => &text[s..=e],
        _ => text,
    }
}

fn drop_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            continue;
        }
        if c == ',' {
            let next = chars[i + 1..].iter().find(|n| !n.is_whitespace());
            if matches!(next, Some('}' | ']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

// =============================================================================
// TESTS
// =============================================================================
