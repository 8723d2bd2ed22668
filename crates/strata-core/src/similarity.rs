//! # Similarity Index
//!
//! Finds entities (and relations) that look like a query, using embedding
//! cosine similarity when an embedder is available and character-level text
//! similarity otherwise.
//!
//! Two entry points:
//! - [`SimilarityIndex::search`]: one query against all current entities
//! - [`SimilarityIndex::related_candidates`]: the batch candidate map that
//!   feeds a consolidation pass
//!
//! Results are ranked by score, ties broken by the most recent version.

use crate::capability::Embedder;
use crate::primitives::{DEFAULT_SNIPPET_LENGTH, NORM_EPSILON};
use crate::store::VersionStore;
use crate::{
    AbsoluteId, EntityId, EntityVersion, RelationId, RelationVersion, StrataError, truncate_chars,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// QUERY TYPES
// =============================================================================

/// Which parts of an entity are compared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextMode {
    NameOnly,
    ContentOnly,
    #[default]
    NameAndContent,
}

/// How two texts are scored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMethod {
    #[default]
    Embedding,
    /// Ratcliff/Obershelp matching ratio.
    SequenceRatio,
    /// Character-set Jaccard index.
    Jaccard,
    /// Geometric mean of character 1-gram and 2-gram precision.
    NgramPrecision,
}

/// Candidate generation strategy for consolidation passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStrategy {
    /// Embedding cosine only, computed as one matrix product.
    Vectorized,
    /// Embedding leg + name sequence ratio + Jaccard top-up + exact names.
    #[default]
    Hybrid,
}

/// A single similarity search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub name: String,
    pub content: Option<String>,
    pub mode: TextMode,
    pub snippet_length: usize,
    pub method: SimilarityMethod,
    pub threshold: f32,
    pub max_results: usize,
    /// Logical ids never returned.
    pub exclude: BTreeSet<EntityId>,
}

impl SearchQuery {
    /// Query by name with default parameters.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: None,
            mode: TextMode::NameAndContent,
            snippet_length: DEFAULT_SNIPPET_LENGTH,
            method: SimilarityMethod::Embedding,
            threshold: crate::primitives::DEFAULT_SIMILARITY_THRESHOLD,
            max_results: crate::primitives::DEFAULT_MAX_CANDIDATES,
            exclude: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: TextMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn method(mut self, method: SimilarityMethod) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    #[must_use]
    pub fn max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    #[must_use]
    pub fn excluding(mut self, entity: EntityId) -> Self {
        self.exclude.insert(entity);
        self
    }
}

/// Parameters for [`SimilarityIndex::related_candidates`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateConfig {
    pub threshold: f32,
    pub max_candidates: usize,
    pub snippet_length: usize,
    pub strategy: CandidateStrategy,
}

/// A scored entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarityHit {
    pub entity: EntityVersion,
    pub score: f32,
}

/// A scored relation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationHit {
    pub relation: RelationVersion,
    pub score: f32,
}

// =============================================================================
// TEXT SIMILARITY
// =============================================================================

/// Compose the comparison text for an entity.
///
/// Returns `None` when the mode needs content and there is none.
#[must_use]
pub fn compose_text(
    name: &str,
    content: Option<&str>,
    mode: TextMode,
    snippet_length: usize,
) -> Option<String> {
    let prefix = content
        .filter(|c| !c.trim().is_empty())
        .map(|c| truncate_chars(c, snippet_length));
    match (mode, prefix) {
        (TextMode::NameOnly, _) => Some(name.to_string()),
        (TextMode::ContentOnly, Some(prefix)) => Some(prefix.to_string()),
        (TextMode::ContentOnly, None) => None,
        (TextMode::NameAndContent, Some(prefix)) => Some(format!("{} {}", name, prefix)),
        (TextMode::NameAndContent, None) => Some(name.to_string()),
    }
}

/// Text embedded for a stored entity version: name plus content prefix.
#[must_use]
pub fn entity_embedding_text(name: &str, content: &str) -> String {
    compose_text(
        name,
        Some(content),
        TextMode::NameAndContent,
        DEFAULT_SNIPPET_LENGTH,
    )
    .unwrap_or_else(|| name.to_string())
}

fn lower_chars(text: &str) -> Vec<char> {
    text.to_lowercase().chars().collect()
}

/// Character-set Jaccard index over lowercase characters.
#[must_use]
pub fn jaccard(a: &str, b: &str) -> f32 {
    let a: BTreeSet<char> = lower_chars(a).into_iter().collect();
    let b: BTreeSet<char> = lower_chars(b).into_iter().collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f32 / union as f32
}

/// Geometric mean of character 1-gram and 2-gram set precision of `a`
/// against `b`.
#[must_use]
pub fn ngram_precision(a: &str, b: &str) -> f32 {
    let a = lower_chars(a);
    let b = lower_chars(b);
    let precision = |n: usize| -> f64 {
        let grams_a: BTreeSet<&[char]> = a.windows(n).collect();
        if grams_a.is_empty() {
            return 0.0;
        }
        let grams_b: BTreeSet<&[char]> = b.windows(n).collect();
        grams_a.intersection(&grams_b).count() as f64 / grams_a.len() as f64
    };
    (precision(1) * precision(2)).sqrt() as f32
}

/// Ratcliff/Obershelp ratio `2·M / (|a| + |b|)` over lowercase characters.
#[must_use]
pub fn sequence_ratio(a: &str, b: &str) -> f32 {
    let a = lower_chars(a);
    let b = lower_chars(b);
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    (2.0 * matching_characters(&a, &b) as f64 / total as f64) as f32
}

/// Total size of the recursively found longest common blocks.
fn matching_characters(a: &[char], b: &[char]) -> usize {
    let mut matched = 0;
    let mut pending = vec![(0, a.len(), 0, b.len())];
    while let Some((alo, ahi, blo, bhi)) = pending.pop() {
        let (i, j, k) = longest_match(a, b, alo, ahi, blo, bhi);
        if k == 0 {
            continue;
        }
        matched += k;
        if alo < i && blo < j {
            pending.push((alo, i, blo, j));
        }
        if i + k < ahi && j + k < bhi {
            pending.push((i + k, ahi, j + k, bhi));
        }
    }
    matched
}

/// Longest common block in `a[alo..ahi]` / `b[blo..bhi]`, earliest on ties.
fn longest_match(
    a: &[char],
    b: &[char],
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let (mut best_i, mut best_j, mut best_k) = (alo, blo, 0);
    let width = bhi - blo;
    let mut previous = vec![0usize; width + 1];
    let mut current = vec![0usize; width + 1];
    for i in alo..ahi {
        for j in blo..bhi {
            let col = j - blo;
            current[col + 1] = if a[i] == b[j] { previous[col] + 1 } else { 0 };
            let k = current[col + 1];
            if k > best_k {
                best_i = i + 1 - k;
                best_j = j + 1 - k;
                best_k = k;
            }
        }
        std::mem::swap(&mut previous, &mut current);
    }
    (best_i, best_j, best_k)
}

/// Score two texts with a text method.
///
/// `SimilarityMethod::Embedding` is scored as `SequenceRatio` here; embedding
/// scores are computed by the index.
#[must_use]
pub fn text_score(method: SimilarityMethod, a: &str, b: &str) -> f32 {
    match method {
        SimilarityMethod::Jaccard => jaccard(a, b),
        SimilarityMethod::NgramPrecision => ngram_precision(a, b),
        SimilarityMethod::SequenceRatio | SimilarityMethod::Embedding => sequence_ratio(a, b),
    }
}

// =============================================================================
// VECTOR SIMILARITY
// =============================================================================

fn normalized(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    vector.iter().map(|x| x / (norm + NORM_EPSILON)).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Cosine similarity of two vectors of equal length.
#[must_use]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    dot(&normalized(a), &normalized(b))
}

/// Row-major matrix of L2-normalized rows.
struct Matrix {
    rows: usize,
    dims: usize,
    data: Vec<f32>,
}

impl Matrix {
    fn from_rows(vectors: &[&[f32]], dims: usize) -> Self {
        let mut data = Vec::with_capacity(vectors.len() * dims);
        for vector in vectors {
            data.extend(normalized(vector));
        }
        Self {
            rows: vectors.len(),
            dims,
            data,
        }
    }

    fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dims..(i + 1) * self.dims]
    }

    /// `M · Mᵀ`, row-major `rows × rows`.
    fn gram(&self) -> Vec<f32> {
        let mut scores = vec![0.0_f32; self.rows * self.rows];
        for i in 0..self.rows {
            for j in i..self.rows {
                let score = dot(self.row(i), self.row(j));
                scores[i * self.rows + j] = score;
                scores[j * self.rows + i] = score;
            }
        }
        scores
    }
}

// =============================================================================
// RANKING
// =============================================================================

fn rank<T>(
    mut scored: Vec<(T, f32)>,
    threshold: f32,
    max_results: usize,
    recency: impl Fn(&T) -> (DateTime<Utc>, AbsoluteId),
    identity: impl Fn(&T) -> u64,
) -> Vec<(T, f32)> {
    scored.retain(|(_, score)| *score >= threshold);
    scored.sort_by(|(x, sx), (y, sy)| sy.total_cmp(sx).then_with(|| recency(y).cmp(&recency(x))));
    let mut seen = BTreeSet::new();
    scored.retain(|(item, _)| seen.insert(identity(item)));
    scored.truncate(max_results);
    scored
}

// =============================================================================
// SIMILARITY INDEX
// =============================================================================

/// Similarity queries over the current state of a store.
pub struct SimilarityIndex<'a> {
    store: &'a dyn VersionStore,
    embedder: Option<&'a dyn Embedder>,
}

impl<'a> SimilarityIndex<'a> {
    #[must_use]
    pub fn new(store: &'a dyn VersionStore, embedder: Option<&'a dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    /// Current entities most similar to the query.
    pub fn search(&self, query: &SearchQuery) -> Result<Vec<SimilarityHit>, StrataError> {
        let Some(query_text) = compose_text(
            &query.name,
            query.content.as_deref(),
            query.mode,
            query.snippet_length,
        ) else {
            return Ok(Vec::new());
        };

        let candidates: Vec<EntityVersion> = self
            .store
            .current_entities()?
            .into_iter()
            .filter(|e| !query.exclude.contains(&e.entity_id))
            .collect();
        let compose = |e: &EntityVersion| {
            compose_text(&e.name, Some(&e.content), query.mode, query.snippet_length)
        };

        let embedded = match query.method {
            SimilarityMethod::Embedding => self.embedding_scores(&query_text, &candidates, &compose),
            _ => None,
        };
        let scored: Vec<(EntityVersion, f32)> = match embedded {
            Some(scores) => candidates.into_iter().zip(scores).collect(),
            None => {
                let method = match query.method {
                    SimilarityMethod::Embedding => SimilarityMethod::SequenceRatio,
                    other => other,
                };
                candidates
                    .into_iter()
                    .filter_map(|e| {
                        let text = compose(&e)?;
                        let score = text_score(method, &query_text, &text);
                        Some((e, score))
                    })
                    .collect()
            }
        };

        Ok(rank(
            scored,
            query.threshold,
            query.max_results,
            EntityVersion::version_key,
            |e| e.entity_id.0,
        )
        .into_iter()
        .map(|(entity, score)| SimilarityHit { entity, score })
        .collect())
    }

    /// Cosine scores of every candidate against the query, or `None` when the
    /// embedding path is unusable and text similarity should be used instead.
    fn embedding_scores(
        &self,
        query_text: &str,
        candidates: &[EntityVersion],
        compose: &dyn Fn(&EntityVersion) -> Option<String>,
    ) -> Option<Vec<f32>> {
        let embedder = self.embedder?;
        let query_vector = match embedder.embed(query_text) {
            Ok(v) if !v.is_empty() => v,
            Ok(_) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed, falling back to text similarity");
                return None;
            }
        };
        let dims = query_vector.len();
        let mut any = false;
        let scores: Vec<f32> = candidates
            .iter()
            .map(|candidate| {
                let stored = candidate.embedding.as_ref().filter(|v| v.len() == dims).cloned();
                let vector = stored.or_else(|| {
                    let text = compose(candidate)?;
                    embedder.embed(&text).ok().filter(|v| v.len() == dims)
                });
                match vector {
                    Some(v) => {
                        any = true;
                        cosine(&query_vector, &v)
                    }
                    None => f32::NEG_INFINITY,
                }
            })
            .collect();
        if !any {
            tracing::debug!("no candidate vectors available, falling back to text similarity");
            return None;
        }
        Some(scores)
    }

    /// Current relations whose content prefix is most similar to `text`.
    pub fn search_relations(
        &self,
        text: &str,
        method: SimilarityMethod,
        threshold: f32,
        max_results: usize,
    ) -> Result<Vec<RelationHit>, StrataError> {
        let relations = self.store.all_current_relations()?;
        let prefix = |r: &RelationVersion| truncate_chars(&r.content, DEFAULT_SNIPPET_LENGTH).to_string();

        let mut scored: Option<Vec<(RelationVersion, f32)>> = None;
        if method == SimilarityMethod::Embedding {
            if let Some(embedder) = self.embedder {
                match embedder.embed(text) {
                    Ok(query_vector) if !query_vector.is_empty() => {
                        let dims = query_vector.len();
                        scored = Some(
                            relations
                                .iter()
                                .filter_map(|r| {
                                    let vector = r
                                        .embedding
                                        .clone()
                                        .filter(|v| v.len() == dims)
                                        .or_else(|| {
                                            embedder.embed(&prefix(r)).ok().filter(|v| v.len() == dims)
                                        })?;
                                    Some((r.clone(), cosine(&query_vector, &vector)))
                                })
                                .collect(),
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "relation query embedding failed, falling back to text similarity");
                    }
                }
            }
        }
        let scored = scored.unwrap_or_else(|| {
            relations
                .iter()
                .map(|r| (r.clone(), text_score(method, text, &prefix(r))))
                .collect()
        });

        Ok(rank(
            scored,
            threshold,
            max_results,
            RelationVersion::version_key,
            |r| r.relation_id.0,
        )
        .into_iter()
        .map(|(relation, score)| RelationHit { relation, score })
        .collect())
    }

    /// Vectors of the given entities: stored when present and of the common
    /// dimension, otherwise embedded on the fly.
    fn entity_vectors(&self, entities: &[EntityVersion], snippet_length: usize) -> Vec<Option<Vec<f32>>> {
        let mut dims: Option<usize> = None;
        entities
            .iter()
            .map(|entity| {
                let stored = entity
                    .embedding
                    .clone()
                    .filter(|v| !v.is_empty() && dims.is_none_or(|d| v.len() == d));
                let vector = stored.or_else(|| {
                    let embedder = self.embedder?;
                    let text = compose_text(
                        &entity.name,
                        Some(&entity.content),
                        TextMode::NameAndContent,
                        snippet_length,
                    )?;
                    embedder
                        .embed(&text)
                        .ok()
                        .filter(|v| !v.is_empty() && dims.is_none_or(|d| v.len() == d))
                });
                if let Some(v) = &vector {
                    dims.get_or_insert(v.len());
                }
                vector
            })
            .collect()
    }

    /// Top-`budget` embedding neighbours of every entity, via one matrix product.
    fn vector_leg(
        &self,
        entities: &[EntityVersion],
        threshold: f32,
        budget: usize,
        snippet_length: usize,
    ) -> Option<BTreeMap<usize, Vec<usize>>> {
        let vectors = self.entity_vectors(entities, snippet_length);
        let present: Vec<(usize, &[f32])> = vectors
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_deref().map(|v| (i, v)))
            .collect();
        if present.len() < 2 {
            return None;
        }
        let dims = present[0].1.len();
        let rows: Vec<&[f32]> = present.iter().map(|(_, v)| *v).collect();
        let matrix = Matrix::from_rows(&rows, dims);
        let scores = matrix.gram();

        let mut leg = BTreeMap::new();
        for (row, &(i, _)) in present.iter().enumerate() {
            let scored: Vec<(usize, f32)> = present
                .iter()
                .enumerate()
                .filter(|(col, _)| *col != row)
                .map(|(col, &(j, _))| (j, scores[row * matrix.rows + col]))
                .collect();
            let picked = rank(
                scored,
                threshold,
                budget,
                |j| entities[*j].version_key(),
                |j| *j as u64,
            );
            leg.insert(i, picked.into_iter().map(|(j, _)| j).collect());
        }
        Some(leg)
    }

    /// Top-`budget` text neighbours of every entity, comparing names only.
    fn text_leg(
        entities: &[EntityVersion],
        method: SimilarityMethod,
        threshold: f32,
        budget: usize,
    ) -> BTreeMap<usize, Vec<usize>> {
        let mut leg = BTreeMap::new();
        for (i, entity) in entities.iter().enumerate() {
            let scored: Vec<(usize, f32)> = entities
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(j, other)| (j, text_score(method, &entity.name, &other.name)))
                .collect();
            let picked = rank(
                scored,
                threshold,
                budget,
                |j| entities[*j].version_key(),
                |j| *j as u64,
            );
            leg.insert(i, picked.into_iter().map(|(j, _)| j).collect());
        }
        leg
    }

    /// Candidate map for a consolidation pass.
    ///
    /// Every current entity with at least one candidate appears as a key. An
    /// entity is never its own candidate. Exact name matches are always
    /// included; the similarity legs fill the remaining budget.
    pub fn related_candidates(
        &self,
        config: &CandidateConfig,
    ) -> Result<BTreeMap<EntityId, BTreeSet<EntityId>>, StrataError> {
        let entities = self.store.current_entities()?;
        let mut picked: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); entities.len()];
        let budget = config.max_candidates;

        match config.strategy {
            CandidateStrategy::Vectorized => {
                match self.vector_leg(&entities, config.threshold, budget, config.snippet_length) {
                    Some(leg) => merge_leg(&mut picked, leg, budget),
                    None => {
                        tracing::warn!("no embeddings available, using name sequence ratio");
                        let leg = Self::text_leg(
                            &entities,
                            SimilarityMethod::SequenceRatio,
                            config.threshold,
                            budget,
                        );
                        merge_leg(&mut picked, leg, budget);
                    }
                }
            }
            CandidateStrategy::Hybrid => {
                let half = budget.div_ceil(2);
                if let Some(leg) =
                    self.vector_leg(&entities, config.threshold, half, config.snippet_length)
                {
                    merge_leg(&mut picked, leg, budget);
                }
                let ratio = Self::text_leg(
                    &entities,
                    SimilarityMethod::SequenceRatio,
                    config.threshold,
                    half,
                );
                merge_leg(&mut picked, ratio, budget);
                let jaccard = Self::text_leg(
                    &entities,
                    SimilarityMethod::Jaccard,
                    config.threshold,
                    budget,
                );
                merge_leg(&mut picked, jaccard, budget);
                add_exact_names(&entities, &mut picked);
            }
        }

        let mut result = BTreeMap::new();
        for (i, set) in picked.into_iter().enumerate() {
            let candidates: BTreeSet<EntityId> = set
                .into_iter()
                .map(|j| entities[j].entity_id)
                .filter(|id| *id != entities[i].entity_id)
                .collect();
            if !candidates.is_empty() {
                result.insert(entities[i].entity_id, candidates);
            }
        }
        tracing::debug!(
            entities = entities.len(),
            with_candidates = result.len(),
            "computed related candidates"
        );
        Ok(result)
    }

    /// Groups of current entities whose embedding cosine is at least
    /// `threshold`, joined transitively. Only groups of two or more.
    pub fn group_by_similarity(&self, threshold: f32) -> Result<Vec<Vec<EntityVersion>>, StrataError> {
        let entities = self.store.current_entities()?;
        let vectors = self.entity_vectors(&entities, DEFAULT_SNIPPET_LENGTH);
        let present: Vec<(usize, &[f32])> = vectors
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_deref().map(|v| (i, v)))
            .collect();
        if present.len() < 2 {
            return Ok(Vec::new());
        }
        let rows: Vec<&[f32]> = present.iter().map(|(_, v)| *v).collect();
        let matrix = Matrix::from_rows(&rows, present[0].1.len());
        let scores = matrix.gram();

        let mut sets = UnionFind::new(present.len());
        for a in 0..present.len() {
            for b in a + 1..present.len() {
                if scores[a * matrix.rows + b] >= threshold {
                    sets.union(a, b);
                }
            }
        }

        let mut groups: BTreeMap<usize, Vec<EntityVersion>> = BTreeMap::new();
        for (slot, &(i, _)) in present.iter().enumerate() {
            groups
                .entry(sets.find(slot))
                .or_default()
                .push(entities[i].clone());
        }
        let mut result: Vec<Vec<EntityVersion>> =
            groups.into_values().filter(|g| g.len() >= 2).collect();
        for group in &mut result {
            group.sort_by_key(|e| e.entity_id);
        }
        result.sort_by_key(|g| g.first().map(|e| e.entity_id));
        Ok(result)
    }
}

fn merge_leg(picked: &mut [BTreeSet<usize>], leg: BTreeMap<usize, Vec<usize>>, budget: usize) {
    for (i, neighbours) in leg {
        for j in neighbours {
            if picked[i].len() >= budget {
                break;
            }
            picked[i].insert(j);
        }
    }
}

fn add_exact_names(entities: &[EntityVersion], picked: &mut [BTreeSet<usize>]) {
    let mut by_name: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, entity) in entities.iter().enumerate() {
        by_name
            .entry(entity.name.trim().to_lowercase())
            .or_default()
            .push(i);
    }
    for group in by_name.values().filter(|g| g.len() > 1) {
        for &i in group {
            picked[i].extend(group.iter().copied().filter(|j| *j != i));
        }
    }
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}

/// Identity of a relation hit, for callers that only need ids.
impl RelationHit {
    #[must_use]
    pub fn relation_id(&self) -> RelationId {
        self.relation.relation_id
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityError, LocalEmbedder};
    use crate::store::MemoryStore;
    use crate::{NewEntityVersion, NewRelationVersion};

    struct DownEmbedder;

    impl Embedder for DownEmbedder {
        fn embed(&self, _text: &str) -> Result<Vec<f32>, CapabilityError> {
            Err(CapabilityError::Unavailable("offline".to_string()))
        }
    }

    fn put(store: &MemoryStore, name: &str, content: &str) -> EntityVersion {
        store
            .put_entity_version(NewEntityVersion::new(None, name, content))
            .expect("put")
    }

    #[test]
    fn sequence_ratio_matches_reference_values() {
        assert!((sequence_ratio("abcd", "bcde") - 0.75).abs() < 1e-6);
        assert!((sequence_ratio("Alice", "alice") - 1.0).abs() < 1e-6);
        assert!(sequence_ratio("abc", "xyz").abs() < 1e-6);
    }

    #[test]
    fn jaccard_over_character_sets() {
        assert!((jaccard("ab", "bc") - 1.0 / 3.0).abs() < 1e-6);
        assert!(jaccard("", "").abs() < 1e-6);
    }

    #[test]
    fn ngram_precision_of_identical_text_is_one() {
        assert!((ngram_precision("hello", "hello") - 1.0).abs() < 1e-6);
        assert!(ngram_precision("a", "a").abs() < 1e-6);
    }

    #[test]
    fn compose_modes() {
        assert_eq!(
            compose_text("Alice", Some("a very long description"), TextMode::NameAndContent, 6),
            Some("Alice a very".to_string())
        );
        assert_eq!(
            compose_text("Alice", None, TextMode::NameAndContent, 6),
            Some("Alice".to_string())
        );
        assert_eq!(compose_text("Alice", None, TextMode::ContentOnly, 6), None);
    }

    #[test]
    fn content_only_without_content_is_empty() {
        let store = MemoryStore::new();
        put(&store, "Alice", "x");
        let index = SimilarityIndex::new(&store, None);
        let hits = index
            .search(&SearchQuery::new("Alice").mode(TextMode::ContentOnly))
            .expect("search");
        assert!(hits.is_empty());
    }

    #[test]
    fn embedding_failure_falls_back_to_text() {
        let store = MemoryStore::new();
        put(&store, "Alice Smith", "");
        put(&store, "Zebra", "");
        let embedder = DownEmbedder;
        let index = SimilarityIndex::new(&store, Some(&embedder));

        let hits = index
            .search(
                &SearchQuery::new("alice smith")
                    .mode(TextMode::NameOnly)
                    .threshold(0.8),
            )
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity.name, "Alice Smith");
    }

    #[test]
    fn results_deduplicated_and_excluded() {
        let store = MemoryStore::new();
        let alice = put(&store, "Alice", "");
        store
            .put_entity_version(NewEntityVersion::new(Some(alice.entity_id), "Alice", ""))
            .expect("put");
        let other = put(&store, "Alice", "");

        let index = SimilarityIndex::new(&store, None);
        let hits = index
            .search(
                &SearchQuery::new("Alice")
                    .method(SimilarityMethod::SequenceRatio)
                    .excluding(other.entity_id),
            )
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity.entity_id, alice.entity_id);
    }

    #[test]
    fn ties_prefer_most_recent() {
        let store = MemoryStore::new();
        let older = put(&store, "Bob", "");
        let newer = put(&store, "Bob", "");
        let index = SimilarityIndex::new(&store, None);
        let hits = index
            .search(&SearchQuery::new("Bob").method(SimilarityMethod::Jaccard))
            .expect("search");
        assert_eq!(hits[0].entity.entity_id, newer.entity_id);
        assert_eq!(hits[1].entity.entity_id, older.entity_id);
    }

    #[test]
    fn hybrid_candidates_never_contain_self() {
        let store = MemoryStore::new();
        let a = put(&store, "Alice", "researcher");
        let b = put(&store, "Alice", "scientist");
        put(&store, "Quarry", "a pit");
        let embedder = LocalEmbedder::default();
        let index = SimilarityIndex::new(&store, Some(&embedder));

        let config = CandidateConfig {
            threshold: 0.6,
            max_candidates: 4,
            snippet_length: 50,
            strategy: CandidateStrategy::Hybrid,
        };
        let candidates = index.related_candidates(&config).expect("candidates");
        for (entity, set) in &candidates {
            assert!(!set.contains(entity));
        }
        assert!(candidates[&a.entity_id].contains(&b.entity_id));
    }

    #[test]
    fn vectorized_respects_budget() {
        let store = MemoryStore::new();
        for i in 0..6 {
            put(&store, &format!("Node {}", i), "same text");
        }
        let embedder = LocalEmbedder::default();
        let index = SimilarityIndex::new(&store, Some(&embedder));
        let config = CandidateConfig {
            threshold: 0.0,
            max_candidates: 2,
            snippet_length: 50,
            strategy: CandidateStrategy::Vectorized,
        };
        let candidates = index.related_candidates(&config).expect("candidates");
        assert_eq!(candidates.len(), 6);
        assert!(candidates.values().all(|set| set.len() <= 2));
    }

    #[test]
    fn grouping_is_transitive() {
        let store = MemoryStore::new();
        let a = store
            .put_entity_version(NewEntityVersion::new(None, "a", "").with_embedding(Some(vec![1.0, 0.0])))
            .expect("put");
        let b = store
            .put_entity_version(NewEntityVersion::new(None, "b", "").with_embedding(Some(vec![0.8, 0.6])))
            .expect("put");
        let c = store
            .put_entity_version(NewEntityVersion::new(None, "c", "").with_embedding(Some(vec![0.28, 0.96])))
            .expect("put");
        store
            .put_entity_version(NewEntityVersion::new(None, "d", "").with_embedding(Some(vec![-1.0, 0.0])))
            .expect("put");

        let index = SimilarityIndex::new(&store, None);
        let groups = index.group_by_similarity(0.75).expect("groups");
        assert_eq!(groups.len(), 1);
        let ids: Vec<EntityId> = groups[0].iter().map(|e| e.entity_id).collect();
        assert_eq!(ids, vec![a.entity_id, b.entity_id, c.entity_id]);
    }

    #[test]
    fn relation_search_by_text() {
        let store = MemoryStore::new();
        let a = put(&store, "A", "");
        let b = put(&store, "B", "");
        store
            .put_relation_version(NewRelationVersion::new(None, a.absolute_id, b.absolute_id, "works with"))
            .expect("put");
        store
            .put_relation_version(NewRelationVersion::new(None, a.absolute_id, b.absolute_id, "zzz"))
            .expect("put");
        let index = SimilarityIndex::new(&store, None);
        let hits = index
            .search_relations("works with", SimilarityMethod::SequenceRatio, 0.9, 5)
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].relation.content, "works with");
    }
}
