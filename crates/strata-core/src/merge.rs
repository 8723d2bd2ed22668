//! # Merge Engine
//!
//! Folds duplicate entities into one logical identity.
//!
//! A merge rewrites the `entity_id` of every source version (atomically, in
//! the store) and then repairs the relations that became self-referential:
//! their contents are synthesized into one new version of the target and the
//! rows are deleted in the same transaction.
//!
//! Content synthesis happens before any mutation, so a provider failure
//! aborts the merge with no partial work.
//!
//! ## Lexical Guard
//!
//! Before a pair is sent to the detailed classifier, the relations already
//! connecting it are checked for same-entity phrases ("alias", "又称", ...).
//! A match merges the pair unconditionally.

use crate::capability::Capabilities;
use crate::config::MergeConfig;
use crate::similarity::entity_embedding_text;
use crate::store::{MergeStats, VersionStore, validate_merge};
use crate::{EntityId, EntityVersion, NewEntityVersion, RelationVersion, StrataError};
use chrono::{TimeDelta, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// SAME-ENTITY SIGNAL
// =============================================================================

/// Decides whether relation content states that two entities are one.
pub trait SameEntitySignal: Send + Sync {
    fn matches(&self, relation_content: &str) -> bool;
}

/// Case-insensitive substring match against a keyword list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordSignal {
    keywords: Vec<String>,
}

impl KeywordSignal {
    #[must_use]
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    #[must_use]
    pub fn from_config(config: &MergeConfig) -> Self {
        Self::new(&config.same_entity_keywords)
    }
}

impl Default for KeywordSignal {
    fn default() -> Self {
        Self::from_config(&MergeConfig::default())
    }
}

impl SameEntitySignal for KeywordSignal {
    fn matches(&self, relation_content: &str) -> bool {
        let content = relation_content.to_lowercase();
        self.keywords.iter().any(|k| content.contains(k.as_str()))
    }
}

// =============================================================================
// REPORTS
// =============================================================================

/// Outcome of one merge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeReport {
    pub target: EntityId,
    pub sources: Vec<EntityId>,
    pub stats: MergeStats,
    /// The version created from self-referential relation contents, if any.
    pub folded: Option<EntityVersion>,
    /// Self-referential relation rows deleted.
    pub relations_removed: usize,
}

/// Outcome of [`MergeEngine::apply_lexical_guard`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuardOutcome {
    /// Merges performed because a relation carried a same-entity phrase.
    pub merges: Vec<MergeReport>,
    /// For every unmerged pair, the current versions of the relations
    /// connecting it (input to the detailed classifier).
    pub remaining: BTreeMap<(EntityId, EntityId), Vec<RelationVersion>>,
}

impl GuardOutcome {
    /// Existing relations of a pair, in either order.
    #[must_use]
    pub fn relations_of(&self, a: EntityId, b: EntityId) -> &[RelationVersion] {
        self.remaining
            .get(&(a.min(b), a.max(b)))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Logical ids absorbed into another entity by the guard.
    pub fn absorbed(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.merges.iter().flat_map(|m| m.sources.iter().copied())
    }
}

/// Current version of each logical relation among `rows`.
#[must_use]
pub fn current_per_relation(rows: Vec<RelationVersion>) -> Vec<RelationVersion> {
    let mut latest: BTreeMap<_, RelationVersion> = BTreeMap::new();
    for row in rows {
        match latest.get(&row.relation_id) {
            Some(existing) if existing.version_key() >= row.version_key() => {}
            _ => {
                latest.insert(row.relation_id, row);
            }
        }
    }
    latest.into_values().collect()
}

/// Distinct non-empty contents, in first-seen order.
fn fragments_of(rows: &[RelationVersion]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    rows.iter()
        .map(|r| r.content.trim())
        .filter(|c| !c.is_empty() && seen.insert(c.to_string()))
        .map(str::to_string)
        .collect()
}

// =============================================================================
// MERGE ENGINE
// =============================================================================

/// Applies merges and self-referential repairs to a store.
pub struct MergeEngine<'a> {
    store: &'a dyn VersionStore,
    caps: &'a Capabilities,
    signal: &'a dyn SameEntitySignal,
}

impl<'a> MergeEngine<'a> {
    #[must_use]
    pub fn new(
        store: &'a dyn VersionStore,
        caps: &'a Capabilities,
        signal: &'a dyn SameEntitySignal,
    ) -> Self {
        Self {
            store,
            caps,
            signal,
        }
    }

    /// Merge `sources` into `target`.
    ///
    /// # Errors
    ///
    /// - `MalformedInput` for empty sources or a target listed as source
    /// - `EntityNotFound` for an unknown target
    /// - `ProviderUnavailable` if relations must be folded and synthesis fails;
    ///   nothing has been written in that case
    pub fn merge(&self, target: EntityId, sources: &[EntityId]) -> Result<MergeReport, StrataError> {
        let source_set = validate_merge(target, sources)?;
        let target_current = self
            .store
            .current_entity(target)?
            .ok_or(StrataError::EntityNotFound(target))?;

        // The version that will be current once the merge has happened.
        let mut after_merge = target_current;
        let mut participants = vec![target];
        for source in &source_set {
            if let Some(current) = self.store.current_entity(*source)? {
                if current.version_key() > after_merge.version_key() {
                    after_merge = current;
                }
                participants.push(*source);
            }
        }

        // Relations that will be self-referential after the merge.
        let mut doomed = Vec::new();
        for (i, a) in participants.iter().enumerate() {
            for b in &participants[i..] {
                doomed.extend(self.store.relations_between(*a, *b)?);
            }
        }
        doomed.sort_by(|x, y| y.version_key().cmp(&x.version_key()));
        doomed.dedup_by_key(|r| r.absolute_id);

        let folded_content = if doomed.is_empty() {
            None
        } else {
            let fragments = fragments_of(&doomed);
            Some(self.synthesize(&after_merge.content, &fragments)?)
        };

        let stats = self.store.merge_entity_ids(target, sources)?;
        tracing::info!(
            keep = %target,
            sources = source_set.len(),
            versions = stats.versions_rewritten,
            "merged entities"
        );

        let (folded, relations_removed) = match folded_content {
            Some(content) => {
                let (version, removed) = self.fold(target, &after_merge, content)?;
                (Some(version), removed)
            }
            None => (None, 0),
        };

        Ok(MergeReport {
            target,
            sources: source_set.into_iter().collect(),
            stats,
            folded,
            relations_removed,
        })
    }

    /// Fold the self-referential relations of `entity` into a new version.
    ///
    /// Returns `None` if there was nothing to repair.
    pub fn repair_self_referential(
        &self,
        entity: EntityId,
    ) -> Result<Option<(EntityVersion, usize)>, StrataError> {
        let rows = self.store.self_referential_relations(entity)?;
        if rows.is_empty() {
            return Ok(None);
        }
        let current = self
            .store
            .current_entity(entity)?
            .ok_or(StrataError::EntityNotFound(entity))?;
        let content = self.synthesize(&current.content, &fragments_of(&rows))?;
        self.fold(entity, &current, content).map(Some)
    }

    fn synthesize(&self, old: &str, fragments: &[String]) -> Result<String, StrataError> {
        if fragments.is_empty() {
            return Ok(old.to_string());
        }
        Ok(self.caps.synthesizer()?.synthesize(old, fragments)?)
    }

    fn fold(
        &self,
        entity: EntityId,
        current: &EntityVersion,
        content: String,
    ) -> Result<(EntityVersion, usize), StrataError> {
        // Strictly later than the current version so the fold becomes current.
        let created_at = Utc::now().max(current.created_at + TimeDelta::microseconds(1));
        let embedding = self
            .caps
            .try_embed(&entity_embedding_text(&current.name, &content));
        let new = NewEntityVersion {
            entity_id: Some(entity),
            name: current.name.clone(),
            content,
            created_at,
            source_cache: current.source_cache.clone(),
            source_doc: current.source_doc.clone(),
            embedding,
        };
        let (version, removed) = self.store.fold_self_referential(entity, new)?;
        tracing::info!(
            entity = %entity,
            removed,
            version = %version.absolute_id,
            "folded self-referential relations"
        );
        Ok((version, removed))
    }

    /// Merge every pair among `ids` whose connecting relations carry a
    /// same-entity phrase.
    ///
    /// The side with more versions is kept (ties keep the lower id). Pairs
    /// that do not match are reported with their existing relations.
    pub fn apply_lexical_guard(&self, ids: &[EntityId]) -> Result<GuardOutcome, StrataError> {
        let mut outcome = GuardOutcome::default();
        self.apply_lexical_guard_into(ids, &mut outcome)?;
        Ok(outcome)
    }

    /// Like [`Self::apply_lexical_guard`], recording into `outcome` as it
    /// goes. On error, `outcome.merges` holds the merges already committed.
    pub fn apply_lexical_guard_into(
        &self,
        ids: &[EntityId],
        outcome: &mut GuardOutcome,
    ) -> Result<(), StrataError> {
        let ids: Vec<EntityId> = ids
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut absorbed: BTreeMap<EntityId, EntityId> = BTreeMap::new();
        let resolve = |absorbed: &BTreeMap<EntityId, EntityId>, mut id: EntityId| {
            while let Some(next) = absorbed.get(&id) {
                id = *next;
            }
            id
        };

        for (i, first) in ids.iter().enumerate() {
            for second in &ids[i + 1..] {
                let a = resolve(&absorbed, *first);
                let b = resolve(&absorbed, *second);
                if a == b {
                    continue;
                }
                let relations = current_per_relation(self.store.relations_between(a, b)?);
                if relations.is_empty() {
                    continue;
                }
                if !relations.iter().any(|r| self.signal.matches(&r.content)) {
                    outcome.remaining.insert((a.min(b), a.max(b)), relations);
                    continue;
                }

                let count_a = self.store.entity_version_count(a)?;
                let count_b = self.store.entity_version_count(b)?;
                let (target, source) = if count_a > count_b || (count_a == count_b && a < b) {
                    (a, b)
                } else {
                    (b, a)
                };
                tracing::debug!(keep = %target, absorb = %source, "same-entity phrase found");
                outcome.merges.push(self.merge(target, &[source])?);
                absorbed.insert(source, target);
                outcome
                    .remaining
                    .retain(|(x, y), _| *x != source && *y != source);
            }
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
