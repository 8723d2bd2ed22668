//! # Graph Statistics
//!
//! Read-only metrics over the current state of a version store. Metrics are
//! informational: nothing in the engine is gated on them.

use crate::store::{StoreStats, VersionStore};
use crate::{EntityId, Session, StrataError};
use serde::Serialize;
use std::collections::BTreeMap;

/// Number of entries in [`GraphMetrics::most_connected`].
pub const TOP_CONNECTED: usize = 10;

/// An entity and how many logical relations touch it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Degree {
    pub entity_id: EntityId,
    pub name: String,
    pub relations: usize,
}

/// Metrics extracted from a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphMetrics {
    /// Row and logical counts.
    pub store: StoreStats,
    /// Entities with more than one version.
    pub multi_version_entities: usize,
    /// Largest version count of any entity.
    pub max_versions: usize,
    /// Entities with no relation at all.
    pub isolated_entities: usize,
    /// Current entities carrying an embedding.
    pub embedded_entities: usize,
    /// Current relations whose endpoints resolve to one entity.
    /// Non-zero only between a merge and its repair.
    pub self_referential_relations: usize,
    /// Logical relations per logical entity, as millionths.
    pub density_millionths: u64,
    /// Highest-degree entities, degree descending then id.
    pub most_connected: Vec<Degree>,
}

impl GraphMetrics {
    /// Compute metrics from a store.
    pub fn collect(store: &dyn VersionStore) -> Result<Self, StrataError> {
        let stats = store.stats()?;
        let entities = store.current_entities()?;

        let mut multi_version_entities = 0;
        let mut max_versions = 0;
        let mut embedded_entities = 0;
        let mut degrees: BTreeMap<EntityId, usize> = BTreeMap::new();
        for entity in &entities {
            let versions = store.entity_version_count(entity.entity_id)?;
            if versions > 1 {
                multi_version_entities += 1;
            }
            max_versions = max_versions.max(versions);
            if entity.embedding.is_some() {
                embedded_entities += 1;
            }
            degrees.insert(entity.entity_id, 0);
        }

        let mut self_referential_relations = 0;
        for relation in store.all_current_relations()? {
            let first = store.entity_by_absolute_id(relation.endpoint1)?;
            let second = store.entity_by_absolute_id(relation.endpoint2)?;
            let (Some(first), Some(second)) = (first, second) else {
                continue;
            };
            if first.entity_id == second.entity_id {
                self_referential_relations += 1;
                continue;
            }
            for id in [first.entity_id, second.entity_id] {
                *degrees.entry(id).or_default() += 1;
            }
        }

        let isolated_entities = degrees.values().filter(|d| **d == 0).count();
        let density_millionths = if stats.entities > 0 {
            (stats.relations as u64).saturating_mul(1_000_000) / stats.entities as u64
        } else {
            0
        };

        let names: BTreeMap<EntityId, &str> =
            entities.iter().map(|e| (e.entity_id, e.name.as_str())).collect();
        let mut ranked: Vec<(EntityId, usize)> =
            degrees.into_iter().filter(|(_, d)| *d > 0).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let most_connected = ranked
            .into_iter()
            .take(TOP_CONNECTED)
            .map(|(entity_id, relations)| Degree {
                entity_id,
                name: names.get(&entity_id).copied().unwrap_or_default().to_string(),
                relations,
            })
            .collect();

        Ok(Self {
            store: stats,
            multi_version_entities,
            max_versions,
            isolated_entities,
            embedded_entities,
            self_referential_relations,
            density_millionths,
            most_connected,
        })
    }

    /// Compute metrics from a Session.
    pub fn from_session(session: &Session) -> Result<Self, StrataError> {
        Self::collect(session.store())
    }

    /// Density as parts per thousand.
    #[must_use]
    pub fn density_per_thousand(&self) -> u64 {
        self.density_millionths / 1000
    }
}
