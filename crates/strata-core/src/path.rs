//! # Path Search
//!
//! Bounded breadth-first enumeration of simple paths between two entities.
//!
//! Relations are undirected and reference entity *versions*; every hop
//! resolves the far endpoint back to its logical entity through the store.
//! Self-referential relations never form a hop.
//!
//! All searches are computationally bounded: at most [`MAX_HOPS`] hops and
//! `max_paths` results.

use crate::primitives::{
    DEFAULT_MAX_HOPS, DEFAULT_MAX_PATHS, MAX_HOPS, PATH_DESCRIPTION_EDGE_LIMIT,
    PATH_EDGE_CONTENT_LIMIT, PATH_NODE_CONTENT_LIMIT,
};
use crate::store::VersionStore;
use crate::{
    AbsoluteId, EntityId, EntityVersion, RelationId, RelationVersion, StrataError, truncate_chars,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// A path search request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathQuery {
    pub start: EntityId,
    pub end: EntityId,
    pub max_hops: usize,
    pub max_paths: usize,
}

impl PathQuery {
    /// Search between two entities with default bounds.
    #[must_use]
    pub fn new(start: EntityId, end: EntityId) -> Self {
        Self {
            start,
            end,
            max_hops: DEFAULT_MAX_HOPS,
            max_paths: DEFAULT_MAX_PATHS,
        }
    }

    #[must_use]
    pub fn max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    #[must_use]
    pub fn max_paths(mut self, max_paths: usize) -> Self {
        self.max_paths = max_paths;
        self
    }

    fn validate(&self) -> Result<(), StrataError> {
        if self.start == self.end {
            return Err(StrataError::MalformedInput(
                "path start and end must differ".to_string(),
            ));
        }
        if self.max_hops == 0 || self.max_hops > MAX_HOPS {
            return Err(StrataError::MalformedInput(format!(
                "max_hops must be within 1..={}, got {}",
                MAX_HOPS, self.max_hops
            )));
        }
        if self.max_paths == 0 {
            return Err(StrataError::MalformedInput(
                "max_paths must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// An entity on a path (its current version).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathNode {
    pub entity_id: EntityId,
    pub name: String,
    pub content: String,
}

/// A relation traversed by a path, oriented in travel direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathEdge {
    pub relation_id: RelationId,
    pub absolute_id: AbsoluteId,
    /// Name of the endpoint version on the near side.
    pub from_name: String,
    /// Name of the endpoint version on the far side.
    pub to_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// One path from start to end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphPath {
    pub nodes: Vec<PathNode>,
    pub edges: Vec<PathEdge>,
    pub hop_count: usize,
    pub description: String,
}

/// Result of a path search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PathSearchResult {
    /// Paths in discovery order (non-decreasing hop count).
    pub paths: Vec<GraphPath>,
    /// Minimum hop count, `None` when no path exists.
    pub shortest_length: Option<usize>,
}

fn ellipsize(text: &str, limit: usize) -> String {
    let cut = truncate_chars(text, limit);
    if cut.len() < text.len() {
        format!("{}...", cut)
    } else {
        text.to_string()
    }
}

/// One traversable hop out of an entity.
#[derive(Debug, Clone)]
struct Hop {
    to: EntityId,
    relation: RelationVersion,
    from_name: String,
    to_name: String,
}

/// Bounded BFS path enumeration over a store.
pub struct PathSearch<'a> {
    store: &'a dyn VersionStore,
}

impl<'a> PathSearch<'a> {
    #[must_use]
    pub fn new(store: &'a dyn VersionStore) -> Self {
        Self { store }
    }

    /// Find up to `max_paths` simple paths of at most `max_hops` hops.
    ///
    /// # Errors
    ///
    /// - `MalformedInput` for `start == end` or out-of-range bounds
    /// - `EntityNotFound` if either endpoint has no versions
    pub fn find_paths(&self, query: &PathQuery) -> Result<PathSearchResult, StrataError> {
        query.validate()?;
        let mut entities: BTreeMap<EntityId, EntityVersion> = BTreeMap::new();
        for id in [query.start, query.end] {
            let current = self
                .store
                .current_entity(id)?
                .ok_or(StrataError::EntityNotFound(id))?;
            entities.insert(id, current);
        }

        let mut hops: BTreeMap<EntityId, Vec<Hop>> = BTreeMap::new();
        let mut visited: BTreeSet<Vec<EntityId>> = BTreeSet::new();
        let mut queue: VecDeque<(Vec<EntityId>, Vec<Hop>)> = VecDeque::new();
        let mut found: Vec<(Vec<EntityId>, Vec<Hop>)> = Vec::new();

        visited.insert(vec![query.start]);
        queue.push_back((vec![query.start], Vec::new()));

        'search: while let Some((entity_path, hop_path)) = queue.pop_front() {
            if hop_path.len() >= query.max_hops {
                continue;
            }
            let Some(&current) = entity_path.last() else {
                continue;
            };
            if !hops.contains_key(&current) {
                let expanded = self.expand(current)?;
                hops.insert(current, expanded);
            }
            for hop in hops.get(&current).into_iter().flatten() {
                if entity_path.contains(&hop.to) {
                    continue;
                }
                let mut next_entities = entity_path.clone();
                next_entities.push(hop.to);
                let mut next_hops = hop_path.clone();
                next_hops.push(hop.clone());

                // Parallel relations into the destination are distinct paths.
                if hop.to == query.end {
                    found.push((next_entities, next_hops));
                    if found.len() >= query.max_paths {
                        break 'search;
                    }
                } else if visited.insert(next_entities.clone()) {
                    queue.push_back((next_entities, next_hops));
                }
            }
        }

        let mut paths = Vec::with_capacity(found.len());
        for (entity_path, hop_path) in found {
            paths.push(self.record(&mut entities, &entity_path, &hop_path)?);
        }
        let shortest_length = paths.iter().map(|p| p.hop_count).min();
        tracing::debug!(
            start = %query.start,
            end = %query.end,
            paths = paths.len(),
            "path search finished"
        );
        Ok(PathSearchResult {
            paths,
            shortest_length,
        })
    }

    /// Hops out of `entity`, in relation id order.
    fn expand(&self, entity: EntityId) -> Result<Vec<Hop>, StrataError> {
        let mut result = Vec::new();
        for relation in self.store.relations_of_entity(entity)? {
            let (Some(first), Some(second)) = (
                self.store.entity_by_absolute_id(relation.endpoint1)?,
                self.store.entity_by_absolute_id(relation.endpoint2)?,
            ) else {
                continue;
            };
            if first.entity_id == second.entity_id {
                continue;
            }
            let (near, far) = if first.entity_id == entity {
                (first, second)
            } else if second.entity_id == entity {
                (second, first)
            } else {
                continue;
            };
            result.push(Hop {
                to: far.entity_id,
                relation,
                from_name: near.name,
                to_name: far.name,
            });
        }
        Ok(result)
    }

    fn record(
        &self,
        entities: &mut BTreeMap<EntityId, EntityVersion>,
        entity_path: &[EntityId],
        hop_path: &[Hop],
    ) -> Result<GraphPath, StrataError> {
        let mut nodes = Vec::with_capacity(entity_path.len());
        for id in entity_path {
            if !entities.contains_key(id) {
                let current = self
                    .store
                    .current_entity(*id)?
                    .ok_or(StrataError::EntityNotFound(*id))?;
                entities.insert(*id, current);
            }
            if let Some(current) = entities.get(id) {
                nodes.push(PathNode {
                    entity_id: *id,
                    name: current.name.clone(),
                    content: ellipsize(&current.content, PATH_NODE_CONTENT_LIMIT),
                });
            }
        }

        let edges: Vec<PathEdge> = hop_path
            .iter()
            .map(|hop| PathEdge {
                relation_id: hop.relation.relation_id,
                absolute_id: hop.relation.absolute_id,
                from_name: hop.from_name.clone(),
                to_name: hop.to_name.clone(),
                content: ellipsize(&hop.relation.content, PATH_EDGE_CONTENT_LIMIT),
                created_at: hop.relation.created_at,
            })
            .collect();

        let mut description = nodes.first().map(|n| n.name.clone()).unwrap_or_default();
        for (edge, node) in hop_path.iter().zip(nodes.iter().skip(1)) {
            description.push_str(&format!(
                " --[{}]--> {}",
                ellipsize(&edge.relation.content, PATH_DESCRIPTION_EDGE_LIMIT),
                node.name
            ));
        }

        Ok(GraphPath {
            hop_count: edges.len(),
            nodes,
            edges,
            description,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::{NewEntityVersion, NewRelationVersion};

    fn put(store: &MemoryStore, name: &str) -> EntityVersion {
        store
            .put_entity_version(NewEntityVersion::new(None, name, format!("{} content", name)))
            .expect("put")
    }

    fn relate(store: &MemoryStore, a: &EntityVersion, b: &EntityVersion, content: &str) {
        store
            .put_relation_version(NewRelationVersion::new(None, a.absolute_id, b.absolute_id, content))
            .expect("relate");
    }

    #[test]
    fn rejects_bad_bounds() {
        let store = MemoryStore::new();
        let a = put(&store, "A");
        let b = put(&store, "B");
        let search = PathSearch::new(&store);

        for query in [
            PathQuery::new(a.entity_id, a.entity_id),
            PathQuery::new(a.entity_id, b.entity_id).max_hops(0),
            PathQuery::new(a.entity_id, b.entity_id).max_hops(MAX_HOPS + 1),
            PathQuery::new(a.entity_id, b.entity_id).max_paths(0),
        ] {
            assert!(matches!(
                search.find_paths(&query),
                Err(StrataError::MalformedInput(_))
            ));
        }
    }

    #[test]
    fn unknown_endpoint_is_not_found() {
        let store = MemoryStore::new();
        let a = put(&store, "A");
        let search = PathSearch::new(&store);
        let result = search.find_paths(&PathQuery::new(a.entity_id, EntityId(42)));
        assert!(matches!(result, Err(StrataError::EntityNotFound(EntityId(42)))));
    }

    #[test]
    fn no_path_has_no_shortest_length() {
        let store = MemoryStore::new();
        let a = put(&store, "A");
        let b = put(&store, "B");
        let result = PathSearch::new(&store)
            .find_paths(&PathQuery::new(a.entity_id, b.entity_id))
            .expect("search");
        assert!(result.paths.is_empty());
        assert_eq!(result.shortest_length, None);
    }

    #[test]
    fn hop_through_older_version() {
        let store = MemoryStore::new();
        let a = put(&store, "A");
        let b = put(&store, "B");
        relate(&store, &a, &b, "knows");
        // A newer version of A does not hide the relation on the old one.
        store
            .put_entity_version(NewEntityVersion::new(Some(a.entity_id), "A", "updated"))
            .expect("put");

        let result = PathSearch::new(&store)
            .find_paths(&PathQuery::new(a.entity_id, b.entity_id))
            .expect("search");
        assert_eq!(result.shortest_length, Some(1));
        assert_eq!(result.paths[0].nodes[0].content, "updated");
        assert_eq!(result.paths[0].description, "A --[knows]--> B");
    }

    #[test]
    fn content_is_truncated() {
        let store = MemoryStore::new();
        let long = "x".repeat(400);
        let a = store
            .put_entity_version(NewEntityVersion::new(None, "A", long.clone()))
            .expect("put");
        let b = put(&store, "B");
        relate(&store, &a, &b, &long);

        let result = PathSearch::new(&store)
            .find_paths(&PathQuery::new(a.entity_id, b.entity_id))
            .expect("search");
        let path = &result.paths[0];
        assert_eq!(path.nodes[0].content.chars().count(), PATH_NODE_CONTENT_LIMIT + 3);
        assert_eq!(path.edges[0].content.chars().count(), PATH_EDGE_CONTENT_LIMIT + 3);
        assert!(path.edges[0].content.ends_with("..."));
        assert!(path.description.contains(&format!("{}...", "x".repeat(PATH_DESCRIPTION_EDGE_LIMIT))));
    }

    #[test]
    fn parallel_relations_are_separate_paths() {
        let store = MemoryStore::new();
        let a = put(&store, "A");
        let d = put(&store, "D");
        relate(&store, &a, &d, "works with");
        relate(&store, &a, &d, "married to");

        let result = PathSearch::new(&store)
            .find_paths(&PathQuery::new(a.entity_id, d.entity_id).max_hops(2))
            .expect("search");
        assert_eq!(result.paths.len(), 2);
        assert_eq!(result.shortest_length, Some(1));
        let mut contents: Vec<&str> = result
            .paths
            .iter()
            .map(|p| p.edges[0].content.as_str())
            .collect();
        contents.sort_unstable();
        assert_eq!(contents, vec!["married to", "works with"]);
    }

    #[test]
    fn parallel_relations_on_last_hop() {
        let store = MemoryStore::new();
        let a = put(&store, "A");
        let b = put(&store, "B");
        let c = put(&store, "C");
        relate(&store, &a, &b, "knows");
        relate(&store, &b, &c, "manages");
        relate(&store, &b, &c, "mentors");

        let result = PathSearch::new(&store)
            .find_paths(&PathQuery::new(a.entity_id, c.entity_id))
            .expect("search");
        assert_eq!(result.paths.len(), 2);
        assert!(result.paths.iter().all(|p| p.hop_count == 2));
    }

    #[test]
    fn self_referential_relations_are_skipped() {
        let store = MemoryStore::new();
        let a = put(&store, "A");
        let a2 = store
            .put_entity_version(NewEntityVersion::new(Some(a.entity_id), "A", "again"))
            .expect("put");
        let b = put(&store, "B");
        relate(&store, &a, &a2, "loop");
        relate(&store, &a2, &b, "knows");

        let result = PathSearch::new(&store)
            .find_paths(&PathQuery::new(a.entity_id, b.entity_id))
            .expect("search");
        assert_eq!(result.paths.len(), 1);
        assert_eq!(result.paths[0].hop_count, 1);
    }
}
