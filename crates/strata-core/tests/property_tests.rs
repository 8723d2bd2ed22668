//! # Property-Based Tests
//!
//! Properties of the version store, merges, similarity search and path
//! search, checked with proptest.

use chrono::{TimeDelta, TimeZone, Utc};
use proptest::collection::vec;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use strata_core::{
    Capabilities, CapabilityError, ContentSynthesizer, EntityId, EntityVersion, KeywordSignal,
    MemoryStore, MergeEngine, NewEntityVersion, NewRelationVersion, PathQuery, PathSearch,
    SearchQuery, SimilarityIndex, SimilarityMethod, VersionStore,
};

struct Joiner;

impl ContentSynthesizer for Joiner {
    fn synthesize(&self, old: &str, fragments: &[String]) -> Result<String, CapabilityError> {
        Ok(format!("{} {}", old, fragments.join(" ")))
    }
}

fn seeded(names: &[String]) -> (MemoryStore, Vec<EntityVersion>) {
    let store = MemoryStore::new();
    let versions = names
        .iter()
        .map(|n| {
            store
                .put_entity_version(NewEntityVersion::new(None, n.clone(), format!("about {}", n)))
                .expect("put")
        })
        .collect();
    (store, versions)
}

proptest! {
    /// The current version always carries the maximum creation time.
    #[test]
    fn current_has_max_created_at(offsets in vec(0i64..10_000, 1..20)) {
        let store = MemoryStore::new();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("time");
        let mut entity = None;
        for (i, offset) in offsets.iter().enumerate() {
            let version = store
                .put_entity_version(
                    NewEntityVersion::new(entity, "E", format!("v{}", i))
                        .at(base + TimeDelta::seconds(*offset)),
                )
                .expect("put");
            entity = Some(version.entity_id);
        }
        let entity = entity.expect("entity");
        let latest = offsets.iter().max().copied().expect("non-empty");
        let current = store.current_entity(entity).expect("read").expect("present");
        prop_assert_eq!(current.created_at, base + TimeDelta::seconds(latest));
    }

    /// After a merge no version keeps a source id and every relation stays
    /// resolvable.
    #[test]
    fn merge_empties_sources(
        count in 2usize..8,
        edges in vec((0usize..8, 0usize..8), 0..12),
        picks in vec(any::<bool>(), 8),
    ) {
        let names: Vec<String> = (0..count).map(|i| format!("N{}", i)).collect();
        let (store, versions) = seeded(&names);
        for (a, b) in &edges {
            let (a, b) = (a % count, b % count);
            store
                .put_relation_version(NewRelationVersion::new(
                    None,
                    versions[a].absolute_id,
                    versions[b].absolute_id,
                    "link",
                ))
                .expect("relate");
        }
        let target = versions[0].entity_id;
        let sources: Vec<EntityId> = versions[1..]
            .iter()
            .zip(picks.iter())
            .filter(|(_, pick)| **pick)
            .map(|(v, _)| v.entity_id)
            .collect();
        prop_assume!(!sources.is_empty());

        let caps = Capabilities::none().with_synthesizer(Arc::new(Joiner));
        let signal = KeywordSignal::default();
        MergeEngine::new(&store, &caps, &signal)
            .merge(target, &sources)
            .expect("merge");

        for source in &sources {
            prop_assert!(store.entity_versions(*source).expect("versions").is_empty());
        }
        for version in &versions {
            prop_assert!(store.entity_by_absolute_id(version.absolute_id).expect("read").is_some());
        }
        for relation in store.all_current_relations().expect("relations") {
            prop_assert!(store.entity_by_absolute_id(relation.endpoint1).expect("read").is_some());
            prop_assert!(store.entity_by_absolute_id(relation.endpoint2).expect("read").is_some());
        }
        prop_assert!(store.self_referential_relations(target).expect("self refs").is_empty());
    }

    /// Paths are simple and within the hop bound.
    #[test]
    fn paths_simple_and_bounded(
        count in 2usize..9,
        edges in vec((0usize..9, 0usize..9), 1..20),
        max_hops in 1usize..=5,
    ) {
        let names: Vec<String> = (0..count).map(|i| format!("P{}", i)).collect();
        let (store, versions) = seeded(&names);
        for (a, b) in &edges {
            let (a, b) = (a % count, b % count);
            store
                .put_relation_version(NewRelationVersion::new(
                    None,
                    versions[a].absolute_id,
                    versions[b].absolute_id,
                    "edge",
                ))
                .expect("relate");
        }
        let query = PathQuery::new(versions[0].entity_id, versions[count - 1].entity_id)
            .max_hops(max_hops)
            .max_paths(20);
        let result = PathSearch::new(&store).find_paths(&query).expect("search");
        for path in &result.paths {
            prop_assert!(path.hop_count <= max_hops);
            prop_assert_eq!(path.nodes.len(), path.hop_count + 1);
            let distinct: BTreeSet<EntityId> = path.nodes.iter().map(|n| n.entity_id).collect();
            prop_assert_eq!(distinct.len(), path.nodes.len());
        }
        prop_assert_eq!(
            result.shortest_length,
            result.paths.iter().map(|p| p.hop_count).min()
        );
    }

    /// Search never returns two hits for one logical entity.
    #[test]
    fn search_hits_distinct(
        names in vec("[a-c]{1,4}", 1..15),
        versions_per in 1usize..4,
        query in "[a-c]{1,4}",
    ) {
        let store = MemoryStore::new();
        for name in &names {
            let first = store
                .put_entity_version(NewEntityVersion::new(None, name.clone(), name.clone()))
                .expect("put");
            for i in 1..versions_per {
                store
                    .put_entity_version(NewEntityVersion::new(
                        Some(first.entity_id),
                        name.clone(),
                        format!("{} {}", name, i),
                    ))
                    .expect("put");
            }
        }
        let hits = SimilarityIndex::new(&store, None)
            .search(
                &SearchQuery::new(query)
                    .method(SimilarityMethod::Jaccard)
                    .threshold(0.0)
                    .max_results(100),
            )
            .expect("search");
        let distinct: BTreeSet<EntityId> = hits.iter().map(|h| h.entity.entity_id).collect();
        prop_assert_eq!(distinct.len(), hits.len());
    }
}
