//! # Consolidation Scheduler
//!
//! Whole-graph deduplication passes.
//!
//! A pass is a list of [`ConsolidationUnit`]s: an entity and the candidate
//! entities it might duplicate or relate to. Units run on a bounded pool of
//! worker threads. The calling thread is the single dispatcher: it owns the
//! work queue and the reservation table, and never hands out a unit whose
//! entity set overlaps a unit still in flight. Workers receive jobs over one
//! channel and report back over another.
//!
//! Each unit is processed as:
//!
//! 1. lexical guard over the unit's entities (same-entity phrases merge)
//! 2. preliminary classifier on truncated content
//! 3. detailed classifier on full content for every flagged candidate
//! 4. merge, or record the relation the classifier described
//!
//! A failing (or panicking) unit is reported with whatever it had already
//! written, and the pass continues. When
//! the queue has drained, every touched entity is swept for
//! self-referential relations.

use crate::capability::{Capabilities, DetailedVerdict};
use crate::config::EngineConfig;
use crate::merge::{GuardOutcome, MergeEngine, MergeReport, SameEntitySignal, current_per_relation};
use crate::session::{Provenance, upsert_relation};
use crate::similarity::SimilarityIndex;
use crate::store::VersionStore;
use crate::{EntityId, EntityVersion, RelationVersion, StrataError, truncate_chars};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

// =============================================================================
// UNITS & REPORTS
// =============================================================================

/// One entity and the candidates it is compared against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsolidationUnit {
    pub entity: EntityId,
    pub candidates: BTreeSet<EntityId>,
}

impl ConsolidationUnit {
    #[must_use]
    pub fn new(entity: EntityId, candidates: impl IntoIterator<Item = EntityId>) -> Self {
        Self {
            entity,
            candidates: candidates.into_iter().filter(|c| *c != entity).collect(),
        }
    }

    /// Every entity the unit may touch.
    #[must_use]
    pub fn ids(&self) -> BTreeSet<EntityId> {
        let mut ids = self.candidates.clone();
        ids.insert(self.entity);
        ids
    }
}

/// What one unit did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitOutcome {
    pub entity: EntityId,
    pub merges: Vec<MergeReport>,
    /// Relation versions this unit wrote.
    pub relations: Vec<RelationVersion>,
}

impl UnitOutcome {
    fn empty(entity: EntityId) -> Self {
        Self {
            entity,
            merges: Vec::new(),
            relations: Vec::new(),
        }
    }
}

/// A unit that did not complete.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitFailure {
    pub entity: EntityId,
    pub reason: String,
    /// Writes committed before the failure.
    pub applied: UnitOutcome,
}

/// Aggregate result of a pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsolidationReport {
    pub outcomes: Vec<UnitOutcome>,
    pub failures: Vec<UnitFailure>,
    /// Units dropped before dispatch (merged away or nothing left to compare).
    pub skipped: usize,
    /// Units discarded by cancellation.
    pub cancelled: usize,
    /// Self-referential relation rows removed by the final sweep.
    pub repaired_relations: usize,
}

impl ConsolidationReport {
    /// Everything written, by completed and failed units alike.
    fn applied(&self) -> impl Iterator<Item = &UnitOutcome> {
        self.outcomes
            .iter()
            .chain(self.failures.iter().map(|f| &f.applied))
    }

    /// Total merges across all units.
    #[must_use]
    pub fn merge_count(&self) -> usize {
        self.applied().map(|o| o.merges.len()).sum()
    }

    /// Total relation versions written across all units.
    #[must_use]
    pub fn relation_count(&self) -> usize {
        self.applied().map(|o| o.relations.len()).sum()
    }
}

/// Cooperative cancellation of a running pass.
///
/// Cancelling stops dispatch and drops queued units; units already in
/// flight run to completion.
#[derive(Debug, Clone, Default)]
pub struct PassControl {
    cancelled: Arc<AtomicBool>,
}

impl PassControl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// =============================================================================
// RESERVATIONS
// =============================================================================

/// Entity ids held by in-flight units. Owned by the dispatcher.
#[derive(Debug, Default)]
struct ReservationTable {
    held: BTreeSet<EntityId>,
}

impl ReservationTable {
    fn is_free(&self, ids: &BTreeSet<EntityId>) -> bool {
        self.held.is_disjoint(ids)
    }

    /// Reserve all of `ids`, or nothing.
    fn try_reserve(&mut self, ids: &BTreeSet<EntityId>) -> bool {
        if !self.is_free(ids) {
            return false;
        }
        self.held.extend(ids.iter().copied());
        true
    }

    fn release(&mut self, ids: &BTreeSet<EntityId>) {
        for id in ids {
            self.held.remove(id);
        }
    }
}

fn pair(a: EntityId, b: EntityId) -> (EntityId, EntityId) {
    (a.min(b), a.max(b))
}

/// How a unit ended, apart from what it wrote.
enum UnitStatus {
    Done,
    /// The unit's entity no longer exists.
    Skipped,
}

struct Completion {
    unit: ConsolidationUnit,
    applied: UnitOutcome,
    result: Result<UnitStatus, String>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("worker panicked: {}", s)
    } else {
        "worker panicked".to_string()
    }
}

// =============================================================================
// CONSOLIDATOR
// =============================================================================

/// Runs consolidation passes against a store.
pub struct Consolidator<'a> {
    store: &'a dyn VersionStore,
    caps: &'a Capabilities,
    config: &'a EngineConfig,
    signal: &'a dyn SameEntitySignal,
    provenance: &'a Provenance,
}

impl<'a> Consolidator<'a> {
    #[must_use]
    pub fn new(
        store: &'a dyn VersionStore,
        caps: &'a Capabilities,
        config: &'a EngineConfig,
        signal: &'a dyn SameEntitySignal,
        provenance: &'a Provenance,
    ) -> Self {
        Self {
            store,
            caps,
            config,
            signal,
            provenance,
        }
    }

    /// Build units from the similarity index's candidate map.
    pub fn plan(&self) -> Result<Vec<ConsolidationUnit>, StrataError> {
        let index = SimilarityIndex::new(self.store, self.caps.embedder());
        let candidates = index.related_candidates(&self.config.similarity.candidate_config())?;
        Ok(candidates
            .into_iter()
            .map(|(entity, set)| ConsolidationUnit::new(entity, set))
            .collect())
    }

    /// Plan and run a full pass.
    pub fn run_pass(&self) -> Result<ConsolidationReport, StrataError> {
        let units = self.plan()?;
        Ok(self.run(units, &PassControl::new()))
    }

    /// Run caller-provided units.
    ///
    /// Never fails as a whole: unit errors are collected in the report.
    pub fn run(&self, units: Vec<ConsolidationUnit>, control: &PassControl) -> ConsolidationReport {
        let mut report = ConsolidationReport::default();
        if units.is_empty() {
            return report;
        }
        if self.caps.classifier().is_err() {
            tracing::warn!("no classifier configured, pass applies the lexical guard only");
        }
        let workers = self.config.consolidation.pool_size.clamp(1, units.len());
        tracing::info!(units = units.len(), workers, "consolidation pass started");

        let mut touched: BTreeSet<EntityId> = BTreeSet::new();
        let (job_tx, job_rx) = mpsc::channel::<ConsolidationUnit>();
        let (done_tx, done_rx) = mpsc::channel::<Completion>();
        let jobs = Mutex::new(job_rx);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let done_tx = done_tx.clone();
                let jobs = &jobs;
                scope.spawn(move || {
                    loop {
                        let next = match jobs.lock() {
                            Ok(rx) => rx.recv(),
                            Err(_) => break,
                        };
                        let Ok(unit) = next else { break };
                        let mut applied = UnitOutcome::empty(unit.entity);
                        let result = match catch_unwind(AssertUnwindSafe(|| {
                            self.process_unit(&unit, &mut applied)
                        })) {
                            Ok(result) => result.map_err(|e| e.to_string()),
                            Err(payload) => Err(panic_message(payload.as_ref())),
                        };
                        let completion = Completion {
                            unit,
                            applied,
                            result,
                        };
                        if done_tx.send(completion).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(done_tx);

            let mut queue: VecDeque<ConsolidationUnit> = units.into();
            let mut reservations = ReservationTable::default();
            let mut merged: BTreeSet<EntityId> = BTreeSet::new();
            let mut dispatched: BTreeSet<(EntityId, EntityId)> = BTreeSet::new();
            let mut in_flight = 0usize;

            loop {
                if control.is_cancelled() && !queue.is_empty() {
                    tracing::info!(dropped = queue.len(), "consolidation pass cancelled");
                    report.cancelled += queue.len();
                    queue.clear();
                }

                while in_flight < workers {
                    report.skipped += prune(&mut queue, &merged, &dispatched);
                    let Some(pos) = queue.iter().position(|u| reservations.is_free(&u.ids())) else {
                        break;
                    };
                    let Some(unit) = queue.remove(pos) else { break };
                    let ids = unit.ids();
                    if !reservations.try_reserve(&ids) {
                        queue.push_front(unit);
                        break;
                    }
                    for candidate in &unit.candidates {
                        dispatched.insert(pair(unit.entity, *candidate));
                    }
                    touched.extend(ids.iter().copied());
                    tracing::debug!(entity = %unit.entity, candidates = unit.candidates.len(), "unit dispatched");
                    let entity = unit.entity;
                    if job_tx.send(unit).is_err() {
                        reservations.release(&ids);
                        report.failures.push(UnitFailure {
                            entity,
                            reason: "worker pool unavailable".to_string(),
                            applied: UnitOutcome::empty(entity),
                        });
                        continue;
                    }
                    in_flight += 1;
                }

                if in_flight == 0 {
                    break;
                }
                let Ok(Completion {
                    unit,
                    applied,
                    result,
                }) = done_rx.recv()
                else {
                    break;
                };
                in_flight -= 1;
                reservations.release(&unit.ids());
                for merge in &applied.merges {
                    merged.extend(merge.sources.iter().copied());
                    touched.insert(merge.target);
                }
                match result {
                    Ok(UnitStatus::Done) => report.outcomes.push(applied),
                    Ok(UnitStatus::Skipped) => {
                        tracing::debug!(entity = %unit.entity, "unit entity gone, skipped");
                        report.skipped += 1;
                    }
                    Err(reason) => {
                        tracing::warn!(
                            entity = %unit.entity,
                            %reason,
                            merges = applied.merges.len(),
                            "unit failed"
                        );
                        report.failures.push(UnitFailure {
                            entity: unit.entity,
                            reason,
                            applied,
                        });
                    }
                }
            }
            drop(job_tx);
        });

        self.sweep(&touched, &mut report);
        tracing::info!(
            completed = report.outcomes.len(),
            failed = report.failures.len(),
            merges = report.merge_count(),
            relations = report.relation_count(),
            "consolidation pass finished"
        );
        report
    }

    /// Repair self-referential relations left on any touched entity.
    fn sweep(&self, touched: &BTreeSet<EntityId>, report: &mut ConsolidationReport) {
        let engine = MergeEngine::new(self.store, self.caps, self.signal);
        for entity in touched {
            match engine.repair_self_referential(*entity) {
                Ok(Some((_, removed))) => report.repaired_relations += removed,
                Ok(None) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    tracing::warn!(entity = %entity, error = %e, "self-referential repair failed");
                    report.failures.push(UnitFailure {
                        entity: *entity,
                        reason: e.to_string(),
                        applied: UnitOutcome::empty(*entity),
                    });
                }
            }
        }
    }

    /// Process one unit, recording every committed write in `applied`.
    fn process_unit(
        &self,
        unit: &ConsolidationUnit,
        applied: &mut UnitOutcome,
    ) -> Result<UnitStatus, StrataError> {
        if self.store.current_entity(unit.entity)?.is_none() {
            return Ok(UnitStatus::Skipped);
        }
        let mut ids = vec![unit.entity];
        for candidate in &unit.candidates {
            if self.store.current_entity(*candidate)?.is_some() {
                ids.push(*candidate);
            } else {
                tracing::debug!(entity = %unit.entity, candidate = %candidate, "candidate gone");
            }
        }

        let engine = MergeEngine::new(self.store, self.caps, self.signal);
        let mut guard = GuardOutcome::default();
        let guarded = engine.apply_lexical_guard_into(&ids, &mut guard);
        let mut absorbed: BTreeMap<EntityId, EntityId> = BTreeMap::new();
        for merge in guard.merges {
            for source in &merge.sources {
                absorbed.insert(*source, merge.target);
            }
            applied.merges.push(merge);
        }
        guarded?;
        let resolve = |mut id: EntityId| {
            while let Some(next) = absorbed.get(&id) {
                id = *next;
            }
            id
        };

        let mut me = resolve(unit.entity);
        let candidates: BTreeSet<EntityId> = ids[1..]
            .iter()
            .map(|c| resolve(*c))
            .filter(|c| *c != me)
            .collect();
        let Ok(classifier) = self.caps.classifier() else {
            return Ok(UnitStatus::Done);
        };
        if candidates.is_empty() {
            return Ok(UnitStatus::Done);
        }

        let snippet = self.config.consolidation.preliminary_snippet;
        let shorten = |e: &EntityVersion| EntityVersion {
            content: truncate_chars(&e.content, snippet).to_string(),
            ..e.clone()
        };
        let current = self.current(me)?;
        let mut others = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            others.push(shorten(&self.current(*candidate)?));
        }
        let verdicts = classifier.classify_preliminary(&shorten(&current), &others)?;
        let flagged: Vec<EntityId> = verdicts
            .into_iter()
            .filter(|(id, verdict)| verdict.is_flagged() && candidates.contains(id))
            .map(|(id, _)| id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        for candidate in flagged {
            if candidate == me {
                continue;
            }
            let Some(other) = self.store.current_entity(candidate)? else {
                continue;
            };
            let entity = self.current(me)?;
            let existing = current_per_relation(self.store.relations_between(me, candidate)?);
            match classifier.classify_detailed(&entity, &other, &existing)? {
                DetailedVerdict::Merge { target } => {
                    let source = if target == me {
                        candidate
                    } else if target == candidate {
                        me
                    } else {
                        return Err(StrataError::MalformedInput(format!(
                            "merge target {} is neither {} nor {}",
                            target, me, candidate
                        )));
                    };
                    applied.merges.push(engine.merge(target, &[source])?);
                    me = target;
                }
                DetailedVerdict::CreateRelation { content } => {
                    let row = upsert_relation(
                        self.store,
                        self.caps,
                        self.provenance,
                        me,
                        candidate,
                        &content,
                    )?;
                    // An unchanged relation comes back as the existing row.
                    if existing.iter().all(|r| r.absolute_id != row.absolute_id) {
                        applied.relations.push(row);
                    }
                }
                DetailedVerdict::NoAction => {}
            }
        }
        Ok(UnitStatus::Done)
    }

    fn current(&self, entity: EntityId) -> Result<EntityVersion, StrataError> {
        self.store
            .current_entity(entity)?
            .ok_or(StrataError::EntityNotFound(entity))
    }
}

/// Drop units that can no longer do anything; returns how many were dropped.
fn prune(
    queue: &mut VecDeque<ConsolidationUnit>,
    merged: &BTreeSet<EntityId>,
    dispatched: &BTreeSet<(EntityId, EntityId)>,
) -> usize {
    let before = queue.len();
    queue.retain_mut(|unit| {
        if merged.contains(&unit.entity) {
            return false;
        }
        let entity = unit.entity;
        unit.candidates
            .retain(|c| !merged.contains(c) && !dispatched.contains(&pair(entity, *c)));
        !unit.candidates.is_empty()
    });
    before - queue.len()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::capability::{Classifier, CapabilityError, ContentSynthesizer, PreliminaryVerdict};
    use crate::merge::KeywordSignal;
    use crate::store::MemoryStore;
    use crate::{NewEntityVersion, NewRelationVersion};
    use std::time::Duration;

    struct Joiner;

    impl ContentSynthesizer for Joiner {
        fn synthesize(&self, old: &str, fragments: &[String]) -> Result<String, CapabilityError> {
            Ok(format!("{} | {}", old, fragments.join(" | ")))
        }
    }

    /// Flags every candidate; merges pairs with equal names into the lower id,
    /// relates everything else.
    struct NameClassifier;

    impl Classifier for NameClassifier {
        fn classify_preliminary(
            &self,
            _entity: &EntityVersion,
            candidates: &[EntityVersion],
        ) -> Result<Vec<(EntityId, PreliminaryVerdict)>, CapabilityError> {
            Ok(candidates
                .iter()
                .map(|c| (c.entity_id, PreliminaryVerdict::PossibleMerge))
                .collect())
        }

        fn classify_detailed(
            &self,
            entity: &EntityVersion,
            candidate: &EntityVersion,
            _existing: &[RelationVersion],
        ) -> Result<DetailedVerdict, CapabilityError> {
            if entity.name == candidate.name {
                Ok(DetailedVerdict::Merge {
                    target: entity.entity_id.min(candidate.entity_id),
                })
            } else {
                Ok(DetailedVerdict::CreateRelation {
                    content: format!("{} appears with {}", entity.name, candidate.name),
                })
            }
        }
    }

    /// Fails or panics for chosen entities, records overlap otherwise.
    #[derive(Default)]
    struct Recorder {
        active: Mutex<BTreeSet<EntityId>>,
        overlaps: AtomicBool,
        fail_on: Option<EntityId>,
        panic_on: Option<EntityId>,
    }

    impl Classifier for Recorder {
        fn classify_preliminary(
            &self,
            entity: &EntityVersion,
            candidates: &[EntityVersion],
        ) -> Result<Vec<(EntityId, PreliminaryVerdict)>, CapabilityError> {
            if Some(entity.entity_id) == self.fail_on {
                return Err(CapabilityError::Unavailable("scripted".to_string()));
            }
            if Some(entity.entity_id) == self.panic_on {
                panic!("scripted panic");
            }
            let ids: BTreeSet<EntityId> = std::iter::once(entity.entity_id)
                .chain(candidates.iter().map(|c| c.entity_id))
                .collect();
            {
                let mut active = self.active.lock().unwrap();
                if !active.is_disjoint(&ids) {
                    self.overlaps.store(true, Ordering::SeqCst);
                }
                active.extend(ids.iter().copied());
            }
            std::thread::sleep(Duration::from_millis(2));
            let mut active = self.active.lock().unwrap();
            for id in &ids {
                active.remove(id);
            }
            Ok(Vec::new())
        }

        fn classify_detailed(
            &self,
            _entity: &EntityVersion,
            _candidate: &EntityVersion,
            _existing: &[RelationVersion],
        ) -> Result<DetailedVerdict, CapabilityError> {
            Ok(DetailedVerdict::NoAction)
        }
    }

    fn add(store: &MemoryStore, name: &str, content: &str) -> EntityVersion {
        store
            .put_entity_version(NewEntityVersion::new(None, name, content))
            .expect("put")
    }

    fn run(
        store: &MemoryStore,
        caps: &Capabilities,
        units: Vec<ConsolidationUnit>,
        pool_size: usize,
    ) -> ConsolidationReport {
        let mut config = EngineConfig::default();
        config.consolidation.pool_size = pool_size;
        let signal = KeywordSignal::default();
        let provenance = Provenance::default();
        Consolidator::new(store, caps, &config, &signal, &provenance).run(units, &PassControl::new())
    }

    #[test]
    fn reservation_is_all_or_nothing() {
        let mut table = ReservationTable::default();
        let first: BTreeSet<EntityId> = [EntityId(1), EntityId(2)].into();
        let second: BTreeSet<EntityId> = [EntityId(2), EntityId(3)].into();
        assert!(table.try_reserve(&first));
        assert!(!table.try_reserve(&second));
        assert!(!table.held.contains(&EntityId(3)));
        table.release(&first);
        assert!(table.try_reserve(&second));
    }

    #[test]
    fn prune_strips_merged_and_dispatched() {
        let mut queue: VecDeque<ConsolidationUnit> = vec![
            ConsolidationUnit::new(EntityId(1), [EntityId(2)]),
            ConsolidationUnit::new(EntityId(2), [EntityId(1), EntityId(3)]),
            ConsolidationUnit::new(EntityId(4), [EntityId(5)]),
        ]
        .into();
        let merged: BTreeSet<EntityId> = [EntityId(5)].into();
        let dispatched: BTreeSet<_> = [pair(EntityId(1), EntityId(2))].into();
        assert_eq!(prune(&mut queue, &merged, &dispatched), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].entity, EntityId(2));
        assert_eq!(queue[0].candidates, [EntityId(3)].into());
    }

    #[test]
    fn duplicates_merge_and_others_relate() {
        let store = MemoryStore::new();
        let a1 = add(&store, "Alice", "engineer");
        let a2 = add(&store, "Alice", "likes tea");
        let bob = add(&store, "Bob", "designer");
        let caps = Capabilities::none()
            .with_classifier(Arc::new(NameClassifier))
            .with_synthesizer(Arc::new(Joiner));

        let report = run(
            &store,
            &caps,
            vec![
                ConsolidationUnit::new(a1.entity_id, [a2.entity_id, bob.entity_id]),
                ConsolidationUnit::new(a2.entity_id, [a1.entity_id]),
            ],
            2,
        );

        assert!(report.failures.is_empty(), "{:?}", report.failures);
        assert_eq!(report.merge_count(), 1);
        assert_eq!(report.relation_count(), 1);
        assert_eq!(store.current_entity(a2.entity_id).expect("read"), None);
        assert_eq!(store.entity_version_count(a1.entity_id).expect("count"), 2);
        assert_eq!(store.relations_between(a1.entity_id, bob.entity_id).expect("rels").len(), 1);
    }

    #[test]
    fn lexical_guard_runs_without_classifier() {
        let store = MemoryStore::new();
        let a = add(&store, "Robert", "a person");
        let b = add(&store, "Bob", "a person");
        store
            .put_relation_version(NewRelationVersion::new(
                None,
                a.absolute_id,
                b.absolute_id,
                "Bob is also known as Robert",
            ))
            .expect("relate");
        let caps = Capabilities::none().with_synthesizer(Arc::new(Joiner));

        let report = run(&store, &caps, vec![ConsolidationUnit::new(a.entity_id, [b.entity_id])], 1);
        assert_eq!(report.merge_count(), 1);
        assert_eq!(store.current_entities().expect("current").len(), 1);
        assert!(store.self_referential_relations(a.entity_id).expect("rels").is_empty());
    }

    #[test]
    fn failures_are_isolated() {
        let store = MemoryStore::new();
        let ids: Vec<EntityId> = (0..6).map(|i| add(&store, &format!("E{}", i), "x").entity_id).collect();
        let caps = Capabilities::none().with_classifier(Arc::new(Recorder {
            fail_on: Some(ids[0]),
            panic_on: Some(ids[2]),
            ..Recorder::default()
        }));
        let units = vec![
            ConsolidationUnit::new(ids[0], [ids[1]]),
            ConsolidationUnit::new(ids[2], [ids[3]]),
            ConsolidationUnit::new(ids[4], [ids[5]]),
        ];

        let report = run(&store, &caps, units, 3);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].entity, ids[4]);
        let failed: BTreeSet<EntityId> = report.failures.iter().map(|f| f.entity).collect();
        assert_eq!(failed, [ids[0], ids[2]].into());
        assert!(report.failures.iter().any(|f| f.reason.contains("panicked")));
    }

    /// Merges `absorb` into `keep`, and is unavailable for anything else.
    struct MergeThenFail {
        keep: EntityId,
        absorb: EntityId,
    }

    impl Classifier for MergeThenFail {
        fn classify_preliminary(
            &self,
            _entity: &EntityVersion,
            candidates: &[EntityVersion],
        ) -> Result<Vec<(EntityId, PreliminaryVerdict)>, CapabilityError> {
            Ok(candidates
                .iter()
                .map(|c| (c.entity_id, PreliminaryVerdict::PossibleMerge))
                .collect())
        }

        fn classify_detailed(
            &self,
            _entity: &EntityVersion,
            candidate: &EntityVersion,
            _existing: &[RelationVersion],
        ) -> Result<DetailedVerdict, CapabilityError> {
            if candidate.entity_id == self.absorb {
                Ok(DetailedVerdict::Merge { target: self.keep })
            } else {
                Err(CapabilityError::Unavailable("down".to_string()))
            }
        }
    }

    #[test]
    fn failed_unit_keeps_its_committed_merges() {
        let store = MemoryStore::new();
        let ids: Vec<EntityId> = (1..=4).map(|i| add(&store, &format!("E{}", i), "x").entity_id).collect();
        let caps = Capabilities::none()
            .with_classifier(Arc::new(MergeThenFail {
                keep: ids[0],
                absorb: ids[1],
            }))
            .with_synthesizer(Arc::new(Joiner));
        let units = vec![
            ConsolidationUnit::new(ids[0], [ids[1], ids[2]]),
            ConsolidationUnit::new(ids[1], [ids[3]]),
        ];

        let report = run(&store, &caps, units, 1);
        assert_eq!(store.entity_version_count(ids[1]).expect("count"), 0);
        assert_eq!(report.merge_count(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].entity, ids[0]);
        assert_eq!(report.failures[0].applied.merges[0].target, ids[0]);
        // The second unit names a merged-away entity and is skipped.
        assert_eq!(report.skipped, 1);
        assert!(report.outcomes.is_empty());
    }

    #[test]
    fn vanished_entities_are_skipped() {
        let store = MemoryStore::new();
        let alice = add(&store, "Alice", "engineer");
        let bob = add(&store, "Bob", "designer");
        let caps = Capabilities::none()
            .with_classifier(Arc::new(NameClassifier))
            .with_synthesizer(Arc::new(Joiner));
        let units = vec![
            ConsolidationUnit::new(EntityId(404), [alice.entity_id]),
            ConsolidationUnit::new(bob.entity_id, [EntityId(405)]),
        ];

        let report = run(&store, &caps, units, 2);
        assert!(report.failures.is_empty(), "{:?}", report.failures);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].entity, bob.entity_id);
        assert_eq!(report.relation_count(), 0);
    }

    #[test]
    fn unchanged_relation_is_not_counted() {
        let store = MemoryStore::new();
        let alice = add(&store, "Alice", "engineer");
        let bob = add(&store, "Bob", "designer");
        store
            .put_relation_version(NewRelationVersion::new(
                None,
                alice.absolute_id,
                bob.absolute_id,
                "Alice appears with Bob",
            ))
            .expect("relate");
        let caps = Capabilities::none()
            .with_classifier(Arc::new(NameClassifier))
            .with_synthesizer(Arc::new(Joiner));

        let report = run(&store, &caps, vec![ConsolidationUnit::new(alice.entity_id, [bob.entity_id])], 1);
        assert!(report.failures.is_empty(), "{:?}", report.failures);
        assert_eq!(report.relation_count(), 0);
        assert_eq!(
            store.relations_between(alice.entity_id, bob.entity_id).expect("rels").len(),
            1
        );
    }

    #[test]
    fn concurrent_units_never_overlap() {
        let store = MemoryStore::new();
        let ids: Vec<EntityId> = (0..40).map(|i| add(&store, &format!("N{}", i), "x").entity_id).collect();
        let recorder = Arc::new(Recorder::default());
        let caps = Capabilities::none().with_classifier(recorder.clone());
        // Each unit overlaps its neighbours.
        let units: Vec<ConsolidationUnit> = (0..ids.len())
            .map(|i| {
                ConsolidationUnit::new(
                    ids[i],
                    [ids[(i + 1) % ids.len()], ids[(i + 7) % ids.len()]],
                )
            })
            .collect();

        let report = run(&store, &caps, units, 8);
        assert!(!recorder.overlaps.load(Ordering::SeqCst));
        assert!(report.failures.is_empty());
        assert_eq!(report.outcomes.len() + report.skipped, ids.len());
    }

    #[test]
    fn cancelled_pass_dispatches_nothing() {
        let store = MemoryStore::new();
        let a = add(&store, "A", "x");
        let b = add(&store, "B", "x");
        let caps = Capabilities::none();
        let config = EngineConfig::default();
        let signal = KeywordSignal::default();
        let provenance = Provenance::default();
        let control = PassControl::new();
        control.cancel();

        let report = Consolidator::new(&store, &caps, &config, &signal, &provenance)
            .run(vec![ConsolidationUnit::new(a.entity_id, [b.entity_id])], &control);
        assert_eq!(report.cancelled, 1);
        assert!(report.outcomes.is_empty());
    }

    #[test]
    fn sweep_repairs_existing_self_references() {
        let store = MemoryStore::new();
        let a = add(&store, "A", "first");
        let a2 = store
            .put_entity_version(NewEntityVersion::new(Some(a.entity_id), "A", "second"))
            .expect("put");
        let b = add(&store, "B", "other");
        store
            .put_relation_version(NewRelationVersion::new(None, a.absolute_id, a2.absolute_id, "self note"))
            .expect("relate");
        let caps = Capabilities::none().with_synthesizer(Arc::new(Joiner));

        let report = run(&store, &caps, vec![ConsolidationUnit::new(a.entity_id, [b.entity_id])], 1);
        assert_eq!(report.repaired_relations, 1);
        let current = store.current_entity(a.entity_id).expect("read").expect("present");
        assert!(current.content.contains("self note"));
    }
}
