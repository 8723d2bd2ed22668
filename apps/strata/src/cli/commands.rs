//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.
//!
//! The engine is synchronous: every command opens the session and does its
//! work inside `spawn_blocking`, which is also where the HTTP provider's
//! blocking calls are allowed.

use crate::config::AppConfig;
use crate::provider::HttpProvider;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_core::merge::current_per_relation;
use strata_core::{
    CacheSource, Capabilities, DirCacheSource, EntityId, GraphMetrics, LocalEmbedder,
    MemoryCacheId, PassControl, PathQuery, SearchQuery, Session, SimilarityMethod, StrataError,
    truncate_chars,
};
use tokio::runtime::Handle;

/// Shared state of one CLI invocation.
#[derive(Debug, Clone)]
pub struct Context {
    pub database: PathBuf,
    pub json_mode: bool,
    pub config: AppConfig,
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Providers for this invocation.
///
/// Without a `[provider]` section only the local embedder is available:
/// merges that need synthesis fail and consolidation applies the lexical
/// guard only.
pub fn build_capabilities(config: &AppConfig, handle: Handle) -> Result<Capabilities, StrataError> {
    let local = Arc::new(LocalEmbedder::default());
    let Some(provider_config) = &config.provider else {
        return Ok(Capabilities::none().with_embedder(local));
    };
    let provider = Arc::new(HttpProvider::new(provider_config, handle)?);
    tracing::debug!(url = provider.base_url(), "using remote capability provider");
    let caps = Capabilities::none()
        .with_classifier(provider.clone())
        .with_synthesizer(provider.clone());
    Ok(if provider_config.embeddings {
        caps.with_embedder(provider)
    } else {
        caps.with_embedder(local)
    })
}

/// Open the database as a session.
pub fn open_session(ctx: &Context, caps: Capabilities) -> Result<Session, StrataError> {
    Session::with_redb(&ctx.database)?
        .with_capabilities(caps)
        .with_config(ctx.config.engine.clone())
}

/// Run `f` with an open session on the blocking pool.
async fn with_session<T, F>(ctx: &Context, f: F) -> Result<T, StrataError>
where
    T: Send + 'static,
    F: FnOnce(&Session) -> Result<T, StrataError> + Send + 'static,
{
    let caps = build_capabilities(&ctx.config, Handle::current())?;
    let ctx = ctx.clone();
    tokio::task::spawn_blocking(move || {
        let session = open_session(&ctx, caps)?;
        f(&session)
    })
    .await
    .map_err(|e| StrataError::Storage(format!("blocking task failed: {}", e)))?
}

/// Print `value` as JSON in JSON mode, otherwise run `human`.
fn emit<T: Serialize>(ctx: &Context, value: &T, human: impl FnOnce(&T)) -> Result<(), StrataError> {
    if ctx.json_mode {
        let text = serde_json::to_string_pretty(value)
            .map_err(|e| StrataError::Serialization(e.to_string()))?;
        println!("{}", text);
    } else {
        human(value);
    }
    Ok(())
}

/// Parse a similarity method name.
pub fn parse_method(name: &str) -> Result<SimilarityMethod, StrataError> {
    match name {
        "embedding" => Ok(SimilarityMethod::Embedding),
        "sequence-ratio" | "sequence_ratio" => Ok(SimilarityMethod::SequenceRatio),
        "jaccard" => Ok(SimilarityMethod::Jaccard),
        "ngram" => Ok(SimilarityMethod::NgramPrecision),
        other => Err(StrataError::MalformedInput(format!(
            "unknown similarity method '{}'",
            other
        ))),
    }
}

fn parse_time(text: &str) -> Result<DateTime<Utc>, StrataError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StrataError::MalformedInput(format!("invalid time '{}': {}", text, e)))
}

// =============================================================================
// INIT / STATUS
// =============================================================================

/// Initialize new database.
pub async fn cmd_init(ctx: &Context, force: bool) -> Result<(), StrataError> {
    if ctx.database.exists() {
        if !force {
            return Err(StrataError::Storage(
                "Database already exists. Use --force to overwrite.".to_string(),
            ));
        }
        std::fs::remove_file(&ctx.database)
            .map_err(|e| StrataError::Storage(format!("remove old database: {}", e)))?;
    }
    with_session(ctx, |_| Ok(())).await?;
    println!("Initialized new database at {:?}", ctx.database);
    Ok(())
}

/// Show graph statistics.
pub async fn cmd_status(ctx: &Context) -> Result<(), StrataError> {
    let metrics = with_session(ctx, GraphMetrics::from_session).await?;
    emit(ctx, &metrics, |m| {
        println!("Strata Graph Status");
        println!("===================");
        println!("Database: {:?}", ctx.database);
        println!();
        println!("Entities:          {} ({} versions)", m.store.entities, m.store.entity_versions);
        println!("Relations:         {} ({} versions)", m.store.relations, m.store.relation_versions);
        println!("Multi-version:     {}", m.multi_version_entities);
        println!("Isolated:          {}", m.isolated_entities);
        println!("Self-referential:  {}", m.self_referential_relations);
        println!("Density:           {} per thousand", m.density_per_thousand());
        for degree in &m.most_connected {
            println!("  {} {} ({} relations)", degree.entity_id, degree.name, degree.relations);
        }
    })
}

// =============================================================================
// ENTITY / RELATIONS
// =============================================================================

pub async fn cmd_entity_show(ctx: &Context, id: u64) -> Result<(), StrataError> {
    let entity = EntityId(id);
    let current = with_session(ctx, move |s| {
        s.store()
            .current_entity(entity)?
            .ok_or(StrataError::EntityNotFound(entity))
    })
    .await?;
    emit(ctx, &current, |v| {
        println!("{} [{}] {}", v.entity_id, v.absolute_id, v.name);
        println!("created: {}", v.created_at.to_rfc3339());
        println!("{}", v.content);
    })
}

pub async fn cmd_entity_versions(ctx: &Context, id: u64) -> Result<(), StrataError> {
    let entity = EntityId(id);
    let versions = with_session(ctx, move |s| {
        let versions = s.store().entity_versions(entity)?;
        if versions.is_empty() {
            return Err(StrataError::EntityNotFound(entity));
        }
        Ok(versions)
    })
    .await?;
    emit(ctx, &versions, |versions| {
        for v in versions {
            println!("{} {} {}: {}", v.absolute_id, v.created_at.to_rfc3339(), v.name, v.content);
        }
    })
}

pub async fn cmd_entity_at(ctx: &Context, id: u64, time: &str) -> Result<(), StrataError> {
    let entity = EntityId(id);
    let at = parse_time(time)?;
    let version = with_session(ctx, move |s| {
        s.store()
            .entity_version_at(entity, at)?
            .ok_or(StrataError::EntityNotFound(entity))
    })
    .await?;
    emit(ctx, &version, |v| {
        println!("{} [{}] {} (as of {})", v.entity_id, v.absolute_id, v.name, v.created_at.to_rfc3339());
        println!("{}", v.content);
    })
}

/// Every entity as it stood at `time`.
pub async fn cmd_snapshot(ctx: &Context, time: &str) -> Result<(), StrataError> {
    let at = parse_time(time)?;
    let versions = with_session(ctx, move |s| s.store().current_entities_before(at)).await?;
    emit(ctx, &versions, |versions| {
        println!("{} entities as of {}", versions.len(), at.to_rfc3339());
        for v in versions {
            println!("  {} {}: {}", v.entity_id, v.name, truncate_chars(&v.content, 80));
        }
    })
}

pub async fn cmd_relations_between(ctx: &Context, a: u64, b: u64, all: bool) -> Result<(), StrataError> {
    let (a, b) = (EntityId(a), EntityId(b));
    let relations = with_session(ctx, move |s| {
        let rows = s.store().relations_between(a, b)?;
        Ok(if all { rows } else { current_per_relation(rows) })
    })
    .await?;
    emit(ctx, &relations, |relations| {
        if relations.is_empty() {
            println!("No relations between {} and {}", a, b);
        }
        for r in relations {
            println!("{} [{}] {}", r.relation_id, r.absolute_id, r.content);
        }
    })
}

// =============================================================================
// SEARCH / PATHS
// =============================================================================

/// Arguments of the `search` command.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub text: String,
    pub content: Option<String>,
    pub method: SimilarityMethod,
    pub threshold: Option<f32>,
    pub limit: usize,
    pub relations: bool,
}

pub async fn cmd_search(ctx: &Context, request: SearchRequest) -> Result<(), StrataError> {
    let threshold = request
        .threshold
        .unwrap_or(ctx.config.engine.similarity.threshold);
    if request.relations {
        let hits = with_session(ctx, move |s| {
            s.similarity()
                .search_relations(&request.text, request.method, threshold, request.limit)
        })
        .await?;
        return emit(ctx, &hits, |hits| {
            for hit in hits {
                println!("{:.3} {} {}", hit.score, hit.relation.relation_id, hit.relation.content);
            }
        });
    }

    let hits = with_session(ctx, move |s| {
        let mut query = SearchQuery::new(request.text)
            .method(request.method)
            .threshold(threshold)
            .max_results(request.limit);
        if let Some(content) = request.content {
            query = query.content(content);
        }
        s.similarity().search(&query)
    })
    .await?;
    emit(ctx, &hits, |hits| {
        if hits.is_empty() {
            println!("No matches");
        }
        for hit in hits {
            println!("{:.3} {} {}", hit.score, hit.entity.entity_id, hit.entity.name);
        }
    })
}

pub async fn cmd_paths(
    ctx: &Context,
    from: u64,
    to: u64,
    max_hops: Option<usize>,
    max_paths: Option<usize>,
) -> Result<(), StrataError> {
    let defaults = &ctx.config.engine.path;
    let query = PathQuery::new(EntityId(from), EntityId(to))
        .max_hops(max_hops.unwrap_or(defaults.max_hops))
        .max_paths(max_paths.unwrap_or(defaults.max_paths));
    let result = with_session(ctx, move |s| s.path_search().find_paths(&query)).await?;
    emit(ctx, &result, |result| match result.shortest_length {
        None => println!("No path within {} hops", query.max_hops),
        Some(shortest) => {
            println!("{} path(s), shortest {} hop(s)", result.paths.len(), shortest);
            for path in &result.paths {
                println!("  {}", path.description);
            }
        }
    })
}

// =============================================================================
// MERGE / CONSOLIDATE
// =============================================================================

pub async fn cmd_merge(ctx: &Context, target: u64, sources: Vec<u64>) -> Result<(), StrataError> {
    let target = EntityId(target);
    let sources: Vec<EntityId> = sources.into_iter().map(EntityId).collect();
    let report = with_session(ctx, move |s| s.merge_engine().merge(target, &sources)).await?;
    emit(ctx, &report, |r| {
        println!(
            "Merged {} entities into {} ({} versions rewritten, {} self-referential relations folded)",
            r.sources.len(),
            r.target,
            r.stats.versions_rewritten,
            r.relations_removed
        );
    })
}

pub async fn cmd_consolidate(ctx: &Context, dry_run: bool) -> Result<(), StrataError> {
    if dry_run {
        let units = with_session(ctx, |s| s.consolidator().plan()).await?;
        return emit(ctx, &units, |units| {
            println!("{} unit(s) planned", units.len());
            for unit in units {
                let ids: Vec<String> = unit.candidates.iter().map(ToString::to_string).collect();
                println!("  {} -> {}", unit.entity, ids.join(", "));
            }
        });
    }

    let control = PassControl::new();
    let on_interrupt = control.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing in-flight units");
            on_interrupt.cancel();
        }
    });
    let report = with_session(ctx, move |s| {
        let consolidator = s.consolidator();
        let units = consolidator.plan()?;
        Ok(consolidator.run(units, &control))
    })
    .await;
    watcher.abort();
    let report = report?;

    emit(ctx, &report, |r| {
        println!("Consolidation finished");
        println!("  Units completed:   {}", r.outcomes.len());
        println!("  Units skipped:     {}", r.skipped);
        println!("  Units cancelled:   {}", r.cancelled);
        println!("  Merges:            {}", r.merge_count());
        println!("  Relations written: {}", r.relation_count());
        println!("  Repaired:          {}", r.repaired_relations);
        for failure in &r.failures {
            println!("  FAILED {}: {}", failure.entity, failure.reason);
        }
    })
}

// =============================================================================
// CACHE
// =============================================================================

pub fn cmd_cache_show(ctx: &Context, dir: &Path, id: &str) -> Result<(), StrataError> {
    let source = DirCacheSource::new(dir);
    let cache_id = MemoryCacheId::new(id);
    let cache = source
        .load(&cache_id)?
        .ok_or_else(|| StrataError::MalformedInput(format!("no memory cache '{}' in {:?}", id, dir)))?;
    emit(ctx, &cache, |c| {
        println!("{} ({}, {})", c.id.as_str(), c.doc_name, c.physical_time.to_rfc3339());
        if let Some(activity) = &c.activity_type {
            println!("activity: {}", activity);
        }
        println!();
        println!("{}", c.content);
    })
}
