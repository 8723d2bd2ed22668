//! # Strata CLI Module
//!
//! This module implements the CLI interface for Strata.
//!
//! ## Available Commands
//!
//! - `init` - Initialize a new database
//! - `status` - Show graph statistics
//! - `entity show|versions|at` - Inspect an entity's history
//! - `snapshot` - Every entity as of a point in time
//! - `relations between` - Relations connecting two entities
//! - `search` - Similarity search over entities or relations
//! - `paths` - Multi-hop paths between two entities
//! - `merge` - Merge entities into a target
//! - `consolidate` - Run a deduplication pass
//! - `cache show` - Print a memory cache

mod commands;

use crate::config::AppConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use strata_core::StrataError;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Strata - versioned knowledge graph maintenance
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the version database
    #[arg(short = 'D', long, global = true, default_value = "strata.redb")]
    pub database: PathBuf,

    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new empty database
    Init {
        /// Replace an existing database
        #[arg(short, long)]
        force: bool,
    },

    /// Show graph statistics
    Status,

    /// Inspect an entity
    Entity {
        #[command(subcommand)]
        command: EntityCommand,
    },

    /// Every entity as it stood at a point in time (RFC 3339)
    Snapshot { time: String },

    /// Inspect relations
    Relations {
        #[command(subcommand)]
        command: RelationsCommand,
    },

    /// Similarity search
    Search {
        /// Entity name (or relation text with --relations)
        text: String,

        /// Entity content to compare as well
        #[arg(long)]
        content: Option<String>,

        /// embedding, sequence-ratio, jaccard or ngram
        #[arg(short, long, default_value = "embedding")]
        method: String,

        /// Minimum score (defaults to the configured threshold)
        #[arg(short, long)]
        threshold: Option<f32>,

        /// Maximum results
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Search relation contents instead of entities
        #[arg(long)]
        relations: bool,
    },

    /// Find paths between two entities
    Paths {
        from: u64,
        to: u64,

        /// Maximum hops (1-5, defaults to the configured value)
        #[arg(long)]
        max_hops: Option<usize>,

        /// Maximum paths (defaults to the configured value)
        #[arg(long)]
        max_paths: Option<usize>,
    },

    /// Merge source entities into a target
    Merge {
        target: u64,

        #[arg(required = true)]
        sources: Vec<u64>,
    },

    /// Run a consolidation pass over the whole graph
    Consolidate {
        /// Only print the planned units
        #[arg(long)]
        dry_run: bool,
    },

    /// Memory caches
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum EntityCommand {
    /// Current version
    Show { id: u64 },
    /// Every version, oldest first
    Versions { id: u64 },
    /// The version current at a point in time (RFC 3339)
    At { id: u64, time: String },
}

#[derive(Subcommand, Debug)]
pub enum RelationsCommand {
    /// Relations connecting two entities
    Between {
        a: u64,
        b: u64,

        /// Include superseded versions
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// Print one memory cache
    Show {
        id: String,

        /// Directory holding `<id>.json` files
        #[arg(long, default_value = "caches")]
        dir: PathBuf,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), StrataError> {
    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::from_env()?,
    };
    let ctx = Context {
        database: cli.database,
        json_mode: cli.json_mode,
        config,
    };

    match cli.command {
        Some(Commands::Init { force }) => cmd_init(&ctx, force).await,
        Some(Commands::Status) | None => cmd_status(&ctx).await,
        Some(Commands::Entity { command }) => match command {
            EntityCommand::Show { id } => cmd_entity_show(&ctx, id).await,
            EntityCommand::Versions { id } => cmd_entity_versions(&ctx, id).await,
            EntityCommand::At { id, time } => cmd_entity_at(&ctx, id, &time).await,
        },
        Some(Commands::Snapshot { time }) => cmd_snapshot(&ctx, &time).await,
        Some(Commands::Relations {
            command: RelationsCommand::Between { a, b, all },
        }) => cmd_relations_between(&ctx, a, b, all).await,
        Some(Commands::Search {
            text,
            content,
            method,
            threshold,
            limit,
            relations,
        }) => {
            let request = SearchRequest {
                text,
                content,
                method: parse_method(&method)?,
                threshold,
                limit,
                relations,
            };
            cmd_search(&ctx, request).await
        }
        Some(Commands::Paths {
            from,
            to,
            max_hops,
            max_paths,
        }) => cmd_paths(&ctx, from, to, max_hops, max_paths).await,
        Some(Commands::Merge { target, sources }) => cmd_merge(&ctx, target, sources).await,
        Some(Commands::Consolidate { dry_run }) => cmd_consolidate(&ctx, dry_run).await,
        Some(Commands::Cache {
            command: CacheCommand::Show { id, dir },
        }) => cmd_cache_show(&ctx, &dir, &id),
    }
}
