//! bunkreq-sync - request provenance and incremental sync
//!
//! Staff and scheduled-job entry point. Every command prints its result as
//! JSON on stdout; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bunkreq_common::config::{load_config, resolve_database_path};
use bunkreq_sync::models::RequestType;
use bunkreq_sync::services::{MergeRequest, SplitSource, StaticRequestParser, SyncInput};
use bunkreq_sync::SyncEngine;

/// Command-line arguments for bunkreq-sync
#[derive(Parser, Debug)]
#[command(name = "bunkreq-sync")]
#[command(about = "Bunk request provenance and incremental synchronization")]
#[command(version)]
struct Args {
    /// TOML config file
    #[arg(short, long, global = true, env = "BUNKREQ_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database file
    #[arg(short, long, global = true, env = "BUNKREQ_DATABASE")]
    database: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or migrate the database
    Init,
    /// Import source rows and update derived requests
    Sync {
        /// JSON file with rows, pre-parsed texts and people
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Reconcile requests after source rows changed
    Invalidate {
        #[arg(required = true)]
        original_ids: Vec<String>,
    },
    /// Merge requests into the one named by --keep
    Merge {
        #[arg(long)]
        keep: String,
        #[arg(long = "type", value_parser = parse_request_type)]
        final_type: RequestType,
        #[arg(required = true, num_args = 2..)]
        request_ids: Vec<String>,
    },
    /// Split absorbed requests back out of a merged request
    Split {
        request_id: String,
        /// absorbed_id[:type[:target_id]]
        #[arg(long = "absorbed", required = true, value_parser = parse_split_source)]
        absorbed: Vec<SplitSource>,
    },
    /// Show the source links of a request
    Links { bunk_request_id: String },
    /// Delete every request of a year with its links
    ClearYear { year: i32 },
}

#[derive(Debug, thiserror::Error)]
enum ArgError {
    #[error("unknown request type '{0}'")]
    RequestType(String),
    #[error("invalid target id '{0}'")]
    TargetId(String),
    #[error("expected absorbed_id[:type[:target_id]], got '{0}'")]
    SplitSource(String),
}

fn parse_request_type(value: &str) -> std::result::Result<RequestType, ArgError> {
    value
        .parse()
        .map_err(|_| ArgError::RequestType(value.to_string()))
}

fn parse_split_source(value: &str) -> std::result::Result<SplitSource, ArgError> {
    let mut parts = value.split(':');
    let absorbed_request_id = match parts.next() {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => return Err(ArgError::SplitSource(value.to_string())),
    };
    let new_type = match parts.next() {
        Some(t) if !t.is_empty() => Some(parse_request_type(t)?),
        _ => None,
    };
    let new_target_id = match parts.next() {
        Some(t) if !t.is_empty() => Some(
            t.parse::<i64>()
                .map_err(|_| ArgError::TargetId(t.to_string()))?,
        ),
        _ => None,
    };
    if parts.next().is_some() {
        return Err(ArgError::SplitSource(value.to_string()));
    }
    Ok(SplitSource {
        absorbed_request_id,
        new_type,
        new_target_id,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(args.config.as_deref()).context("Failed to load configuration")?;

    // Initialize tracing (RUST_LOG wins over the configured level)
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let db_path = resolve_database_path(args.database.as_deref(), &config);
    info!("Database: {}", db_path.display());

    let engine = SyncEngine::open(&db_path, config)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    match args.command {
        Command::Init => {
            info!("Database ready");
            print_json(&serde_json::json!({ "database": db_path.display().to_string() }))?;
        }
        Command::Sync { input } => {
            let input = SyncInput::load(&input)
                .with_context(|| format!("Failed to read sync input {}", input.display()))?;
            let parser = Arc::new(StaticRequestParser::from_input(&input));
            let report = engine
                .pipeline(parser, engine.store_lookup())
                .run(&input.rows)
                .await
                .context("Sync run failed")?;
            print_json(&report)?;
        }
        Command::Invalidate { original_ids } => {
            let result = engine.invalidation.handle_source_changes(&original_ids).await;
            print_json(&result)?;
        }
        Command::Merge {
            keep,
            final_type,
            request_ids,
        } => {
            let outcome = engine
                .merge_split
                .merge(&MergeRequest {
                    request_ids,
                    keep_target_from: keep,
                    final_type,
                })
                .await
                .context("Merge rejected")?;
            print_json(&outcome)?;
        }
        Command::Split {
            request_id,
            absorbed,
        } => {
            let outcome = engine
                .merge_split
                .split(&request_id, &absorbed)
                .await
                .context("Split rejected")?;
            print_json(&outcome)?;
        }
        Command::Links { bunk_request_id } => {
            let links = engine.provenance.links_for(&bunk_request_id).await?;
            print_json(&links)?;
        }
        Command::ClearYear { year } => {
            let report = engine
                .requests
                .clear_year(year, &engine.provenance)
                .await
                .with_context(|| format!("Failed to clear year {}", year))?;
            print_json(&report)?;
        }
    }

    Ok(())
}
