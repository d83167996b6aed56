//! Database schema migrations
//!
//! Versioned, idempotent migrations tracked in the `schema_version` table.
//!
//! # Migration Guidelines
//!
//! 1. **Never modify existing migrations** - databases in the field were built from them
//! 2. **Always add new migrations** - one function per schema change
//! 3. **Stay idempotent** - `IF NOT EXISTS` everywhere, safe to run twice

use super::{BUNK_REQUESTS, SOURCE_LINKS};
use crate::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// Current schema version
///
/// **IMPORTANT:** Increment this when adding new migrations
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Get current schema version from database
///
/// Returns 0 if schema_version table doesn't exist or has no rows
pub async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let table_exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM sqlite_master
            WHERE type='table' AND name='schema_version'
        )
        "#,
    )
    .fetch_one(pool)
    .await?;

    if !table_exists {
        return Ok(0);
    }

    let version: Option<i32> =
        sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;

    Ok(version.unwrap_or(0))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;

    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let current_version = get_schema_version(pool).await?;

    if current_version == CURRENT_SCHEMA_VERSION {
        info!("Database schema is up to date (v{})", current_version);
        return Ok(());
    }

    if current_version > CURRENT_SCHEMA_VERSION {
        warn!(
            "Database schema version ({}) is newer than code version ({})",
            current_version, CURRENT_SCHEMA_VERSION
        );
        return Ok(());
    }

    info!(
        "Running database migrations: v{} -> v{}",
        current_version, CURRENT_SCHEMA_VERSION
    );

    if current_version < 1 {
        migrate_v1(pool).await?;
        set_schema_version(pool, 1).await?;
        info!("Migration v1 completed");
    }

    if current_version < 2 {
        migrate_v2(pool).await?;
        set_schema_version(pool, 2).await?;
        info!("Migration v2 completed");
    }

    Ok(())
}

/// Migration v1: uniqueness of (bunk_request, original_request) source links
///
/// A retried batch insert must hit this index and be skipped, never
/// produce a second copy of the same provenance row.
async fn migrate_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration v1: unique source link index");

    let sql = format!(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_source_links_unique
        ON records (
            json_extract(data, '$.bunk_request'),
            json_extract(data, '$.original_request')
        )
        WHERE collection = '{}'
        "#,
        SOURCE_LINKS
    );
    sqlx::query(&sql).execute(pool).await?;

    Ok(())
}

/// Migration v2: lookup indexes for invalidation scans and identity matching
async fn migrate_v2(pool: &SqlitePool) -> Result<()> {
    info!("Running migration v2: provenance and request lookup indexes");

    let by_original = format!(
        r#"
        CREATE INDEX IF NOT EXISTS idx_source_links_original
        ON records (json_extract(data, '$.original_request'))
        WHERE collection = '{}'
        "#,
        SOURCE_LINKS
    );
    sqlx::query(&by_original).execute(pool).await?;

    let by_requester = format!(
        r#"
        CREATE INDEX IF NOT EXISTS idx_bunk_requests_requester
        ON records (
            json_extract(data, '$.requester_id'),
            json_extract(data, '$.year')
        )
        WHERE collection = '{}'
        "#,
        BUNK_REQUESTS
    );
    sqlx::query(&by_requester).execute(pool).await?;

    Ok(())
}
