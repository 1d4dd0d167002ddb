//! # Database Migrations
//!
//! Embedded SQL migrations for the snapshot catalog.
//!
//! ## What Is Migrated
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Catalog vs. Snapshot Tables                        │
//! │                                                                         │
//! │  migrations/sqlite/ (embedded, versioned)                              │
//! │  ├── snapshots          one row per snapshot                           │
//! │  ├── snapshot_tables    TableSpec JSON + physical table name           │
//! │  └── pull_checkpoints   resumable pull progress                        │
//! │                                                                         │
//! │  created at runtime by SchemaRepository::create_schema                 │
//! │  └── s_<snapshot>__<table>   records + side-columns                    │
//! │      (never migrated: columns are only ever added)                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Adding New Migrations
//!
//! 1. Create a new file in `migrations/sqlite/` with the next sequence number
//! 2. Name format: `NNN_description.sql`
//! 3. Write idempotent SQL (use `IF NOT EXISTS` where possible)
//! 4. **NEVER** modify existing migrations - always add new ones

use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;

/// Embedded migrations from the `migrations/sqlite` directory.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Brings the catalog up to date. Already-applied versions are skipped, and
/// each pending file runs in its own transaction, in filename order.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    MIGRATOR.run(pool).await?;
    debug!(versions = MIGRATOR.migrations.len(), "Catalog migrated");
    Ok(())
}

/// `(embedded, applied)` migration counts.
pub async fn migration_status(pool: &SqlitePool) -> DbResult<(usize, usize)> {
    let applied: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1")
            .fetch_one(pool)
            .await?;
    Ok((MIGRATOR.migrations.len(), applied as usize))
}
