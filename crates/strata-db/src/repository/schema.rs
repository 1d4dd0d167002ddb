//! # Schema Repository
//!
//! Materializes table specs as physical tables and keeps the catalog.
//!
//! ## create_schema Is Additive
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  CREATE TABLE IF NOT EXISTS s_<snap>__<table> (...)                     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  pragma_table_info ──► existing columns                                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ALTER TABLE ... ADD COLUMN   for every missing field / side-column     │
//! │       │                        (columns are never dropped or retyped)   │
//! │       ▼                                                                 │
//! │  snapshot_tables.spec_json ← latest TableSpec                           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashSet;
use strata_core::TableSpec;
use tracing::{debug, info};

use super::{
    ensure_identifier, quote_ident, sql_type, SnapshotTable, COL_DIRTY, COL_PUSH_CLAIM,
    SIDE_COLUMNS,
};
use crate::error::{DbError, DbResult};

/// Repository for the snapshot catalog and physical tables.
#[derive(Debug, Clone)]
pub struct SchemaRepository {
    pool: SqlitePool,
}

impl SchemaRepository {
    /// Creates a new SchemaRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SchemaRepository { pool }
    }

    /// Creates (or extends) the physical tables of a snapshot.
    ///
    /// Idempotent. Re-running with a wider spec adds the new columns and
    /// keeps every existing row.
    pub async fn create_schema(
        &self,
        snapshot_id: &str,
        tables: &[TableSpec],
    ) -> DbResult<Vec<SnapshotTable>> {
        ensure_identifier(snapshot_id)?;
        let bound = tables
            .iter()
            .map(|spec| {
                spec.validate()?;
                SnapshotTable::new(snapshot_id, spec.clone())
            })
            .collect::<DbResult<Vec<_>>>()?;

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT OR IGNORE INTO snapshots (id, created_at) VALUES (?1, ?2)")
            .bind(snapshot_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        for table in &bound {
            let added = ensure_physical_table(&mut *tx, table).await?;
            let spec_json = serde_json::to_string(&table.spec)?;

            sqlx::query(
                r#"
                INSERT INTO snapshot_tables (
                    snapshot_id, table_ws_id, physical_name, spec_json, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                ON CONFLICT (snapshot_id, table_ws_id) DO UPDATE SET
                    spec_json = excluded.spec_json,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(snapshot_id)
            .bind(table.table_ws_id())
            .bind(table.physical_name())
            .bind(spec_json)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            info!(
                table = %table.label(),
                columns = table.spec.columns.len(),
                added_columns = added,
                "Snapshot table ready"
            );
        }

        tx.commit().await?;
        Ok(bound)
    }

    /// Loads a table spec registered by [`create_schema`](Self::create_schema).
    pub async fn load_table(&self, snapshot_id: &str, table_ws_id: &str) -> DbResult<SnapshotTable> {
        let spec_json: Option<String> = sqlx::query_scalar(
            "SELECT spec_json FROM snapshot_tables WHERE snapshot_id = ?1 AND table_ws_id = ?2",
        )
        .bind(snapshot_id)
        .bind(table_ws_id)
        .fetch_optional(&self.pool)
        .await?;

        let spec_json = spec_json.ok_or_else(|| {
            DbError::not_found("Snapshot table", format!("{}/{}", snapshot_id, table_ws_id))
        })?;
        let spec: TableSpec = serde_json::from_str(&spec_json)?;
        SnapshotTable::new(snapshot_id, spec)
    }

    /// All table specs of a snapshot, ordered by wsId.
    pub async fn list_tables(&self, snapshot_id: &str) -> DbResult<Vec<TableSpec>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT spec_json FROM snapshot_tables WHERE snapshot_id = ?1 ORDER BY table_ws_id",
        )
        .bind(snapshot_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(DbError::from))
            .collect()
    }

    /// Ids of every registered snapshot.
    pub async fn list_snapshots(&self) -> DbResult<Vec<String>> {
        let ids = sqlx::query_scalar("SELECT id FROM snapshots ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    /// Drops every physical table of a snapshot and its catalog rows.
    ///
    /// ## Returns
    /// `false` if the snapshot did not exist.
    pub async fn drop_snapshot(&self, snapshot_id: &str) -> DbResult<bool> {
        ensure_identifier(snapshot_id)?;
        let mut tx = self.pool.begin().await?;

        let physical: Vec<String> = sqlx::query_scalar(
            "SELECT physical_name FROM snapshot_tables WHERE snapshot_id = ?1",
        )
        .bind(snapshot_id)
        .fetch_all(&mut *tx)
        .await?;

        for name in &physical {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)))
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM pull_checkpoints WHERE snapshot_id = ?1")
            .bind(snapshot_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM snapshot_tables WHERE snapshot_id = ?1")
            .bind(snapshot_id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM snapshots WHERE id = ?1")
            .bind(snapshot_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        info!(snapshot = %snapshot_id, tables = physical.len(), "Snapshot dropped");
        Ok(removed > 0)
    }
}

/// Creates the table if needed and adds missing columns. Returns how many
/// columns were added.
async fn ensure_physical_table(conn: &mut SqliteConnection, table: &SnapshotTable) -> DbResult<usize> {
    let name = table.quoted_name();

    let mut ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} (\"wsId\" TEXT PRIMARY KEY NOT NULL, \"id\" TEXT NOT NULL UNIQUE",
        name
    );
    for column in &table.spec.columns {
        ddl.push_str(&format!(
            ", {} {}",
            quote_ident(column.ws_id()),
            sql_type(column.pg_type)
        ));
    }
    for (column, definition) in SIDE_COLUMNS {
        ddl.push_str(&format!(", {} {}", quote_ident(column), definition));
    }
    ddl.push(')');
    sqlx::query(&ddl).execute(&mut *conn).await?;

    let existing: HashSet<String> = sqlx::query("SELECT name FROM pragma_table_info(?1)")
        .bind(table.physical_name())
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(|row| row.try_get::<String, _>("name"))
        .collect::<Result<_, _>>()?;

    let mut missing: Vec<(String, String)> = table
        .spec
        .columns
        .iter()
        .filter(|c| !existing.contains(c.ws_id()))
        .map(|c| (c.ws_id().to_string(), sql_type(c.pg_type).to_string()))
        .collect();
    missing.extend(
        SIDE_COLUMNS
            .iter()
            .filter(|(c, _)| !existing.contains(*c))
            .map(|(c, d)| (c.to_string(), d.to_string())),
    );

    for (column, definition) in &missing {
        debug!(table = %table.label(), column = %column, "Adding column");
        sqlx::query(&format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            name,
            quote_ident(column),
            definition
        ))
        .execute(&mut *conn)
        .await?;
    }

    let index_prefix = table.physical_name();
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_ident(&format!("{}__dirty_idx", index_prefix)),
        name,
        quote_ident(COL_DIRTY)
    ))
    .execute(&mut *conn)
    .await?;
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_ident(&format!("{}__claim_idx", index_prefix)),
        name,
        quote_ident(COL_PUSH_CLAIM)
    ))
    .execute(&mut *conn)
    .await?;

    // A fresh CREATE reports every column as existing; only ALTERs count.
    Ok(missing.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::posts_spec;
    use crate::Database;
    use strata_core::{ColumnSpec, EntityId, PgType};

    #[tokio::test]
    async fn test_create_schema_is_idempotent_and_additive() {
        let db = Database::in_memory().await.unwrap();
        let schema = db.schema();

        let first = schema.create_schema("snap", &[posts_spec()]).await.unwrap();
        assert_eq!(first[0].physical_name(), "s_snap__posts");
        schema.create_schema("snap", &[posts_spec()]).await.unwrap();

        let mut wider = posts_spec();
        wider.columns.push(ColumnSpec::new(
            EntityId::new("rating", vec!["f_rating".into()]),
            "Rating",
            PgType::Numeric,
        ));
        schema.create_schema("snap", &[wider]).await.unwrap();

        let loaded = schema.load_table("snap", "posts").await.unwrap();
        assert!(loaded.spec.column("rating").is_some());

        let columns: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info('s_snap__posts')")
                .fetch_all(db.pool())
                .await
                .unwrap();
        assert!(columns.contains(&"rating".to_string()));
        assert!(columns.contains(&"__push_claim".to_string()));
    }

    #[tokio::test]
    async fn test_rejects_invalid_specs() {
        let db = Database::in_memory().await.unwrap();
        let schema = db.schema();

        assert!(matches!(
            schema.create_schema("Bad Snap", &[posts_spec()]).await,
            Err(DbError::InvalidIdentifier(_))
        ));

        let mut reserved = posts_spec();
        reserved.columns[0].id.ws_id = "__dirty".to_string();
        assert!(matches!(
            schema.create_schema("snap", &[reserved]).await,
            Err(DbError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_load_missing_table() {
        let db = Database::in_memory().await.unwrap();
        assert!(matches!(
            db.schema().load_table("snap", "posts").await,
            Err(DbError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_drop_snapshot() {
        let db = Database::in_memory().await.unwrap();
        let schema = db.schema();
        schema.create_schema("snap", &[posts_spec()]).await.unwrap();
        assert_eq!(schema.list_snapshots().await.unwrap(), vec!["snap".to_string()]);
        assert_eq!(schema.list_tables("snap").await.unwrap().len(), 1);

        assert!(schema.drop_snapshot("snap").await.unwrap());
        assert!(!schema.drop_snapshot("snap").await.unwrap());
        assert!(schema.list_tables("snap").await.unwrap().is_empty());
    }
}
