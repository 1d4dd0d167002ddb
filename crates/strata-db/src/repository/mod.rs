//! # Repository Module
//!
//! Snapshot store repositories.
//!
//! ## Physical Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │               s_<snapshot>__<table>  (one per synced table)            │
//! │                                                                         │
//! │  "wsId"                TEXT PRIMARY KEY   local identity               │
//! │  "id"                  TEXT UNIQUE        remote id or placeholder     │
//! │  <column wsId> ...     per PgType         synced field values          │
//! │  "__edited_fields"     TEXT (JSON)        field → edit time + markers  │
//! │  "__suggested_values"  TEXT (JSON)        agent proposals              │
//! │  "__metadata"          TEXT (JSON)        connector row metadata       │
//! │  "__dirty"             INTEGER            editedFields non-empty       │
//! │  "__push_claim"        TEXT               claim token of a push batch  │
//! │  "__push_claimed_at"   INTEGER            claim time (unix seconds)    │
//! │                                                                         │
//! │  PgType → storage:                                                      │
//! │    TEXT, TIMESTAMP            → TEXT                                    │
//! │    NUMERIC                    → NUMERIC                                 │
//! │    BOOLEAN                    → INTEGER 0/1                             │
//! │    *_ARRAY, JSON              → TEXT holding JSON                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`SchemaRepository`](schema::SchemaRepository) - Catalog and physical tables
//! - [`RecordRepository`](records::RecordRepository) - Records, edits, suggestions, push claims
//! - [`ProgressRepository`](progress::ProgressRepository) - Pull checkpoints
//! - [`filter`] - JSON filter predicates compiled to SQL

pub mod filter;
pub mod progress;
pub mod records;
pub mod schema;

use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use strata_core::ids::is_valid_slug;
use strata_core::{
    EditedFields, FieldMap, PgType, RecordId, SnapshotRecord, SuggestedValues, TableSpec,
};

use crate::error::{DbError, DbResult};

// =============================================================================
// Column Names
// =============================================================================

pub const COL_WS_ID: &str = "wsId";
pub const COL_ID: &str = "id";
pub const COL_EDITED_FIELDS: &str = "__edited_fields";
pub const COL_SUGGESTED_VALUES: &str = "__suggested_values";
pub const COL_METADATA: &str = "__metadata";
pub const COL_DIRTY: &str = "__dirty";
pub const COL_PUSH_CLAIM: &str = "__push_claim";
pub const COL_PUSH_CLAIMED_AT: &str = "__push_claimed_at";

/// Side-columns and their DDL, in table order.
pub(crate) const SIDE_COLUMNS: &[(&str, &str)] = &[
    (COL_EDITED_FIELDS, "TEXT NOT NULL DEFAULT '{}'"),
    (COL_SUGGESTED_VALUES, "TEXT NOT NULL DEFAULT '{}'"),
    (COL_METADATA, "TEXT"),
    (COL_DIRTY, "INTEGER NOT NULL DEFAULT 0"),
    (COL_PUSH_CLAIM, "TEXT"),
    (COL_PUSH_CLAIMED_AT, "INTEGER"),
];

// =============================================================================
// SnapshotTable
// =============================================================================

/// A table spec bound to the snapshot that materializes it.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotTable {
    pub snapshot_id: String,
    pub spec: TableSpec,
}

impl SnapshotTable {
    /// Binds `spec` to `snapshot_id`, checking both are usable in a table name.
    pub fn new(snapshot_id: impl Into<String>, spec: TableSpec) -> DbResult<Self> {
        let snapshot_id = snapshot_id.into();
        ensure_identifier(&snapshot_id)?;
        ensure_identifier(spec.ws_id())?;
        Ok(SnapshotTable { snapshot_id, spec })
    }

    /// The table's wsId.
    pub fn table_ws_id(&self) -> &str {
        self.spec.ws_id()
    }

    /// `s_<snapshot>__<table>`
    pub fn physical_name(&self) -> String {
        physical_table_name(&self.snapshot_id, self.table_ws_id())
    }

    pub(crate) fn quoted_name(&self) -> String {
        quote_ident(&self.physical_name())
    }

    /// `snapshot/table`, for logs and errors.
    pub fn label(&self) -> String {
        format!("{}/{}", self.snapshot_id, self.table_ws_id())
    }
}

/// Physical table name for a (snapshot, table) pair.
pub fn physical_table_name(snapshot_id: &str, table_ws_id: &str) -> String {
    format!("s_{}__{}", snapshot_id, table_ws_id)
}

/// Quotes an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Rejects identifiers that are not wsId slugs.
pub fn ensure_identifier(value: &str) -> DbResult<()> {
    if is_valid_slug(value) {
        Ok(())
    } else {
        Err(DbError::InvalidIdentifier(value.to_string()))
    }
}

// =============================================================================
// Value Mapping
// =============================================================================

/// SQLite column type for a PgType.
pub(crate) fn sql_type(pg_type: PgType) -> &'static str {
    match pg_type {
        PgType::Numeric => "NUMERIC",
        PgType::Boolean => "INTEGER",
        _ => "TEXT",
    }
}

/// A value ready to be bound to a statement.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SqlValue {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
}

/// Converts a JSON field value into its storage form.
///
/// Values that do not match the column type are stored as their JSON text so
/// nothing a connector delivers is lost.
pub(crate) fn to_sql_value(pg_type: PgType, value: &Value) -> SqlValue {
    if pg_type.is_array() || pg_type == PgType::Json {
        return match value {
            Value::Null => SqlValue::Null,
            other => SqlValue::Text(other.to_string()),
        };
    }
    match (pg_type, value) {
        (_, Value::Null) => SqlValue::Null,
        (PgType::Numeric, Value::Number(n)) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        (PgType::Boolean, Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
        (_, Value::String(s)) => SqlValue::Text(s.clone()),
        (_, other) => SqlValue::Text(other.to_string()),
    }
}

/// Pushes a bound value onto a query.
pub(crate) fn push_sql_value(qb: &mut QueryBuilder<'_, Sqlite>, value: SqlValue) {
    match value {
        SqlValue::Null => qb.push_bind(None::<String>),
        SqlValue::Text(s) => qb.push_bind(s),
        SqlValue::Integer(i) => qb.push_bind(i),
        SqlValue::Real(f) => qb.push_bind(f),
    };
}

/// SELECT expression that reads a field column back as JSON text.
fn select_expr(column: &str, pg_type: PgType) -> String {
    let quoted = quote_ident(column);
    if pg_type.is_array() || pg_type == PgType::Json {
        format!("{0} AS {0}", quoted)
    } else {
        format!("json_quote({0}) AS {0}", quoted)
    }
}

/// Decodes the text produced by [`select_expr`].
fn from_stored(pg_type: PgType, raw: Option<String>) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };
    let parsed = serde_json::from_str::<Value>(&raw).unwrap_or(Value::String(raw));
    match (pg_type, &parsed) {
        (PgType::Boolean, Value::Number(n)) => match n.as_i64() {
            Some(0) => Value::Bool(false),
            Some(1) => Value::Bool(true),
            _ => parsed,
        },
        _ => parsed,
    }
}

/// Column list for reading whole records.
pub(crate) fn select_columns(spec: &TableSpec) -> String {
    let mut columns = vec![quote_ident(COL_WS_ID), quote_ident(COL_ID)];
    columns.extend(
        spec.columns
            .iter()
            .map(|c| select_expr(c.ws_id(), c.pg_type)),
    );
    columns.extend(
        [
            COL_EDITED_FIELDS,
            COL_SUGGESTED_VALUES,
            COL_METADATA,
            COL_DIRTY,
        ]
        .iter()
        .map(|c| quote_ident(c)),
    );
    columns.join(", ")
}

/// Builds a record from a row selected with [`select_columns`].
pub(crate) fn record_from_row(spec: &TableSpec, row: &SqliteRow) -> DbResult<SnapshotRecord> {
    let ws_id: String = row.try_get(COL_WS_ID)?;
    let stored_id: String = row.try_get(COL_ID)?;

    let mut fields = FieldMap::new();
    for column in &spec.columns {
        let raw: Option<String> = row.try_get(column.ws_id())?;
        fields.insert(column.ws_id().to_string(), from_stored(column.pg_type, raw));
    }

    let edited_raw: String = row.try_get(COL_EDITED_FIELDS)?;
    let suggested_raw: String = row.try_get(COL_SUGGESTED_VALUES)?;
    let metadata_raw: Option<String> = row.try_get(COL_METADATA)?;
    let dirty: i64 = row.try_get(COL_DIRTY)?;

    let edited_fields: EditedFields = serde_json::from_str(&edited_raw)?;
    let suggested_values: SuggestedValues = serde_json::from_str(&suggested_raw)?;
    let metadata = match metadata_raw {
        Some(raw) => serde_json::from_str(&raw)?,
        None => Value::Null,
    };

    Ok(SnapshotRecord {
        id: RecordId::from_stored(ws_id, &stored_id),
        fields,
        edited_fields,
        suggested_values,
        dirty: dirty != 0,
        metadata,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use strata_core::{ColumnSpec, EntityId, PgType, TableSpec};

    use super::SnapshotTable;
    use crate::Database;

    /// `posts` with title (required), views (numeric), published, tags, body.
    pub fn posts_spec() -> TableSpec {
        let col = |id: &str, pg: PgType| {
            ColumnSpec::new(EntityId::new(id, vec![format!("f_{}", id)]), id, pg)
        };
        TableSpec::new(
            EntityId::new("posts", vec!["site".into(), "posts".into()]),
            "Posts",
            vec![
                col("title", PgType::Text).required(),
                col("views", PgType::Numeric),
                col("published", PgType::Boolean),
                col("tags", PgType::TextArray),
                col("body", PgType::Text),
                col("slug", PgType::Text).readonly(),
            ],
        )
    }

    pub async fn posts_table() -> (Database, SnapshotTable) {
        let db = Database::in_memory().await.unwrap();
        let tables = db.schema().create_schema("snap", &[posts_spec()]).await.unwrap();
        (db, tables.into_iter().next().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_physical_names() {
        assert_eq!(physical_table_name("snap1", "posts"), "s_snap1__posts");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert!(ensure_identifier("snap1").is_ok());
        assert!(matches!(
            ensure_identifier("Snap 1"),
            Err(DbError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_value_mapping() {
        assert_eq!(to_sql_value(PgType::Numeric, &json!(3)), SqlValue::Integer(3));
        assert_eq!(to_sql_value(PgType::Numeric, &json!(2.5)), SqlValue::Real(2.5));
        assert_eq!(to_sql_value(PgType::Boolean, &json!(true)), SqlValue::Integer(1));
        assert_eq!(
            to_sql_value(PgType::TextArray, &json!(["a"])),
            SqlValue::Text("[\"a\"]".into())
        );
        assert_eq!(
            to_sql_value(PgType::Numeric, &json!("n/a")),
            SqlValue::Text("n/a".into())
        );
        assert_eq!(
            to_sql_value(PgType::Json, &json!("n/a")),
            SqlValue::Text("\"n/a\"".into())
        );
    }

    #[test]
    fn test_stored_decoding() {
        assert_eq!(from_stored(PgType::Boolean, Some("1".into())), json!(true));
        assert_eq!(from_stored(PgType::Text, Some("\"hi\"".into())), json!("hi"));
        assert_eq!(from_stored(PgType::Json, Some("{\"a\":1}".into())), json!({"a": 1}));
        assert_eq!(from_stored(PgType::Json, Some("not json".into())), json!("not json"));
        assert_eq!(from_stored(PgType::Numeric, None), Value::Null);
    }
}
