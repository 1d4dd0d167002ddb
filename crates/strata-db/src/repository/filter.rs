//! # Record Filters
//!
//! JSON boolean predicates over a snapshot table, compiled to parameterized
//! SQL. Every value is bound; only validated column names reach the SQL text.
//!
//! ## Grammar
//! ```text
//! filter := { "and": [filter, ...] }            empty → true
//!         | { "or":  [filter, ...] }            empty → false
//!         | { "not": filter }
//!         | { "eq" | "ne" | "gt" | "gte" | "lt" | "lte":
//!               { "field": <col>, "value": <json> } }
//!         | { "contains": { "field": <col>, "value": <json> } }
//!         | { "in": { "field": <col>, "values": [<json>, ...] } }
//!         | { "isNull" | "isNotNull": { "field": <col> } }
//!         | { "dirty": true | false }
//!
//! <col> := column wsId | "id" | "wsId"
//! ```
//!
//! `contains` is a case-insensitive substring match on text columns and an
//! element match on array columns. `eq`/`ne` with a `null` value become
//! `IS NULL` / `IS NOT NULL`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite};
use strata_core::validation::validate_value;
use strata_core::{ColumnSpec, EntityId, PgType, TableSpec};

use super::{push_sql_value, quote_ident, to_sql_value, COL_DIRTY, COL_ID, COL_WS_ID};
use crate::error::{DbError, DbResult};

/// A filter predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Eq(Comparison),
    Ne(Comparison),
    Gt(Comparison),
    Gte(Comparison),
    Lt(Comparison),
    Lte(Comparison),
    Contains(Comparison),
    In(Membership),
    IsNull(FieldTarget),
    IsNotNull(FieldTarget),
    Dirty(bool),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub field: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub field: String,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldTarget {
    pub field: String,
}

impl Filter {
    /// Parses a filter from its JSON form.
    pub fn from_json(value: &Value) -> DbResult<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| DbError::InvalidFilter(format!("malformed filter: {}", e)))
    }

    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Filter::Eq(Comparison {
            field: field.into(),
            value,
        })
    }

    pub fn contains(field: impl Into<String>, value: Value) -> Self {
        Filter::Contains(Comparison {
            field: field.into(),
            value,
        })
    }
}

/// Appends the SQL form of `filter` to `qb`.
pub fn push_filter(
    qb: &mut QueryBuilder<'_, Sqlite>,
    spec: &TableSpec,
    filter: &Filter,
) -> DbResult<()> {
    match filter {
        Filter::And(parts) => push_group(qb, spec, parts, " AND ", "1"),
        Filter::Or(parts) => push_group(qb, spec, parts, " OR ", "0"),
        Filter::Not(inner) => {
            qb.push("NOT (");
            push_filter(qb, spec, inner)?;
            qb.push(")");
            Ok(())
        }
        Filter::Eq(c) => push_comparison(qb, spec, c, "eq", "="),
        Filter::Ne(c) => push_comparison(qb, spec, c, "ne", "<>"),
        Filter::Gt(c) => push_comparison(qb, spec, c, "gt", ">"),
        Filter::Gte(c) => push_comparison(qb, spec, c, "gte", ">="),
        Filter::Lt(c) => push_comparison(qb, spec, c, "lt", "<"),
        Filter::Lte(c) => push_comparison(qb, spec, c, "lte", "<="),
        Filter::Contains(c) => push_contains(qb, spec, c),
        Filter::In(m) => {
            let column = resolve_field(spec, &m.field)?;
            if m.values.is_empty() {
                qb.push("0");
                return Ok(());
            }
            qb.push(quote_ident(column.ws_id()));
            qb.push(" IN (");
            for (i, value) in m.values.iter().enumerate() {
                check_value(&column, value, "in")?;
                if i > 0 {
                    qb.push(", ");
                }
                push_sql_value(qb, to_sql_value(column.pg_type, value));
            }
            qb.push(")");
            Ok(())
        }
        Filter::IsNull(t) => {
            let column = resolve_field(spec, &t.field)?;
            qb.push(format!("{} IS NULL", quote_ident(column.ws_id())));
            Ok(())
        }
        Filter::IsNotNull(t) => {
            let column = resolve_field(spec, &t.field)?;
            qb.push(format!("{} IS NOT NULL", quote_ident(column.ws_id())));
            Ok(())
        }
        Filter::Dirty(dirty) => {
            qb.push(format!(
                "{} = {}",
                quote_ident(COL_DIRTY),
                i64::from(*dirty)
            ));
            Ok(())
        }
    }
}

fn push_group(
    qb: &mut QueryBuilder<'_, Sqlite>,
    spec: &TableSpec,
    parts: &[Filter],
    separator: &str,
    empty: &str,
) -> DbResult<()> {
    if parts.is_empty() {
        qb.push(empty);
        return Ok(());
    }
    qb.push("(");
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            qb.push(separator);
        }
        qb.push("(");
        push_filter(qb, spec, part)?;
        qb.push(")");
    }
    qb.push(")");
    Ok(())
}

fn push_comparison(
    qb: &mut QueryBuilder<'_, Sqlite>,
    spec: &TableSpec,
    comparison: &Comparison,
    name: &str,
    operator: &str,
) -> DbResult<()> {
    let column = resolve_field(spec, &comparison.field)?;
    let quoted = quote_ident(column.ws_id());

    if comparison.value.is_null() {
        return match name {
            "eq" => {
                qb.push(format!("{} IS NULL", quoted));
                Ok(())
            }
            "ne" => {
                qb.push(format!("{} IS NOT NULL", quoted));
                Ok(())
            }
            _ => Err(DbError::InvalidFilter(format!(
                "{} on '{}' needs a non-null value",
                name, comparison.field
            ))),
        };
    }

    let ordered = !matches!(name, "eq" | "ne");
    if ordered
        && !matches!(
            column.pg_type,
            PgType::Text | PgType::Numeric | PgType::Timestamp
        )
    {
        return Err(DbError::InvalidFilter(format!(
            "{} is not supported for {} column '{}'",
            name, column.pg_type, comparison.field
        )));
    }

    check_value(&column, &comparison.value, name)?;
    qb.push(format!("{} {} ", quoted, operator));
    push_sql_value(qb, to_sql_value(column.pg_type, &comparison.value));
    Ok(())
}

fn push_contains(
    qb: &mut QueryBuilder<'_, Sqlite>,
    spec: &TableSpec,
    comparison: &Comparison,
) -> DbResult<()> {
    let column = resolve_field(spec, &comparison.field)?;
    let quoted = quote_ident(column.ws_id());

    match column.pg_type.element_type() {
        Some(element) => {
            let probe = ColumnSpec::new(column.id.clone(), column.name.clone(), element);
            check_value(&probe, &comparison.value, "contains")?;
            qb.push(format!(
                "EXISTS (SELECT 1 FROM json_each({}) WHERE json_each.value = ",
                quoted
            ));
            push_sql_value(qb, to_sql_value(element, &comparison.value));
            qb.push(")");
            Ok(())
        }
        None if matches!(column.pg_type, PgType::Text | PgType::Timestamp) => {
            let Some(needle) = comparison.value.as_str() else {
                return Err(DbError::InvalidFilter(format!(
                    "contains on '{}' needs a string value",
                    comparison.field
                )));
            };
            qb.push(format!("{} LIKE ", quoted));
            qb.push_bind(format!("%{}%", escape_like(needle)));
            qb.push(" ESCAPE '\\'");
            Ok(())
        }
        None => Err(DbError::InvalidFilter(format!(
            "contains is not supported for {} column '{}'",
            column.pg_type, comparison.field
        ))),
    }
}

/// Resolves a filter field to a column (the `id` / `wsId` keys are TEXT).
fn resolve_field(spec: &TableSpec, field: &str) -> DbResult<ColumnSpec> {
    if field == COL_ID || field == COL_WS_ID {
        return Ok(ColumnSpec::new(
            EntityId::new(field, Vec::new()),
            field,
            PgType::Text,
        ));
    }
    spec.column(field)
        .cloned()
        .ok_or_else(|| DbError::InvalidFilter(format!("unknown field '{}'", field)))
}

fn check_value(column: &ColumnSpec, value: &Value, operator: &str) -> DbResult<()> {
    validate_value(column, value)
        .map_err(|e| DbError::InvalidFilter(format!("{}: {}", operator, e)))
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::posts_spec;
    use serde_json::json;

    fn compile(filter: Value) -> DbResult<String> {
        let filter = Filter::from_json(&filter)?;
        let mut qb = QueryBuilder::<Sqlite>::new("");
        push_filter(&mut qb, &posts_spec(), &filter)?;
        Ok(qb.sql().to_string())
    }

    #[test]
    fn test_compiles_nested_predicates() {
        let sql = compile(json!({
            "and": [
                { "eq": { "field": "published", "value": true } },
                { "or": [
                    { "gt": { "field": "views", "value": 10 } },
                    { "not": { "isNull": { "field": "body" } } }
                ] },
                { "dirty": false }
            ]
        }))
        .unwrap();

        assert!(sql.contains("\"published\" = ?"));
        assert!(sql.contains("\"views\" > ?"));
        assert!(sql.contains("NOT (\"body\" IS NULL)"));
        assert!(sql.contains("\"__dirty\" = 0"));
    }

    #[test]
    fn test_null_equality_and_empty_groups() {
        assert_eq!(
            compile(json!({ "eq": { "field": "body", "value": null } })).unwrap(),
            "\"body\" IS NULL"
        );
        assert_eq!(compile(json!({ "and": [] })).unwrap(), "1");
        assert_eq!(compile(json!({ "in": { "field": "title", "values": [] } })).unwrap(), "0");
    }

    #[test]
    fn test_contains_variants() {
        let text = compile(json!({ "contains": { "field": "title", "value": "50%" } })).unwrap();
        assert!(text.contains("LIKE ?"));
        let array = compile(json!({ "contains": { "field": "tags", "value": "rust" } })).unwrap();
        assert!(array.contains("json_each(\"tags\")"));
    }

    #[test]
    fn test_rejects_bad_filters() {
        assert!(matches!(
            compile(json!({ "eq": { "field": "colour", "value": "red" } })),
            Err(DbError::InvalidFilter(_))
        ));
        assert!(matches!(
            compile(json!({ "gt": { "field": "published", "value": true } })),
            Err(DbError::InvalidFilter(_))
        ));
        assert!(matches!(
            compile(json!({ "eq": { "field": "views", "value": "many" } })),
            Err(DbError::InvalidFilter(_))
        ));
        assert!(matches!(
            compile(json!({ "between": { "field": "views" } })),
            Err(DbError::InvalidFilter(_))
        ));
    }

    #[test]
    fn test_id_fields_are_addressable() {
        let sql = compile(json!({ "in": { "field": "wsId", "values": ["rec_a", "rec_b"] } }))
            .unwrap();
        assert_eq!(sql, "\"wsId\" IN (?, ?)");
    }
}
