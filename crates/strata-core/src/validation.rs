//! # Validation Module
//!
//! Checks record values against a [`TableSpec`].
//!
//! ## Where Validation Runs
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Points                                  │
//! │                                                                         │
//! │  applyEdit (accepted + suggested)                                       │
//! │  ├── column exists                                                      │
//! │  ├── column is not read-only                                            │
//! │  └── value matches pgType (null allowed)                                │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  push (per record, before the connector call)                           │
//! │  ├── create: required columns present and non-null                      │
//! │  ├── update: no read-only column edited                                 │
//! │  └── every sent value matches pgType                                    │
//! │                                                                         │
//! │  Failing records are skipped and stay dirty.                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use strata_core::schema::{ColumnSpec, PgType};
//! use strata_core::validation::validate_value;
//! use strata_core::EntityId;
//! use serde_json::json;
//!
//! let price = ColumnSpec::new(EntityId::new("price", vec!["p".into()]), "Price", PgType::Numeric);
//! assert!(validate_value(&price, &json!(9.5)).is_ok());
//! assert!(validate_value(&price, &json!("cheap")).is_err());
//! ```

use chrono::{DateTime, NaiveDate};
use serde_json::Value;

use crate::error::ValidationError;
use crate::record::{FieldMap, PushOperation, SnapshotRecord};
use crate::schema::{ColumnSpec, PgType, TableSpec};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Value Validators
// =============================================================================

/// JSON type name used in mismatch messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Returns true if `value` is an RFC 3339 timestamp or a `YYYY-MM-DD` date.
pub fn is_timestamp(value: &str) -> bool {
    DateTime::parse_from_rfc3339(value).is_ok()
        || NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
}

/// Validates one value against a column's type.
///
/// `null` is accepted for every type; requiredness is checked on push.
pub fn validate_value(column: &ColumnSpec, value: &Value) -> ValidationResult<()> {
    if value.is_null() {
        return Ok(());
    }

    let field = column.ws_id();
    let mismatch = || ValidationError::TypeMismatch {
        field: field.to_string(),
        expected: column.pg_type,
        found: json_type_name(value).to_string(),
    };

    match column.pg_type {
        PgType::Json => Ok(()),
        PgType::Timestamp => match value {
            Value::String(s) if is_timestamp(s) => Ok(()),
            Value::String(s) => Err(ValidationError::InvalidFormat {
                field: field.to_string(),
                reason: format!("'{}' is not an RFC 3339 timestamp", s),
            }),
            _ => Err(mismatch()),
        },
        scalar if !scalar.is_array() => {
            if matches_scalar(scalar, value) {
                Ok(())
            } else {
                Err(mismatch())
            }
        }
        array => {
            let Value::Array(items) = value else {
                return Err(mismatch());
            };
            // Array types always have an element type.
            let element = array.element_type().unwrap_or(PgType::Json);
            for item in items {
                if !item.is_null() && !matches_scalar(element, item) {
                    return Err(ValidationError::TypeMismatch {
                        field: field.to_string(),
                        expected: array,
                        found: format!("array containing {}", json_type_name(item)),
                    });
                }
            }
            Ok(())
        }
    }
}

fn matches_scalar(pg_type: PgType, value: &Value) -> bool {
    match pg_type {
        PgType::Text => value.is_string(),
        PgType::Numeric => value.is_number(),
        PgType::Boolean => value.is_boolean(),
        PgType::Timestamp => value.as_str().is_some_and(is_timestamp),
        _ => true,
    }
}

// =============================================================================
// Record Validators
// =============================================================================

/// Validates field values of an edit before they are stored.
pub fn validate_edit_fields(spec: &TableSpec, fields: &FieldMap) -> ValidationResult<()> {
    for (field_id, value) in fields {
        let column = spec
            .column(field_id)
            .ok_or_else(|| ValidationError::UnknownColumn {
                field: field_id.clone(),
            })?;

        if column.readonly {
            return Err(ValidationError::ReadOnly {
                field: field_id.clone(),
            });
        }

        validate_value(column, value)?;
    }
    Ok(())
}

/// Validates a dirty record immediately before it is pushed.
///
/// Delete pushes carry no field values and always pass.
pub fn validate_for_push(spec: &TableSpec, record: &SnapshotRecord) -> ValidationResult<()> {
    match record.push_operation() {
        None | Some(PushOperation::Delete) => Ok(()),
        Some(PushOperation::Create) => {
            for column in spec.columns.iter().filter(|c| c.required && !c.readonly) {
                let present = record
                    .fields
                    .get(column.ws_id())
                    .is_some_and(|v| !v.is_null());
                if !present {
                    return Err(ValidationError::Required {
                        field: column.ws_id().to_string(),
                    });
                }
            }
            validate_pushed_values(spec, record)
        }
        Some(PushOperation::Update) => {
            for field_id in record.edited_fields.edited_field_ids() {
                if spec.column(field_id).is_some_and(|c| c.readonly) {
                    return Err(ValidationError::ReadOnly {
                        field: field_id.to_string(),
                    });
                }
            }
            validate_pushed_values(spec, record)
        }
    }
}

fn validate_pushed_values(spec: &TableSpec, record: &SnapshotRecord) -> ValidationResult<()> {
    for (field_id, value) in &record.push_fields() {
        // Pulled-only columns on a create are filtered out by the connector.
        if let Some(column) = spec.column(field_id) {
            if !column.readonly {
                validate_value(column, value)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::RecordId;
    use crate::record::{EditedFields, SuggestedValues};
    use crate::EntityId;
    use chrono::Utc;
    use serde_json::json;

    fn col(ws_id: &str, pg_type: PgType) -> ColumnSpec {
        ColumnSpec::new(EntityId::new(ws_id, vec![ws_id.into()]), ws_id, pg_type)
    }

    fn spec() -> TableSpec {
        TableSpec::new(
            EntityId::new("items", vec!["items".into()]),
            "Items",
            vec![
                col("name", PgType::Text).required(),
                col("price", PgType::Numeric),
                col("tags", PgType::TextArray),
                col("published_at", PgType::Timestamp),
                col("views", PgType::Numeric).readonly(),
            ],
        )
    }

    fn record(fields: serde_json::Value, edited_fields: EditedFields) -> SnapshotRecord {
        let mut record = SnapshotRecord {
            id: RecordId {
                ws_id: "rec_1".into(),
                remote_id: None,
            },
            fields: fields.as_object().cloned().unwrap_or_default(),
            edited_fields,
            suggested_values: SuggestedValues::default(),
            dirty: false,
            metadata: Value::Null,
        };
        record.sync_dirty();
        record
    }

    #[test]
    fn test_scalar_types() {
        assert!(validate_value(&col("b", PgType::Boolean), &json!(true)).is_ok());
        assert!(validate_value(&col("b", PgType::Boolean), &json!("yes")).is_err());
        assert!(validate_value(&col("t", PgType::Text), &json!(null)).is_ok());
        assert!(validate_value(&col("j", PgType::Json), &json!({"a": [1]})).is_ok());
    }

    #[test]
    fn test_array_types() {
        let tags = col("tags", PgType::TextArray);
        assert!(validate_value(&tags, &json!(["a", "b", null])).is_ok());
        assert!(validate_value(&tags, &json!("a")).is_err());
        let err = validate_value(&tags, &json!(["a", 1])).unwrap_err();
        assert!(err.to_string().contains("array containing number"));
    }

    #[test]
    fn test_timestamps() {
        let ts = col("ts", PgType::Timestamp);
        assert!(validate_value(&ts, &json!("2026-01-02T03:04:05Z")).is_ok());
        assert!(validate_value(&ts, &json!("2026-01-02")).is_ok());
        assert!(matches!(
            validate_value(&ts, &json!("yesterday")),
            Err(ValidationError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_edit_fields_rules() {
        let spec = spec();
        let ok = json!({ "name": "Lamp", "price": 12 });
        assert!(validate_edit_fields(&spec, ok.as_object().unwrap()).is_ok());

        let unknown = json!({ "colour": "red" });
        assert!(matches!(
            validate_edit_fields(&spec, unknown.as_object().unwrap()),
            Err(ValidationError::UnknownColumn { .. })
        ));

        let readonly = json!({ "views": 3 });
        assert!(matches!(
            validate_edit_fields(&spec, readonly.as_object().unwrap()),
            Err(ValidationError::ReadOnly { .. })
        ));
    }

    #[test]
    fn test_create_requires_required_columns() {
        let spec = spec();
        let missing = record(json!({ "price": 3 }), EditedFields::created_at(Utc::now()));
        assert_eq!(
            validate_for_push(&spec, &missing),
            Err(ValidationError::Required {
                field: "name".into()
            })
        );

        let complete = record(
            json!({ "name": "Lamp", "price": 3 }),
            EditedFields::created_at(Utc::now()),
        );
        assert!(validate_for_push(&spec, &complete).is_ok());
    }

    #[test]
    fn test_update_checks_only_edited_values() {
        let spec = spec();
        let mut edited = EditedFields::default();
        edited.mark_field("price", Utc::now());
        // `name` is bad but not edited, so it is not sent.
        let r = record(json!({ "name": 5, "price": "x" }), edited);
        assert!(matches!(
            validate_for_push(&spec, &r),
            Err(ValidationError::TypeMismatch { .. })
        ));

        let mut edited = EditedFields::default();
        edited.mark_field("views", Utc::now());
        let r = record(json!({ "views": 10 }), edited);
        assert!(matches!(
            validate_for_push(&spec, &r),
            Err(ValidationError::ReadOnly { .. })
        ));
    }

    #[test]
    fn test_delete_always_passes() {
        let mut edited = EditedFields::default();
        edited.mark_deleted(Utc::now());
        let r = record(json!({ "name": null }), edited);
        assert!(validate_for_push(&spec(), &r).is_ok());
    }
}
