//! # Table Schema Model
//!
//! Source-agnostic description of one remote table's shape.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Schema Model                                   │
//! │                                                                         │
//! │  ┌──────────────────────┐        ┌──────────────────────────────┐      │
//! │  │      TableSpec       │ 1    * │         ColumnSpec           │      │
//! │  │  ──────────────────  │───────►│  ──────────────────────────  │      │
//! │  │  id (EntityId)       │        │  id (EntityId)               │      │
//! │  │  slug, name          │        │  name                        │      │
//! │  │  titleColumn?        │        │  pgType ──► closed set       │      │
//! │  │  mainContentColumn?  │        │  required / readonly         │      │
//! │  └──────────────────────┘        │  metadata (hints only)       │      │
//! │                                  └──────────────────────────────┘      │
//! │                                                                         │
//! │  PgType: TEXT, TEXT_ARRAY, NUMERIC, NUMERIC_ARRAY,                      │
//! │          BOOLEAN, BOOLEAN_ARRAY, JSON, TIMESTAMP                        │
//! │  The lowest common denominator every backing store must support.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use ts_rs::TS;

use crate::error::ValidationError;
use crate::ids::{is_reserved_column_name, is_valid_slug, EntityId};

// =============================================================================
// PgType
// =============================================================================

/// Column value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum PgType {
    Text,
    TextArray,
    Numeric,
    NumericArray,
    Boolean,
    BooleanArray,
    Json,
    Timestamp,
}

impl PgType {
    /// All variants, in declaration order.
    pub const ALL: [PgType; 8] = [
        PgType::Text,
        PgType::TextArray,
        PgType::Numeric,
        PgType::NumericArray,
        PgType::Boolean,
        PgType::BooleanArray,
        PgType::Json,
        PgType::Timestamp,
    ];

    /// Returns true for the `*_ARRAY` variants.
    pub const fn is_array(&self) -> bool {
        matches!(
            self,
            PgType::TextArray | PgType::NumericArray | PgType::BooleanArray
        )
    }

    /// Element type of an array variant.
    pub const fn element_type(&self) -> Option<PgType> {
        match self {
            PgType::TextArray => Some(PgType::Text),
            PgType::NumericArray => Some(PgType::Numeric),
            PgType::BooleanArray => Some(PgType::Boolean),
            _ => None,
        }
    }

    /// Canonical name (`TEXT_ARRAY`, `NUMERIC`, ...).
    pub const fn as_str(&self) -> &'static str {
        match self {
            PgType::Text => "TEXT",
            PgType::TextArray => "TEXT_ARRAY",
            PgType::Numeric => "NUMERIC",
            PgType::NumericArray => "NUMERIC_ARRAY",
            PgType::Boolean => "BOOLEAN",
            PgType::BooleanArray => "BOOLEAN_ARRAY",
            PgType::Json => "JSON",
            PgType::Timestamp => "TIMESTAMP",
        }
    }
}

impl std::fmt::Display for PgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PgType {
    type Err = ValidationError;

    /// Parses canonical names plus the common SQL spellings connectors report
    /// (`text[]`, `jsonb`, `timestamptz`, `bool`, ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let parsed = match normalized.as_str() {
            "text" | "string" | "varchar" => PgType::Text,
            "text_array" | "text[]" | "string[]" => PgType::TextArray,
            "numeric" | "number" | "integer" | "float" | "decimal" => PgType::Numeric,
            "numeric_array" | "numeric[]" | "number[]" => PgType::NumericArray,
            "boolean" | "bool" => PgType::Boolean,
            "boolean_array" | "boolean[]" | "bool[]" => PgType::BooleanArray,
            "json" | "jsonb" | "object" => PgType::Json,
            "timestamp" | "timestamptz" | "datetime" | "date" => PgType::Timestamp,
            _ => {
                return Err(ValidationError::NotAllowed {
                    field: "pgType".to_string(),
                    allowed: PgType::ALL.iter().map(|t| t.as_str().to_string()).collect(),
                })
            }
        };
        Ok(parsed)
    }
}

// =============================================================================
// Column Metadata (presentation hints)
// =============================================================================

/// How a TEXT column's content should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum TextFormat {
    Plain,
    Markdown,
    Html,
    Url,
    Email,
}

/// Display granularity of a TIMESTAMP column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum DateGranularity {
    Date,
    DateTime,
}

/// One entry of a select-style option list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ColumnOption {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Points at the remote table a reference column links to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ForeignKeyHint {
    pub table_remote_id: Vec<String>,
}

/// Presentation hints. These never change query semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ColumnMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_format: Option<TextFormat>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_granularity: Option<DateGranularity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<ColumnOption>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<ForeignKeyHint>,
}

// =============================================================================
// ColumnSpec
// =============================================================================

/// One column of a [`TableSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ColumnSpec {
    pub id: EntityId,
    pub name: String,
    pub pg_type: PgType,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub readonly: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ColumnMetadata>,
}

impl ColumnSpec {
    /// Creates an optional, writable column.
    pub fn new(id: EntityId, name: impl Into<String>, pg_type: PgType) -> Self {
        ColumnSpec {
            id,
            name: name.into(),
            pg_type,
            required: false,
            readonly: false,
            metadata: None,
        }
    }

    /// Marks the column as required on create.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Marks the column as read-only (never pushed).
    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    /// Attaches presentation hints.
    pub fn with_metadata(mut self, metadata: ColumnMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The column's wsId (also its physical column name).
    pub fn ws_id(&self) -> &str {
        &self.id.ws_id
    }

    /// Text format hint, if any.
    pub fn text_format(&self) -> Option<TextFormat> {
        self.metadata.as_ref().and_then(|m| m.text_format)
    }
}

// =============================================================================
// TableSpec
// =============================================================================

/// Normalized shape of one remote table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct TableSpec {
    pub id: EntityId,
    pub slug: String,
    pub name: String,
    pub columns: Vec<ColumnSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_column_remote_id: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_content_column_remote_id: Option<Vec<String>>,
}

impl TableSpec {
    /// Creates a table spec whose slug equals the table's wsId.
    pub fn new(id: EntityId, name: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        TableSpec {
            slug: id.ws_id.clone(),
            id,
            name: name.into(),
            columns,
            title_column_remote_id: None,
            main_content_column_remote_id: None,
        }
    }

    /// The table's wsId.
    pub fn ws_id(&self) -> &str {
        &self.id.ws_id
    }

    /// Looks up a column by wsId.
    pub fn column(&self, ws_id: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.id.ws_id == ws_id)
    }

    /// Looks up a column by its remote path.
    pub fn column_by_remote_id(&self, remote_id: &[String]) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.id.remote_id == remote_id)
    }

    /// Looks up a column by the last element of its remote path.
    pub fn column_by_leaf_remote_id(&self, leaf: &str) -> Option<&ColumnSpec> {
        self.columns
            .iter()
            .find(|c| c.id.leaf_remote_id() == Some(leaf))
    }

    /// The column used as a record's display title.
    pub fn title_column(&self) -> Option<&ColumnSpec> {
        self.title_column_remote_id
            .as_deref()
            .and_then(|id| self.column_by_remote_id(id))
    }

    /// The column holding the record's main body content.
    pub fn main_content_column(&self) -> Option<&ColumnSpec> {
        self.main_content_column_remote_id
            .as_deref()
            .and_then(|id| self.column_by_remote_id(id))
    }

    /// Columns that may be sent to the source.
    pub fn writable_columns(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.columns.iter().filter(|c| !c.readonly)
    }

    /// Checks that the spec can be materialized as a snapshot table.
    ///
    /// ## Checks
    /// - table wsId and every column wsId are valid slugs
    /// - column wsIds are unique
    /// - no column collides with a reserved store column
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_slug(&self.id.ws_id) {
            return Err(ValidationError::InvalidSlug {
                value: self.id.ws_id.clone(),
            });
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            let ws_id = column.ws_id();
            if !is_valid_slug(ws_id) {
                return Err(ValidationError::InvalidSlug {
                    value: ws_id.to_string(),
                });
            }
            if is_reserved_column_name(ws_id) {
                return Err(ValidationError::ReservedName {
                    name: ws_id.to_string(),
                });
            }
            if !seen.insert(ws_id) {
                return Err(ValidationError::Duplicate {
                    field: "column".to_string(),
                    value: ws_id.to_string(),
                });
            }
        }

        Ok(())
    }
}

/// A discovered table, as returned by table listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct TablePreview {
    pub id: EntityId,
    pub display_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn posts_spec() -> TableSpec {
        let mut spec = TableSpec::new(
            EntityId::new("posts", vec!["site".into(), "posts".into()]),
            "Posts",
            vec![
                ColumnSpec::new(EntityId::new("title", vec!["f_title".into()]), "Title", PgType::Text)
                    .required(),
                ColumnSpec::new(EntityId::new("body", vec!["f_body".into()]), "Body", PgType::Text)
                    .with_metadata(ColumnMetadata {
                        text_format: Some(TextFormat::Markdown),
                        ..Default::default()
                    }),
                ColumnSpec::new(
                    EntityId::new("created_on", vec!["f_created".into()]),
                    "Created",
                    PgType::Timestamp,
                )
                .readonly(),
            ],
        );
        spec.title_column_remote_id = Some(vec!["f_title".into()]);
        spec
    }

    #[test]
    fn test_pg_type_parsing() {
        assert_eq!("text[]".parse::<PgType>().unwrap(), PgType::TextArray);
        assert_eq!("JSONB".parse::<PgType>().unwrap(), PgType::Json);
        assert_eq!("NUMERIC_ARRAY".parse::<PgType>().unwrap(), PgType::NumericArray);
        assert!("money".parse::<PgType>().is_err());
        assert_eq!(PgType::BooleanArray.element_type(), Some(PgType::Boolean));
        assert!(!PgType::Json.is_array());
    }

    #[test]
    fn test_pg_type_serde_names() {
        let json = serde_json::to_string(&PgType::TextArray).unwrap();
        assert_eq!(json, "\"TEXT_ARRAY\"");
    }

    #[test]
    fn test_column_lookup() {
        let spec = posts_spec();
        assert_eq!(spec.title_column().unwrap().ws_id(), "title");
        assert!(spec.main_content_column().is_none());
        assert_eq!(spec.column_by_leaf_remote_id("f_body").unwrap().ws_id(), "body");
        assert_eq!(spec.column("body").unwrap().text_format(), Some(TextFormat::Markdown));
        assert_eq!(spec.writable_columns().count(), 2);
    }

    #[test]
    fn test_validate_rejects_bad_columns() {
        assert!(posts_spec().validate().is_ok());

        let mut dup = posts_spec();
        dup.columns.push(dup.columns[0].clone());
        assert!(matches!(dup.validate(), Err(ValidationError::Duplicate { .. })));

        let mut reserved = posts_spec();
        reserved.columns[0].id.ws_id = "id".to_string();
        assert!(matches!(
            reserved.validate(),
            Err(ValidationError::ReservedName { .. })
        ));

        let mut bad_slug = posts_spec();
        bad_slug.columns[1].id.ws_id = "Body Text".to_string();
        assert!(matches!(
            bad_slug.validate(),
            Err(ValidationError::InvalidSlug { .. })
        ));
    }

    #[test]
    fn test_metadata_skips_empty_hints() {
        let json = serde_json::to_value(ColumnMetadata::default()).unwrap();
        assert_eq!(json, serde_json::json!({}));
    }
}
