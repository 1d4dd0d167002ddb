//! # Snapshot Records
//!
//! The persisted unit of a snapshot and the edit metadata that travels with it.
//!
//! ## Record Anatomy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SnapshotRecord                                   │
//! │                                                                         │
//! │  id ─────────────── { wsId: "rec_1f..", remoteId: "post_88" | null }    │
//! │                                                                         │
//! │  fields ─────────── { title: "Hello", body: "..." }   ◄── authoritative │
//! │                                                                         │
//! │  editedFields ───── { title: 2026-01-03T10:00Z,                         │
//! │                       __created?: ts, __deleted?: ts }                  │
//! │                       non-empty  ⇔  dirty                               │
//! │                                                                         │
//! │  suggestedValues ── { body: "proposed text", __deleted?: ts }           │
//! │                       never returned as a field's value                 │
//! │                                                                         │
//! │  dirty ──────────── true while editedFields is non-empty                │
//! │  metadata ───────── connector-supplied row metadata (JSON)              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Push Routing
//! ```text
//!   editedFields.__deleted set   → DELETE
//!   editedFields.__created set   → CREATE
//!   any other entry              → UPDATE
//!   empty                        → clean (nothing to push)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use ts_rs::TS;

use crate::ids::RecordId;

/// Field values keyed by column wsId.
pub type FieldMap = serde_json::Map<String, Value>;

/// Marker key for a pending create in `editedFields` / `suggestedValues`.
pub const CREATED_MARKER: &str = "__created";

/// Marker key for a pending delete in `editedFields` / `suggestedValues`.
pub const DELETED_MARKER: &str = "__deleted";

// =============================================================================
// PushOperation
// =============================================================================

/// The three push paths, in the order a push cycle drains them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum PushOperation {
    Create,
    Update,
    Delete,
}

impl PushOperation {
    /// Creates before updates before deletes.
    pub const ORDERED: [PushOperation; 3] = [
        PushOperation::Create,
        PushOperation::Update,
        PushOperation::Delete,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            PushOperation::Create => "create",
            PushOperation::Update => "update",
            PushOperation::Delete => "delete",
        }
    }
}

impl std::fmt::Display for PushOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PushOperation {
    type Err = crate::error::ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(PushOperation::Create),
            "update" => Ok(PushOperation::Update),
            "delete" => Ok(PushOperation::Delete),
            _ => Err(crate::error::ValidationError::NotAllowed {
                field: "operation".to_string(),
                allowed: PushOperation::ORDERED
                    .iter()
                    .map(|op| op.as_str().to_string())
                    .collect(),
            }),
        }
    }
}

// =============================================================================
// EditedFields
// =============================================================================

/// Field → edit time, plus the create/delete markers.
///
/// Serialized flat: `{"title": "...", "__created": "..."}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditedFields {
    #[serde(rename = "__created", default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    #[serde(rename = "__deleted", default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub fields: BTreeMap<String, DateTime<Utc>>,
}

impl EditedFields {
    /// Edits for a freshly created local record.
    pub fn created_at(at: DateTime<Utc>) -> Self {
        EditedFields {
            created: Some(at),
            ..Default::default()
        }
    }

    /// True when there is nothing to push.
    pub fn is_empty(&self) -> bool {
        self.created.is_none() && self.deleted.is_none() && self.fields.is_empty()
    }

    /// Records an edit of `field` at `at`.
    pub fn mark_field(&mut self, field: impl Into<String>, at: DateTime<Utc>) {
        self.fields.insert(field.into(), at);
    }

    /// Sets the create marker (clears a delete marker).
    pub fn mark_created(&mut self, at: DateTime<Utc>) {
        self.deleted = None;
        self.created = Some(at);
    }

    /// Sets the delete marker (clears a create marker).
    pub fn mark_deleted(&mut self, at: DateTime<Utc>) {
        self.created = None;
        self.deleted = Some(at);
    }

    /// Drops the delete marker; returns true if one was present.
    pub fn clear_deleted(&mut self) -> bool {
        self.deleted.take().is_some()
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        *self = EditedFields::default();
    }

    /// Which push path a record with these edits belongs to.
    pub fn push_operation(&self) -> Option<PushOperation> {
        if self.deleted.is_some() {
            Some(PushOperation::Delete)
        } else if self.created.is_some() {
            Some(PushOperation::Create)
        } else if !self.fields.is_empty() {
            Some(PushOperation::Update)
        } else {
            None
        }
    }

    /// Field wsIds with a pending edit (markers excluded).
    pub fn edited_field_ids(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

// =============================================================================
// SuggestedValues
// =============================================================================

/// Proposed, not yet applied values plus create/delete proposals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuggestedValues {
    #[serde(rename = "__created", default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    #[serde(rename = "__deleted", default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub values: BTreeMap<String, Value>,
}

impl SuggestedValues {
    pub fn is_empty(&self) -> bool {
        self.created.is_none() && self.deleted.is_none() && self.values.is_empty()
    }

    /// Proposes `value` for `field`, replacing an earlier proposal.
    pub fn suggest(&mut self, field: impl Into<String>, value: Value) {
        self.values.insert(field.into(), value);
    }

    /// Removes and returns the proposal for `field`.
    pub fn take(&mut self, field: &str) -> Option<Value> {
        self.values.remove(field)
    }

    /// Number of pending proposals, markers included.
    pub fn pending_count(&self) -> usize {
        self.values.len()
            + usize::from(self.created.is_some())
            + usize::from(self.deleted.is_some())
    }
}

// =============================================================================
// SnapshotRecord
// =============================================================================

/// One row of a snapshot table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub id: RecordId,
    pub fields: FieldMap,
    pub edited_fields: EditedFields,
    pub suggested_values: SuggestedValues,
    pub dirty: bool,
    pub metadata: Value,
}

impl SnapshotRecord {
    /// True if the record has been pushed at least once.
    pub fn is_pushed(&self) -> bool {
        self.id.remote_id.is_some()
    }

    /// The authoritative value of `field` (suggestions are ignored).
    pub fn value(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Recomputes `dirty` from `edited_fields`.
    pub fn sync_dirty(&mut self) {
        self.dirty = !self.edited_fields.is_empty();
    }

    /// True if `dirty` agrees with `edited_fields`.
    pub fn is_dirty_consistent(&self) -> bool {
        self.dirty == !self.edited_fields.is_empty()
    }

    /// Which push path this record is waiting on, if any.
    pub fn push_operation(&self) -> Option<PushOperation> {
        self.edited_fields.push_operation()
    }

    /// Field values that a push of this record should send.
    ///
    /// Creates send every non-null field; updates send only edited fields.
    pub fn push_fields(&self) -> FieldMap {
        match self.push_operation() {
            Some(PushOperation::Create) => self
                .fields
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            Some(PushOperation::Update) => self
                .edited_fields
                .edited_field_ids()
                .filter_map(|f| {
                    self.fields
                        .get(f)
                        .map(|v| (f.to_string(), v.clone()))
                })
                .collect(),
            _ => FieldMap::new(),
        }
    }
}

// =============================================================================
// ConnectorRecord
// =============================================================================

/// A record as delivered by a connector's pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorRecord {
    /// Native id at the source.
    pub id: String,

    /// Values keyed by column wsId.
    pub fields: FieldMap,

    /// Optional per-row metadata (etag, url, publish state, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ConnectorRecord {
    pub fn new(id: impl Into<String>, fields: FieldMap) -> Self {
        ConnectorRecord {
            id: id.into(),
            fields,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// =============================================================================
// FieldRef
// =============================================================================

/// Addresses one field (or a `__created` / `__deleted` marker) of one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct FieldRef {
    pub ws_id: String,
    pub field_id: String,
}

impl FieldRef {
    pub fn new(ws_id: impl Into<String>, field_id: impl Into<String>) -> Self {
        FieldRef {
            ws_id: ws_id.into(),
            field_id: field_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_edited_fields_flat_serialization() {
        let mut edits = EditedFields::created_at(ts(10));
        edits.mark_field("title", ts(20));

        let value = serde_json::to_value(&edits).unwrap();
        assert!(value.get("__created").is_some());
        assert!(value.get("title").is_some());
        assert!(value.get("__deleted").is_none());

        let back: EditedFields = serde_json::from_value(value).unwrap();
        assert_eq!(back, edits);
        assert_eq!(back.fields.len(), 1);
    }

    #[test]
    fn test_markers_are_mutually_exclusive() {
        let mut edits = EditedFields::created_at(ts(1));
        edits.mark_deleted(ts(2));
        assert!(edits.created.is_none());
        assert_eq!(edits.push_operation(), Some(PushOperation::Delete));

        edits.mark_created(ts(3));
        assert!(edits.deleted.is_none());
        assert_eq!(edits.push_operation(), Some(PushOperation::Create));
    }

    #[test]
    fn test_push_routing() {
        let mut edits = EditedFields::default();
        assert_eq!(edits.push_operation(), None);
        edits.mark_field("body", ts(5));
        assert_eq!(edits.push_operation(), Some(PushOperation::Update));
        assert!(!edits.clear_deleted());
        edits.clear();
        assert!(edits.is_empty());
    }

    #[test]
    fn test_suggested_values_parse_markers() {
        let parsed: SuggestedValues = serde_json::from_value(json!({
            "body": "proposed",
            "__deleted": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(parsed.deleted.is_some());
        assert_eq!(parsed.values.get("body"), Some(&json!("proposed")));
        assert_eq!(parsed.pending_count(), 2);
    }

    #[test]
    fn test_push_fields_for_update_only_sends_edits() {
        let mut fields = FieldMap::new();
        fields.insert("title".into(), json!("Hello"));
        fields.insert("body".into(), json!("World"));

        let mut edited = EditedFields::default();
        edited.mark_field("body", ts(1));

        let mut record = SnapshotRecord {
            id: RecordId {
                ws_id: "rec_a".into(),
                remote_id: Some("r1".into()),
            },
            fields,
            edited_fields: edited,
            suggested_values: SuggestedValues::default(),
            dirty: false,
            metadata: Value::Null,
        };
        assert!(!record.is_dirty_consistent());
        record.sync_dirty();
        assert!(record.dirty);

        let pushed = record.push_fields();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed.get("body"), Some(&json!("World")));
    }

    #[test]
    fn test_push_operation_parse() {
        assert_eq!("Delete".parse::<PushOperation>().unwrap(), PushOperation::Delete);
        assert!("upsert".parse::<PushOperation>().is_err());
    }
}
