//! # Edit Operations
//!
//! What a user or an agent can do to a snapshot table.
//!
//! ## Two-Tier Edit Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   EditTier::Accepted  (user)           EditTier::Suggested  (agent)     │
//! │   ──────────────────────────           ────────────────────────────     │
//! │   writes `fields`                      writes `suggestedValues` only    │
//! │   marks `editedFields` → dirty         record stays clean               │
//! │                                                 │                       │
//! │                                   accept ───────┤──────── reject        │
//! │                                     │                       │           │
//! │                               moved into `fields`      discarded        │
//! │                               marked dirty                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Shape
//! ```json
//! [
//!   { "op": "create", "fields": { "title": "Draft" } },
//!   { "op": "update", "wsId": "rec_1", "fields": { "title": "Final" } },
//!   { "op": "delete", "wsId": "rec_2" },
//!   { "op": "undelete", "wsId": "rec_2" }
//! ]
//! ```

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::record::FieldMap;

/// Who is making an edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum EditTier {
    /// A user edit: applied immediately and pushed later.
    Accepted,
    /// An agent proposal: stored aside until accepted or rejected.
    Suggested,
}

impl std::fmt::Display for EditTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EditTier::Accepted => f.write_str("accepted"),
            EditTier::Suggested => f.write_str("suggested"),
        }
    }
}

/// One edit operation against a snapshot table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum EditOp {
    /// Adds a new local record. `ws_id` is generated when absent.
    Create {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ws_id: Option<String>,
        #[serde(default)]
        fields: FieldMap,
    },

    /// Changes field values of an existing record.
    Update { ws_id: String, fields: FieldMap },

    /// Marks a record for deletion (never-pushed records are removed).
    Delete { ws_id: String },

    /// Reverts a pending delete.
    Undelete { ws_id: String },
}

impl EditOp {
    pub fn create(fields: FieldMap) -> Self {
        EditOp::Create {
            ws_id: None,
            fields,
        }
    }

    pub fn update(ws_id: impl Into<String>, fields: FieldMap) -> Self {
        EditOp::Update {
            ws_id: ws_id.into(),
            fields,
        }
    }

    pub fn delete(ws_id: impl Into<String>) -> Self {
        EditOp::Delete {
            ws_id: ws_id.into(),
        }
    }

    pub fn undelete(ws_id: impl Into<String>) -> Self {
        EditOp::Undelete {
            ws_id: ws_id.into(),
        }
    }

    /// The target record, if known before the op is applied.
    pub fn ws_id(&self) -> Option<&str> {
        match self {
            EditOp::Create { ws_id, .. } => ws_id.as_deref(),
            EditOp::Update { ws_id, .. }
            | EditOp::Delete { ws_id }
            | EditOp::Undelete { ws_id } => Some(ws_id),
        }
    }

    /// Field values carried by the op (empty for delete/undelete).
    pub fn fields(&self) -> Option<&FieldMap> {
        match self {
            EditOp::Create { fields, .. } | EditOp::Update { fields, .. } => Some(fields),
            EditOp::Delete { .. } | EditOp::Undelete { .. } => None,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EditOp::Create { .. } => "create",
            EditOp::Update { .. } => "update",
            EditOp::Delete { .. } => "delete",
            EditOp::Undelete { .. } => "undelete",
        }
    }
}

/// Result of applying a batch of edit ops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct EditOutcome {
    /// wsIds of records created by the batch, in op order.
    pub created: Vec<String>,
    /// wsIds touched by update/delete/undelete ops.
    pub updated: Vec<String>,
    /// wsIds hard-deleted because they were never pushed.
    pub removed: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_edit_op_wire_shape() {
        let ops: Vec<EditOp> = serde_json::from_value(json!([
            { "op": "create", "fields": { "title": "Draft" } },
            { "op": "update", "wsId": "rec_1", "fields": { "title": "Final" } },
            { "op": "delete", "wsId": "rec_2" },
            { "op": "undelete", "wsId": "rec_2" }
        ]))
        .unwrap();

        assert_eq!(ops.len(), 4);
        assert_eq!(ops[0].ws_id(), None);
        assert_eq!(ops[1].ws_id(), Some("rec_1"));
        assert_eq!(ops[2].kind(), "delete");
        assert!(ops[3].fields().is_none());

        let value = serde_json::to_value(&ops[1]).unwrap();
        assert_eq!(value["op"], "update");
        assert_eq!(value["wsId"], "rec_1");
    }

    #[test]
    fn test_unknown_op_is_rejected() {
        let parsed: Result<EditOp, _> =
            serde_json::from_value(json!({ "op": "merge", "wsId": "rec_1" }));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_tier_serde() {
        assert_eq!(
            serde_json::to_string(&EditTier::Suggested).unwrap(),
            "\"suggested\""
        );
    }
}
