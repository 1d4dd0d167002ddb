//! # Identifiers
//!
//! Local and remote identity for tables, columns and records.
//!
//! ## Dual-Key Identity Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Entity Identity                                 │
//! │                                                                         │
//! │   wsId (local)                       remoteId (source)                  │
//! │   ────────────                       ─────────────────                  │
//! │   "blog_posts"                       ["site_91", "coll_44"]             │
//! │   • generated here                   • owned by the connector           │
//! │   • slug: [a-z][a-z0-9_]*            • ordered path, opaque             │
//! │   • stable across pulls              • may be composite                 │
//! │   • doubles as SQL identifier                                           │
//! │                                                                         │
//! │   Records created locally get a placeholder remote id:                  │
//! │       "unpublished_" + wsId   until the first successful push           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use ts_rs::TS;
use uuid::Uuid;

/// Prefix of the synthetic remote id given to never-pushed records.
pub const PLACEHOLDER_PREFIX: &str = "unpublished_";

/// Longest slug accepted as a wsId (fits SQLite/Postgres identifier limits).
pub const MAX_SLUG_LEN: usize = 63;

/// Column names the snapshot store reserves for its own columns.
///
/// SQLite compares identifiers case-insensitively, so `wsid` would clash
/// with the `wsId` primary key.
pub const RESERVED_COLUMN_NAMES: &[&str] = &["wsid", "id"];

// =============================================================================
// EntityId
// =============================================================================

/// Identity of a table or column: local slug plus remote path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct EntityId {
    /// Locally generated, table-safe slug.
    pub ws_id: String,

    /// Ordered path of native identifiers needed to address the entity.
    pub remote_id: Vec<String>,
}

impl EntityId {
    /// Creates an id from an explicit wsId and remote path.
    pub fn new(ws_id: impl Into<String>, remote_id: Vec<String>) -> Self {
        EntityId {
            ws_id: ws_id.into(),
            remote_id,
        }
    }

    /// Creates an id whose wsId is derived from a display name.
    ///
    /// ## Example
    /// ```rust
    /// use strata_core::EntityId;
    ///
    /// let id = EntityId::from_name("Blog Posts", vec!["site".into(), "posts".into()]);
    /// assert_eq!(id.ws_id, "blog_posts");
    /// ```
    pub fn from_name(name: &str, remote_id: Vec<String>) -> Self {
        EntityId {
            ws_id: slugify(name),
            remote_id,
        }
    }

    /// The last element of the remote path (the entity's own native id).
    pub fn leaf_remote_id(&self) -> Option<&str> {
        self.remote_id.last().map(String::as_str)
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.ws_id, self.remote_id.join("/"))
    }
}

// =============================================================================
// RecordId
// =============================================================================

/// Identity of a snapshot record.
///
/// `remote_id` is `None` until the record has been pushed once; the store
/// keeps a placeholder in its place (see [`placeholder_remote_id`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordId {
    pub ws_id: String,
    pub remote_id: Option<String>,
}

impl RecordId {
    /// Builds a record id from the value stored in the `id` column.
    pub fn from_stored(ws_id: impl Into<String>, stored_id: &str) -> Self {
        let remote_id = if is_placeholder_remote_id(stored_id) {
            None
        } else {
            Some(stored_id.to_string())
        };
        RecordId {
            ws_id: ws_id.into(),
            remote_id,
        }
    }

    /// The value to persist in the `id` column.
    pub fn stored_id(&self) -> String {
        match &self.remote_id {
            Some(id) => id.clone(),
            None => placeholder_remote_id(&self.ws_id),
        }
    }
}

// =============================================================================
// Slugs
// =============================================================================

/// Converts a display name into a URL/table-safe slug.
///
/// ## Rules
/// - lowercase ASCII letters, digits and `_` only
/// - runs of other characters collapse into one `_`
/// - must start with a letter (`x_` is prepended otherwise)
/// - at most [`MAX_SLUG_LEN`] characters
///
/// ## Example
/// ```rust
/// use strata_core::ids::slugify;
///
/// assert_eq!(slugify("Post Title (EN)"), "post_title_en");
/// assert_eq!(slugify("2024 Sales"), "x_2024_sales");
/// assert_eq!(slugify("¡¡¡"), "x");
/// ```
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_sep = false;

    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }

    let needs_prefix = slug
        .chars()
        .next()
        .map_or(true, |c| !c.is_ascii_lowercase());
    if needs_prefix {
        slug = if slug.is_empty() {
            "x".to_string()
        } else {
            format!("x_{}", slug)
        };
    }

    slug.truncate(MAX_SLUG_LEN);
    while slug.ends_with('_') {
        slug.pop();
    }
    slug
}

/// Returns true if `value` is a valid wsId slug.
pub fn is_valid_slug(value: &str) -> bool {
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    value.len() <= MAX_SLUG_LEN
        && first.is_ascii_lowercase()
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Returns true if `name` collides with a column the store reserves.
pub fn is_reserved_column_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("__") || RESERVED_COLUMN_NAMES.contains(&lower.as_str())
}

/// Slugifies `name` and suffixes `_2`, `_3`, ... until it is not in `taken`.
pub fn unique_slug(name: &str, taken: &HashSet<String>) -> String {
    let base = slugify(name);
    if !taken.contains(&base) && !is_reserved_column_name(&base) {
        return base;
    }

    let mut n = 2;
    loop {
        let suffix = format!("_{}", n);
        let mut candidate = base.clone();
        candidate.truncate(MAX_SLUG_LEN - suffix.len());
        candidate.push_str(&suffix);
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

// =============================================================================
// Record ids
// =============================================================================

/// Generates a new record wsId (`rec_` + 32 hex chars).
pub fn generate_record_ws_id() -> String {
    format!("rec_{}", Uuid::new_v4().simple())
}

/// The placeholder remote id for a never-pushed record.
pub fn placeholder_remote_id(ws_id: &str) -> String {
    format!("{}{}", PLACEHOLDER_PREFIX, ws_id)
}

/// Returns true if `remote_id` is a placeholder rather than a real source id.
pub fn is_placeholder_remote_id(remote_id: &str) -> bool {
    remote_id.starts_with(PLACEHOLDER_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_rules() {
        assert_eq!(slugify("Title"), "title");
        assert_eq!(slugify("  Main -- Content  "), "main_content");
        assert_eq!(slugify("9 lives"), "x_9_lives");
        assert_eq!(slugify(""), "x");
        assert!(slugify(&"a".repeat(200)).len() <= MAX_SLUG_LEN);
    }

    #[test]
    fn test_slug_validation() {
        assert!(is_valid_slug("blog_posts"));
        assert!(is_valid_slug("rec_0a1b"));
        assert!(!is_valid_slug("Blog"));
        assert!(!is_valid_slug("_x"));
        assert!(!is_valid_slug("1abc"));
        assert!(!is_valid_slug(""));
        assert!(!is_valid_slug("has-dash"));
    }

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved_column_name("id"));
        assert!(is_reserved_column_name("wsid"));
        assert!(is_reserved_column_name("WsId"));
        assert!(is_reserved_column_name("__dirty"));
        assert!(!is_reserved_column_name("title"));
    }

    #[test]
    fn test_unique_slug_suffixes() {
        let mut taken = HashSet::new();
        taken.insert("title".to_string());
        taken.insert("title_2".to_string());
        assert_eq!(unique_slug("Title", &taken), "title_3");
        assert_eq!(unique_slug("Body", &taken), "body");
        assert_eq!(unique_slug("ID", &taken), "id_2");
    }

    #[test]
    fn test_placeholder_round_trip() {
        let ws_id = generate_record_ws_id();
        assert!(is_valid_slug(&ws_id));

        let stored = placeholder_remote_id(&ws_id);
        let record_id = RecordId::from_stored(ws_id.clone(), &stored);
        assert_eq!(record_id.remote_id, None);
        assert_eq!(record_id.stored_id(), stored);

        let pushed = RecordId::from_stored(ws_id, "remote-42");
        assert_eq!(pushed.remote_id.as_deref(), Some("remote-42"));
    }
}
