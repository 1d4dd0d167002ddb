//! `tables`: table discovery on a connection.

use strata_core::{EntityId, TablePreview};
use strata_sync::{Connector, DiscoveryMode, SyncError, TableSearchPage};

use super::Context;
use crate::error::CliError;

pub async fn run(
    ctx: &Context,
    connection: &str,
    search: Option<&str>,
    cursor: Option<&str>,
) -> Result<(), CliError> {
    let connector = ctx.connector(connection)?;
    let service = connector.display_name().to_string();

    let page = match (connector.discovery_mode(), search, cursor) {
        (DiscoveryMode::List, None, None) => TableSearchPage {
            tables: connector
                .list_tables()
                .await
                .map_err(|e| SyncError::connector(&service, e))?,
            has_more: false,
            next_cursor: None,
        },
        _ => connector
            .search_tables(search, cursor)
            .await
            .map_err(|e| SyncError::connector(&service, e))?,
    };

    ctx.emit(&page, |page| {
        for table in &page.tables {
            println!(
                "{:<24} {:<32} {}",
                table.id.ws_id,
                table.display_name,
                table.id.remote_id.join("/")
            );
        }
        if let Some(next) = &page.next_cursor {
            println!("more results: --cursor {}", next);
        }
    })
}

/// Finds the table a user named on the command line.
///
/// Matches the wsId, the leaf remote id, or the display name
/// (case-insensitive), in that order.
pub async fn resolve_table(connector: &dyn Connector, name: &str) -> Result<EntityId, CliError> {
    let service = connector.display_name().to_string();
    let candidates = match connector.discovery_mode() {
        DiscoveryMode::List => connector.list_tables().await,
        DiscoveryMode::Search => connector.search_tables(Some(name), None).await.map(|p| p.tables),
    }
    .map_err(|e| SyncError::connector(&service, e))?;

    pick_table(&candidates, name)
        .map(|preview| preview.id.clone())
        .ok_or_else(|| CliError::not_found("Table", name))
}

fn pick_table<'a>(candidates: &'a [TablePreview], name: &str) -> Option<&'a TablePreview> {
    candidates
        .iter()
        .find(|t| t.id.ws_id == name)
        .or_else(|| {
            candidates
                .iter()
                .find(|t| t.id.remote_id.last().map(String::as_str) == Some(name))
        })
        .or_else(|| {
            candidates
                .iter()
                .find(|t| t.display_name.eq_ignore_ascii_case(name))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{ColumnSpec, PgType, TableSpec};
    use strata_sync::connector::memory::{MemoryConnector, MemoryOptions};

    fn preview(ws_id: &str, remote: &str, name: &str) -> TablePreview {
        TablePreview {
            id: EntityId::new(ws_id, vec![remote.to_string()]),
            display_name: name.to_string(),
        }
    }

    #[test]
    fn test_pick_table_precedence() {
        let tables = vec![
            preview("posts", "tbl_1", "Articles"),
            preview("authors", "posts", "Posts"),
        ];
        assert_eq!(pick_table(&tables, "posts").unwrap().id.ws_id, "posts");
        assert_eq!(pick_table(&tables, "tbl_1").unwrap().id.ws_id, "posts");
        assert_eq!(pick_table(&tables, "articles").unwrap().id.ws_id, "posts");
        assert!(pick_table(&tables, "comments").is_none());
    }

    #[tokio::test]
    async fn test_resolve_table_against_connector() {
        let connector = MemoryConnector::new(MemoryOptions::default());
        let spec = TableSpec::new(
            EntityId::new("posts", vec!["tbl_posts".into()]),
            "Blog Posts",
            vec![ColumnSpec::new(
                EntityId::new("title", vec!["f_title".into()]),
                "Title",
                PgType::Text,
            )],
        );
        connector.add_table(spec, Vec::new()).await;

        let id = resolve_table(&connector, "blog posts").await.unwrap();
        assert_eq!(id.remote_id, vec!["tbl_posts".to_string()]);
        assert!(resolve_table(&connector, "nope").await.is_err());
    }
}
