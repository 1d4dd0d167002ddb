//! `pull`: resumable table pulls with caller-side retry.
//!
//! ```text
//!   resolve table ──► [--restart: clear checkpoint]
//!        │
//!        ▼
//!   with_retry ──► engine.pull(token on attempt 1, checkpoint after)
//!        │
//!        ▼
//!   PullReport per table
//! ```

use serde_json::Value;
use strata_sync::{Connector, PullReport};
use tracing::{error, info};

use super::tables::resolve_table;
use super::{parse_json_arg, Context};
use crate::error::CliError;
use crate::retry::with_retry;

#[derive(Debug, Default)]
pub struct PullOptions {
    pub restart: bool,
    pub resume_token: Option<String>,
}

pub async fn run(
    ctx: &Context,
    connection: &str,
    snapshot: &str,
    tables: &[String],
    options: PullOptions,
) -> Result<(), CliError> {
    let engine = ctx.engine().await?;
    let connector = ctx.connector(connection)?;
    let connector: &dyn Connector = connector.as_ref();
    let resume_token: Option<Value> = options
        .resume_token
        .as_deref()
        .map(|raw| parse_json_arg("--resume-token", raw))
        .transpose()?;

    let mut reports: Vec<PullReport> = Vec::with_capacity(tables.len());
    let mut first_error: Option<CliError> = None;

    for name in tables {
        let table = resolve_table(connector, name).await?;

        if options.restart && engine.clear_checkpoint(snapshot, &table.ws_id).await? {
            info!(snapshot = %snapshot, table = %table.ws_id, "Discarded pull checkpoint");
        }

        let job = format!("pull {}/{}", snapshot, table.ws_id);
        let result = with_retry(&ctx.config.retry, &job, |attempt| {
            // Later attempts continue from the checkpoint the failed one saved.
            let token = if attempt == 1 { resume_token.clone() } else { None };
            engine.pull(snapshot, connector, &table, token)
        })
        .await;

        match result {
            Ok(report) => reports.push(report),
            Err(e) => {
                error!(table = %name, error = %e, "Pull failed");
                if first_error.is_none() {
                    first_error = Some(CliError::from(e));
                }
            }
        }
    }

    ctx.emit(&reports, |reports| {
        for r in reports {
            println!(
                "{}: {} records in {} batches ({} new, {} updated{}){}",
                r.table,
                r.records,
                r.batches,
                r.inserted,
                r.updated,
                if r.dirty_overwritten > 0 {
                    format!(", {} local edits overwritten", r.dirty_overwritten)
                } else {
                    String::new()
                },
                if r.resumed { " [resumed]" } else { "" },
            );
        }
    })?;

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{ColumnSpec, ConnectorRecord, EntityId, FieldMap, PgType, TableSpec};
    use strata_db::Database;
    use strata_sync::connector::memory::{MemoryConnector, MemoryOptions};
    use strata_sync::{RetrySettings, SyncEngine};

    fn posts_spec() -> TableSpec {
        TableSpec::new(
            EntityId::new("posts", vec!["tbl_posts".into()]),
            "Posts",
            vec![ColumnSpec::new(
                EntityId::new("title", vec!["title".into()]),
                "Title",
                PgType::Text,
            )],
        )
    }

    fn rows(n: usize) -> Vec<ConnectorRecord> {
        (0..n)
            .map(|i| {
                let mut fields = FieldMap::new();
                fields.insert("title".into(), serde_json::json!(format!("Post {}", i)));
                ConnectorRecord::new(format!("rec_{:04}", i), fields)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_retry_resumes_interrupted_pull() {
        let connector = MemoryConnector::new(MemoryOptions::default().page_size(100).fail_after_batches(2));
        connector.add_table(posts_spec(), rows(250)).await;

        let engine = SyncEngine::new(Database::in_memory().await.unwrap(), Default::default());
        let retry = RetrySettings {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_secs: 1,
        };

        let table = EntityId::new("posts", vec!["tbl_posts".into()]);
        let report = with_retry(&retry, "pull", |_| {
            engine.pull("blog", &connector, &table, None)
        })
        .await
        .unwrap();

        assert!(report.resumed);
        assert_eq!(report.records_pulled, 250);
        let status = engine.status("blog", "posts").await.unwrap();
        assert!(status.checkpoint.unwrap().is_complete());
    }
}
