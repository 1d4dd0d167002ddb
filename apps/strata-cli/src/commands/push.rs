//! `push`: drain dirty rows back to the service.
//!
//! Batch failures do not stop a push; they are listed per table and the
//! affected rows stay dirty for the next run. Any batch failure makes the
//! command exit with `PARTIAL_FAILURE`.

use serde::Serialize;
use strata_core::PushOperation;
use strata_sync::{BatchError, OperationReport, PushReport, SyncResult};
use tracing::warn;

use super::Context;
use crate::error::{CliError, ErrorCode};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchFailure {
    operation: PushOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    batch_index: Option<usize>,
    ws_ids: Vec<String>,
    message: String,
}

impl From<&BatchError> for BatchFailure {
    fn from(err: &BatchError) -> Self {
        BatchFailure {
            operation: err.operation,
            batch_index: err.batch_index,
            ws_ids: err.ws_ids.clone(),
            message: err.error.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TablePushSummary {
    table: String,
    pushed: usize,
    operations: Vec<OperationReport>,
    failures: Vec<BatchFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl TablePushSummary {
    fn from_result(table: String, result: SyncResult<PushReport>) -> Self {
        match result {
            Ok(report) => TablePushSummary {
                table: report.table.clone(),
                pushed: report.pushed(),
                failures: report.errors.iter().map(BatchFailure::from).collect(),
                operations: report.operations,
                error: None,
            },
            Err(e) => TablePushSummary {
                table,
                pushed: 0,
                operations: Vec::new(),
                failures: Vec::new(),
                error: Some(e.to_string()),
            },
        }
    }

    fn failed(&self) -> bool {
        self.error.is_some() || !self.failures.is_empty()
    }
}

pub async fn run(
    ctx: &Context,
    connection: &str,
    snapshot: &str,
    tables: &[String],
    operation: Option<PushOperation>,
) -> Result<(), CliError> {
    let engine = ctx.engine().await?;
    let connector = ctx.connector(connection)?;

    let tables: Vec<String> = if tables.is_empty() {
        engine
            .tables(snapshot)
            .await?
            .iter()
            .map(|spec| spec.ws_id().to_string())
            .collect()
    } else {
        tables.to_vec()
    };
    if tables.is_empty() {
        return Err(CliError::not_found("Snapshot", snapshot));
    }

    let results = match operation {
        None => engine.push_all(snapshot, connector.as_ref(), &tables).await,
        Some(op) => {
            let mut results = Vec::with_capacity(tables.len());
            for table in &tables {
                let result = engine.push(snapshot, connector.as_ref(), table, Some(op)).await;
                results.push((table.clone(), result));
            }
            results
        }
    };

    let summaries: Vec<TablePushSummary> = results
        .into_iter()
        .map(|(table, result)| TablePushSummary::from_result(table, result))
        .collect();
    let failed = summaries.iter().filter(|s| s.failed()).count();

    ctx.emit(&summaries, |summaries| {
        for s in summaries {
            if let Some(error) = &s.error {
                println!("{}: failed: {}", s.table, error);
                continue;
            }
            let ops: Vec<String> = s
                .operations
                .iter()
                .filter(|o| o.batches > 0)
                .map(|o| format!("{} {}", o.pushed, o.operation))
                .collect();
            println!(
                "{}: pushed {} ({})",
                s.table,
                s.pushed,
                if ops.is_empty() { "nothing dirty".to_string() } else { ops.join(", ") }
            );
            for f in &s.failures {
                println!("  {} batch failed for {}: {}", f.operation, f.ws_ids.join(", "), f.message);
            }
        }
    })?;

    if failed > 0 {
        warn!(snapshot = %snapshot, failed, "Push finished with failures");
        return Err(CliError::new(
            ErrorCode::PartialFailure,
            format!("{} of {} tables did not push cleanly", failed, summaries.len()),
        )
        .with_description("Rows that failed to push stay dirty and are retried on the next push."));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_db::DbError;
    use strata_sync::SyncError;

    #[test]
    fn test_summary_from_store_failure() {
        let summary = TablePushSummary::from_result(
            "posts".into(),
            Err(SyncError::database("blog/posts", DbError::Internal("locked".into()))),
        );
        assert!(summary.failed());
        assert_eq!(summary.table, "posts");
        assert!(summary.error.unwrap().contains("locked"));
    }

    #[test]
    fn test_summary_from_clean_report() {
        let report = PushReport {
            table: "blog/posts".into(),
            operations: vec![OperationReport {
                operation: PushOperation::Update,
                batches: 1,
                pushed: 3,
                still_dirty: 0,
                lost_claims: 0,
                skipped: 0,
                failed_batches: 0,
            }],
            errors: Vec::new(),
        };
        let summary = TablePushSummary::from_result("posts".into(), Ok(report));
        assert!(!summary.failed());
        assert_eq!(summary.pushed, 3);
    }
}
