//! Snapshot reads, edits and housekeeping.

use serde::Serialize;
use serde_json::Value;
use strata_core::{EditOp, EditTier, FieldRef, SnapshotRecord};
use strata_db::{Filter, ListQuery};
use strata_sync::TableStatus;

use super::{parse_json_arg, Context};
use crate::error::CliError;

fn print_record(record: &SnapshotRecord) {
    let fields = serde_json::to_string(&record.fields).unwrap_or_default();
    println!(
        "{:<28} {:<20} {}{} {}",
        record.id.ws_id,
        record.id.remote_id.as_deref().unwrap_or("(unpushed)"),
        if record.dirty { "*" } else { " " },
        if record.suggested_values.is_empty() { " " } else { "?" },
        fields
    );
}

pub async fn list(
    ctx: &Context,
    snapshot: &str,
    table: &str,
    cursor: Option<String>,
    limit: u32,
    filter: Option<&str>,
) -> Result<(), CliError> {
    if limit == 0 {
        return Err(CliError::invalid_input("--limit must be greater than 0"));
    }
    let filter: Option<Filter> = filter.map(|raw| parse_json_arg("--filter", raw)).transpose()?;

    let engine = ctx.engine().await?;
    let query = ListQuery {
        cursor,
        limit,
        filter,
    };
    let page = engine.list_records(snapshot, table, &query).await?;

    ctx.emit(&page, |page| {
        for record in &page.records {
            print_record(record);
        }
        println!(
            "{} of {} records (filtered {})",
            page.records.len(),
            page.total_count,
            page.filtered_count
        );
        if let Some(next) = &page.next_cursor {
            println!("next page: --cursor {}", next);
        }
    })
}

pub async fn get(ctx: &Context, snapshot: &str, table: &str, ws_id: &str) -> Result<(), CliError> {
    let engine = ctx.engine().await?;
    let record = engine
        .get_record(snapshot, table, ws_id)
        .await?
        .ok_or_else(|| CliError::not_found("Record", ws_id))?;

    ctx.emit(&record, |record| {
        print_record(record);
        if !record.suggested_values.is_empty() {
            for (field, value) in &record.suggested_values.values {
                println!("  suggested {} = {}", field, value);
            }
        }
    })
}

pub async fn edit(
    ctx: &Context,
    snapshot: &str,
    table: &str,
    ops: &str,
    suggest: bool,
) -> Result<(), CliError> {
    let ops: Vec<EditOp> = parse_json_arg("edit ops", ops)?;
    if ops.is_empty() {
        return Err(CliError::invalid_input("No edit operations given"));
    }
    let tier = if suggest {
        EditTier::Suggested
    } else {
        EditTier::Accepted
    };

    let engine = ctx.engine().await?;
    let outcome = engine.apply_edit(snapshot, table, &ops, tier).await?;

    ctx.emit(&outcome, |outcome| {
        println!(
            "{} edit: {} created, {} updated, {} removed",
            tier,
            outcome.created.len(),
            outcome.updated.len(),
            outcome.removed.len()
        );
        for ws_id in &outcome.created {
            println!("  created {}", ws_id);
        }
    })
}

/// Parses `wsId:fieldId`.
fn parse_field_ref(raw: &str) -> Result<FieldRef, CliError> {
    match raw.split_once(':') {
        Some((ws_id, field)) if !ws_id.is_empty() && !field.is_empty() => Ok(FieldRef::new(ws_id, field)),
        _ => Err(CliError::invalid_input(format!(
            "Expected wsId:fieldId, got '{}'",
            raw
        ))),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Resolved {
    accepted: bool,
    fields: usize,
}

/// `accept` / `reject`.
pub async fn resolve(
    ctx: &Context,
    snapshot: &str,
    table: &str,
    refs: &[String],
    all: bool,
    accept: bool,
) -> Result<(), CliError> {
    if !all && refs.is_empty() {
        return Err(CliError::invalid_input("Give wsId:fieldId pairs or --all"));
    }
    let refs = refs
        .iter()
        .map(|raw| parse_field_ref(raw))
        .collect::<Result<Vec<_>, _>>()?;

    let engine = ctx.engine().await?;
    let fields = match (all, accept) {
        (true, true) => engine.accept_all_suggestions(snapshot, table).await?,
        (true, false) => engine.reject_all_suggestions(snapshot, table).await?,
        (false, true) => engine.accept_suggestions(snapshot, table, &refs).await?,
        (false, false) => engine.reject_suggestions(snapshot, table, &refs).await?,
    };

    ctx.emit(&Resolved { accepted: accept, fields }, |r| {
        println!(
            "{} {} suggested value(s)",
            if r.accepted { "Accepted" } else { "Rejected" },
            r.fields
        );
    })
}

pub async fn status(ctx: &Context, snapshot: &str, table: Option<&str>) -> Result<(), CliError> {
    let engine = ctx.engine().await?;
    let tables: Vec<String> = match table {
        Some(table) => vec![table.to_string()],
        None => engine
            .tables(snapshot)
            .await?
            .iter()
            .map(|spec| spec.ws_id().to_string())
            .collect(),
    };
    if tables.is_empty() {
        return Err(CliError::not_found("Snapshot", snapshot));
    }

    let mut statuses: Vec<TableStatus> = Vec::with_capacity(tables.len());
    for table in &tables {
        statuses.push(engine.status(snapshot, table).await?);
    }

    ctx.emit(&statuses, |statuses| {
        for s in statuses {
            let pull = match &s.checkpoint {
                None => "never pulled".to_string(),
                Some(c) if c.is_complete() => format!("pulled {} records", c.records_pulled),
                Some(c) => format!("pull interrupted after {} records", c.records_pulled),
            };
            println!(
                "{}: dirty {} (create {}, update {}, delete {}), {} with suggestions, {}",
                s.table,
                s.dirty.total(),
                s.dirty.create,
                s.dirty.update,
                s.dirty.delete,
                s.pending_suggestions,
                pull
            );
        }
    })
}

pub async fn snapshots(ctx: &Context) -> Result<(), CliError> {
    let engine = ctx.engine().await?;
    let ids = engine.snapshots().await?;
    ctx.emit(&ids, |ids| {
        for id in ids {
            println!("{}", id);
        }
    })
}

pub async fn drop(ctx: &Context, snapshot: &str) -> Result<(), CliError> {
    let engine = ctx.engine().await?;
    if !engine.drop_snapshot(snapshot).await? {
        return Err(CliError::not_found("Snapshot", snapshot));
    }
    ctx.emit(&Value::String(snapshot.to_string()), |_| {
        println!("Dropped snapshot {}", snapshot);
    })
}
