//! # JSON API Connector
//!
//! Generic REST/JSON source over HTTP with bearer authentication.
//!
//! ## Endpoints
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  GET   {base}/tables                    {"tables": [{id, name}]}        │
//! │  GET   {base}/tables/{id}               {id, name, columns: [...]}      │
//! │  GET   {base}/tables/{id}/records       ?offset=&limit=                 │
//! │                                         {"records": [...], "nextOffset"}│
//! │  POST  {base}/tables/{id}/records       {"records": [{ref, fields}]}    │
//! │                                         → {"records": [{ref, id}]}      │
//! │  PATCH {base}/tables/{id}/records       {"records": [{id, fields}]}     │
//! │  POST  {base}/tables/{id}/records/delete {"ids": [...]}                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Wire payloads are keyed by remote column id; snapshot records are keyed
//! by column wsId. The [`TableSpec`] maps between them.
//!
//! Failing responses may carry `{"error": {"message": "...", "code": "..."}}`,
//! which [`Connector::classify_error`] turns into a service message.

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use strata_core::classify::classify_with;
use strata_core::ids::unique_slug;
use strata_core::richtext::{ParagraphTransform, RichTextTransform};
use strata_core::schema::TextFormat;
use strata_core::{
    ClassifiedError, ColumnMetadata, ColumnSpec, ConnectorError, ConnectorRecord, EntityId,
    ErrorCategory, FieldMap, PgType, PushOperation, SnapshotRecord, TablePreview, TableSpec,
};
use tracing::{debug, warn};
use url::Url;

use super::{Connector, ConnectorResult, PullBatch, PullBatchHandler};
use crate::config::ConnectionConfig;

pub const SERVICE_NAME: &str = "json_api";

const DEFAULT_PAGE_SIZE: usize = 100;
const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct TablesResponse {
    tables: Vec<WireTable>,
}

#[derive(Debug, Deserialize)]
struct WireTable {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTableSpec {
    id: String,
    name: String,
    #[serde(default)]
    columns: Vec<WireColumn>,
    #[serde(default)]
    title_column: Option<String>,
    #[serde(default)]
    main_content_column: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireColumn {
    id: String,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    readonly: bool,
    #[serde(default)]
    format: Option<TextFormat>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordsResponse {
    records: Vec<WireRecord>,
    #[serde(default)]
    next_offset: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    id: String,
    #[serde(default)]
    fields: FieldMap,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
struct CreateItem<'a> {
    #[serde(rename = "ref")]
    reference: &'a str,
    fields: FieldMap,
}

#[derive(Debug, Serialize)]
struct UpdateItem<'a> {
    id: &'a str,
    fields: FieldMap,
}

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    records: Vec<CreatedRef>,
}

#[derive(Debug, Deserialize)]
struct CreatedRef {
    #[serde(rename = "ref")]
    reference: String,
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

// =============================================================================
// Connector
// =============================================================================

/// REST/JSON connector.
#[derive(Clone)]
pub struct JsonApiConnector {
    client: Client,
    base_url: Url,
    api_key: String,
    display_name: String,
    page_size: usize,
    batch_size: usize,
    native_documents: bool,
    rich_text: Arc<dyn RichTextTransform>,
}

impl std::fmt::Debug for JsonApiConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonApiConnector")
            .field("base_url", &self.base_url.as_str())
            .field("display_name", &self.display_name)
            .field("page_size", &self.page_size)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

fn instantiation(reason: impl Into<String>) -> ConnectorError {
    ConnectorError::Instantiation {
        service: SERVICE_NAME.to_string(),
        reason: reason.into(),
    }
}

impl JsonApiConnector {
    /// Builds the connector from `[connections.<name>]`.
    ///
    /// ## Settings
    /// - `base_url`, `api_key` (required)
    /// - `settings.display_name`, `settings.page_size`, `settings.batch_size`,
    ///   `settings.timeout_secs`, `settings.native_documents`
    ///
    /// Fails before any network call when credentials or the URL are unusable.
    pub fn from_config(config: &ConnectionConfig) -> ConnectorResult<Self> {
        let raw_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| instantiation("base_url is required"))?;
        let base_url = Url::parse(raw_url).map_err(|e| instantiation(format!("base_url: {}", e)))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(instantiation(format!(
                "base_url must be http or https, got {}",
                base_url.scheme()
            )));
        }

        let api_key = config
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| instantiation("api_key is required"))?
            .to_string();

        let timeout = config.setting_u64("timeout_secs").unwrap_or(DEFAULT_TIMEOUT_SECS);
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(|e| instantiation(format!("HTTP client: {}", e)))?;

        Ok(JsonApiConnector {
            client,
            base_url,
            api_key,
            display_name: config
                .setting_str("display_name")
                .unwrap_or("JSON API")
                .to_string(),
            page_size: config
                .setting_u64("page_size")
                .map(|n| n as usize)
                .unwrap_or(DEFAULT_PAGE_SIZE)
                .max(1),
            batch_size: config
                .setting_u64("batch_size")
                .map(|n| n as usize)
                .unwrap_or(DEFAULT_BATCH_SIZE)
                .max(1),
            native_documents: config
                .settings
                .get("native_documents")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            rich_text: Arc::new(ParagraphTransform),
        })
    }

    /// Replaces the rich-text converter.
    pub fn with_rich_text(mut self, transform: Arc<dyn RichTextTransform>) -> Self {
        self.rich_text = transform;
        self
    }

    /// `{base}/seg/seg/...`, each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> ConnectorResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| instantiation(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn table_remote_id<'a>(&self, spec: &'a TableSpec) -> ConnectorResult<&'a str> {
        spec.id
            .leaf_remote_id()
            .ok_or_else(|| ConnectorError::InvalidResponse {
                reason: format!("table {} has no remote id", spec.ws_id()),
            })
    }

    async fn send(&self, request: RequestBuilder) -> ConnectorResult<reqwest::Response> {
        let response = request
            .bearer_auth(&self.api_key)
            .header("accept", "application/json")
            .send()
            .await
            .map_err(transport_error)?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, retry_after, body))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> ConnectorResult<T> {
        self.send(request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ConnectorError::InvalidResponse {
                reason: e.to_string(),
            })
    }

    /// Wire fields (remote column ids) → snapshot fields (column wsIds).
    fn fields_from_wire(&self, spec: &TableSpec, wire: FieldMap) -> FieldMap {
        let mut fields = FieldMap::new();
        for (remote_id, value) in wire {
            let Some(column) = spec.column_by_leaf_remote_id(&remote_id) else {
                continue;
            };
            let value = match (column.text_format(), &value) {
                (Some(TextFormat::Html), Value::Object(_)) => {
                    Value::String(self.rich_text.from_native_document(&value))
                }
                _ => value,
            };
            fields.insert(column.ws_id().to_string(), value);
        }
        fields
    }

    /// Snapshot fields (column wsIds) → wire fields (remote column ids).
    fn fields_to_wire(&self, spec: &TableSpec, fields: FieldMap) -> FieldMap {
        let mut wire = FieldMap::new();
        for (ws_id, value) in fields {
            let Some(column) = spec.column(&ws_id) else {
                continue;
            };
            if column.readonly {
                continue;
            }
            let Some(remote_id) = column.id.leaf_remote_id() else {
                continue;
            };
            let value = match (self.native_documents, column.text_format(), &value) {
                (true, Some(TextFormat::Html), Value::String(html)) => {
                    self.rich_text.to_native_document(html)
                }
                _ => value,
            };
            wire.insert(remote_id.to_string(), value);
        }
        wire
    }
}

// =============================================================================
// Error Mapping
// =============================================================================

fn transport_error(err: reqwest::Error) -> ConnectorError {
    if err.is_timeout() {
        ConnectorError::Timeout {
            message: err.to_string(),
        }
    } else if err.is_decode() {
        ConnectorError::InvalidResponse {
            reason: err.to_string(),
        }
    } else {
        ConnectorError::Network {
            message: err.to_string(),
        }
    }
}

fn status_error(status: StatusCode, retry_after_secs: Option<u64>, body: String) -> ConnectorError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ConnectorError::Unauthorized {
            message: service_error(&body)
                .map(|e| e.message)
                .unwrap_or_else(|| status.to_string()),
        },
        StatusCode::TOO_MANY_REQUESTS => ConnectorError::RateLimited { retry_after_secs },
        StatusCode::PAYLOAD_TOO_LARGE => ConnectorError::ResponseTooLarge { message: body },
        _ => ConnectorError::Http {
            status: status.as_u16(),
            body,
        },
    }
}

fn service_error(body: &str) -> Option<ErrorBody> {
    serde_json::from_str::<ErrorEnvelope>(body).ok().map(|e| e.error)
}

// =============================================================================
// Spec Mapping
// =============================================================================

fn table_id(remote_id: &str, name: &str) -> EntityId {
    EntityId::from_name(name, vec![remote_id.to_string()])
}

fn table_spec_from_wire(wire: WireTableSpec) -> ConnectorResult<TableSpec> {
    let mut taken = HashSet::new();
    let mut columns = Vec::with_capacity(wire.columns.len());

    for column in wire.columns {
        let pg_type: PgType = column.kind.parse().map_err(|_| ConnectorError::InvalidResponse {
            reason: format!("column {} has unsupported type '{}'", column.id, column.kind),
        })?;
        let ws_id = unique_slug(&column.name, &taken);
        taken.insert(ws_id.clone());

        let mut spec = ColumnSpec::new(EntityId::new(ws_id, vec![column.id]), column.name, pg_type);
        if column.required {
            spec = spec.required();
        }
        if column.readonly {
            spec = spec.readonly();
        }
        if let Some(format) = column.format {
            spec = spec.with_metadata(ColumnMetadata {
                text_format: Some(format),
                ..Default::default()
            });
        }
        columns.push(spec);
    }

    let mut spec = TableSpec::new(table_id(&wire.id, &wire.name), wire.name, columns);
    spec.title_column_remote_id = wire.title_column.map(|c| vec![c]);
    spec.main_content_column_remote_id = wire.main_content_column.map(|c| vec![c]);
    spec.validate().map_err(|e| ConnectorError::InvalidResponse {
        reason: format!("table {}: {}", spec.name, e),
    })?;
    Ok(spec)
}

fn offset_of(progress: Option<&Value>) -> ConnectorResult<u64> {
    match progress {
        None | Some(Value::Null) => Ok(0),
        Some(value) => value
            .get("offset")
            .and_then(Value::as_u64)
            .ok_or_else(|| ConnectorError::InvalidResponse {
                reason: format!("unrecognized pull progress: {}", value),
            }),
    }
}

#[async_trait]
impl Connector for JsonApiConnector {
    fn service_name(&self) -> &str {
        SERVICE_NAME
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    async fn test_connection(&self) -> ConnectorResult<()> {
        let url = self.endpoint(&["tables"])?;
        self.send(self.client.get(url)).await?;
        Ok(())
    }

    async fn list_tables(&self) -> ConnectorResult<Vec<TablePreview>> {
        let url = self.endpoint(&["tables"])?;
        let response: TablesResponse = self.send_json(self.client.get(url)).await?;
        Ok(response
            .tables
            .into_iter()
            .map(|t| TablePreview {
                id: table_id(&t.id, &t.name),
                display_name: t.name,
            })
            .collect())
    }

    async fn fetch_table_spec(&self, table: &EntityId) -> ConnectorResult<TableSpec> {
        let remote_id = table
            .leaf_remote_id()
            .ok_or_else(|| ConnectorError::InvalidResponse {
                reason: format!("table {} has no remote id", table.ws_id),
            })?;
        let url = self.endpoint(&["tables", remote_id])?;
        let wire: WireTableSpec = self.send_json(self.client.get(url)).await?;
        let mut spec = table_spec_from_wire(wire)?;
        // Keep the caller's wsId so renamed tables map to the same snapshot table.
        spec.id.ws_id = table.ws_id.clone();
        spec.slug = table.ws_id.clone();
        Ok(spec)
    }

    async fn pull_records(
        &self,
        spec: &TableSpec,
        progress: Option<Value>,
        handler: &mut dyn PullBatchHandler,
    ) -> ConnectorResult<()> {
        let remote_id = self.table_remote_id(spec)?;
        let url = self.endpoint(&["tables", remote_id, "records"])?;
        let mut offset = offset_of(progress.as_ref())?;

        loop {
            let request = self.client.get(url.clone()).query(&[
                ("offset", offset.to_string()),
                ("limit", self.page_size.to_string()),
            ]);
            let page: RecordsResponse = self.send_json(request).await?;
            if page.records.is_empty() {
                return Ok(());
            }

            let count = page.records.len() as u64;
            let records: Vec<ConnectorRecord> = page
                .records
                .into_iter()
                .map(|r| {
                    let record = ConnectorRecord::new(r.id, self.fields_from_wire(spec, r.fields));
                    match r.metadata {
                        Some(metadata) => record.with_metadata(metadata),
                        None => record,
                    }
                })
                .collect();

            let next = page.next_offset.unwrap_or(offset + count);
            if next <= offset {
                return Err(ConnectorError::InvalidResponse {
                    reason: format!("nextOffset {} does not advance past offset {}", next, offset),
                });
            }
            debug!(table = %spec.ws_id(), offset, count, "Pulled page");
            handler
                .on_batch(PullBatch {
                    records,
                    progress: json!({ "offset": next }),
                })
                .await?;

            if page.next_offset.is_none() && (count as usize) < self.page_size {
                return Ok(());
            }
            offset = next;
        }
    }

    fn batch_size(&self, _operation: PushOperation) -> usize {
        self.batch_size
    }

    async fn create_records(
        &self,
        spec: &TableSpec,
        records: &[SnapshotRecord],
    ) -> ConnectorResult<HashMap<String, String>> {
        let remote_id = self.table_remote_id(spec)?;
        let url = self.endpoint(&["tables", remote_id, "records"])?;
        let items: Vec<CreateItem<'_>> = records
            .iter()
            .map(|r| CreateItem {
                reference: &r.id.ws_id,
                fields: self.fields_to_wire(spec, r.push_fields()),
            })
            .collect();

        let response: CreatedResponse = self
            .send_json(self.client.post(url).json(&json!({ "records": items })))
            .await?;

        let created: HashMap<String, String> = response
            .records
            .into_iter()
            .map(|r| (r.reference, r.id))
            .collect();
        if created.len() < records.len() {
            warn!(
                table = %spec.ws_id(),
                sent = records.len(),
                returned = created.len(),
                "Create response is missing ids"
            );
        }
        Ok(created)
    }

    async fn update_records(&self, spec: &TableSpec, records: &[SnapshotRecord]) -> ConnectorResult<()> {
        let remote_id = self.table_remote_id(spec)?;
        let url = self.endpoint(&["tables", remote_id, "records"])?;
        let items = records
            .iter()
            .map(|r| {
                let id = r.id.remote_id.as_deref().ok_or_else(|| ConnectorError::InvalidResponse {
                    reason: format!("record {} was never pushed", r.id.ws_id),
                })?;
                Ok(UpdateItem {
                    id,
                    fields: self.fields_to_wire(spec, r.push_fields()),
                })
            })
            .collect::<ConnectorResult<Vec<_>>>()?;

        self.send(self.client.patch(url).json(&json!({ "records": items })))
            .await?;
        Ok(())
    }

    async fn delete_records(&self, spec: &TableSpec, records: &[SnapshotRecord]) -> ConnectorResult<()> {
        let remote_id = self.table_remote_id(spec)?;
        let url = self.endpoint(&["tables", remote_id, "records", "delete"])?;
        let ids: Vec<&str> = records
            .iter()
            .filter_map(|r| r.id.remote_id.as_deref())
            .collect();
        if ids.is_empty() {
            return Ok(());
        }

        self.send(self.client.post(url).json(&json!({ "ids": ids })))
            .await?;
        Ok(())
    }

    fn classify_error(&self, error: &ConnectorError) -> ClassifiedError {
        classify_with(&self.display_name, error, |err| match err {
            ConnectorError::Http { status, body } => service_error(body).map(|e| {
                ClassifiedError::new(
                    ErrorCategory::Service,
                    format!("{} reported an error: {}", self.display_name, e.message),
                )
                .with_context(json!({ "status": status, "code": e.code }))
            }),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use strata_core::{EditedFields, RecordId, SuggestedValues};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    // =========================================================================
    // HTTP stub
    // =========================================================================

    #[derive(Debug, Clone)]
    struct Seen {
        method: String,
        target: String,
        authorization: Option<String>,
        body: Value,
    }

    /// Serves `replies` in order, one request per connection.
    async fn stub_server(replies: Vec<(u16, Value)>) -> (String, Arc<Mutex<Vec<Seen>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen: Arc<Mutex<Vec<Seen>>> = Arc::default();
        let log = Arc::clone(&seen);

        tokio::spawn(async move {
            for (status, reply) in replies {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let mut stream = BufReader::new(stream);

                let mut request_line = String::new();
                stream.read_line(&mut request_line).await.unwrap();
                let mut parts = request_line.split_whitespace();
                let method = parts.next().unwrap_or_default().to_string();
                let target = parts.next().unwrap_or_default().to_string();

                let mut content_length = 0usize;
                let mut authorization = None;
                loop {
                    let mut line = String::new();
                    stream.read_line(&mut line).await.unwrap();
                    let line = line.trim_end();
                    if line.is_empty() {
                        break;
                    }
                    if let Some((name, value)) = line.split_once(':') {
                        match name.trim().to_ascii_lowercase().as_str() {
                            "content-length" => content_length = value.trim().parse().unwrap(),
                            "authorization" => authorization = Some(value.trim().to_string()),
                            _ => {}
                        }
                    }
                }
                let mut body = vec![0u8; content_length];
                stream.read_exact(&mut body).await.unwrap();

                log.lock().unwrap().push(Seen {
                    method,
                    target,
                    authorization,
                    body: serde_json::from_slice(&body).unwrap_or(Value::Null),
                });

                let payload = reply.to_string();
                let response = format!(
                    "HTTP/1.1 {} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    payload.len(),
                    payload
                );
                stream.get_mut().write_all(response.as_bytes()).await.unwrap();
                stream.get_mut().shutdown().await.ok();
            }
        });

        (format!("http://{}/v1/", addr), seen)
    }

    fn stub_connector(base_url: &str, page_size: u64) -> JsonApiConnector {
        JsonApiConnector::from_config(
            &ConnectionConfig::new(SERVICE_NAME)
                .with_base_url(base_url)
                .with_api_key("secret")
                .with_setting("page_size", json!(page_size)),
        )
        .unwrap()
    }

    #[derive(Default)]
    struct Collect(Vec<PullBatch>);

    #[async_trait]
    impl PullBatchHandler for Collect {
        async fn on_batch(&mut self, batch: PullBatch) -> ConnectorResult<()> {
            self.0.push(batch);
            Ok(())
        }
    }

    fn local_record(ws_id: &str, remote_id: Option<&str>, edited: Value, fields: Value) -> SnapshotRecord {
        let edited: EditedFields = serde_json::from_value(edited).unwrap();
        SnapshotRecord {
            id: RecordId {
                ws_id: ws_id.to_string(),
                remote_id: remote_id.map(str::to_string),
            },
            fields: serde_json::from_value(fields).unwrap(),
            dirty: !edited.is_empty(),
            edited_fields: edited,
            suggested_values: SuggestedValues::default(),
            metadata: Value::Null,
        }
    }

    #[tokio::test]
    async fn test_pull_follows_pages_until_short_page() {
        let (base, seen) = stub_server(vec![
            (
                200,
                json!({
                    "records": [
                        { "id": "r1", "fields": { "c1": "One", "c9": "dropped" } },
                        { "id": "r2", "fields": { "c1": "Two" }, "metadata": { "etag": "x" } }
                    ],
                    "nextOffset": 2
                }),
            ),
            (200, json!({ "records": [{ "id": "r3", "fields": { "c1": "Three" } }] })),
        ])
        .await;
        let connector = stub_connector(&base, 2);
        let spec = table_spec_from_wire(wire_spec()).unwrap();

        let mut collect = Collect::default();
        connector.pull_records(&spec, None, &mut collect).await.unwrap();

        assert_eq!(collect.0.len(), 2);
        assert_eq!(collect.0[0].progress, json!({ "offset": 2 }));
        assert_eq!(collect.0[1].progress, json!({ "offset": 3 }));
        let first = &collect.0[0].records[0];
        assert_eq!(first.id, "r1");
        assert_eq!(first.fields.get("title"), Some(&json!("One")));
        assert_eq!(first.fields.len(), 1);
        assert_eq!(collect.0[0].records[1].metadata, Some(json!({ "etag": "x" })));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].method, "GET");
        assert_eq!(seen[0].target, "/v1/tables/tbl_9/records?offset=0&limit=2");
        assert_eq!(seen[1].target, "/v1/tables/tbl_9/records?offset=2&limit=2");
        assert_eq!(seen[0].authorization.as_deref(), Some("Bearer secret"));
    }

    #[tokio::test]
    async fn test_pull_resumes_from_progress_offset() {
        let (base, seen) = stub_server(vec![(200, json!({ "records": [] }))]).await;
        let connector = stub_connector(&base, 50);
        let spec = table_spec_from_wire(wire_spec()).unwrap();

        let mut collect = Collect::default();
        connector
            .pull_records(&spec, Some(json!({ "offset": 120 })), &mut collect)
            .await
            .unwrap();

        assert!(collect.0.is_empty());
        assert_eq!(seen.lock().unwrap()[0].target, "/v1/tables/tbl_9/records?offset=120&limit=50");
    }

    #[tokio::test]
    async fn test_pull_rejects_next_offset_that_does_not_advance() {
        let (base, _seen) = stub_server(vec![(
            200,
            json!({ "records": [{ "id": "r1", "fields": {} }], "nextOffset": 0 }),
        )])
        .await;
        let connector = stub_connector(&base, 1);
        let spec = table_spec_from_wire(wire_spec()).unwrap();

        let mut collect = Collect::default();
        let err = connector.pull_records(&spec, None, &mut collect).await.unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidResponse { .. }));
        assert!(collect.0.is_empty());
    }

    #[tokio::test]
    async fn test_create_maps_references_to_remote_ids() {
        let (base, seen) = stub_server(vec![(
            200,
            json!({ "records": [{ "ref": "post_a", "id": "rem_1" }] }),
        )])
        .await;
        let connector = stub_connector(&base, 10);
        let spec = table_spec_from_wire(wire_spec()).unwrap();
        let records = vec![
            local_record(
                "post_a",
                None,
                json!({ "__created": "2024-05-01T00:00:00Z" }),
                json!({ "title": "A", "created": "2024-05-01T00:00:00Z" }),
            ),
            local_record(
                "post_b",
                None,
                json!({ "__created": "2024-05-01T00:00:00Z" }),
                json!({ "title": "B" }),
            ),
        ];

        let created = connector.create_records(&spec, &records).await.unwrap();
        assert_eq!(created, HashMap::from([("post_a".to_string(), "rem_1".to_string())]));

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].method, "POST");
        assert_eq!(seen[0].target, "/v1/tables/tbl_9/records");
        assert_eq!(
            seen[0].body,
            json!({ "records": [
                { "ref": "post_a", "fields": { "c1": "A" } },
                { "ref": "post_b", "fields": { "c1": "B" } }
            ] })
        );
    }

    #[tokio::test]
    async fn test_update_sends_only_edited_fields() {
        let (base, seen) = stub_server(vec![(200, json!({}))]).await;
        let connector = stub_connector(&base, 10);
        let spec = table_spec_from_wire(wire_spec()).unwrap();
        let records = vec![local_record(
            "post_a",
            Some("rem_1"),
            json!({ "body": "2024-05-01T00:00:00Z" }),
            json!({ "title": "A", "body": "<p>New</p>" }),
        )];

        connector.update_records(&spec, &records).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].method, "PATCH");
        assert_eq!(
            seen[0].body,
            json!({ "records": [{ "id": "rem_1", "fields": { "c2": "<p>New</p>" } }] })
        );
    }

    #[tokio::test]
    async fn test_delete_posts_remote_ids_and_maps_failures() {
        let (base, seen) = stub_server(vec![
            (200, json!({})),
            (429, json!({ "error": { "message": "slow down" } })),
        ])
        .await;
        let connector = stub_connector(&base, 10);
        let spec = table_spec_from_wire(wire_spec()).unwrap();
        let records = vec![
            local_record("post_a", Some("rem_1"), json!({ "__deleted": "2024-05-01T00:00:00Z" }), json!({})),
            local_record("post_b", None, json!({ "__deleted": "2024-05-01T00:00:00Z" }), json!({})),
        ];

        connector.delete_records(&spec, &records).await.unwrap();
        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen[0].target, "/v1/tables/tbl_9/records/delete");
            assert_eq!(seen[0].body, json!({ "ids": ["rem_1"] }));
        }

        let err = connector.delete_records(&spec, &records).await.unwrap_err();
        assert!(matches!(err, ConnectorError::RateLimited { .. }));
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig::new(SERVICE_NAME)
            .with_base_url("https://api.example.com/v1/")
            .with_api_key("secret")
            .with_setting("display_name", json!("Example CMS"))
    }

    fn wire_spec() -> WireTableSpec {
        serde_json::from_value(json!({
            "id": "tbl_9",
            "name": "Blog Posts",
            "titleColumn": "c1",
            "columns": [
                { "id": "c1", "name": "Title", "type": "string", "required": true },
                { "id": "c2", "name": "Body", "type": "text", "format": "html" },
                { "id": "c3", "name": "Title", "type": "number" },
                { "id": "c4", "name": "Created", "type": "timestamptz", "readonly": true }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_instantiation_requires_url_and_key() {
        assert!(JsonApiConnector::from_config(&config()).is_ok());

        let no_key = ConnectionConfig::new(SERVICE_NAME).with_base_url("https://api.example.com");
        assert!(matches!(
            JsonApiConnector::from_config(&no_key),
            Err(ConnectorError::Instantiation { .. })
        ));

        let bad_scheme = config().with_base_url("ftp://api.example.com");
        assert!(matches!(
            JsonApiConnector::from_config(&bad_scheme),
            Err(ConnectorError::Instantiation { .. })
        ));
    }

    #[test]
    fn test_endpoint_encodes_segments() {
        let connector = JsonApiConnector::from_config(&config()).unwrap();
        let url = connector.endpoint(&["tables", "a b/c", "records"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/tables/a%20b%2Fc/records");
    }

    #[test]
    fn test_table_spec_mapping() {
        let spec = table_spec_from_wire(wire_spec()).unwrap();
        assert_eq!(spec.ws_id(), "blog_posts");
        assert_eq!(spec.id.remote_id, vec!["tbl_9"]);
        assert_eq!(spec.title_column_remote_id, Some(vec!["c1".to_string()]));

        let ws_ids: Vec<&str> = spec.columns.iter().map(|c| c.ws_id()).collect();
        assert_eq!(ws_ids, vec!["title", "body", "title_2", "created"]);
        assert_eq!(spec.columns[2].pg_type, PgType::Numeric);
        assert!(spec.columns[0].required);
        assert!(spec.columns[3].readonly);
        assert_eq!(spec.columns[1].text_format(), Some(TextFormat::Html));
    }

    #[test]
    fn test_unknown_column_type_is_invalid_response() {
        let mut wire = wire_spec();
        wire.columns[0].kind = "geopoint".into();
        assert!(matches!(
            table_spec_from_wire(wire),
            Err(ConnectorError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_field_mapping_both_ways() {
        let connector = JsonApiConnector::from_config(&config().with_setting("native_documents", json!(true)))
            .unwrap();
        let spec = table_spec_from_wire(wire_spec()).unwrap();

        let mut wire = FieldMap::new();
        wire.insert("c1".into(), json!("Hello"));
        wire.insert("c2".into(), json!({"type": "doc", "content": [{"type": "paragraph", "text": "Hi"}]}));
        wire.insert("unknown".into(), json!(1));
        let fields = connector.fields_from_wire(&spec, wire);
        assert_eq!(fields.get("title"), Some(&json!("Hello")));
        assert_eq!(fields.get("body"), Some(&json!("<p>Hi</p>")));
        assert_eq!(fields.len(), 2);

        let mut local = fields.clone();
        local.insert("created".into(), json!("2024-01-01T00:00:00Z"));
        let back = connector.fields_to_wire(&spec, local);
        assert_eq!(back.get("c1"), Some(&json!("Hello")));
        assert!(back.get("c2").map(Value::is_object).unwrap_or(false));
        assert!(!back.contains_key("c4"));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, None, r#"{"error":{"message":"expired token"}}"#.into()),
            ConnectorError::Unauthorized { message } if message == "expired token"
        ));
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, Some(12), String::new()),
            ConnectorError::RateLimited { retry_after_secs: Some(12) }
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, None, "upstream".into()),
            ConnectorError::Http { status: 502, .. }
        ));
    }

    #[test]
    fn test_classify_structured_error_body() {
        let connector = JsonApiConnector::from_config(&config()).unwrap();
        let err = ConnectorError::Http {
            status: 422,
            body: r#"{"error": {"message": "Slug already taken", "code": "duplicate_slug"}}"#.into(),
        };
        let classified = connector.classify_error(&err);
        assert_eq!(classified.category, ErrorCategory::Service);
        assert!(classified.user_friendly_message.contains("Example CMS"));
        assert!(classified.user_friendly_message.contains("Slug already taken"));
        assert_eq!(classified.context.unwrap()["code"], json!("duplicate_slug"));

        let plain = ConnectorError::Http {
            status: 500,
            body: "<html>oops</html>".into(),
        };
        assert_eq!(connector.classify_error(&plain).category, ErrorCategory::Unknown);
    }
}
