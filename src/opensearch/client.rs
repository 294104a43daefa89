use std::sync::Arc;
use std::time::Instant;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, warn};

use super::credentials::{CredentialProvider, CredentialsConfig};
use super::executor::{REF_ID_FIELD, REF_VERSION_FIELD};
use super::processor::Processor;
use crate::ast::Query;
use crate::collection::{Collection, CollectionRegistry};
use crate::error::{Error, Result};
use crate::operation::{
    failure_refs, group_by_collection, id_string, Action, Operation, OperationKind,
};
use crate::result::QueryResult;

fn default_url() -> String {
    "http://localhost:9200".to_string()
}

/// `[opensearch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSearchConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub number_of_shards: Option<u32>,
    #[serde(default)]
    pub number_of_replicas: Option<u32>,
    /// Accept invalid/self-signed certificates. Use with caution.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

impl Default for OpenSearchConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            number_of_shards: None,
            number_of_replicas: None,
            accept_invalid_certs: false,
            credentials: CredentialsConfig::default(),
        }
    }
}

/// HTTP client for one OpenSearch cluster.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(base_url: impl Into<String>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self::with_http(reqwest::Client::new(), base_url, credentials)
    }

    fn with_http(
        http: reqwest::Client,
        base_url: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }

    pub fn from_config(config: &OpenSearchConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;
        Ok(Self::with_http(
            http,
            &config.url,
            Arc::from(config.credentials.provider()),
        ))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Request to `path` with credentials applied.
    pub(crate) fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let builder = self
            .http
            .request(method, format!("{}/{}", self.base_url, path.trim_start_matches('/')));
        Ok(match self.credentials.credentials()? {
            Some(creds) => builder.basic_auth(creds.username, Some(creds.password)),
            None => builder,
        })
    }

    /// Send and decode a JSON response, turning error statuses into
    /// [`Error::Backend`].
    pub(crate) async fn send_json(&self, builder: RequestBuilder) -> Result<Value> {
        let response = builder.send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn search(&self, collection: &Collection, query: &Query) -> Result<QueryResult> {
        let document = Processor::new(collection).compile(query)?;
        debug!(collection = %collection.name, query = %document, "running search");

        let start = Instant::now();
        let request = self
            .request(Method::POST, &format!("{}/_search", collection.name))?
            .json(&document);
        let response = self.send_json(request).await?;
        let execution_time = start.elapsed();

        let hits = match response.pointer("/hits/hits") {
            Some(Value::Array(hits)) => hits.clone(),
            _ => Vec::new(),
        };
        Ok(QueryResult::new(hits.len(), execution_time, hits.into_iter()))
    }

    /// Apply a batch and return the refs of operations that failed.
    ///
    /// Each collection's upserts go out as one `_bulk` request, then its
    /// deletes as another.
    pub async fn bulk_process(
        &self,
        collections: &CollectionRegistry,
        operations: &[Operation],
    ) -> Result<Vec<Value>> {
        let mut failed = Vec::new();

        for (name, batch) in group_by_collection(operations) {
            let collection = match collections.get(name) {
                Ok(collection) => collection,
                Err(e) => {
                    warn!(collection = %name, error = %e, "skipping operations");
                    failed.extend(failure_refs(batch.upserts.iter().copied()));
                    failed.extend(failure_refs(batch.deletes.iter().copied()));
                    continue;
                }
            };

            for (kind, group) in [
                (OperationKind::Upsert, &batch.upserts),
                (OperationKind::Delete, &batch.deletes),
            ] {
                if group.is_empty() {
                    continue;
                }
                let refs = self.bulk_group(collection, kind, group).await?;
                failed.extend(refs);
            }
        }

        Ok(failed)
    }

    async fn bulk_group(
        &self,
        collection: &Collection,
        kind: OperationKind,
        group: &[&Operation],
    ) -> Result<Vec<Value>> {
        let mut failed = Vec::new();
        let mut sent = Vec::with_capacity(group.len());
        let mut body = String::new();

        for &op in group {
            match bulk_lines(collection, op) {
                Ok(lines) => {
                    for line in lines {
                        body.push_str(&line.to_string());
                        body.push('\n');
                    }
                    sent.push(op);
                }
                Err(e) => {
                    warn!(
                        collection = %collection.name,
                        kind = kind.as_str(),
                        error = %e,
                        "rejected bulk operation"
                    );
                    failed.push(op.failure_ref());
                }
            }
        }
        if sent.is_empty() {
            return Ok(failed);
        }

        let request = self
            .request(Method::POST, "_bulk")?
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body);

        let response = match self.send_json(request).await {
            Ok(response) => response,
            Err(e) if e.is_connectivity() => {
                error!(
                    collection = %collection.name,
                    kind = kind.as_str(),
                    error = %e,
                    "bulk request aborted"
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    collection = %collection.name,
                    kind = kind.as_str(),
                    count = sent.len(),
                    error = %e,
                    "bulk request failed"
                );
                failed.extend(failure_refs(sent));
                return Ok(failed);
            }
        };

        let items = response
            .get("items")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for (i, op) in sent.iter().enumerate() {
            match items.get(i).map(item_outcome) {
                Some(ItemOutcome::Applied) => {}
                Some(ItemOutcome::Stale) => {
                    debug!(
                        collection = %collection.name,
                        id = ?op.id(),
                        "newer version already indexed"
                    );
                }
                Some(ItemOutcome::Failed(reason)) => {
                    warn!(
                        collection = %collection.name,
                        kind = kind.as_str(),
                        id = ?op.id(),
                        error = %reason,
                        "bulk item failed"
                    );
                    failed.push(op.failure_ref());
                }
                None => {
                    warn!(
                        collection = %collection.name,
                        kind = kind.as_str(),
                        id = ?op.id(),
                        "bulk response is missing an item"
                    );
                    failed.push(op.failure_ref());
                }
            }
        }

        debug!(
            collection = %collection.name,
            kind = kind.as_str(),
            count = sent.len(),
            "bulk request applied"
        );
        Ok(failed)
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Backend {
        status: status.as_u16(),
        body,
    })
}

/// Action and source lines for one operation.
fn bulk_lines(collection: &Collection, op: &Operation) -> Result<Vec<Value>> {
    let id = op.id().map(id_string).ok_or_else(|| {
        Error::InvalidOperation(format!(
            "{} on `{}` has no id",
            op.kind().as_str(),
            collection.name
        ))
    })?;

    match &op.action {
        Action::Upsert(record) => {
            let version = record
                .get(REF_VERSION_FIELD)
                .and_then(Value::as_i64)
                .unwrap_or_else(current_version);

            let mut source: Map<String, Value> = record.clone();
            source.insert(REF_ID_FIELD.to_string(), Value::String(id.clone()));
            source.insert(REF_VERSION_FIELD.to_string(), json!(version));

            Ok(vec![
                json!({"index": {
                    "_index": collection.name,
                    "_id": id,
                    "version": version,
                    "version_type": "external_gte"
                }}),
                Value::Object(source),
            ])
        }
        Action::Delete(_) => Ok(vec![json!({"delete": {
            "_index": collection.name,
            "_id": id
        }})]),
    }
}

/// Microseconds since the epoch, used when a record carries no version.
fn current_version() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

#[derive(Debug, PartialEq)]
enum ItemOutcome {
    Applied,
    /// External version older than the stored one; the newer write stands.
    Stale,
    Failed(String),
}

fn item_outcome(item: &Value) -> ItemOutcome {
    let Some((action, result)) = item.as_object().and_then(|o| o.iter().next()) else {
        return ItemOutcome::Failed(format!("unexpected bulk item {}", item));
    };
    let status = result.get("status").and_then(Value::as_u64).unwrap_or(0);
    let Some(error) = result.get("error") else {
        return ItemOutcome::Applied;
    };

    let error_type = error.get("type").and_then(Value::as_str).unwrap_or_default();
    if status == u64::from(StatusCode::CONFLICT.as_u16())
        && error_type == "version_conflict_engine_exception"
    {
        return ItemOutcome::Stale;
    }
    if action == "delete" && status == u64::from(StatusCode::NOT_FOUND.as_u16()) {
        return ItemOutcome::Applied;
    }
    ItemOutcome::Failed(error.to_string())
}
