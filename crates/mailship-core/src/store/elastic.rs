//! Elasticsearch backend.
//!
//! Lookups use a `terms` query on the configured queue-id field; writes go
//! through `_bulk` as NDJSON. Hosts are tried in order and the next one is
//! used only when a request fails at the transport level.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{BulkItem, BulkOp, BulkResponse, DocumentStore};
use crate::config::StoreConfig;
use crate::document::AggregateDocument;
use crate::error::StoreError;

/// HTTP client for one Elasticsearch index.
#[derive(Debug, Clone)]
pub struct ElasticStore {
    client: Client,
    hosts: Vec<String>,
    index: String,
    qid_field: String,
}

impl ElasticStore {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let hosts = config
            .hosts
            .iter()
            .map(|h| h.trim().trim_end_matches('/').to_string())
            .filter(|h| !h.is_empty())
            .collect();
        Ok(Self {
            client,
            hosts,
            index: config.index.clone(),
            qid_field: config.qid_field.clone(),
        })
    }

    #[must_use]
    pub fn index(&self) -> &str {
        &self.index
    }

    /// Make sure the index exists with the queue-id field mapped as
    /// `keyword`, creating it when absent. An existing index whose field is
    /// analysed is rejected: `terms` lookups on it would never match.
    pub async fn ensure_index(&self) -> Result<(), StoreError> {
        let resp = self
            .send(|client, host| client.head(format!("{host}/{}", self.index)))
            .await?;
        match resp.status() {
            status if status.is_success() => self.check_qid_mapping().await,
            StatusCode::NOT_FOUND => self.create_index().await,
            status => Err(StoreError::Status {
                status: status.as_u16(),
                body: String::new(),
            }),
        }
    }

    async fn create_index(&self) -> Result<(), StoreError> {
        let mapping = index_mapping(&self.qid_field);
        let resp = self
            .send(|client, host| client.put(format!("{host}/{}", self.index)).json(&mapping))
            .await?;
        if resp.status().is_success() {
            info!(index = %self.index, field = %self.qid_field, "Created index with keyword queue id");
            return Ok(());
        }
        let (status, body) = error_body(resp).await;
        if error_type(&body).as_deref() == Some("resource_already_exists_exception") {
            return self.check_qid_mapping().await;
        }
        Err(StoreError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn check_qid_mapping(&self) -> Result<(), StoreError> {
        let resp = self
            .send(|client, host| {
                client.get(format!(
                    "{host}/{}/_mapping/field/{}",
                    self.index, self.qid_field
                ))
            })
            .await?;
        if !resp.status().is_success() {
            let (status, body) = error_body(resp).await;
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let text = resp
            .text()
            .await
            .map_err(|e| StoreError::Response(e.to_string()))?;
        let body: Value = serde_json::from_str(&text)?;
        match field_mapping_type(&body, &self.qid_field) {
            Some(kind) if kind == "keyword" => Ok(()),
            Some(kind) => Err(StoreError::QidMapping {
                index: self.index.clone(),
                field: self.qid_field.clone(),
                found: kind,
            }),
            // Index exists without documents; map the field before the
            // first write maps it dynamically as text.
            None => self.put_qid_mapping().await,
        }
    }

    async fn put_qid_mapping(&self) -> Result<(), StoreError> {
        let mapping = index_mapping(&self.qid_field);
        let resp = self
            .send(|client, host| {
                client
                    .put(format!("{host}/{}/_mapping", self.index))
                    .json(&mapping["mappings"])
            })
            .await?;
        if resp.status().is_success() {
            info!(index = %self.index, field = %self.qid_field, "Mapped queue id as keyword");
            return Ok(());
        }
        let (status, body) = error_body(resp).await;
        Err(StoreError::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// Send the request built by `build` to each host in turn until one
    /// answers.
    async fn send<F>(&self, build: F) -> Result<Response, StoreError>
    where
        F: Fn(&Client, &str) -> RequestBuilder,
    {
        let mut last_err = StoreError::Transport("no store hosts configured".to_string());
        for host in &self.hosts {
            match build(&self.client, host).send().await {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    warn!(host = %host, error = %err, "Store host unreachable; trying next");
                    last_err = StoreError::Transport(format!("{host}: {err}"));
                }
            }
        }
        Err(last_err)
    }
}

async fn error_body(resp: Response) -> (StatusCode, String) {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    (status, body)
}

impl DocumentStore for ElasticStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let resp = self.send(|client, host| client.get(format!("{host}/"))).await?;
        if resp.status().is_success() {
            return Ok(());
        }
        let (status, body) = error_body(resp).await;
        Err(StoreError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn find_open(
        &self,
        qids: &[String],
        limit: usize,
    ) -> Result<Vec<AggregateDocument>, StoreError> {
        let query = search_body(&self.qid_field, qids, limit);
        let resp = self
            .send(|client, host| {
                client
                    .post(format!("{host}/{}/_search", self.index))
                    .json(&query)
            })
            .await?;

        if !resp.status().is_success() {
            let (status, body) = error_body(resp).await;
            if status == StatusCode::NOT_FOUND && is_index_not_found(&body) {
                return Err(StoreError::MissingCollection(self.index.clone()));
            }
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = resp
            .text()
            .await
            .map_err(|e| StoreError::Response(e.to_string()))?;
        let docs = parse_search_response(&text)?;
        debug!(requested = qids.len(), found = docs.len(), "Orphan lookup complete");
        Ok(docs)
    }

    async fn bulk(&self, ops: &[BulkOp]) -> Result<BulkResponse, StoreError> {
        if ops.is_empty() {
            return Ok(BulkResponse::default());
        }
        let payload = bulk_payload(&self.index, ops)?;
        let resp = self
            .send(|client, host| {
                client
                    .post(format!("{host}/_bulk"))
                    .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
                    .body(payload.clone())
            })
            .await?;

        if !resp.status().is_success() {
            let (status, body) = error_body(resp).await;
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = resp
            .text()
            .await
            .map_err(|e| StoreError::Response(e.to_string()))?;
        parse_bulk_response(&text, ops)
    }
}

fn search_body(qid_field: &str, qids: &[String], limit: usize) -> Value {
    json!({
        "size": limit,
        "query": { "terms": { qid_field: qids } }
    })
}

/// Index body mapping the queue-id field as `keyword`. A dotted field such
/// as `qid.keyword` becomes a keyword sub-field of a text field.
fn index_mapping(qid_field: &str) -> Value {
    let property = match qid_field.split_once('.') {
        Some((parent, sub)) => (
            parent,
            json!({ "type": "text", "fields": { sub: { "type": "keyword" } } }),
        ),
        None => (qid_field, json!({ "type": "keyword" })),
    };
    let (name, spec) = property;
    json!({ "mappings": { "properties": { name: spec } } })
}

/// Type of `field` in a `_mapping/field` response, from whichever index
/// answered.
fn field_mapping_type(body: &Value, field: &str) -> Option<String> {
    let leaf = field.rsplit('.').next().unwrap_or(field);
    body.as_object()?.values().find_map(|index| {
        index
            .get("mappings")?
            .get(field)?
            .get("mapping")?
            .get(leaf)?
            .get("type")?
            .as_str()
            .map(str::to_string)
    })
}

fn error_type(body: &str) -> Option<String> {
    serde_json::from_str::<Value>(body)
        .ok()?
        .pointer("/error/type")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn is_index_not_found(body: &str) -> bool {
    error_type(body).as_deref() == Some("index_not_found_exception")
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Deserialize)]
struct SearchHits {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source")]
    source: Value,
}

/// Decode the hits of a search response. A hit whose source does not decode
/// as a document is logged and skipped; the rest are still returned.
fn parse_search_response(text: &str) -> Result<Vec<AggregateDocument>, StoreError> {
    let resp: SearchResponse = serde_json::from_str(text)?;
    let mut docs = Vec::with_capacity(resp.hits.hits.len());
    for hit in resp.hits.hits {
        match serde_json::from_value::<AggregateDocument>(hit.source) {
            Ok(mut doc) => {
                doc.id = Some(hit.id);
                docs.push(doc);
            }
            Err(err) => {
                warn!(id = %hit.id, error = %err, "Stored document does not decode; skipped");
            }
        }
    }
    Ok(docs)
}

/// Action line plus body line per operation, newline terminated.
fn bulk_payload(index: &str, ops: &[BulkOp]) -> Result<String, StoreError> {
    let mut out = String::new();
    for op in ops {
        let action = match op {
            BulkOp::Create { .. } => json!({ "create": { "_index": index } }),
            BulkOp::Index { id, .. } => json!({ "index": { "_index": index, "_id": id } }),
        };
        out.push_str(&serde_json::to_string(&action)?);
        out.push('\n');
        out.push_str(&serde_json::to_string(op.body())?);
        out.push('\n');
    }
    Ok(out)
}

#[derive(Deserialize)]
struct BulkApiResponse {
    #[serde(default)]
    items: Vec<HashMap<String, BulkApiItem>>,
}

#[derive(Deserialize)]
struct BulkApiItem {
    #[serde(rename = "_id")]
    id: Option<String>,
    #[serde(default)]
    status: u16,
    error: Option<Value>,
}

fn parse_bulk_response(text: &str, ops: &[BulkOp]) -> Result<BulkResponse, StoreError> {
    let resp: BulkApiResponse = serde_json::from_str(text)?;
    if resp.items.len() != ops.len() {
        return Err(StoreError::Response(format!(
            "bulk response has {} items for {} operations",
            resp.items.len(),
            ops.len()
        )));
    }

    let items = resp
        .items
        .into_iter()
        .zip(ops)
        .map(|(mut entry, op)| {
            let qid = op.qid().to_string();
            let Some((_, item)) = entry.drain().next() else {
                return BulkItem {
                    qid,
                    id: None,
                    error: Some("empty bulk item".to_string()),
                };
            };
            let failed = item.error.is_some() || !(200..300).contains(&item.status);
            if failed {
                let reason = item
                    .error
                    .map_or_else(|| format!("HTTP {}", item.status), |e| describe_error(&e));
                BulkItem {
                    qid,
                    id: None,
                    error: Some(reason),
                }
            } else {
                BulkItem {
                    qid,
                    id: item.id,
                    error: None,
                }
            }
        })
        .collect();
    Ok(BulkResponse { items })
}

fn describe_error(error: &Value) -> String {
    match (
        error.get("type").and_then(Value::as_str),
        error.get("reason").and_then(Value::as_str),
    ) {
        (Some(kind), Some(reason)) => format!("{kind}: {reason}"),
        _ => error.to_string(),
    }
}
