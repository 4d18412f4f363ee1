//! In-process document store.
//!
//! Writes are visible to the next lookup immediately. Failures can be
//! injected per call so flush retries can be exercised without a network.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tracing::warn;

use super::{BulkItem, BulkOp, BulkResponse, DocumentStore};
use crate::document::AggregateDocument;
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Inner {
    /// id -> stored body
    docs: BTreeMap<String, Value>,
    next_id: u64,
    collection_exists: bool,
    fail_pings: usize,
    fail_finds: usize,
    fail_bulks: usize,
    reject_once: HashSet<String>,
    find_calls: usize,
    bulk_calls: Vec<Vec<BulkOp>>,
}

/// Thread-safe in-memory [`DocumentStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Empty store whose collection does not exist yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store `doc` directly, returning its new identifier.
    pub fn insert(&self, doc: &AggregateDocument) -> Result<String, StoreError> {
        Ok(self.insert_body(serde_json::to_value(doc)?))
    }

    /// Store a raw body as another writer would have left it.
    pub fn insert_body(&self, body: Value) -> String {
        let mut inner = self.lock();
        inner.collection_exists = true;
        let id = inner.assign_id();
        inner.docs.insert(id.clone(), body);
        id
    }

    /// All stored documents with identifiers, ordered by identifier.
    #[must_use]
    pub fn documents(&self) -> Vec<AggregateDocument> {
        self.lock()
            .docs
            .iter()
            .filter_map(|(id, body)| decode(id, body).ok())
            .collect()
    }

    /// Documents stored for one queue id.
    #[must_use]
    pub fn documents_for(&self, qid: &str) -> Vec<AggregateDocument> {
        self.documents().into_iter().filter(|d| d.qid == qid).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().docs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail the next `n` pings with a transport error.
    pub fn fail_next_pings(&self, n: usize) {
        self.lock().fail_pings = n;
    }

    /// Fail the next `n` lookups with a transport error.
    pub fn fail_next_finds(&self, n: usize) {
        self.lock().fail_finds = n;
    }

    /// Fail the next `n` bulk requests as a whole.
    pub fn fail_next_bulks(&self, n: usize) {
        self.lock().fail_bulks = n;
    }

    /// Reject the next bulk item written for each queue id, once.
    pub fn reject_items_once<I, S>(&self, qids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock()
            .reject_once
            .extend(qids.into_iter().map(Into::into));
    }

    #[must_use]
    pub fn find_calls(&self) -> usize {
        self.lock().find_calls
    }

    /// Every bulk request received, including failed ones.
    #[must_use]
    pub fn bulk_calls(&self) -> Vec<Vec<BulkOp>> {
        self.lock().bulk_calls.clone()
    }
}

impl Inner {
    fn assign_id(&mut self) -> String {
        self.next_id += 1;
        format!("mem-{:06}", self.next_id)
    }
}

fn decode(id: &str, body: &Value) -> Result<AggregateDocument, StoreError> {
    let mut doc: AggregateDocument = serde_json::from_value(body.clone())?;
    doc.id = Some(id.to_string());
    Ok(doc)
}

fn take_failure(counter: &mut usize) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

impl DocumentStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        if take_failure(&mut self.lock().fail_pings) {
            return Err(StoreError::Transport("injected ping failure".to_string()));
        }
        Ok(())
    }

    async fn find_open(
        &self,
        qids: &[String],
        limit: usize,
    ) -> Result<Vec<AggregateDocument>, StoreError> {
        let mut inner = self.lock();
        inner.find_calls += 1;
        if take_failure(&mut inner.fail_finds) {
            return Err(StoreError::Transport("injected lookup failure".to_string()));
        }
        if !inner.collection_exists {
            return Err(StoreError::MissingCollection("memory".to_string()));
        }

        let wanted: HashSet<&str> = qids.iter().map(String::as_str).collect();
        let mut found = Vec::new();
        for (id, body) in &inner.docs {
            if found.len() >= limit {
                break;
            }
            let matches = body
                .get("qid")
                .and_then(Value::as_str)
                .is_some_and(|q| wanted.contains(q));
            if !matches {
                continue;
            }
            match decode(id, body) {
                Ok(doc) => found.push(doc),
                Err(err) => warn!(id = %id, error = %err, "Stored document does not decode; skipped"),
            }
        }
        Ok(found)
    }

    async fn bulk(&self, ops: &[BulkOp]) -> Result<BulkResponse, StoreError> {
        let mut inner = self.lock();
        inner.bulk_calls.push(ops.to_vec());
        if take_failure(&mut inner.fail_bulks) {
            return Err(StoreError::Transport("injected bulk failure".to_string()));
        }
        inner.collection_exists = true;

        let mut items = Vec::with_capacity(ops.len());
        for op in ops {
            let qid = op.qid().to_string();
            if inner.reject_once.remove(&qid) {
                items.push(BulkItem {
                    qid,
                    id: None,
                    error: Some("injected item rejection".to_string()),
                });
                continue;
            }
            let id = match op {
                BulkOp::Create { .. } => inner.assign_id(),
                BulkOp::Index { id, .. } => id.clone(),
            };
            inner.docs.insert(id.clone(), op.body().clone());
            items.push(BulkItem {
                qid,
                id: Some(id),
                error: None,
            });
        }
        Ok(BulkResponse { items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(qid: &str) -> BulkOp {
        BulkOp::Create {
            qid: qid.to_string(),
            body: serde_json::to_value(AggregateDocument::new(qid, "mx", "t")).unwrap(),
        }
    }

    #[tokio::test]
    async fn lookup_before_first_write_reports_missing_collection() {
        let store = MemoryStore::new();
        let err = store.find_open(&["Q".to_string()], 10).await.unwrap_err();
        assert!(err.is_missing_collection());
    }

    #[tokio::test]
    async fn writes_are_visible_to_next_lookup() {
        let store = MemoryStore::new();
        let resp = store.bulk(&[create("Q1"), create("Q2")]).await.unwrap();
        assert_eq!(resp.failed(), 0);
        let found = store.find_open(&["Q2".to_string()], 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].qid, "Q2");
        assert_eq!(found[0].id, resp.items[1].id);
    }

    #[tokio::test]
    async fn undecodable_stored_body_is_skipped() {
        let store = MemoryStore::new();
        store.insert_body(serde_json::json!({"qid": "Q1", "events": "none"}));
        let good = store.insert(&AggregateDocument::new("Q2", "mx", "t")).unwrap();
        let found = store
            .find_open(&["Q1".to_string(), "Q2".to_string()], 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id.as_deref(), Some(good.as_str()));
    }

    #[tokio::test]
    async fn index_replaces_by_id() {
        let store = MemoryStore::new();
        let id = store.insert(&AggregateDocument::new("Q1", "mx", "t")).unwrap();
        let mut doc = AggregateDocument::new("Q1", "mx", "t");
        doc.is_final = true;
        store
            .bulk(&[BulkOp::Index {
                qid: "Q1".to_string(),
                id: id.clone(),
                body: serde_json::to_value(&doc).unwrap(),
            }])
            .await
            .unwrap();
        let docs = store.documents_for("Q1");
        assert_eq!(docs.len(), 1);
        assert!(docs[0].is_final);
        assert_eq!(docs[0].id.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn lookup_honours_limit() {
        let store = MemoryStore::new();
        store.bulk(&[create("Q1"), create("Q1"), create("Q1")]).await.unwrap();
        let found = store.find_open(&["Q1".to_string()], 2).await.unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn injected_item_rejection_fires_once() {
        let store = MemoryStore::new();
        store.reject_items_once(["Q2"]);
        let first = store.bulk(&[create("Q1"), create("Q2")]).await.unwrap();
        assert_eq!(first.failed(), 1);
        assert!(first.items[1].error.is_some());
        let second = store.bulk(&[create("Q2")]).await.unwrap();
        assert_eq!(second.failed(), 0);
        assert_eq!(store.bulk_calls().len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next_pings(1);
        assert!(store.ping().await.is_err());
        assert!(store.ping().await.is_ok());
    }
}
