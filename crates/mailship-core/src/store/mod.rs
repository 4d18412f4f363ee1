//! Document store abstraction.
//!
//! The shipper only needs three things from a store: a liveness probe, a
//! lookup of open documents by queue id, and a bulk write of creates and
//! id-addressed replacements. [`ElasticStore`] talks to Elasticsearch over
//! HTTP; [`MemoryStore`] keeps everything in process for replay and tests.

mod elastic;
mod memory;

pub use elastic::ElasticStore;
pub use memory::MemoryStore;

use serde::Serialize;
use serde_json::Value;

use crate::document::AggregateDocument;
use crate::error::StoreError;

/// One write in a bulk request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BulkOp {
    /// New document; the store assigns the identifier.
    Create { qid: String, body: Value },
    /// Full replacement of the document stored under `id`.
    Index { qid: String, id: String, body: Value },
}

impl BulkOp {
    #[must_use]
    pub fn qid(&self) -> &str {
        match self {
            Self::Create { qid, .. } | Self::Index { qid, .. } => qid,
        }
    }

    #[must_use]
    pub fn body(&self) -> &Value {
        match self {
            Self::Create { body, .. } | Self::Index { body, .. } => body,
        }
    }

    #[must_use]
    pub fn is_create(&self) -> bool {
        matches!(self, Self::Create { .. })
    }
}

/// Per-item result of a bulk request, in request order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItem {
    pub qid: String,
    /// Identifier the document now lives under, when the item succeeded
    pub id: Option<String>,
    /// Store-provided reason, when the item failed
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    pub items: Vec<BulkItem>,
}

impl BulkResponse {
    #[must_use]
    pub fn failed(&self) -> usize {
        self.items.iter().filter(|i| i.error.is_some()).count()
    }
}

/// Storage backend for aggregate documents.
#[allow(async_fn_in_trait)]
pub trait DocumentStore {
    /// Liveness probe.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Documents whose queue id is in `qids`, at most `limit` of them, each
    /// with its storage identifier set. A missing collection is reported as
    /// [`StoreError::MissingCollection`].
    async fn find_open(
        &self,
        qids: &[String],
        limit: usize,
    ) -> Result<Vec<AggregateDocument>, StoreError>;

    /// Submit all operations as one request.
    async fn bulk(&self, ops: &[BulkOp]) -> Result<BulkResponse, StoreError>;
}
