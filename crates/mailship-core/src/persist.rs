//! Writes the working set to the store in one bulk request.

use serde::Serialize;
use tracing::{debug, warn};

use crate::document::WorkingSet;
use crate::error::{CycleError, StoreError};
use crate::store::{BulkOp, DocumentStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistReport {
    pub created: usize,
    pub updated: usize,
}

/// One operation per working document: a create for documents without a
/// storage identifier, an id-addressed replacement otherwise.
pub fn build_bulk(set: &WorkingSet) -> Result<Vec<BulkOp>, serde_json::Error> {
    set.iter()
        .map(|doc| {
            let body = serde_json::to_value(doc)?;
            let qid = doc.qid.clone();
            Ok(match &doc.id {
                Some(id) => BulkOp::Index {
                    qid,
                    id: id.clone(),
                    body,
                },
                None => BulkOp::Create { qid, body },
            })
        })
        .collect()
}

/// Persist every working document.
///
/// Succeeds only if every item succeeds. On partial failure the identifiers
/// of items that did go through are recorded in `set`, so the retried
/// request replaces them instead of creating them again.
pub async fn persist<S: DocumentStore>(
    store: &S,
    set: &mut WorkingSet,
) -> Result<PersistReport, CycleError> {
    let ops = build_bulk(set).map_err(|e| CycleError::Persist(StoreError::Json(e)))?;
    if ops.is_empty() {
        return Ok(PersistReport::default());
    }

    let report = PersistReport {
        created: ops.iter().filter(|op| op.is_create()).count(),
        updated: ops.iter().filter(|op| !op.is_create()).count(),
    };
    debug!(created = report.created, updated = report.updated, "Submitting bulk write");

    let response = store.bulk(&ops).await.map_err(CycleError::Persist)?;
    let failed = response.failed();
    if failed == 0 {
        return Ok(report);
    }

    for item in &response.items {
        match (&item.error, &item.id) {
            (Some(reason), _) => {
                warn!(qid = %item.qid, reason = %reason, "Bulk item rejected");
            }
            (None, Some(id)) => {
                if let Some(doc) = set.get_mut(&item.qid) {
                    doc.id.get_or_insert_with(|| id.clone());
                }
            }
            (None, None) => {}
        }
    }
    Err(CycleError::PartialBulk {
        failed,
        total: ops.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::AggregateDocument;
    use crate::store::MemoryStore;

    fn set_with(qids: &[&str]) -> WorkingSet {
        let mut set = WorkingSet::new();
        for qid in qids {
            set.get_or_create(qid, "mx", "t");
        }
        set
    }

    #[test]
    fn stored_documents_become_index_ops_without_id_in_body() {
        let mut set = WorkingSet::new();
        let mut doc = AggregateDocument::new("A", "mx", "t");
        doc.id = Some("doc-a".to_string());
        set.install(doc);
        set.get_or_create("B", "mx", "t");

        let ops = build_bulk(&set).unwrap();
        assert_eq!(ops.len(), 2);
        match &ops[0] {
            BulkOp::Index { id, body, .. } => {
                assert_eq!(id, "doc-a");
                assert!(body.get("id").is_none());
                assert!(body.get("_id").is_none());
            }
            other => panic!("expected index op, got {other:?}"),
        }
        assert!(ops[1].is_create());
    }

    #[tokio::test]
    async fn empty_set_writes_nothing() {
        let store = MemoryStore::new();
        let report = persist(&store, &mut WorkingSet::new()).await.unwrap();
        assert_eq!(report, PersistReport::default());
        assert!(store.bulk_calls().is_empty());
    }

    #[tokio::test]
    async fn writes_all_documents() {
        let store = MemoryStore::new();
        let report = persist(&store, &mut set_with(&["A", "B", "C"])).await.unwrap();
        assert_eq!(report.created, 3);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn partial_failure_records_successful_ids() {
        let store = MemoryStore::new();
        store.reject_items_once(["B"]);
        let mut set = set_with(&["A", "B"]);
        let err = persist(&store, &mut set).await.unwrap_err();
        assert!(matches!(err, CycleError::PartialBulk { failed: 1, total: 2 }));
        assert!(set.get("A").unwrap().id.is_some());
        assert!(set.get("B").unwrap().id.is_none());
    }

    #[tokio::test]
    async fn transport_failure_is_persist_error() {
        let store = MemoryStore::new();
        store.fail_next_bulks(1);
        let err = persist(&store, &mut set_with(&["A"])).await.unwrap_err();
        assert!(matches!(err, CycleError::Persist(_)));
    }
}
