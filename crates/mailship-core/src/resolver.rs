//! Loads previously stored documents for the queue ids in a batch.
//!
//! A transaction often spans several batches. Before assembly, every queue
//! id in the in-flight queue is looked up so new events extend the stored
//! document instead of starting a second one.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::debug;

use crate::document::WorkingSet;
use crate::error::StoreError;
use crate::event::CanonicalEvent;
use crate::store::DocumentStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolveReport {
    /// Distinct queue ids looked up
    pub requested: usize,
    /// Documents returned by the store
    pub found: usize,
    /// Documents newly installed into the working set
    pub installed: usize,
    /// Documents skipped because their queue id was already present
    pub skipped: usize,
}

/// Distinct queue ids of `queue`, sorted.
#[must_use]
pub fn distinct_qids(queue: &[CanonicalEvent]) -> Vec<String> {
    queue
        .iter()
        .map(|e| e.qid.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Look up stored documents for the queue and install them into `set`.
///
/// A missing collection counts as zero results. A queue id already in the
/// set keeps its working copy; if that copy has no storage identifier yet it
/// adopts the stored one, so a create that went through on an earlier
/// attempt becomes an update rather than a second document.
pub async fn resolve_orphans<S: DocumentStore>(
    store: &S,
    queue: &[CanonicalEvent],
    page_size: usize,
    set: &mut WorkingSet,
) -> Result<ResolveReport, StoreError> {
    let qids = distinct_qids(queue);
    let mut report = ResolveReport {
        requested: qids.len(),
        ..ResolveReport::default()
    };
    if qids.is_empty() {
        return Ok(report);
    }

    let found = match store.find_open(&qids, page_size).await {
        Ok(found) => found,
        Err(err) if err.is_missing_collection() => {
            debug!(error = %err, "Document collection absent; nothing to resolve");
            return Ok(report);
        }
        Err(err) => return Err(err),
    };
    report.found = found.len();

    for doc in found {
        let qid = doc.qid.clone();
        let stored_id = doc.id.clone();
        if set.install(doc) {
            report.installed += 1;
            continue;
        }
        report.skipped += 1;
        if let Some(existing) = set.get_mut(&qid) {
            if existing.id.is_none() {
                debug!(qid = %qid, id = ?stored_id, "Working document adopts stored identifier");
                existing.id = stored_id;
                continue;
            }
        }
        debug!(qid = %qid, "Duplicate stored document skipped");
    }

    debug!(
        requested = report.requested,
        found = report.found,
        installed = report.installed,
        "Orphans resolved"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::AggregateDocument;
    use crate::event::SubProcess;
    use crate::parser::Fields;
    use crate::store::MemoryStore;

    fn event(qid: &str) -> CanonicalEvent {
        CanonicalEvent {
            qid: qid.to_string(),
            prog: "postfix/qmgr".to_string(),
            kind: SubProcess::Qmgr,
            host: "mx".to_string(),
            date: "t".to_string(),
            action: None,
            fields: Fields::new(),
        }
    }

    #[test]
    fn qids_are_distinct() {
        let queue = vec![event("B"), event("A"), event("B")];
        assert_eq!(distinct_qids(&queue), ["A", "B"]);
    }

    #[tokio::test]
    async fn missing_collection_means_no_orphans() {
        let store = MemoryStore::new();
        let mut set = WorkingSet::new();
        let report = resolve_orphans(&store, &[event("A")], 10, &mut set).await.unwrap();
        assert_eq!(report.found, 0);
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn installs_stored_documents_with_ids() {
        let store = MemoryStore::new();
        let id = store.insert(&AggregateDocument::new("A", "mx", "t0")).unwrap();
        store.insert(&AggregateDocument::new("Z", "mx", "t0")).unwrap();
        let mut set = WorkingSet::new();
        let report = resolve_orphans(&store, &[event("A"), event("B")], 10, &mut set)
            .await
            .unwrap();
        assert_eq!(report.installed, 1);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("A").unwrap().id.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn duplicates_never_overwrite_working_copy() {
        let store = MemoryStore::new();
        store.insert(&AggregateDocument::new("A", "mx", "stored")).unwrap();
        store.insert(&AggregateDocument::new("A", "mx", "stored-again")).unwrap();
        let mut set = WorkingSet::new();
        let report = resolve_orphans(&store, &[event("A")], 10, &mut set).await.unwrap();
        assert_eq!(report.installed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(set.get("A").unwrap().date.as_deref(), Some("stored"));
    }

    #[tokio::test]
    async fn unstored_working_copy_adopts_identifier() {
        let store = MemoryStore::new();
        let id = store.insert(&AggregateDocument::new("A", "mx", "stored")).unwrap();
        let mut set = WorkingSet::new();
        set.get_or_create("A", "mx", "working");
        resolve_orphans(&store, &[event("A")], 10, &mut set).await.unwrap();
        let doc = set.get("A").unwrap();
        assert_eq!(doc.date.as_deref(), Some("working"));
        assert_eq!(doc.id.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn lookup_failure_propagates() {
        let store = MemoryStore::new();
        store.fail_next_finds(1);
        let mut set = WorkingSet::new();
        assert!(resolve_orphans(&store, &[event("A")], 10, &mut set).await.is_err());
    }
}
