//! Folds canonical events into per-transaction documents.
//!
//! Assembly is pure over its inputs: running the same event queue against
//! the same working set twice leaves the set as after the first run. Flush
//! retries depend on that.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::document::{AggregateDocument, AppendOutcome, EventEntry, WorkingSet, coerce_f64, coerce_u64};
use crate::event::{CanonicalEvent, SubProcess};
use crate::parser::Fields;

/// Counters for one assembly pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssemblyReport {
    /// Events offered
    pub events: usize,
    /// Entries appended to a document's event list
    pub appended: usize,
    /// Entries dropped as exact duplicates
    pub duplicates: usize,
    /// Queue-manager "queued" events dropped because one is already recorded
    pub repeat_queued: usize,
    /// Events folded into summary fields only (cleanup, pickup)
    pub absorbed: usize,
    /// Events intentionally discarded (scache statistics)
    pub discarded: usize,
    /// Events dropped for an unexpected field shape
    pub shape_errors: usize,
}

enum Applied {
    Entry(AppendOutcome),
    RepeatQueued,
    Absorbed,
    Discarded,
    Shape(&'static str),
}

/// Apply every event in `queue`, in order, to `set`.
pub fn assemble(queue: &[CanonicalEvent], set: &mut WorkingSet) -> AssemblyReport {
    let mut report = AssemblyReport {
        events: queue.len(),
        ..AssemblyReport::default()
    };

    for event in queue {
        let doc = set.get_or_create(&event.qid, &event.host, &event.date);
        match apply(doc, event) {
            Applied::Entry(AppendOutcome::Appended) => report.appended += 1,
            Applied::Entry(AppendOutcome::Duplicate) => report.duplicates += 1,
            Applied::RepeatQueued => {
                debug!(qid = %event.qid, "Repeat queued event dropped");
                report.repeat_queued += 1;
            }
            Applied::Absorbed => report.absorbed += 1,
            Applied::Discarded => report.discarded += 1,
            Applied::Shape(reason) => {
                warn!(qid = %event.qid, prog = %event.prog, reason, "Event has unexpected shape; dropped");
                report.shape_errors += 1;
            }
        }
    }

    report
}

fn apply(doc: &mut AggregateDocument, event: &CanonicalEvent) -> Applied {
    let mut fields = event.fields.clone();
    match &event.kind {
        SubProcess::Qmgr => apply_qmgr(doc, event, fields),
        SubProcess::Smtp => {
            if let Some(delay) = fields.get("delay").and_then(coerce_f64) {
                doc.delay = Some(delay);
                fields.remove("delay");
            }
            if let Some(Value::String(delays)) = fields.remove("delays") {
                doc.delays = Some(delays);
            }
            append(doc, event, event.action.as_deref(), fields)
        }
        SubProcess::Cleanup => {
            if let Some(Value::String(id)) = fields.remove("message-id") {
                doc.message_id = Some(id);
            }
            if let Some(Value::String(id)) = fields.remove("resent-message-id") {
                doc.resent_message_id = Some(id);
            }
            Applied::Absorbed
        }
        SubProcess::Pickup => {
            if let Some(uid) = fields.get("uid").and_then(coerce_u64) {
                doc.uid = Some(uid);
            }
            Applied::Absorbed
        }
        SubProcess::Scache => {
            if fields.contains_key("statistics") {
                Applied::Discarded
            } else {
                Applied::Shape("scache event without statistics")
            }
        }
        SubProcess::Error => append(doc, event, Some("error"), fields),
        SubProcess::Bounce => append(doc, event, Some("bounced"), fields),
        SubProcess::Local | SubProcess::Other(_) => {
            append(doc, event, event.action.as_deref(), fields)
        }
    }
}

fn apply_qmgr(doc: &mut AggregateDocument, event: &CanonicalEvent, mut fields: Fields) -> Applied {
    if event.action.as_deref() == Some("removed") {
        doc.is_final = true;
        return append(doc, event, Some("removed"), Fields::new());
    }

    if let Some(status) = fields.remove("status") {
        return match status.as_str() {
            Some(s) if s.contains("expired, returned") => {
                append(doc, event, Some("expired"), fields)
            }
            _ => Applied::Shape("unrecognized queue manager status"),
        };
    }

    if doc.has_action("queued") {
        return Applied::RepeatQueued;
    }

    let from = match fields.remove("from") {
        Some(Value::String(from)) => from,
        _ => String::new(),
    };
    doc.from = Some(from);
    if let Some(size) = fields.remove("size").as_ref().and_then(coerce_u64) {
        doc.size = Some(size);
    }
    if let Some(nrcpt) = fields.remove("nrcpt").as_ref().and_then(coerce_u64) {
        doc.nrcpt = Some(nrcpt);
    }
    append(doc, event, Some("queued"), fields)
}

fn append(
    doc: &mut AggregateDocument,
    event: &CanonicalEvent,
    action: Option<&str>,
    fields: Fields,
) -> Applied {
    Applied::Entry(doc.append(EventEntry::new(&event.date, action, fields)))
}
