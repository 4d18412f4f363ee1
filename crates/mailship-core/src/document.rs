//! Per-transaction aggregate documents.
//!
//! One [`AggregateDocument`] collects everything known about one Postfix
//! queue id: summary fields hoisted from specific sub-processes plus an
//! ordered, duplicate-free list of [`EventEntry`] values. The
//! [`WorkingSet`] holds the documents touched by the current flush cycle.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::parser::Fields;

/// One event inside a document.
///
/// Field order is irrelevant: equality is structural, which is what
/// duplicate suppression relies on.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventEntry(Fields);

impl EventEntry {
    /// Build an entry from a timestamp, optional action tag and the
    /// remaining event fields.
    #[must_use]
    pub fn new(date: &str, action: Option<&str>, fields: Fields) -> Self {
        let mut map = fields;
        map.insert("date".to_string(), Value::String(date.to_string()));
        if let Some(action) = action {
            map.insert("action".to_string(), Value::String(action.to_string()));
        }
        Self(map)
    }

    #[must_use]
    pub fn action(&self) -> Option<&str> {
        self.0.get("action").and_then(Value::as_str)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[must_use]
    pub fn fields(&self) -> &Fields {
        &self.0
    }
}

/// What happened to an entry offered to [`AggregateDocument::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// A structurally equal entry is already present.
    Duplicate,
}

/// The per-transaction document as stored.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregateDocument {
    /// Storage identifier; never part of the stored body.
    #[serde(skip)]
    pub id: Option<String>,

    pub qid: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Timestamp of the first event seen for this transaction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    #[serde(
        default,
        deserialize_with = "lenient_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub size: Option<u64>,

    #[serde(
        default,
        deserialize_with = "lenient_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub nrcpt: Option<u64>,

    #[serde(
        default,
        deserialize_with = "lenient_f64",
        skip_serializing_if = "Option::is_none"
    )]
    pub delay: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delays: Option<String>,

    #[serde(
        rename = "message-id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub message_id: Option<String>,

    #[serde(
        rename = "resent-message-id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub resent_message_id: Option<String>,

    #[serde(
        default,
        deserialize_with = "lenient_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub uid: Option<u64>,

    /// Set once the removal event has been seen
    #[serde(rename = "isFinal", default)]
    pub is_final: bool,

    #[serde(default)]
    pub events: Vec<EventEntry>,

    /// Unknown top-level fields written by other tools; preserved on update.
    #[serde(flatten)]
    pub extra: Fields,
}

impl AggregateDocument {
    /// Fresh document for a transaction first seen on `host` at `date`.
    #[must_use]
    pub fn new(qid: impl Into<String>, host: impl Into<String>, date: impl Into<String>) -> Self {
        Self {
            qid: qid.into(),
            host: Some(host.into()),
            date: Some(date.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn has_action(&self, action: &str) -> bool {
        self.events.iter().any(|e| e.action() == Some(action))
    }

    /// Append unless an equal entry is already present.
    pub fn append(&mut self, entry: EventEntry) -> AppendOutcome {
        if self.events.contains(&entry) {
            return AppendOutcome::Duplicate;
        }
        self.events.push(entry);
        AppendOutcome::Appended
    }
}

/// Accept integers or numeric strings.
#[must_use]
pub fn coerce_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Accept numbers or numeric strings.
#[must_use]
pub fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// Stored numbers may arrive as strings from other writers; values that do
// not coerce read as absent.
fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    Ok(Option::<Value>::deserialize(deserializer)?
        .as_ref()
        .and_then(coerce_u64))
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    Ok(Option::<Value>::deserialize(deserializer)?
        .as_ref()
        .and_then(coerce_f64))
}

/// Documents touched by the current flush cycle, keyed by queue id.
///
/// Ordered so bulk requests are deterministic.
#[derive(Debug, Clone, Default)]
pub struct WorkingSet {
    docs: BTreeMap<String, AggregateDocument>,
}

impl WorkingSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a document loaded from the store. An existing entry for the
    /// same queue id is kept as is; returns `false` in that case.
    pub fn install(&mut self, doc: AggregateDocument) -> bool {
        if self.docs.contains_key(&doc.qid) {
            return false;
        }
        self.docs.insert(doc.qid.clone(), doc);
        true
    }

    #[must_use]
    pub fn get(&self, qid: &str) -> Option<&AggregateDocument> {
        self.docs.get(qid)
    }

    pub fn get_mut(&mut self, qid: &str) -> Option<&mut AggregateDocument> {
        self.docs.get_mut(qid)
    }

    /// Existing document for `qid`, or a fresh one seeded with `host`/`date`.
    pub fn get_or_create(&mut self, qid: &str, host: &str, date: &str) -> &mut AggregateDocument {
        self.docs
            .entry(qid.to_string())
            .or_insert_with(|| AggregateDocument::new(qid, host, date))
    }

    pub fn iter(&self) -> impl Iterator<Item = &AggregateDocument> {
        self.docs.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn clear(&mut self) {
        self.docs.clear();
    }
}
