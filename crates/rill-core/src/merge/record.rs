use std::fmt;

use rill_lang::FieldPath;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::aggregate::GroupKey;
use crate::document::{Document, format_millis, now_millis};
use crate::window::{WindowBounds, WindowEmission};

// ---------------------------------------------------------------------------
// MergeRecord
// ---------------------------------------------------------------------------

/// One aggregate result: a group within a window.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeRecord {
    pub key: GroupKey,
    pub window: WindowBounds,
    pub revision: u32,
    pub fields: Map<String, Value>,
}

impl MergeRecord {
    /// One record per group of a closing window.
    pub fn from_emission(emission: &WindowEmission) -> Vec<MergeRecord> {
        emission
            .groups
            .iter()
            .map(|(key, fields)| MergeRecord {
                key: key.clone(),
                window: emission.bounds,
                revision: emission.revision,
                fields: fields.clone(),
            })
            .collect()
    }

    /// `{ _id, _window: { start, end }, <fields...> }`.
    pub fn to_document(&self) -> Map<String, Value> {
        let mut doc = Map::with_capacity(self.fields.len() + 2);
        doc.insert("_id".into(), self.key.value().clone());
        doc.insert("_window".into(), self.window.to_value());
        for (k, v) in &self.fields {
            doc.insert(k.clone(), v.clone());
        }
        doc
    }
}

// ---------------------------------------------------------------------------
// MergeKey
// ---------------------------------------------------------------------------

/// Identity of a stored document: the values of the `on` fields, in order,
/// rendered canonically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MergeKey(String);

impl MergeKey {
    /// Missing `on` fields contribute `null`.
    pub fn from_document(doc: &Map<String, Value>, on: &[FieldPath]) -> Self {
        let parts: Vec<Value> = on
            .iter()
            .map(|f| f.lookup_in(doc).cloned().unwrap_or(Value::Null))
            .collect();
        Self(Value::Array(parts).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MergeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// DeadLetter
// ---------------------------------------------------------------------------

/// Where a document failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Source,
    Validate,
    Window,
    Aggregate,
    Merge,
}

/// An append-only dead-letter entry carrying the original document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub doc: Value,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub stage: FailureStage,
    pub processor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<Value>,
    pub at: Value,
}

impl DeadLetter {
    pub fn new(doc: Value, reason: impl Into<String>, stage: FailureStage, processor: &str) -> Self {
        Self {
            doc,
            reason: reason.into(),
            detail: None,
            stage,
            processor: processor.to_string(),
            event_time: None,
            at: format_millis(now_millis()),
        }
    }

    /// A dead letter for an ingested document, stamped with its event time.
    pub fn for_document(
        doc: &Document,
        reason: impl Into<String>,
        stage: FailureStage,
        processor: &str,
    ) -> Self {
        let mut letter = Self::new(doc.to_value(), reason, stage, processor);
        letter.event_time = Some(format_millis(doc.event_time_ms()));
        letter
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
