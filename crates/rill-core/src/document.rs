use chrono::{DateTime, SecondsFormat, Utc};
use rill_lang::FieldPath;
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// An ingested document: the original JSON object plus ingestion metadata.
///
/// The body is never modified after ingestion; dead letters carry it back
/// out exactly as it arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    body: Map<String, Value>,
    event_time_ms: i64,
    ingested_at_ms: i64,
    seq: u64,
}

/// Why a source record could not become a [`Document`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MalformedRecord {
    #[error("record is not valid JSON: {0}")]
    Json(String),
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("time field {field} has unusable value {value}")]
    BadEventTime { field: String, value: String },
}

impl Document {
    /// Build a document from a decoded record.
    ///
    /// With `time_field` set, its value must be an RFC 3339 string or an
    /// integer of epoch milliseconds. When the field is absent, or no time
    /// field is configured, the event time is the ingestion time.
    pub fn from_value(
        value: Value,
        time_field: Option<&FieldPath>,
        ingested_at_ms: i64,
        seq: u64,
    ) -> Result<Self, MalformedRecord> {
        let Value::Object(body) = value else {
            return Err(MalformedRecord::NotAnObject);
        };

        let event_time_ms = match time_field.and_then(|f| f.lookup_in(&body).map(|v| (f, v))) {
            Some((field, raw)) => {
                parse_event_time(raw).ok_or_else(|| MalformedRecord::BadEventTime {
                    field: field.to_string(),
                    value: raw.to_string(),
                })?
            }
            None => ingested_at_ms,
        };

        Ok(Self {
            body,
            event_time_ms,
            ingested_at_ms,
            seq,
        })
    }

    /// Decode one line of JSON text.
    pub fn from_json_line(
        line: &str,
        time_field: Option<&FieldPath>,
        ingested_at_ms: i64,
        seq: u64,
    ) -> Result<Self, MalformedRecord> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| MalformedRecord::Json(e.to_string()))?;
        Self::from_value(value, time_field, ingested_at_ms, seq)
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    pub fn event_time_ms(&self) -> i64 {
        self.event_time_ms
    }

    pub fn ingested_at_ms(&self) -> i64 {
        self.ingested_at_ms
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// The original document as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.body.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }
}

/// Accepts RFC 3339 strings and integer epoch milliseconds.
pub fn parse_event_time(raw: &Value) -> Option<i64> {
    match raw {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis()),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

/// Render epoch milliseconds as RFC 3339 with millisecond precision.
/// Out-of-range values fall back to the raw number.
pub fn format_millis(ms: i64) -> Value {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
        None => Value::from(ms),
    }
}

/// Wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
