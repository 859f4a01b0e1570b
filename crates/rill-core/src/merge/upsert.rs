use rill_config::{UpdateStage, WhenMatched, WhenNotMatched};
use serde_json::{Map, Value};

use super::record::MergeKey;

/// How an incoming record combines with the stored collection.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePolicy {
    pub when_matched: WhenMatched,
    pub when_not_matched: WhenNotMatched,
}

impl MergePolicy {
    pub fn new(when_matched: WhenMatched, when_not_matched: WhenNotMatched) -> Self {
        Self {
            when_matched,
            when_not_matched,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    Merged,
    Updated,
    /// Matched and the stored document is already what the policy produces.
    Unchanged,
    /// `keep_existing` on a match.
    Kept,
    /// `discard` on a miss.
    Discarded,
}

/// Result of applying a policy: what happened, and the document to store
/// when anything needs writing.
#[derive(Debug, Clone, PartialEq)]
pub struct Upsert {
    pub outcome: UpsertOutcome,
    pub store: Option<Map<String, Value>>,
}

/// The policy refused the record. Routed to dead-letter, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeRejection {
    #[error("a document with key {key} already exists (when_matched = fail)")]
    Matched { key: String },
    #[error("no document with key {key} exists (when_not_matched = fail)")]
    NotMatched { key: String },
}

/// Decide what an upsert of `incoming` does against `existing`.
pub fn apply_upsert(
    key: &MergeKey,
    existing: Option<&Map<String, Value>>,
    incoming: Map<String, Value>,
    policy: &MergePolicy,
) -> Result<Upsert, MergeRejection> {
    let Some(existing) = existing else {
        return match policy.when_not_matched {
            WhenNotMatched::Insert => Ok(Upsert {
                outcome: UpsertOutcome::Inserted,
                store: Some(incoming),
            }),
            WhenNotMatched::Discard => Ok(Upsert {
                outcome: UpsertOutcome::Discarded,
                store: None,
            }),
            WhenNotMatched::Fail => Err(MergeRejection::NotMatched {
                key: key.to_string(),
            }),
        };
    };

    let (outcome, next) = match &policy.when_matched {
        WhenMatched::Replace => (UpsertOutcome::Replaced, incoming),
        WhenMatched::Merge => {
            let mut merged = existing.clone();
            for (k, v) in incoming {
                merged.insert(k, v);
            }
            (UpsertOutcome::Merged, merged)
        }
        WhenMatched::KeepExisting => {
            return Ok(Upsert {
                outcome: UpsertOutcome::Kept,
                store: None,
            });
        }
        WhenMatched::Fail => {
            return Err(MergeRejection::Matched {
                key: key.to_string(),
            });
        }
        WhenMatched::Pipeline(stages) => (
            UpsertOutcome::Updated,
            run_update_pipeline(existing, &Value::Object(incoming), stages),
        ),
    };

    if &next == existing {
        return Ok(Upsert {
            outcome: UpsertOutcome::Unchanged,
            store: None,
        });
    }
    Ok(Upsert {
        outcome,
        store: Some(next),
    })
}

/// Each stage sees the document produced by the previous one. Within a
/// stage every `set` expression is evaluated before any is assigned.
fn run_update_pipeline(
    existing: &Map<String, Value>,
    incoming: &Value,
    stages: &[UpdateStage],
) -> Map<String, Value> {
    let mut doc = existing.clone();
    for stage in stages {
        let root = Value::Object(doc.clone());
        let vars = [("new", incoming)];
        let values: Vec<_> = stage
            .set
            .iter()
            .map(|(path, expr)| (path, expr.eval(&root, &vars).cloned()))
            .collect();
        for (path, value) in values {
            match value {
                Some(v) => path.assign(&mut doc, v),
                None => {
                    path.remove(&mut doc);
                }
            }
        }
        for path in &stage.unset {
            path.remove(&mut doc);
        }
    }
    doc
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
