use std::hash::{DefaultHasher, Hash, Hasher};

use rill_lang::Expr;
use serde_json::Value;

use crate::document::Document;

/// A group key value with a canonical text form used for equality and
/// hashing. Object members are ordered, so structurally equal keys compare
/// equal.
#[derive(Debug, Clone)]
pub struct GroupKey {
    value: Value,
    canonical: String,
}

impl GroupKey {
    pub fn new(value: Value) -> Self {
        let canonical = value.to_string();
        Self { value, canonical }
    }

    /// Evaluate the `_id` expression. A missing field yields the `null` key.
    pub fn extract(expr: &Expr, doc: &Document) -> Self {
        Self::new(expr.eval_doc(doc.body()).cloned().unwrap_or(Value::Null))
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// Stable partition index in `0..partitions`.
    pub fn partition(&self, partitions: usize) -> usize {
        let mut h = DefaultHasher::new();
        self.canonical.hash(&mut h);
        (h.finish() % partitions.max(1) as u64) as usize
    }
}

impl PartialEq for GroupKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for GroupKey {}

impl Hash for GroupKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}
