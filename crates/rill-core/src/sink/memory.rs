use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{Ack, DeadLetterSink, UpsertSink};
use crate::error::CoreResult;
use crate::merge::{DeadLetter, MergeKey, MergePolicy, apply_upsert};

// ---------------------------------------------------------------------------
// MemoryCollection: inspectable keyed store
// ---------------------------------------------------------------------------

/// In-process keyed collection. Shared between the sink writing it and
/// whoever inspects it.
#[derive(Debug, Default)]
pub struct MemoryCollection {
    docs: Mutex<BTreeMap<MergeKey, Map<String, Value>>>,
}

impl MemoryCollection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn get(&self, key: &MergeKey) -> Option<Map<String, Value>> {
        self.lock().get(key).cloned()
    }

    /// Every stored document, ordered by key.
    pub fn documents(&self) -> Vec<Value> {
        self.lock()
            .values()
            .map(|d| Value::Object(d.clone()))
            .collect()
    }

    /// Documents whose `_id` equals `id`.
    pub fn find_by_id(&self, id: &Value) -> Vec<Value> {
        self.lock()
            .values()
            .filter(|d| d.get("_id") == Some(id))
            .map(|d| Value::Object(d.clone()))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<MergeKey, Map<String, Value>>> {
        self.docs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// [`UpsertSink`] writing into a [`MemoryCollection`].
#[derive(Debug)]
pub struct MemorySink {
    name: String,
    collection: Arc<MemoryCollection>,
    policy: MergePolicy,
}

impl MemorySink {
    pub fn new(name: impl Into<String>, collection: Arc<MemoryCollection>, policy: MergePolicy) -> Self {
        Self {
            name: name.into(),
            collection,
            policy,
        }
    }
}

#[async_trait]
impl UpsertSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upsert(&self, key: &MergeKey, record: Map<String, Value>) -> CoreResult<Ack> {
        let mut docs = self.collection.lock();
        match apply_upsert(key, docs.get(key), record, &self.policy) {
            Ok(up) => {
                if let Some(doc) = up.store {
                    docs.insert(key.clone(), doc);
                }
                Ok(Ack::Written(up.outcome))
            }
            Err(rejection) => Ok(Ack::Rejected(rejection.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryDeadLetters
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryDeadLetters {
    name: String,
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetters {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            letters: Mutex::new(Vec::new()),
        })
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    fn name(&self) -> &str {
        &self.name
    }

    async fn append(&self, letter: &DeadLetter) -> CoreResult<()> {
        self.letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(letter.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
