use std::sync::Arc;

use rill_lang::FieldPath;

use super::{Ack, DeadLetterSink, RetryPolicy, UpsertSink};
use crate::error::CoreResult;
use crate::merge::{DeadLetter, FailureStage, MergeKey, MergeRecord, UpsertOutcome};

/// What became of an emitted aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    Written(UpsertOutcome),
    /// Rejected by the merge policy and written to dead-letter.
    DeadLettered,
    /// Rejected with no dead-letter output configured.
    Dropped,
}

/// Routes aggregates to the keyed output and failures to dead-letter,
/// retrying transient sink errors.
pub struct OutputRouter {
    processor: String,
    on: Vec<FieldPath>,
    good: Arc<dyn UpsertSink>,
    dlq: Option<Arc<dyn DeadLetterSink>>,
    retry: RetryPolicy,
}

impl OutputRouter {
    pub fn new(
        processor: impl Into<String>,
        on: Vec<FieldPath>,
        good: Arc<dyn UpsertSink>,
        dlq: Option<Arc<dyn DeadLetterSink>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            processor: processor.into(),
            on,
            good,
            dlq,
            retry,
        }
    }

    pub fn processor(&self) -> &str {
        &self.processor
    }

    pub fn has_dead_letter(&self) -> bool {
        self.dlq.is_some()
    }

    /// Upsert one aggregate. A record the merge policy refuses is
    /// dead-lettered; only sink failures that outlast the retry policy are
    /// errors.
    pub async fn emit(&self, record: &MergeRecord) -> CoreResult<EmitOutcome> {
        let doc = record.to_document();
        let key = MergeKey::from_document(&doc, &self.on);
        let good = &self.good;
        let ack = self
            .retry
            .run("upsert", || {
                let doc = doc.clone();
                let key = &key;
                async move { good.upsert(key, doc).await }
            })
            .await?;

        match ack {
            Ack::Written(outcome) => Ok(EmitOutcome::Written(outcome)),
            Ack::Rejected(detail) => {
                let letter = DeadLetter::new(
                    serde_json::Value::Object(doc),
                    "merge rejected",
                    FailureStage::Merge,
                    &self.processor,
                )
                .with_detail(detail);
                if self.dead_letter(letter).await? {
                    Ok(EmitOutcome::DeadLettered)
                } else {
                    Ok(EmitOutcome::Dropped)
                }
            }
        }
    }

    /// Append to dead-letter. Returns `false` when no dead-letter output is
    /// configured and the entry was dropped.
    pub async fn dead_letter(&self, letter: DeadLetter) -> CoreResult<bool> {
        let Some(dlq) = &self.dlq else {
            log::warn!(
                "no dead-letter output, dropping document ({:?}: {})",
                letter.stage,
                letter.reason
            );
            return Ok(false);
        };
        let letter = &letter;
        self.retry
            .run("dead-letter append", || async move { dlq.append(letter).await })
            .await?;
        Ok(true)
    }

    /// Stop both outputs. Both are attempted; the first error is returned.
    pub async fn stop(&self) -> CoreResult<()> {
        let good = self.good.stop().await;
        let dlq = match &self.dlq {
            Some(d) => d.stop().await,
            None => Ok(()),
        };
        good.and(dlq)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::GroupKey;
    use crate::error::{CoreError, CoreReason};
    use crate::merge::MergePolicy;
    use crate::sink::{MemoryCollection, MemoryDeadLetters, MemorySink};
    use crate::window::WindowBounds;
    use async_trait::async_trait;
    use rill_config::{WhenMatched, WhenNotMatched};
    use serde_json::{Map, Value, json};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn record(id: &str, n: i64) -> MergeRecord {
        let mut fields = Map::new();
        fields.insert("n".into(), json!(n));
        MergeRecord {
            key: GroupKey::new(json!(id)),
            window: WindowBounds {
                start_ms: 0,
                end_ms: 3000,
            },
            revision: 0,
            fields,
        }
    }

    fn on() -> Vec<FieldPath> {
        vec![FieldPath::from_dotted("_id"), FieldPath::from_dotted("_window")]
    }

    #[tokio::test]
    async fn merge_rejection_goes_to_dead_letter() {
        let coll = MemoryCollection::new();
        let good = Arc::new(MemorySink::new(
            "good",
            Arc::clone(&coll),
            MergePolicy::new(WhenMatched::Fail, WhenNotMatched::Insert),
        ));
        let dlq = MemoryDeadLetters::new("dlq");
        let dlq_sink: Arc<dyn DeadLetterSink> = dlq.clone();
        let router = OutputRouter::new("p", on(), good, Some(dlq_sink), RetryPolicy::once());

        assert_eq!(
            router.emit(&record("red", 1)).await.unwrap(),
            EmitOutcome::Written(UpsertOutcome::Inserted)
        );
        assert_eq!(router.emit(&record("red", 2)).await.unwrap(), EmitOutcome::DeadLettered);

        let letters = dlq.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].stage, FailureStage::Merge);
        assert_eq!(letters[0].doc["n"], json!(2));
        assert_eq!(coll.len(), 1);
    }

    #[tokio::test]
    async fn rejection_without_dead_letter_is_dropped() {
        let good = Arc::new(MemorySink::new(
            "good",
            MemoryCollection::new(),
            MergePolicy::new(WhenMatched::Merge, WhenNotMatched::Fail),
        ));
        let router = OutputRouter::new("p", on(), good, None, RetryPolicy::once());
        assert_eq!(router.emit(&record("red", 1)).await.unwrap(), EmitOutcome::Dropped);
        assert!(!router.has_dead_letter());
    }

    struct Flaky {
        failures: AtomicU32,
        inner: MemorySink,
    }

    #[async_trait]
    impl UpsertSink for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn upsert(&self, key: &MergeKey, record: Map<String, Value>) -> CoreResult<Ack> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CoreError::from(CoreReason::Sink));
            }
            self.inner.upsert(key, record).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_sink_errors_are_retried() {
        let coll = MemoryCollection::new();
        let good = Arc::new(Flaky {
            failures: AtomicU32::new(2),
            inner: MemorySink::new(
                "good",
                Arc::clone(&coll),
                MergePolicy::new(WhenMatched::Replace, WhenNotMatched::Insert),
            ),
        });
        let retry = RetryPolicy {
            max_attempts: 3,
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
        };
        let router = OutputRouter::new("p", on(), good, None, retry);
        assert_eq!(
            router.emit(&record("red", 1)).await.unwrap(),
            EmitOutcome::Written(UpsertOutcome::Inserted)
        );
        assert_eq!(coll.len(), 1);
    }
}
