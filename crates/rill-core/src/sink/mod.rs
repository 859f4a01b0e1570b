mod file;
mod memory;
mod retry;
mod router;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::CoreResult;
use crate::merge::{DeadLetter, MergeKey, UpsertOutcome};

pub use file::{FileCollection, FileDeadLetters};
pub use memory::{MemoryCollection, MemoryDeadLetters, MemorySink};
pub use retry::RetryPolicy;
pub use router::{EmitOutcome, OutputRouter};

/// Acknowledgment of an upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum Ack {
    Written(UpsertOutcome),
    /// The merge policy refused the record; the reason is routed to
    /// dead-letter.
    Rejected(String),
}

/// Keyed "good" output. Implementations apply their merge policy against the
/// stored collection and persist the result before acknowledging.
#[async_trait]
pub trait UpsertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn upsert(&self, key: &MergeKey, record: Map<String, Value>) -> CoreResult<Ack>;

    /// Flush and release resources.
    async fn stop(&self) -> CoreResult<()> {
        Ok(())
    }
}

/// Append-only failure output.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    fn name(&self) -> &str;

    async fn append(&self, letter: &DeadLetter) -> CoreResult<()>;

    async fn stop(&self) -> CoreResult<()> {
        Ok(())
    }
}
