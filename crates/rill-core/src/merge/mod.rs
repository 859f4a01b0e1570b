mod record;
mod upsert;

pub use record::{DeadLetter, FailureStage, MergeKey, MergeRecord};
pub use upsert::{MergePolicy, MergeRejection, Upsert, UpsertOutcome, apply_upsert};
