use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Processor counters. Lock-free; shared by the ingest task and workers.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    ingested: AtomicU64,
    malformed: AtomicU64,
    invalid: AtomicU64,
    folded: AtomicU64,
    fold_rejected: AtomicU64,
    late_dropped: AtomicU64,
    late_dead_lettered: AtomicU64,
    revised: AtomicU64,
    windows_closed: AtomicU64,
    records_emitted: AtomicU64,
    merge_rejected: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
}

macro_rules! counter {
    ($($inc:ident => $field:ident),* $(,)?) => {
        impl ProcessorStats {
            $(
                pub(crate) fn $inc(&self, n: u64) {
                    self.$field.fetch_add(n, Ordering::Relaxed);
                }
            )*
        }
    };
}

counter! {
    add_ingested => ingested,
    add_malformed => malformed,
    add_invalid => invalid,
    add_folded => folded,
    add_fold_rejected => fold_rejected,
    add_late_dropped => late_dropped,
    add_late_dead_lettered => late_dead_lettered,
    add_revised => revised,
    add_windows_closed => windows_closed,
    add_records_emitted => records_emitted,
    add_merge_rejected => merge_rejected,
    add_dead_lettered => dead_lettered,
    add_dropped => dropped,
}

impl ProcessorStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            ingested: get(&self.ingested),
            malformed: get(&self.malformed),
            invalid: get(&self.invalid),
            folded: get(&self.folded),
            fold_rejected: get(&self.fold_rejected),
            late_dropped: get(&self.late_dropped),
            late_dead_lettered: get(&self.late_dead_lettered),
            revised: get(&self.revised),
            windows_closed: get(&self.windows_closed),
            records_emitted: get(&self.records_emitted),
            merge_rejected: get(&self.merge_rejected),
            dead_lettered: get(&self.dead_lettered),
            dropped: get(&self.dropped),
        }
    }
}

/// Point-in-time copy of [`ProcessorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Records received from the source, well-formed or not.
    pub ingested: u64,
    pub malformed: u64,
    /// Documents that failed validation.
    pub invalid: u64,
    pub folded: u64,
    pub fold_rejected: u64,
    pub late_dropped: u64,
    pub late_dead_lettered: u64,
    /// Late documents folded into an already-closed window.
    pub revised: u64,
    pub windows_closed: u64,
    /// Aggregate records written to the good sink.
    pub records_emitted: u64,
    pub merge_rejected: u64,
    /// Entries appended to the dead-letter sink.
    pub dead_lettered: u64,
    /// Failures dropped for lack of a dead-letter sink, or by policy.
    pub dropped: u64,
}
