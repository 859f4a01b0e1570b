use std::sync::Arc;

use rill_config::ProcessorConfig;
use rill_core::sink::OutputRouter;
use rill_core::validate::Validator;
use rill_core::window::{SharedWatermark, WatermarkEstimator};
use tokio::sync::mpsc;

use crate::ingest::{IngestConfig, run_ingest};
use crate::source::{DocumentSource, RecordDecoder};
use crate::stats::ProcessorStats;
use crate::worker::{WorkerConfig, WorkerMsg, run_worker};

use super::types::{FailureSignal, TaskGroup};

// ---------------------------------------------------------------------------
// Task spawn helpers: each creates its channels and spawns its tasks
// ---------------------------------------------------------------------------

/// Spawn `runtime.workers` aggregation workers, one channel each.
/// Returns (worker senders, task group).
pub(super) fn spawn_workers(
    config: &ProcessorConfig,
    router: &Arc<OutputRouter>,
    stats: &Arc<ProcessorStats>,
    failure: &FailureSignal,
) -> (Vec<mpsc::Sender<WorkerMsg>>, TaskGroup) {
    let count = config.runtime.workers.max(1);
    let capacity = config.runtime.channel_capacity.max(1);
    let mut senders = Vec::with_capacity(count);
    let mut group = TaskGroup::new("workers");

    for id in 0..count {
        let (tx, rx) = mpsc::channel(capacity);
        let worker_config = WorkerConfig {
            id,
            window: config.pipeline.window.clone(),
            router: Arc::clone(router),
            stats: Arc::clone(stats),
            flush_on_stop: config.runtime.flush_on_stop,
            fatal: failure.fatal.clone(),
        };
        group.spawn(failure, run_worker(worker_config, rx));
        senders.push(tx);
    }
    (senders, group)
}

/// Subscribe to the source and spawn the ingest task that feeds `workers`.
pub(super) fn spawn_ingest(
    config: &ProcessorConfig,
    source: Box<dyn DocumentSource>,
    workers: Vec<mpsc::Sender<WorkerMsg>>,
    router: Arc<OutputRouter>,
    stats: &Arc<ProcessorStats>,
    watermark: &SharedWatermark,
    failure: &FailureSignal,
) -> TaskGroup {
    let pipeline = &config.pipeline;
    let window = &pipeline.window;

    let (tx, rx) = mpsc::channel(config.runtime.channel_capacity.max(1));
    let decoder = RecordDecoder::new(pipeline.source.time_field.clone());
    let subscription = source.subscribe(tx, decoder);

    let ingest_config = IngestConfig {
        subscription,
        rx,
        workers,
        validator: pipeline.validate.as_ref().map(Validator::new),
        group_key: window.group.key.clone(),
        estimator: WatermarkEstimator::new(window.watermark.as_millis_i64(), watermark.clone()),
        window_size_ms: window.size_millis(),
        allowed_lateness_ms: window.allowed_lateness.as_millis_i64(),
        watermark_interval: config.runtime.watermark_interval.as_duration(),
        router,
        stats: Arc::clone(stats),
        cancel: failure.cancel.clone(),
        fatal: failure.fatal.clone(),
    };

    let mut group = TaskGroup::new("ingest");
    group.spawn(failure, run_ingest(ingest_config));
    group
}
