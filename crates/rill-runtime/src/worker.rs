use std::sync::Arc;

use rill_config::{LatePolicy, WindowSpec};
use rill_core::aggregate::GroupKey;
use rill_core::error::CoreResult;
use rill_core::merge::{DeadLetter, FailureStage, MergeRecord};
use rill_core::sink::{EmitOutcome, OutputRouter};
use rill_core::window::{FoldOutcome, WindowBounds, WindowStore};
use rill_core::Document;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::stats::ProcessorStats;

/// Messages from the ingest task to one worker. A worker sees documents and
/// watermarks in the order ingest sent them.
#[derive(Debug)]
pub(crate) enum WorkerMsg {
    Document { key: GroupKey, doc: Document },
    Watermark(i64),
}

pub(crate) struct WorkerConfig {
    pub id: usize,
    pub window: WindowSpec,
    pub router: Arc<OutputRouter>,
    pub stats: Arc<ProcessorStats>,
    pub flush_on_stop: bool,
    /// Cancelled when the processor has failed; nothing is emitted at stop.
    pub fatal: CancellationToken,
}

// ---------------------------------------------------------------------------
// Worker: owns the windows of one partition
// ---------------------------------------------------------------------------

struct Worker {
    id: usize,
    store: WindowStore,
    late_policy: LatePolicy,
    router: Arc<OutputRouter>,
    stats: Arc<ProcessorStats>,
}

impl Worker {
    async fn on_document(&mut self, key: GroupKey, doc: Document) -> CoreResult<()> {
        match self.store.fold(key, &doc) {
            FoldOutcome::Folded => self.stats.add_folded(1),
            FoldOutcome::Revised(bounds) => {
                self.stats.add_revised(1);
                rill_warn!(
                    pipe,
                    worker = self.id,
                    window_start = bounds.start_ms,
                    seq = doc.seq(),
                    "late document folded into closed window, revision pending"
                );
            }
            FoldOutcome::Late(bounds) => self.on_late(doc, bounds).await?,
            FoldOutcome::Rejected(e) => {
                self.stats.add_fold_rejected(1);
                rill_debug!(pipe, worker = self.id, error = %e, "fold rejected");
                let letter = DeadLetter::for_document(
                    &doc,
                    "aggregation type error",
                    FailureStage::Aggregate,
                    self.router.processor(),
                )
                .with_detail(e.to_string());
                self.dead_letter(letter).await?;
            }
        }
        Ok(())
    }

    async fn on_late(&mut self, doc: Document, bounds: WindowBounds) -> CoreResult<()> {
        match self.late_policy {
            LatePolicy::Dlq => {
                self.stats.add_late_dead_lettered(1);
                let letter = DeadLetter::for_document(
                    &doc,
                    "late document",
                    FailureStage::Window,
                    self.router.processor(),
                )
                .with_detail(format!(
                    "window [{}, {}) closed at watermark {}",
                    bounds.start_ms,
                    bounds.end_ms,
                    self.store.watermark()
                ));
                self.dead_letter(letter).await
            }
            LatePolicy::Revise => {
                self.stats.add_late_dropped(1);
                rill_warn!(
                    pipe,
                    worker = self.id,
                    window_start = bounds.start_ms,
                    seq = doc.seq(),
                    "late document past revise retention dropped"
                );
                Ok(())
            }
            LatePolicy::Drop => {
                self.stats.add_late_dropped(1);
                rill_debug!(
                    pipe,
                    worker = self.id,
                    window_start = bounds.start_ms,
                    seq = doc.seq(),
                    "late document dropped"
                );
                Ok(())
            }
        }
    }

    async fn on_watermark(&mut self, watermark: i64) -> CoreResult<()> {
        let closed = self.store.advance(watermark);
        self.stats.add_windows_closed(closed as u64);
        self.emit_closing().await
    }

    /// Emit every closing window, then evict what is no longer needed. A
    /// window whose emission fails stays closing.
    async fn emit_closing(&mut self) -> CoreResult<()> {
        for emission in self.store.closing() {
            let records = MergeRecord::from_emission(&emission);
            for record in &records {
                match self.router.emit(record).await? {
                    EmitOutcome::Written(_) => self.stats.add_records_emitted(1),
                    EmitOutcome::DeadLettered => {
                        self.stats.add_merge_rejected(1);
                        self.stats.add_dead_lettered(1);
                    }
                    EmitOutcome::Dropped => {
                        self.stats.add_merge_rejected(1);
                        self.stats.add_dropped(1);
                    }
                }
            }
            self.store.mark_emitted(emission.window);
            rill_debug!(
                pipe,
                worker = self.id,
                window_start = emission.bounds.start_ms,
                revision = emission.revision,
                groups = records.len(),
                "window emitted"
            );
        }
        let evicted = self.store.evict();
        if evicted > 0 {
            rill_trace!(res, worker = self.id, evicted, "windows evicted");
        }
        Ok(())
    }

    async fn dead_letter(&self, letter: DeadLetter) -> CoreResult<()> {
        if self.router.dead_letter(letter).await? {
            self.stats.add_dead_lettered(1);
        } else {
            self.stats.add_dropped(1);
        }
        Ok(())
    }

    /// Emit what is already closing, plus every open window when
    /// `flush_open` is set, then release window state.
    async fn finish(&mut self, flush_open: bool) -> CoreResult<()> {
        if flush_open {
            let closed = self.store.close_all();
            self.stats.add_windows_closed(closed as u64);
            if closed > 0 {
                rill_debug!(pipe, worker = self.id, windows = closed, "flushing open windows");
            }
        }
        self.emit_closing().await?;
        self.store.release();
        Ok(())
    }

    /// Drop window state without emitting anything.
    fn abandon(&mut self) {
        if !self.store.is_empty() {
            rill_warn!(
                pipe,
                worker = self.id,
                windows = self.store.len(),
                "processor failed, discarding window state"
            );
        }
        self.store.release();
    }
}

// ---------------------------------------------------------------------------
// Task entry point
// ---------------------------------------------------------------------------

/// Fold documents of one partition until the ingest task hangs up, then
/// flush and release window state.
#[tracing::instrument(name = "worker", skip_all, fields(worker = config.id))]
pub(crate) async fn run_worker(
    config: WorkerConfig,
    mut rx: mpsc::Receiver<WorkerMsg>,
) -> anyhow::Result<()> {
    let WorkerConfig {
        id,
        window,
        router,
        stats,
        flush_on_stop,
        fatal,
    } = config;
    let mut worker = Worker {
        id,
        store: WindowStore::new(&window),
        late_policy: window.late_policy,
        router,
        stats,
    };

    while let Some(msg) = rx.recv().await {
        let result = match msg {
            WorkerMsg::Document { key, doc } => worker.on_document(key, doc).await,
            WorkerMsg::Watermark(wm) => worker.on_watermark(wm).await,
        };
        result.map_err(|e| anyhow::anyhow!("worker {id}: {e}"))?;
    }

    if fatal.is_cancelled() {
        worker.abandon();
    } else {
        worker
            .finish(flush_on_stop)
            .await
            .map_err(|e| anyhow::anyhow!("worker {id} flush: {e}"))?;
    }
    rill_debug!(pipe, worker = id, "worker stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rill_config::{
        AccumulatorOp, AccumulatorSpec, GroupSpec, HumanDuration, WhenMatched, WhenNotMatched,
    };
    use async_trait::async_trait;
    use rill_core::merge::{MergeKey, MergePolicy};
    use rill_core::sink::{
        Ack, DeadLetterSink, MemoryCollection, MemoryDeadLetters, MemorySink, RetryPolicy,
        UpsertSink,
    };
    use rill_core::window::{WindowId, WindowPhase};
    use rill_core::{CoreError, CoreReason};
    use rill_lang::{Expr, FieldPath};
    use serde_json::{Map, Value, json};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn window(late_policy: LatePolicy) -> WindowSpec {
        WindowSpec {
            size: Duration::from_secs(3),
            watermark: HumanDuration::from(Duration::ZERO),
            allowed_lateness: HumanDuration::from(Duration::ZERO),
            late_policy,
            revise_retention: Duration::from_secs(3),
            group: GroupSpec {
                key: Expr::Field(FieldPath::from_dotted("color")),
                accumulators: vec![AccumulatorSpec {
                    name: "n".into(),
                    op: AccumulatorOp::Sum,
                    expr: Expr::Field(FieldPath::from_dotted("x")),
                }],
            },
        }
    }

    struct Harness {
        tx: mpsc::Sender<WorkerMsg>,
        handle: tokio::task::JoinHandle<anyhow::Result<()>>,
        good: Arc<MemoryCollection>,
        dlq: Arc<MemoryDeadLetters>,
        stats: Arc<ProcessorStats>,
    }

    fn on() -> Vec<FieldPath> {
        vec![FieldPath::from_dotted("_id"), FieldPath::from_dotted("_window")]
    }

    fn spawn(late_policy: LatePolicy) -> Harness {
        spawn_with(late_policy, true)
    }

    fn spawn_with(late_policy: LatePolicy, flush_on_stop: bool) -> Harness {
        let good = MemoryCollection::new();
        let dlq = MemoryDeadLetters::new("dlq");
        let dlq_sink: Arc<dyn DeadLetterSink> = dlq.clone();
        let router = Arc::new(OutputRouter::new(
            "p",
            on(),
            Arc::new(MemorySink::new(
                "good",
                Arc::clone(&good),
                MergePolicy::new(WhenMatched::Replace, WhenNotMatched::Insert),
            )),
            Some(dlq_sink),
            RetryPolicy::once(),
        ));
        let stats = Arc::new(ProcessorStats::default());
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(run_worker(
            WorkerConfig {
                id: 0,
                window: window(late_policy),
                router,
                stats: Arc::clone(&stats),
                flush_on_stop,
                fatal: CancellationToken::new(),
            },
            rx,
        ));
        Harness {
            tx,
            handle,
            good,
            dlq,
            stats,
        }
    }

    fn doc(body: Value, ts: i64) -> WorkerMsg {
        let doc = Document::from_value(body, None, ts, 0).unwrap();
        let key = GroupKey::new(doc.body().get("color").cloned().unwrap_or(Value::Null));
        WorkerMsg::Document { key, doc }
    }

    fn sums(good: &MemoryCollection) -> Vec<(Value, Value)> {
        let mut out: Vec<_> = good
            .documents()
            .into_iter()
            .map(|d| (d["_id"].clone(), d["n"].clone()))
            .collect();
        out.sort_by_key(|(id, _)| id.to_string());
        out
    }

    #[tokio::test]
    async fn watermark_closes_and_emits_window() {
        let h = spawn(LatePolicy::Drop);
        h.tx.send(doc(json!({"color": "red", "x": 1}), 0)).await.unwrap();
        h.tx.send(doc(json!({"color": "red", "x": 2}), 1000)).await.unwrap();
        h.tx.send(doc(json!({"color": "blue", "x": 4}), 2000)).await.unwrap();
        h.tx.send(WorkerMsg::Watermark(3000)).await.unwrap();
        drop(h.tx);
        h.handle.await.unwrap().unwrap();

        assert_eq!(
            sums(&h.good),
            vec![(json!("blue"), json!(4)), (json!("red"), json!(3))]
        );
        assert_eq!(h.stats.snapshot().windows_closed, 1);
    }

    #[tokio::test]
    async fn late_document_goes_to_dead_letter() {
        let h = spawn(LatePolicy::Dlq);
        h.tx.send(doc(json!({"color": "red", "x": 1}), 0)).await.unwrap();
        h.tx.send(WorkerMsg::Watermark(3000)).await.unwrap();
        h.tx.send(doc(json!({"color": "red", "x": 5}), 500)).await.unwrap();
        drop(h.tx);
        h.handle.await.unwrap().unwrap();

        assert_eq!(sums(&h.good), vec![(json!("red"), json!(1))]);
        let letters = h.dlq.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].stage, FailureStage::Window);
        assert_eq!(letters[0].doc, json!({"color": "red", "x": 5}));
    }

    #[tokio::test]
    async fn revise_reemits_window_with_late_document() {
        let h = spawn(LatePolicy::Revise);
        h.tx.send(doc(json!({"color": "red", "x": 1}), 0)).await.unwrap();
        h.tx.send(WorkerMsg::Watermark(3000)).await.unwrap();
        h.tx.send(doc(json!({"color": "red", "x": 5}), 500)).await.unwrap();
        h.tx.send(WorkerMsg::Watermark(3000)).await.unwrap();
        drop(h.tx);
        h.handle.await.unwrap().unwrap();

        assert_eq!(sums(&h.good), vec![(json!("red"), json!(6))]);
        assert_eq!(h.stats.snapshot().revised, 1);
        assert!(h.dlq.is_empty());
    }

    #[tokio::test]
    async fn type_error_is_dead_lettered_and_window_continues() {
        let h = spawn(LatePolicy::Drop);
        h.tx.send(doc(json!({"color": "red", "x": 1}), 0)).await.unwrap();
        h.tx.send(doc(json!({"color": "red", "x": "two"}), 10)).await.unwrap();
        h.tx.send(doc(json!({"color": "red", "x": 3}), 20)).await.unwrap();
        drop(h.tx);
        h.handle.await.unwrap().unwrap();

        assert_eq!(sums(&h.good), vec![(json!("red"), json!(4))]);
        let letters = h.dlq.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, "aggregation type error");
        assert_eq!(letters[0].stage, FailureStage::Aggregate);
    }

    #[tokio::test]
    async fn revise_after_retention_keeps_emitted_sum() {
        let h = spawn(LatePolicy::Revise);
        h.tx.send(doc(json!({"color": "red", "x": 1}), 0)).await.unwrap();
        h.tx.send(doc(json!({"color": "red", "x": 2}), 1000)).await.unwrap();
        h.tx.send(WorkerMsg::Watermark(3000)).await.unwrap();
        // Retention is 3s: window [0, 3000) is evicted here.
        h.tx.send(WorkerMsg::Watermark(6000)).await.unwrap();
        h.tx.send(doc(json!({"color": "red", "x": 100}), 100)).await.unwrap();
        drop(h.tx);
        h.handle.await.unwrap().unwrap();

        assert_eq!(sums(&h.good), vec![(json!("red"), json!(3))]);
        let stats = h.stats.snapshot();
        assert_eq!(stats.late_dropped, 1);
        assert_eq!(stats.revised, 0);
        assert!(h.dlq.is_empty());
    }

    #[tokio::test]
    async fn pending_revision_is_emitted_without_flush() {
        let h = spawn_with(LatePolicy::Revise, false);
        h.tx.send(doc(json!({"color": "red", "x": 1}), 0)).await.unwrap();
        h.tx.send(WorkerMsg::Watermark(3000)).await.unwrap();
        h.tx.send(doc(json!({"color": "red", "x": 5}), 500)).await.unwrap();
        // Open window [3000, 6000): not flushed.
        h.tx.send(doc(json!({"color": "red", "x": 9}), 4000)).await.unwrap();
        drop(h.tx);
        h.handle.await.unwrap().unwrap();

        assert_eq!(sums(&h.good), vec![(json!("red"), json!(6))]);
        assert_eq!(h.stats.snapshot().windows_closed, 1);
    }

    /// Upsert target that is always unreachable.
    struct DownSink {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl UpsertSink for DownSink {
        fn name(&self) -> &str {
            "down"
        }

        async fn upsert(&self, _key: &MergeKey, _record: Map<String, Value>) -> CoreResult<Ack> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::from(CoreReason::Sink))
        }
    }

    fn failing_router(sink: &Arc<DownSink>) -> Arc<OutputRouter> {
        let good: Arc<dyn UpsertSink> = sink.clone();
        Arc::new(OutputRouter::new(
            "p",
            on(),
            good,
            None,
            RetryPolicy {
                max_attempts: 2,
                initial: Duration::from_millis(5),
                max: Duration::from_millis(5),
            },
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_sink_retries_keep_window_closing() {
        let sink = Arc::new(DownSink {
            attempts: AtomicU32::new(0),
        });
        let window = window(LatePolicy::Drop);
        let mut worker = Worker {
            id: 0,
            store: WindowStore::new(&window),
            late_policy: window.late_policy,
            router: failing_router(&sink),
            stats: Arc::new(ProcessorStats::default()),
        };

        let WorkerMsg::Document { key, doc } = doc(json!({"color": "red", "x": 1}), 0) else {
            unreachable!()
        };
        worker.on_document(key, doc).await.unwrap();
        assert!(worker.on_watermark(3000).await.is_err());

        assert_eq!(sink.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(worker.store.phase(WindowId(0)), Some(WindowPhase::Closing));
        assert_eq!(worker.stats.snapshot().records_emitted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_sink_retries_fail_the_worker() {
        let sink = Arc::new(DownSink {
            attempts: AtomicU32::new(0),
        });
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(run_worker(
            WorkerConfig {
                id: 3,
                window: window(LatePolicy::Drop),
                router: failing_router(&sink),
                stats: Arc::new(ProcessorStats::default()),
                flush_on_stop: true,
                fatal: CancellationToken::new(),
            },
            rx,
        ));
        tx.send(doc(json!({"color": "red", "x": 1}), 0)).await.unwrap();
        tx.send(WorkerMsg::Watermark(3000)).await.unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.to_string().starts_with("worker 3:"), "{err}");
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 2);
        // The worker stopped receiving.
        assert!(tx.send(WorkerMsg::Watermark(6000)).await.is_err());
    }
}
