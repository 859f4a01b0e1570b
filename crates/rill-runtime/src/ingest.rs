use std::sync::Arc;
use std::time::Duration;

use rill_config::ValidationAction;
use rill_core::aggregate::GroupKey;
use rill_core::merge::{DeadLetter, FailureStage};
use rill_core::sink::OutputRouter;
use rill_core::validate::{ValidationResult, Validator};
use rill_core::window::{NO_WATERMARK, WatermarkEstimator};
use rill_core::{Document, MalformedRecord};
use rill_lang::Expr;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::source::{SourceEvent, Subscription};
use crate::stats::ProcessorStats;
use crate::worker::WorkerMsg;

pub(crate) struct IngestConfig {
    pub subscription: Subscription,
    pub rx: mpsc::Receiver<SourceEvent>,
    pub workers: Vec<mpsc::Sender<WorkerMsg>>,
    pub validator: Option<Validator>,
    pub group_key: Expr,
    pub estimator: WatermarkEstimator,
    pub window_size_ms: i64,
    pub allowed_lateness_ms: i64,
    pub watermark_interval: Duration,
    pub router: Arc<OutputRouter>,
    pub stats: Arc<ProcessorStats>,
    /// Stop request: cancel the source and drain.
    pub cancel: CancellationToken,
    /// Set once any task of the processor has failed.
    pub fatal: CancellationToken,
}

// ---------------------------------------------------------------------------
// Ingest: source events → validation → partitioned workers
// ---------------------------------------------------------------------------

struct Ingest {
    workers: Vec<mpsc::Sender<WorkerMsg>>,
    validator: Option<Validator>,
    group_key: Expr,
    estimator: WatermarkEstimator,
    window_size_ms: i64,
    allowed_lateness_ms: i64,
    last_broadcast: i64,
    router: Arc<OutputRouter>,
    stats: Arc<ProcessorStats>,
    fatal: CancellationToken,
}

/// Why ingestion stopped early.
enum Halt {
    /// A worker is gone because the processor already failed.
    WorkerGone,
    Fatal(anyhow::Error),
}

impl From<anyhow::Error> for Halt {
    fn from(e: anyhow::Error) -> Self {
        Halt::Fatal(e)
    }
}

impl Ingest {
    /// Handle one event. Returns `false` at end of stream.
    async fn on_event(&mut self, event: SourceEvent) -> Result<bool, Halt> {
        match event {
            SourceEvent::Document(doc) => {
                self.stats.add_ingested(1);
                self.on_document(doc).await?;
            }
            SourceEvent::Malformed { raw, error } => {
                self.stats.add_ingested(1);
                self.stats.add_malformed(1);
                self.on_malformed(raw, error).await?;
            }
            SourceEvent::Watermark(wm) => {
                self.estimator.observe_explicit(wm);
                self.broadcast_if_closing().await?;
            }
            SourceEvent::Error(e) => rill_warn!(conn, error = %e, "source error"),
            SourceEvent::End => {
                rill_info!(conn, "end of stream");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_document(&mut self, doc: Document) -> Result<(), Halt> {
        if let Some(validator) = &self.validator
            && let ValidationResult::Invalid(err) = validator.validate(&doc)
        {
            self.stats.add_invalid(1);
            return match validator.action() {
                ValidationAction::Dlq => {
                    let letter = DeadLetter::for_document(
                        &doc,
                        err.to_string(),
                        FailureStage::Validate,
                        self.router.processor(),
                    );
                    self.dead_letter(letter).await
                }
                ValidationAction::Drop => {
                    self.stats.add_dropped(1);
                    rill_debug!(pipe, seq = doc.seq(), reason = %err, "invalid document dropped");
                    Ok(())
                }
                ValidationAction::Fail => Err(Halt::Fatal(anyhow::anyhow!(
                    "document #{} failed validation: {err}",
                    doc.seq()
                ))),
            };
        }

        let key = GroupKey::extract(&self.group_key, &doc);
        let event_time = doc.event_time_ms();
        let partition = key.partition(self.workers.len());
        if self.workers[partition]
            .send(WorkerMsg::Document { key, doc })
            .await
            .is_err()
        {
            return Err(self.worker_gone(partition));
        }

        // Observed after dispatch: a document is never late against the
        // watermark it advanced.
        self.estimator.observe(event_time);
        self.broadcast_if_closing().await
    }

    async fn on_malformed(&mut self, raw: Value, error: MalformedRecord) -> Result<(), Halt> {
        rill_debug!(pipe, error = %error, "malformed source record");
        let letter = DeadLetter::new(
            raw,
            "malformed source record",
            FailureStage::Source,
            self.router.processor(),
        )
        .with_detail(error.to_string());
        self.dead_letter(letter).await
    }

    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), Halt> {
        let written = self
            .router
            .dead_letter(letter)
            .await
            .map_err(|e| anyhow::anyhow!("dead-letter output: {e}"))?;
        if written {
            self.stats.add_dead_lettered(1);
        } else {
            self.stats.add_dropped(1);
        }
        Ok(())
    }

    fn worker_gone(&self, partition: usize) -> Halt {
        if self.fatal.is_cancelled() {
            Halt::WorkerGone
        } else {
            Halt::Fatal(anyhow::anyhow!("worker {partition} stopped unexpectedly"))
        }
    }

    /// Index of the last window end (shifted by allowed lateness) that
    /// `wm` has passed. Windows only close when this changes.
    fn close_epoch(&self, wm: i64) -> i64 {
        if wm == NO_WATERMARK {
            return i64::MIN;
        }
        wm.saturating_sub(self.allowed_lateness_ms)
            .div_euclid(self.window_size_ms)
    }

    /// Broadcast right away when the watermark crossed a window close
    /// boundary, so late classification does not wait for the next tick.
    async fn broadcast_if_closing(&mut self) -> Result<(), Halt> {
        let wm = self.estimator.current();
        if self.close_epoch(wm) != self.close_epoch(self.last_broadcast) {
            self.broadcast(false).await?;
        }
        Ok(())
    }

    /// Send the current watermark to every worker. A value already sent is
    /// skipped unless `resend` is set.
    async fn broadcast(&mut self, resend: bool) -> Result<(), Halt> {
        let wm = self.estimator.current();
        if wm == NO_WATERMARK || (!resend && wm == self.last_broadcast) {
            return Ok(());
        }
        for (i, tx) in self.workers.iter().enumerate() {
            if tx.send(WorkerMsg::Watermark(wm)).await.is_err() {
                return Err(self.worker_gone(i));
            }
        }
        self.last_broadcast = wm;
        rill_trace!(pipe, watermark = wm, "watermark broadcast");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Task entry point
// ---------------------------------------------------------------------------

/// Pull events from the source until end of stream or a stop request. On
/// stop the source is cancelled and whatever it already produced is
/// drained. Dropping the worker senders on return lets workers flush.
#[tracing::instrument(name = "ingest", skip_all, fields(workers = config.workers.len()))]
pub(crate) async fn run_ingest(config: IngestConfig) -> anyhow::Result<()> {
    let IngestConfig {
        subscription,
        mut rx,
        workers,
        validator,
        group_key,
        estimator,
        window_size_ms,
        allowed_lateness_ms,
        watermark_interval,
        router,
        stats,
        cancel,
        fatal,
    } = config;

    let mut ingest = Ingest {
        workers,
        validator,
        group_key,
        estimator,
        window_size_ms: window_size_ms.max(1),
        allowed_lateness_ms,
        last_broadcast: NO_WATERMARK,
        router,
        stats,
        fatal,
    };

    let mut tick = tokio::time::interval(watermark_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    tick.tick().await;
    let mut draining = false;

    let outcome: Result<(), Halt> = async {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !draining => {
                    rill_info!(pipe, "stop requested, draining source");
                    subscription.cancel();
                    draining = true;
                }
                event = rx.recv() => match event {
                    Some(event) => {
                        if !ingest.on_event(event).await? {
                            break;
                        }
                    }
                    None => break,
                },
                // Re-sent even when unchanged: workers emit pending
                // revisions on every watermark.
                _ = tick.tick() => ingest.broadcast(true).await?,
            }
        }
        // Final watermark so workers close what it already covers.
        ingest.broadcast(false).await
    }
    .await;

    subscription.cancel();
    drop(rx);
    let source_result = subscription.join().await;

    let result = match outcome {
        Ok(()) | Err(Halt::WorkerGone) => source_result,
        Err(Halt::Fatal(e)) => Err(e),
    };
    if result.is_err() {
        // Workers must see the failure before their channels close.
        ingest.fatal.cancel();
    }
    result?;
    rill_debug!(pipe, stats = ?ingest.stats.snapshot(), "ingest stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
