mod signal;
mod spawn;
mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use orion_error::op_context;
use orion_error::prelude::*;
use rill_config::ProcessorConfig;
use rill_core::sink::{OutputRouter, RetryPolicy};
use rill_core::window::SharedWatermark;
use tokio_util::sync::CancellationToken;

use crate::error::{RuntimeError, RuntimeReason, RuntimeResult};
use crate::sink_build::{SinkCatalog, build_output_router};
use crate::source::open_source;
use crate::stats::{ProcessorStats, StatsSnapshot};

// Re-export public API
pub use signal::wait_for_signal;

use spawn::{spawn_ingest, spawn_workers};
use types::{FailureSignal, TaskGroup};

// ---------------------------------------------------------------------------
// ProcessorState
// ---------------------------------------------------------------------------

/// `Created → Running → Stopped | Failed → Dropped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Created,
    Running,
    Stopped,
    Failed,
    Dropped,
}

// ---------------------------------------------------------------------------
// Processor: the top-level lifecycle handle
// ---------------------------------------------------------------------------

/// One aggregation pipeline: a source, a pool of window workers and the
/// merge / dead-letter outputs.
///
/// Task groups are stored in start order and joined in reverse (LIFO)
/// during [`wait`](Self::wait): ingest stops first, closing every worker
/// channel, then workers drain and flush, then the sinks are stopped.
pub struct Processor {
    name: String,
    config: ProcessorConfig,
    catalog: SinkCatalog,
    state: ProcessorState,
    /// Stop request. Cancelled by [`stop`](Self::stop) or by a failing task.
    cancel: CancellationToken,
    /// Cancelled only when a task failed.
    fatal: CancellationToken,
    stats: Arc<ProcessorStats>,
    watermark: SharedWatermark,
    listen_addr: Option<SocketAddr>,
    groups: Vec<TaskGroup>,
    router: Option<Arc<OutputRouter>>,
}

impl Processor {
    /// Create a processor with its own sink catalog. Nothing runs until
    /// [`start`](Self::start).
    pub fn create(name: impl Into<String>, config: ProcessorConfig) -> Self {
        Self::create_with_catalog(name, config, SinkCatalog::new())
    }

    /// Create a processor whose `memory` outputs live in `catalog`.
    pub fn create_with_catalog(
        name: impl Into<String>,
        config: ProcessorConfig,
        catalog: SinkCatalog,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            catalog,
            state: ProcessorState::Created,
            cancel: CancellationToken::new(),
            fatal: CancellationToken::new(),
            stats: Arc::new(ProcessorStats::default()),
            watermark: SharedWatermark::new(),
            listen_addr: None,
            groups: Vec::new(),
            router: None,
        }
    }

    /// Open outputs and source, then spawn workers and the ingest task.
    /// A processor that fails to start is left `Failed`.
    #[tracing::instrument(name = "processor.start", skip_all, fields(processor = %self.name))]
    pub async fn start(&mut self) -> RuntimeResult<()> {
        if self.state != ProcessorState::Created {
            return Err(self.transition_error("start"));
        }
        let mut op = op_context!("processor-start").with_auto_log();
        op.record("processor", self.name.as_str());
        op.record("pipeline", self.config.pipeline.to_string().as_str());

        if let Err(e) = self.launch().await {
            self.state = ProcessorState::Failed;
            return Err(e);
        }
        self.state = ProcessorState::Running;
        op.mark_suc();
        Ok(())
    }

    async fn launch(&mut self) -> RuntimeResult<()> {
        let router = Arc::new(
            build_output_router(&self.name, &self.config, &self.catalog)
                .await
                .position(format!("processor {}", self.name))?,
        );
        let retry = RetryPolicy::from_config(&self.config.retry);
        let source = open_source(&self.config.pipeline.source, retry)
            .await
            .position(format!("processor {}", self.name))?;
        self.listen_addr = source.local_addr();
        let source_name = source.name().to_string();

        let failure = FailureSignal {
            fatal: self.fatal.clone(),
            cancel: self.cancel.clone(),
        };

        // Start order: workers → ingest
        let (senders, worker_group) =
            spawn_workers(&self.config, &router, &self.stats, &failure);
        let workers = worker_group.len();
        self.groups.push(worker_group);

        self.groups.push(spawn_ingest(
            &self.config,
            source,
            senders,
            Arc::clone(&router),
            &self.stats,
            &self.watermark,
            &failure,
        ));
        self.router = Some(router);

        rill_info!(
            sys,
            processor = %self.name,
            source = %source_name,
            workers,
            "processor running"
        );
        Ok(())
    }

    /// Request a graceful stop: the source is cancelled and what it already
    /// produced is drained. Use [`wait`](Self::wait) to observe completion.
    pub fn stop(&self) {
        if self.state == ProcessorState::Running && !self.cancel.is_cancelled() {
            rill_info!(sys, processor = %self.name, "stopping processor");
        }
        self.cancel.cancel();
    }

    /// Wait until every task has finished, then stop the sinks.
    ///
    /// Returns the first task failure. Finite sources end on their own, so
    /// `wait` without `stop` runs the processor to completion.
    pub async fn wait(&mut self) -> RuntimeResult<()> {
        match self.state {
            ProcessorState::Running => {}
            ProcessorState::Stopped | ProcessorState::Failed => return Ok(()),
            ProcessorState::Created | ProcessorState::Dropped => {
                return Err(self.transition_error("wait"));
            }
        }

        let mut first = None;
        while let Some(group) = self.groups.pop() {
            let name = group.name;
            rill_debug!(sys, task_group = name, "waiting for task group to finish");
            match group.wait().await {
                Ok(()) => rill_debug!(sys, task_group = name, "task group finished"),
                Err(e) => {
                    first.get_or_insert(e);
                }
            }
        }

        if let Some(router) = self.router.take()
            && let Err(e) = router.stop().await
        {
            rill_error!(res, processor = %self.name, error = %e, "failed to stop sinks");
            first.get_or_insert(StructError::from(RuntimeReason::Shutdown).with_detail(e.to_string()));
        }

        let stats = self.stats.snapshot();
        match first {
            Some(e) => {
                self.state = ProcessorState::Failed;
                rill_error!(sys, processor = %self.name, error = %e, ?stats, "processor failed");
                Err(e)
            }
            None if self.fatal.is_cancelled() => {
                self.state = ProcessorState::Failed;
                Err(StructError::from(RuntimeReason::Fatal)
                    .with_detail(format!("processor {} failed", self.name)))
            }
            None => {
                self.state = ProcessorState::Stopped;
                rill_info!(sys, processor = %self.name, ?stats, "processor stopped");
                Ok(())
            }
        }
    }

    /// Stop if running, wait for completion and release all state.
    pub async fn drop(mut self) -> RuntimeResult<()> {
        let result = if self.state == ProcessorState::Running {
            self.stop();
            self.wait().await
        } else {
            Ok(())
        };
        self.groups.clear();
        self.router = None;
        self.state = ProcessorState::Dropped;
        rill_debug!(sys, processor = %self.name, "processor dropped");
        result
    }

    fn transition_error(&self, op: &str) -> RuntimeError {
        StructError::from(RuntimeReason::Lifecycle).with_detail(format!(
            "cannot {op} processor {} in state {:?}",
            self.name, self.state
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Catalog holding this processor's `memory` outputs.
    pub fn catalog(&self) -> &SinkCatalog {
        &self.catalog
    }

    /// Bound address of a `tcp` source, once started.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Current watermark in epoch milliseconds.
    pub fn watermark(&self) -> i64 {
        self.watermark.get()
    }

    /// Returns a clone of the stop token (for signal integration).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
