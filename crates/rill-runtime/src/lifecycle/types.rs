use std::future::Future;

use orion_error::prelude::*;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{RuntimeError, RuntimeReason, RuntimeResult};

// ---------------------------------------------------------------------------
// TaskGroup: named collection of async tasks for ordered shutdown
// ---------------------------------------------------------------------------

/// A named group of async tasks that are shut down together.
///
/// Groups are assembled in *start order* and joined in *reverse order*
/// (LIFO) during shutdown:
///
///   start:  workers → ingest
///   join:   ingest → workers
///
/// Ingest is the only producer for the workers, so once it has returned
/// every worker channel is closed and workers can drain and flush.
pub(crate) struct TaskGroup {
    pub(super) name: &'static str,
    handles: Vec<JoinHandle<anyhow::Result<()>>>,
}

impl TaskGroup {
    pub(super) fn new(name: &'static str) -> Self {
        Self {
            name,
            handles: Vec::new(),
        }
    }

    /// Spawn `task` into this group. A task that fails trips `failure` so
    /// the rest of the processor winds down.
    pub(super) fn spawn<F>(&mut self, failure: &FailureSignal, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let failure = failure.clone();
        let group = self.name;
        self.handles.push(tokio::spawn(async move {
            let result = task.await;
            if let Err(e) = &result {
                rill_error!(sys, task_group = group, error = %e, "task failed");
                failure.trip();
            }
            result
        }));
    }

    pub(super) fn len(&self) -> usize {
        self.handles.len()
    }

    /// Join every task in this group and return the first error.
    pub(super) async fn wait(self) -> RuntimeResult<()> {
        let mut first: Option<RuntimeError> = None;
        for handle in self.handles {
            let result = handle
                .await
                .map_err(|e| {
                    StructError::from(RuntimeReason::Shutdown)
                        .with_detail(format!("task join error: {e}"))
                })
                .and_then(|r| r.owe(RuntimeReason::Fatal));
            if let Err(e) = result
                && first.is_none()
            {
                first = Some(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// FailureSignal
// ---------------------------------------------------------------------------

/// The pair of tokens a failing task cancels: `fatal` marks the processor
/// as failed, `cancel` stops ingestion.
#[derive(Debug, Clone)]
pub(crate) struct FailureSignal {
    pub fatal: CancellationToken,
    pub cancel: CancellationToken,
}

impl FailureSignal {
    pub(super) fn trip(&self) {
        self.fatal.cancel();
        self.cancel.cancel();
    }
}
