mod inline;
mod jsonl;
mod tcp;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rill_config::{SourceKind, SourceSpec};
use rill_core::document::now_millis;
use rill_core::sink::RetryPolicy;
use rill_core::{Document, MalformedRecord};
use rill_lang::FieldPath;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::RuntimeResult;

pub use inline::InlineSource;
pub use jsonl::JsonlSource;
pub use tcp::TcpSource;

// ---------------------------------------------------------------------------
// SourceEvent
// ---------------------------------------------------------------------------

/// What a source pushes into the ingest channel.
#[derive(Debug)]
pub enum SourceEvent {
    Document(Document),
    /// A record that could not become a document. `raw` is the record as
    /// received (a JSON string for undecodable text).
    Malformed { raw: Value, error: MalformedRecord },
    /// A watermark announced by the source itself, epoch milliseconds.
    Watermark(i64),
    /// A transient error the source is recovering from.
    Error(String),
    /// A finite source is exhausted.
    End,
}

// ---------------------------------------------------------------------------
// RecordDecoder
// ---------------------------------------------------------------------------

/// Turns raw records into [`SourceEvent`]s: extracts event time and stamps
/// ingestion time plus a processor-wide arrival sequence number.
#[derive(Debug, Clone)]
pub struct RecordDecoder {
    time_field: Option<FieldPath>,
    seq: Arc<AtomicU64>,
}

impl RecordDecoder {
    pub fn new(time_field: Option<FieldPath>) -> Self {
        Self {
            time_field,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn decode_value(&self, value: Value) -> SourceEvent {
        let raw = value.clone();
        match Document::from_value(value, self.time_field.as_ref(), now_millis(), self.next_seq()) {
            Ok(doc) => SourceEvent::Document(doc),
            Err(error) => SourceEvent::Malformed { raw, error },
        }
    }

    pub fn decode_line(&self, line: &str) -> SourceEvent {
        match serde_json::from_str::<Value>(line) {
            Ok(value) => self.decode_value(value),
            Err(e) => SourceEvent::Malformed {
                raw: Value::String(line.to_string()),
                error: MalformedRecord::Json(e.to_string()),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// DocumentSource / Subscription
// ---------------------------------------------------------------------------

/// A document source connector.
///
/// `subscribe` starts producing into `tx` and hands back a [`Subscription`].
/// The channel is bounded; a full channel suspends the source.
pub trait DocumentSource: Send {
    fn name(&self) -> &str;

    /// Bound address for network sources.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn subscribe(self: Box<Self>, tx: mpsc::Sender<SourceEvent>, decoder: RecordDecoder) -> Subscription;
}

/// Handle to a running source task.
pub struct Subscription {
    cancel: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl Subscription {
    pub fn new(cancel: CancellationToken, handle: JoinHandle<anyhow::Result<()>>) -> Self {
        Self { cancel, handle }
    }

    /// Ask the source to stop producing. Events already sent stay queued.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the source task to finish.
    pub async fn join(self) -> anyhow::Result<()> {
        self.handle
            .await
            .map_err(|e| anyhow::anyhow!("source task join error: {e}"))?
    }
}

/// Open the source a pipeline declares. Files are opened and sockets bound
/// here, so configuration mistakes surface before the processor runs.
pub async fn open_source(spec: &SourceSpec, retry: RetryPolicy) -> RuntimeResult<Box<dyn DocumentSource>> {
    Ok(match &spec.kind {
        SourceKind::Inline { documents } => Box::new(InlineSource::new(documents.clone())),
        SourceKind::Jsonl { path } => Box::new(JsonlSource::open(path).await?),
        SourceKind::Tcp { addr } => Box::new(TcpSource::bind(addr, retry).await?),
    })
}

/// Send one event; `false` once the receiver is gone.
pub(crate) async fn forward(tx: &mpsc::Sender<SourceEvent>, event: SourceEvent) -> bool {
    tx.send(event).await.is_ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
