use std::net::SocketAddr;

use orion_error::prelude::*;
use rill_core::sink::RetryPolicy;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{DocumentSource, RecordDecoder, SourceEvent, Subscription, forward};
use crate::error::RuntimeResult;

/// Newline-delimited JSON over TCP. Any number of clients may connect; the
/// source runs until cancelled.
pub struct TcpSource {
    name: String,
    listener: TcpListener,
    local_addr: SocketAddr,
    retry: RetryPolicy,
}

impl TcpSource {
    /// Bind `tcp://host:port` (the scheme is optional). Port 0 picks a free
    /// port; see [`DocumentSource::local_addr`].
    pub async fn bind(listen: &str, retry: RetryPolicy) -> RuntimeResult<Self> {
        let addr = listen.strip_prefix("tcp://").unwrap_or(listen);
        let listener = TcpListener::bind(addr)
            .await
            .owe_sys()
            .position(listen.to_string())?;
        let local_addr = listener.local_addr().owe_sys()?;
        Ok(Self {
            name: format!("tcp:{local_addr}"),
            listener,
            local_addr,
            retry,
        })
    }
}

impl DocumentSource for TcpSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    fn subscribe(self: Box<Self>, tx: mpsc::Sender<SourceEvent>, decoder: RecordDecoder) -> Subscription {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { self.accept_loop(tx, decoder, token).await });
        Subscription::new(cancel, handle)
    }
}

impl TcpSource {
    #[tracing::instrument(name = "source.tcp", skip_all, fields(listen = %self.local_addr))]
    async fn accept_loop(
        self,
        tx: mpsc::Sender<SourceEvent>,
        decoder: RecordDecoder,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut failures = 0u32;
        loop {
            tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => {
                        failures = 0;
                        rill_debug!(conn, peer = %peer, "accepted connection");
                        tokio::spawn(handle_connection(
                            stream,
                            peer,
                            tx.clone(),
                            decoder.clone(),
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        let delay = self.retry.backoff(failures);
                        rill_warn!(conn, error = %e, attempt = failures, backoff = ?delay, "accept failed");
                        if !forward(&tx, SourceEvent::Error(e.to_string())).await {
                            break;
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => break,
                        }
                    }
                },
                _ = cancel.cancelled() => break,
            }
        }
        Ok(())
    }
}

#[tracing::instrument(skip_all, fields(peer = %peer))]
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::Sender<SourceEvent>,
    decoder: RecordDecoder,
    cancel: CancellationToken,
) {
    let (reader, _writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if !forward(&tx, decoder.decode_line(&line)).await {
                        rill_warn!(conn, "ingest channel closed, dropping connection");
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    rill_warn!(conn, error = %e, "connection read error");
                    break;
                }
            },
            _ = cancel.cancelled() => break,
        }
    }
    rill_debug!(conn, "connection closed");
}
