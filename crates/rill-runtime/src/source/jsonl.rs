use std::path::{Path, PathBuf};

use orion_error::prelude::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{DocumentSource, RecordDecoder, SourceEvent, Subscription, forward};
use crate::error::RuntimeResult;

/// A JSON Lines file read once from start to end. Blank lines are skipped.
pub struct JsonlSource {
    name: String,
    path: PathBuf,
    file: tokio::fs::File,
}

impl JsonlSource {
    pub async fn open(path: &Path) -> RuntimeResult<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .owe_sys()
            .position(path.display().to_string())?;
        Ok(Self {
            name: format!("jsonl:{}", path.display()),
            path: path.to_path_buf(),
            file,
        })
    }
}

impl DocumentSource for JsonlSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribe(self: Box<Self>, tx: mpsc::Sender<SourceEvent>, decoder: RecordDecoder) -> Subscription {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let JsonlSource { path, file, .. } = *self;
            read_lines(file, &path, tx, decoder, token).await
        });
        Subscription::new(cancel, handle)
    }
}

#[tracing::instrument(name = "source.jsonl", skip_all, fields(path = %path.display()))]
async fn read_lines(
    file: tokio::fs::File,
    path: &Path,
    tx: mpsc::Sender<SourceEvent>,
    decoder: RecordDecoder,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(file).lines();
    let mut count = 0u64;
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = cancel.cancelled() => return Ok(()),
        };
        match line {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                count += 1;
                if !forward(&tx, decoder.decode_line(&line)).await {
                    return Ok(());
                }
            }
            Ok(None) => break,
            Err(e) => {
                rill_warn!(conn, error = %e, "read error, ending source");
                forward(&tx, SourceEvent::Error(e.to_string())).await;
                break;
            }
        }
    }
    rill_debug!(conn, lines = count, "end of file");
    forward(&tx, SourceEvent::End).await;
    Ok(())
}
