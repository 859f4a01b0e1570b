use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{DocumentSource, RecordDecoder, SourceEvent, Subscription, forward};

/// Documents listed in the processor file, replayed once in order.
pub struct InlineSource {
    documents: Vec<Value>,
}

impl InlineSource {
    pub fn new(documents: Vec<Value>) -> Self {
        Self { documents }
    }
}

impl DocumentSource for InlineSource {
    fn name(&self) -> &str {
        "inline"
    }

    fn subscribe(self: Box<Self>, tx: mpsc::Sender<SourceEvent>, decoder: RecordDecoder) -> Subscription {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            for doc in self.documents {
                if token.is_cancelled() {
                    return Ok(());
                }
                if !forward(&tx, decoder.decode_value(doc)).await {
                    return Ok(());
                }
            }
            forward(&tx, SourceEvent::End).await;
            Ok(())
        });
        Subscription::new(cancel, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn replays_documents_then_ends() {
        let (tx, mut rx) = mpsc::channel(8);
        let source = Box::new(InlineSource::new(vec![json!({"x": 1}), json!(7)]));
        let sub = source.subscribe(tx, RecordDecoder::new(None));

        assert!(matches!(rx.recv().await, Some(SourceEvent::Document(_))));
        assert!(matches!(rx.recv().await, Some(SourceEvent::Malformed { .. })));
        assert!(matches!(rx.recv().await, Some(SourceEvent::End)));
        assert!(rx.recv().await.is_none());
        sub.join().await.unwrap();
    }
}
