use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use sproxy_protocol::chat::CompletionChunk;

use super::{PipelineError, StreamEvent};

/// Typed chunk channel with one terminator; the HTTP layer formats SSE at
/// the boundary. A failed send means the caller went away, which aborts the
/// pipeline (resource guards release on unwind).
pub(crate) struct Emitter {
    tx: mpsc::Sender<StreamEvent>,
    first: bool,
}

impl Emitter {
    pub(crate) fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self { tx, first: true }
    }

    async fn send(&self, event: StreamEvent) -> Result<(), PipelineError> {
        self.tx.send(event).await.map_err(|_| PipelineError::Closed)
    }

    pub(crate) async fn reasoning(
        &mut self,
        text: impl Into<String>,
    ) -> Result<(), PipelineError> {
        let chunk = CompletionChunk::reasoning(text, self.first);
        self.first = false;
        self.send(StreamEvent::Chunk(chunk)).await
    }

    /// Terminal content chunk (`finish_reason: "STOP"`).
    pub(crate) async fn content(&mut self, text: impl Into<String>) -> Result<(), PipelineError> {
        self.first = false;
        self.send(StreamEvent::Chunk(CompletionChunk::content(text))).await
    }

    pub(crate) async fn error(&self, payload: JsonValue) {
        let _ = self.tx.send(StreamEvent::Error(payload)).await;
    }

    pub(crate) async fn done(&self) {
        let _ = self.tx.send(StreamEvent::Done).await;
    }
}
