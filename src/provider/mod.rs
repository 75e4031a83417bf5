use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ChatResult;
use crate::types::{FunctionSchema, Message, StreamDelta};

/// Everything a model client needs for one completion
#[derive(Debug, Clone)]
pub struct ModelRequest {
    /// System messages first, then retrieved content and history
    pub messages: Vec<Message>,
    pub functions: Vec<FunctionSchema>,
    /// Model, temperature, reply budget and any caller overrides
    pub parameters: serde_json::Value,
}

/// Chat completion backend
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Stream a completion, sending deltas through the channel as they arrive.
    /// Returns the full assistant message, including any function calls.
    async fn stream(
        &self,
        request: &ModelRequest,
        delta_tx: mpsc::UnboundedSender<StreamDelta>,
    ) -> ChatResult<Message>;

    /// Non-streaming completion (default impl collects the stream)
    async fn complete(&self, request: &ModelRequest) -> ChatResult<Message> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = self.stream(request, tx).await?;
        while rx.try_recv().is_ok() {}
        Ok(result)
    }
}

/// Text embedding backend
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Length of every vector this provider returns
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> ChatResult<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> ChatResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}
