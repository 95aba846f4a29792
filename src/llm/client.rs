//! The `LlmClient` seam between the orchestrator and the hosted model.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{Completion, GenerationRequest};
use super::LlmError;

/// Capacity of fragment channels handed to streaming consumers.
pub(crate) const FRAGMENT_CHANNEL_CAPACITY: usize = 32;

/// A generative-model backend.
///
/// `generate` returns the buffered completion (text and/or tool calls).
/// `generate_stream` delivers the answer incrementally; the receiver end
/// doubles as the cancellation signal — when the consumer drops it, the
/// producer's next `send` fails and the producer stops consuming upstream
/// tokens.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Completion, LlmError>;

    /// Stream text fragments for a request. The channel closing is the
    /// terminal signal: after the last fragment the receiver yields `None`.
    ///
    /// The default implementation buffers via `generate` and emits the full
    /// text as a single fragment; backends with a streaming API override it.
    async fn generate_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<mpsc::Receiver<Result<String, LlmError>>, LlmError> {
        let completion = self.generate(request).await?;
        let (tx, rx) = mpsc::channel(FRAGMENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let _ = tx.send(Ok(completion.text)).await;
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OneShotLlm;

    #[async_trait]
    impl LlmClient for OneShotLlm {
        async fn generate(&self, _request: &GenerationRequest) -> Result<Completion, LlmError> {
            Ok(Completion {
                text: "full answer".to_string(),
                tool_calls: vec![],
            })
        }
    }

    #[tokio::test]
    async fn default_stream_emits_single_fragment_then_closes() {
        let client = OneShotLlm;
        let mut rx = client
            .generate_stream(&GenerationRequest::default())
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().unwrap(), "full answer");
        assert!(rx.recv().await.is_none());
    }
}
