use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::*;

/// LLM client, one implementation per vendor. Responses arrive as streaming deltas.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// Receives agent progress as it happens. Must not block.
pub type ProgressSink = Arc<dyn Fn(AgentEvent) + Send + Sync>;

/// Agent invocation capability consumed by graph nodes.
///
/// Implementations must stop promptly once `cancel` fires and return
/// `StrandError::Cancelled`.
pub trait Agent: Send + Sync + 'static {
    /// Agent name, used in events and registry lookups.
    fn name(&self) -> &str;

    /// Run the request to completion.
    fn run(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<AgentResponse>>;

    /// Run the request, reporting progress through `progress`.
    fn run_streaming(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
        progress: ProgressSink,
    ) -> BoxFuture<'_, Result<AgentResponse>> {
        let _ = progress;
        self.run(request, cancel)
    }
}
