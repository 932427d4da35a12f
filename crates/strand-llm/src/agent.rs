use std::sync::Arc;

use futures::future::BoxFuture;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use strand_core::config::ModelConfig;
use strand_core::error::{Result, StrandError};
use strand_core::traits::{Agent, LlmClient, ProgressSink};
use strand_core::types::*;

/// Accumulator for streaming tool call deltas.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    input_json: String,
}

/// An [`Agent`] backed by a streaming [`LlmClient`].
///
/// Each call is a single model turn: instructions and history go in, one
/// assistant message comes out. Every stream read is raced against the
/// cancellation token.
pub struct LlmAgent {
    name: String,
    client: Arc<dyn LlmClient>,
    config: ModelConfig,
    instructions: Option<String>,
}

impl LlmAgent {
    pub fn new(
        name: impl Into<String>,
        client: impl Into<Arc<dyn LlmClient>>,
        config: ModelConfig,
    ) -> Self {
        Self {
            name: name.into(),
            client: client.into(),
            config,
            instructions: None,
        }
    }

    /// Default instructions, used when a request carries none.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn model(&self) -> &ModelConfig {
        &self.config
    }

    fn build_messages(&self, request: &AgentRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);

        let mut system = request
            .instructions
            .clone()
            .or_else(|| self.instructions.clone())
            .unwrap_or_default();
        if let Some(ref schema) = request.output_schema {
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str(&format!(
                "Respond with a single JSON value matching this schema and nothing else:\n{}",
                schema
            ));
        }
        if !system.is_empty() {
            messages.push(ChatMessage::system(system));
        }

        messages.extend(request.messages.iter().cloned());
        messages
    }

    async fn drive(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
        progress: Option<ProgressSink>,
    ) -> Result<AgentResponse> {
        let emit = |event: AgentEvent| {
            if let Some(ref sink) = progress {
                sink(event);
            }
        };

        let mut config = self.config.clone();
        if let Some(ref model) = request.model {
            config.model_id = model.clone();
        }
        let messages = self.build_messages(&request);

        debug!(agent = %self.name, model = %config.model_id, messages = messages.len(), "Invoking agent");

        let stream_result = tokio::select! {
            result = self.client.chat_stream(&config, messages) => result,
            _ = cancel.cancelled() => return Err(StrandError::Cancelled { node: None }),
        };
        let mut stream = stream_result?;

        let mut text_content = String::new();
        let mut thinking_content = String::new();
        let mut tool_calls: Vec<ToolCallAccumulator> = Vec::new();
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;

        loop {
            let delta = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StrandError::Cancelled { node: None }),
                delta = stream.next() => delta,
            };
            let Some(delta) = delta else { break };

            match delta? {
                StreamDelta::TextDelta(text) => {
                    emit(AgentEvent::TextDelta { text: text.clone() });
                    text_content.push_str(&text);
                }
                StreamDelta::ThinkingDelta(text) => {
                    emit(AgentEvent::ThinkingDelta { text: text.clone() });
                    thinking_content.push_str(&text);
                }
                StreamDelta::ToolUseStart { index, id, name } => {
                    while tool_calls.len() <= index {
                        tool_calls.push(ToolCallAccumulator::default());
                    }
                    emit(AgentEvent::ToolStart { name: name.clone() });
                    tool_calls[index].id = id;
                    tool_calls[index].name = name;
                }
                StreamDelta::ToolInputDelta { index, delta } => {
                    if let Some(tc) = tool_calls.get_mut(index) {
                        tc.input_json.push_str(&delta);
                    }
                }
                StreamDelta::Usage {
                    input_tokens: i,
                    output_tokens: o,
                } => {
                    input_tokens += i;
                    output_tokens += o;
                    emit(AgentEvent::Usage {
                        input_tokens,
                        output_tokens,
                    });
                }
                StreamDelta::Stop(StopReason::MaxTokens) => {
                    warn!(agent = %self.name, "LLM hit max tokens");
                }
                StreamDelta::Stop(_) | StreamDelta::MessageId(_) => {}
            }
        }

        let mut content = Vec::new();
        if !thinking_content.is_empty() {
            content.push(ContentBlock::Thinking {
                thinking: thinking_content,
            });
        }
        if !text_content.is_empty() {
            content.push(ContentBlock::Text { text: text_content });
        }
        for tc in tool_calls {
            let input: serde_json::Value =
                serde_json::from_str(&tc.input_json).unwrap_or(serde_json::Value::Null);
            emit(AgentEvent::ToolEnd {
                name: tc.name.clone(),
                input: input.clone(),
            });
            content.push(ContentBlock::ToolUse {
                id: tc.id,
                name: tc.name,
                input,
            });
        }

        Ok(AgentResponse {
            messages: vec![ChatMessage {
                role: Role::Assistant,
                content,
                timestamp: Some(chrono::Utc::now()),
            }],
            input_tokens,
            output_tokens,
        })
    }
}

impl Agent for LlmAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<AgentResponse>> {
        Box::pin(self.drive(request, cancel, None))
    }

    fn run_streaming(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
        progress: ProgressSink,
    ) -> BoxFuture<'_, Result<AgentResponse>> {
        Box::pin(self.drive(request, cancel, Some(progress)))
    }
}
