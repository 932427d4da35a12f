use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use tracing::debug;

use strand_core::config::ModelConfig;
use strand_core::error::{Result, StrandError};
use strand_core::traits::LlmClient;
use strand_core::types::*;

/// Line that separates responses in a replay file.
pub const REPLAY_SEPARATOR: &str = "---";

/// Offline client that answers with canned responses, in order.
///
/// Used to dry-run graph files without a provider. Responses are streamed
/// word by word so progress events look like a live model.
pub struct ReplayClient {
    responses: Mutex<VecDeque<String>>,
}

impl ReplayClient {
    pub fn new(responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
        }
    }

    /// Parse a replay file: responses separated by lines containing only `---`.
    pub fn parse(content: &str) -> Self {
        let mut responses = Vec::new();
        let mut current = Vec::new();
        for line in content.lines() {
            if line.trim() == REPLAY_SEPARATOR {
                responses.push(current.join("\n").trim().to_string());
                current.clear();
            } else {
                current.push(line);
            }
        }
        let last = current.join("\n").trim().to_string();
        if !last.is_empty() {
            responses.push(last);
        }
        Self::new(responses)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|r| r.len()).unwrap_or(0)
    }
}

/// Split text into word-sized chunks, keeping the whitespace.
fn chunk_words(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if ch.is_whitespace() {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

impl LlmClient for ReplayClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let model = config.model_id.clone();
        Box::pin(async move {
            let next = self
                .responses
                .lock()
                .map_err(|_| StrandError::LlmRequest("replay state poisoned".into()))?
                .pop_front();
            let text = next.ok_or_else(|| {
                StrandError::LlmRequest(format!("replay exhausted for model {}", model))
            })?;
            debug!(model = %model, messages = messages.len(), "Replaying canned response");

            let mut deltas: Vec<Result<StreamDelta>> = chunk_words(&text)
                .into_iter()
                .map(|c| Ok(StreamDelta::TextDelta(c)))
                .collect();
            deltas.push(Ok(StreamDelta::Stop(StopReason::EndTurn)));
            Ok(Box::pin(stream::iter(deltas)) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}
