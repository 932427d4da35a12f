//! Test doubles for the agent and LLM client capabilities.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use strand_core::config::ModelConfig;
use strand_core::error::{Result, StrandError};
use strand_core::traits::{Agent, LlmClient, ProgressSink};
use strand_core::types::*;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Scripted {
    Text(String),
    Fail(String),
    /// A failure worth retrying.
    Unavailable(String),
}

fn next_step(script: &Mutex<VecDeque<Scripted>>) -> Scripted {
    script
        .lock()
        .expect("script lock")
        .pop_front()
        .unwrap_or_else(|| Scripted::Fail("script exhausted".into()))
}

/// `LlmClient` that replays a script and records every request.
pub struct ScriptedClient {
    script: Mutex<VecDeque<Scripted>>,
    recorded: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
    models: Arc<Mutex<Vec<String>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedClient {
    pub fn new(responses: Vec<&str>) -> Self {
        Self::from_steps(
            responses
                .into_iter()
                .map(|r| Scripted::Text(r.to_string()))
                .collect(),
        )
    }

    pub fn from_steps(steps: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            recorded: Arc::new(Mutex::new(Vec::new())),
            models: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Messages of every request, in call order.
    pub fn recorded(&self) -> Arc<Mutex<Vec<Vec<ChatMessage>>>> {
        self.recorded.clone()
    }

    /// Model id of every request, in call order.
    pub fn models(&self) -> Arc<Mutex<Vec<String>>> {
        self.models.clone()
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl LlmClient for ScriptedClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.recorded.lock().expect("recorded lock").push(messages);
        self.models
            .lock()
            .expect("models lock")
            .push(config.model_id.clone());
        let step = next_step(&self.script);

        Box::pin(async move {
            match step {
                Scripted::Fail(msg) => Err(StrandError::LlmRequest(msg)),
                Scripted::Unavailable(msg) => Err(StrandError::LlmUnavailable(msg)),
                Scripted::Text(text) => {
                    let mut deltas: Vec<Result<StreamDelta>> = text
                        .split_inclusive(' ')
                        .map(|w| Ok(StreamDelta::TextDelta(w.to_string())))
                        .collect();
                    deltas.push(Ok(StreamDelta::Usage {
                        input_tokens: 10,
                        output_tokens: 5,
                    }));
                    deltas.push(Ok(StreamDelta::Stop(StopReason::EndTurn)));
                    Ok(Box::pin(stream::iter(deltas)) as BoxStream<'_, Result<StreamDelta>>)
                }
            }
        })
    }
}

/// `Agent` that replays a script, counting invocations and keeping requests.
pub struct ScriptedAgent {
    name: String,
    script: Mutex<VecDeque<Scripted>>,
    requests: Arc<Mutex<Vec<AgentRequest>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedAgent {
    pub fn new(name: &str, responses: Vec<&str>) -> Self {
        Self::from_steps(
            name,
            responses
                .into_iter()
                .map(|r| Scripted::Text(r.to_string()))
                .collect(),
        )
    }

    pub fn from_steps(name: &str, steps: Vec<Scripted>) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(steps.into()),
            requests: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Agent that answers every call with the same text.
    pub fn repeating(name: &str, response: &str, times: usize) -> Self {
        Self::new(name, vec![response; times])
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    pub fn requests(&self) -> Arc<Mutex<Vec<AgentRequest>>> {
        self.requests.clone()
    }
}

impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<AgentResponse>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(StrandError::Cancelled { node: None });
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().expect("requests lock").push(request);
            match next_step(&self.script) {
                Scripted::Text(text) => Ok(AgentResponse::from_text(text)),
                Scripted::Fail(message) | Scripted::Unavailable(message) => Err(StrandError::Agent {
                    agent: self.name.clone(),
                    message,
                }),
            }
        })
    }

    fn run_streaming(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
        progress: ProgressSink,
    ) -> BoxFuture<'_, Result<AgentResponse>> {
        Box::pin(async move {
            let response = self.run(request, cancel).await?;
            progress(AgentEvent::TextDelta {
                text: response.text(),
            });
            Ok(response)
        })
    }
}

/// `Agent` that never answers; it returns only once cancelled.
pub struct PendingAgent {
    started: Arc<Notify>,
}

impl PendingAgent {
    pub fn new() -> Self {
        Self {
            started: Arc::new(Notify::new()),
        }
    }

    /// Notified when an invocation begins waiting.
    pub fn started(&self) -> Arc<Notify> {
        self.started.clone()
    }
}

impl Default for PendingAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent for PendingAgent {
    fn name(&self) -> &str {
        "pending"
    }

    fn run(
        &self,
        _request: AgentRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<AgentResponse>> {
        Box::pin(async move {
            self.started.notify_one();
            cancel.cancelled().await;
            Err(StrandError::Cancelled { node: None })
        })
    }
}

/// `Agent` that echoes its prompt after a delay, tracking how many calls
/// are in flight at once.
pub struct ConcurrencyProbe {
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn max_in_flight(&self) -> Arc<AtomicUsize> {
        self.max_in_flight.clone()
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl Agent for ConcurrencyProbe {
    fn name(&self) -> &str {
        "probe"
    }

    fn run(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<AgentResponse>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let result = tokio::select! {
                _ = tokio::time::sleep(self.delay) => {
                    let prompt = request.messages.last().map(ChatMessage::text).unwrap_or_default();
                    Ok(AgentResponse::from_text(format!("echo: {}", prompt)))
                }
                _ = cancel.cancelled() => Err(StrandError::Cancelled { node: None }),
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }
}
