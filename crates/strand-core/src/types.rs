use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of one graph run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content block in a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },

    #[serde(rename = "thinking")]
    Thinking { thinking: String },
}

/// A chat message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::text_with_role(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text_with_role(Role::User, text)
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::text_with_role(Role::Assistant, text)
    }

    fn text_with_role(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::Text { text: text.into() }],
            timestamp: Some(Utc::now()),
        }
    }

    /// Extract all text content from this message.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Stop reason from the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

/// A streaming delta from the LLM.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A chunk of text content.
    TextDelta(String),

    /// A chunk of thinking/reasoning content.
    ThinkingDelta(String),

    /// Start of a tool use block.
    ToolUseStart {
        index: usize,
        id: String,
        name: String,
    },

    /// A chunk of tool use input JSON.
    ToolInputDelta { index: usize, delta: String },

    /// The response is complete.
    Stop(StopReason),

    /// Usage information.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },

    /// Message ID from the API.
    MessageId(String),
}

/// One request to an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRequest {
    /// System instructions for this call.
    #[serde(default)]
    pub instructions: Option<String>,
    /// Model identifier; `None` uses the agent's own model.
    #[serde(default)]
    pub model: Option<String>,
    /// Prior conversation, oldest first.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// JSON schema the response is expected to satisfy.
    #[serde(default)]
    pub output_schema: Option<serde_json::Value>,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::user(prompt)],
            ..Default::default()
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }
}

/// Messages an agent produced for one request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentResponse {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl AgentResponse {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::assistant_text(text)],
            ..Default::default()
        }
    }

    /// Text of the last assistant message, empty if there is none.
    pub fn text(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(ChatMessage::text)
            .unwrap_or_default()
    }
}

/// Progress emitted by an agent while it runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Text streaming from the model.
    TextDelta { text: String },
    /// Reasoning streaming from the model.
    ThinkingDelta { text: String },
    /// The model started a tool call.
    ToolStart { name: String },
    /// Tool call input is complete.
    ToolEnd { name: String, input: serde_json::Value },
    /// Token usage update.
    Usage { input_tokens: u64, output_tokens: u64 },
}

/// Lifecycle of one graph run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running,
    CompletedSuccessfully,
    DeadEnded,
    Faulted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompletedSuccessfully | Self::DeadEnded | Self::Faulted
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::CompletedSuccessfully => "completed_successfully",
            Self::DeadEnded => "dead_ended",
            Self::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// Event published on a run's event bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphEvent {
    RunStarted {
        run_id: RunId,
        entry: String,
    },
    NodeStarted {
        run_id: RunId,
        node: String,
    },
    NodeCompleted {
        run_id: RunId,
        node: String,
        elapsed_ms: u64,
    },
    NodeFailed {
        run_id: RunId,
        node: String,
        error: String,
    },
    TransitionTaken {
        run_id: RunId,
        from: String,
        to: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    /// Progress from an agent invoked inside a node; `node` is the full
    /// path, e.g. `research/query[2]` for a fanned-out sub-invocation.
    Agent {
        run_id: RunId,
        node: String,
        agent: String,
        event: AgentEvent,
    },
    RunFinished {
        run_id: RunId,
        state: RunState,
        node: Option<String>,
        invocations: usize,
        elapsed_ms: u64,
    },
}

impl GraphEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::NodeStarted { run_id, .. }
            | Self::NodeCompleted { run_id, .. }
            | Self::NodeFailed { run_id, .. }
            | Self::TransitionTaken { run_id, .. }
            | Self::Agent { run_id, .. }
            | Self::RunFinished { run_id, .. } => run_id,
        }
    }

    /// Short name of the event variant, used as the log entry type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::NodeStarted { .. } => "node_started",
            Self::NodeCompleted { .. } => "node_completed",
            Self::NodeFailed { .. } => "node_failed",
            Self::TransitionTaken { .. } => "transition_taken",
            Self::Agent { .. } => "agent",
            Self::RunFinished { .. } => "run_finished",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_text_uses_last_assistant_message() {
        let response = AgentResponse {
            messages: vec![
                ChatMessage::assistant_text("draft"),
                ChatMessage::user("again"),
                ChatMessage::assistant_text("final"),
            ],
            ..Default::default()
        };
        assert_eq!(response.text(), "final");
        assert_eq!(AgentResponse::default().text(), "");
    }

    #[test]
    fn request_builder() {
        let req = AgentRequest::new("summarize")
            .with_instructions("be brief")
            .with_model("small");
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].text(), "summarize");
        assert_eq!(req.instructions.as_deref(), Some("be brief"));
        assert_eq!(req.model.as_deref(), Some("small"));
    }

    #[test]
    fn terminal_states() {
        assert!(!RunState::NotStarted.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::DeadEnded.is_terminal());
        assert!(RunState::Faulted.is_terminal());
        assert!(RunState::CompletedSuccessfully.is_terminal());
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = GraphEvent::Agent {
            run_id: RunId("r1".into()),
            node: "research/query[0]".into(),
            agent: "researcher".into(),
            event: AgentEvent::TextDelta { text: "hi".into() },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "agent");
        assert_eq!(json["event"]["kind"], "text_delta");
        assert_eq!(event.kind(), "agent");
    }
}
