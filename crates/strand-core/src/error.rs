use thiserror::Error;

/// Failures detected while assembling a graph, before any run starts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphAssemblyError {
    #[error("Graph has no entry node")]
    MissingEntry,

    #[error("Transition {from} -> {to} targets a node that was never added")]
    DanglingTarget { from: String, to: String },

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("Transition {from} -> {to}: {from} outputs {output} but {to} expects {input}")]
    TypeMismatch {
        from: String,
        to: String,
        output: &'static str,
        input: &'static str,
    },

    #[error("Guard on {from} -> {to} takes {guard} but {from} outputs {output}")]
    GuardTypeMismatch {
        from: String,
        to: String,
        guard: &'static str,
        output: &'static str,
    },

    #[error("Entry node {node} expects {expected}, run was started with {found}")]
    InputTypeMismatch {
        node: String,
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum StrandError {
    // Graph errors
    #[error("Graph assembly failed: {0}")]
    GraphAssembly(#[from] GraphAssemblyError),

    #[error("Run stopped unexpectedly at {node} (no accepting transition), output: {output}")]
    UnexpectedStop { node: String, output: String },

    #[error("Node {node} failed: {source}")]
    NodeInvocation {
        node: String,
        #[source]
        source: Box<StrandError>,
    },

    #[error("Run cancelled{}", .node.as_deref().map(|n| format!(" at {n}")).unwrap_or_default())]
    Cancelled { node: Option<String> },

    #[error("Run did not produce a {expected} output")]
    OutputType { expected: &'static str },

    // Structured output errors
    #[error("Could not parse {type_name} after {attempts} attempts")]
    StructuredOutputParse {
        type_name: &'static str,
        attempts: u32,
        last_response: String,
    },

    // Agent errors
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent {agent} is owned by node {owner}")]
    AgentOwnership { agent: String, owner: String },

    #[error("Agent {agent} failed: {message}")]
    Agent { agent: String, message: String },

    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    /// The provider could not serve the request right now (rate limited,
    /// overloaded or timed out). Another attempt may succeed.
    #[error("LLM provider unavailable: {0}")]
    LlmUnavailable(String),

    #[error("LLM provider not supported: {0}")]
    UnsupportedProvider(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Errors raised by host-provided node code
    #[error(transparent)]
    External(Box<dyn std::error::Error + Send + Sync>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StrandError {
    /// Wrap an arbitrary error raised inside a node.
    pub fn external(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::External(err.into())
    }

    /// True for cancellation, including cancellation wrapped by a failing node.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled { .. } => true,
            Self::NodeInvocation { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Failures another attempt might not hit, such as an unavailable
    /// provider or a dropped connection.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::LlmUnavailable(_) | Self::LlmStream(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Name of the node the error is attributed to, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::UnexpectedStop { node, .. } | Self::NodeInvocation { node, .. } => Some(node),
            Self::Cancelled { node } => node.as_deref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, StrandError>;
