use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use strand_core::error::{Result, StrandError};
use strand_core::event::EventBus;
use strand_core::traits::{Agent, ProgressSink};
use strand_core::types::{AgentRequest, AgentResponse, GraphEvent, RunId};

use crate::trace::{RunTrace, TraceStep};

/// Owner recorded for agents registered by the host before the run starts.
pub const HOST_OWNER: &str = "host";

struct RegisteredAgent {
    agent: Arc<dyn Agent>,
    owner: String,
}

/// Agents attached during one run, keyed by name.
///
/// Every entry records the node that registered it. Only the owner may
/// replace or remove an entry, until it hands ownership to another node.
#[derive(Default)]
pub struct AgentRegistry {
    entries: HashMap<String, RegisteredAgent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an agent. Returns the replaced agent, if any.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        agent: Arc<dyn Agent>,
        owner: &str,
    ) -> Result<Option<Arc<dyn Agent>>> {
        let key = key.into();
        if let Some(existing) = self.entries.get(&key) {
            if existing.owner != owner {
                return Err(StrandError::AgentOwnership {
                    agent: key,
                    owner: existing.owner.clone(),
                });
            }
        }
        let previous = self.entries.insert(
            key,
            RegisteredAgent {
                agent,
                owner: owner.to_string(),
            },
        );
        Ok(previous.map(|p| p.agent))
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Agent>> {
        self.entries.get(key).map(|e| e.agent.clone())
    }

    pub fn owner(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|e| e.owner.as_str())
    }

    pub fn remove(&mut self, key: &str, requester: &str) -> Result<Arc<dyn Agent>> {
        self.check_owner(key, requester)?;
        self.entries
            .remove(key)
            .map(|e| e.agent)
            .ok_or_else(|| StrandError::AgentNotFound(key.to_string()))
    }

    /// Hand an entry to another owner.
    pub fn transfer(&mut self, key: &str, requester: &str, new_owner: &str) -> Result<()> {
        self.check_owner(key, requester)?;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.owner = new_owner.to_string();
        }
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_owner(&self, key: &str, requester: &str) -> Result<()> {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| StrandError::AgentNotFound(key.to_string()))?;
        if entry.owner != requester {
            return Err(StrandError::AgentOwnership {
                agent: key.to_string(),
                owner: entry.owner.clone(),
            });
        }
        Ok(())
    }
}

/// Per-run carrier handed to every node invocation.
///
/// Cloning is cheap; clones share the registry, cancellation token, event
/// bus, completion flag and trace. [`ProcessContext::child`] derives the
/// context for a nested or fanned-out sub-invocation.
#[derive(Clone)]
pub struct ProcessContext {
    run_id: RunId,
    path: String,
    owner: String,
    agents: Arc<RwLock<AgentRegistry>>,
    cancel: CancellationToken,
    events: Arc<EventBus>,
    completed: Arc<AtomicBool>,
    trace: Option<Arc<Mutex<RunTrace>>>,
    subscriber: Option<mpsc::UnboundedSender<GraphEvent>>,
}

impl ProcessContext {
    pub fn new() -> Self {
        Self::with_run_id(RunId::new())
    }

    pub fn with_run_id(run_id: RunId) -> Self {
        Self {
            run_id,
            path: String::new(),
            owner: HOST_OWNER.to_string(),
            agents: Arc::new(RwLock::new(AgentRegistry::new())),
            cancel: CancellationToken::new(),
            events: Arc::new(EventBus::default()),
            completed: Arc::new(AtomicBool::new(false)),
            trace: None,
            subscriber: None,
        }
    }

    /// Use a caller-owned cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Publish on a caller-owned event bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Record a step trace for this run.
    pub fn with_tracing(mut self) -> Self {
        self.trace = Some(Arc::new(Mutex::new(RunTrace::new(self.run_id.clone()))));
        self
    }

    /// Also deliver every published event to `tx`. Unlike bus receivers,
    /// this channel never drops events.
    pub(crate) fn with_subscriber(mut self, tx: mpsc::UnboundedSender<GraphEvent>) -> Self {
        self.subscriber = Some(tx);
        self
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Path of the node (and sub-invocation) this context belongs to,
    /// e.g. `research/query[1]`. Empty outside any node.
    pub fn node_path(&self) -> &str {
        &self.path
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel the whole run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn publish(&self, event: GraphEvent) {
        if let Some(ref tx) = self.subscriber {
            // The receiver is gone once the subscriber has seen RunFinished.
            let _ = tx.send(event.clone());
        }
        self.events.publish(event);
    }

    pub(crate) fn for_node(&self, node: &str) -> Self {
        let mut ctx = self.clone();
        ctx.path = node.to_string();
        ctx.owner = node.to_string();
        ctx
    }

    /// Context for a sub-invocation labelled `label` under this one.
    pub fn child(&self, label: impl AsRef<str>) -> Self {
        let mut ctx = self.clone();
        ctx.path = if self.path.is_empty() {
            label.as_ref().to_string()
        } else {
            format!("{}/{}", self.path, label.as_ref())
        };
        ctx
    }

    /// Mark the run as successfully completed with the current node's output.
    pub fn complete_successfully(&self) {
        if self.completed.swap(true, Ordering::SeqCst) {
            warn!(node = %self.path, "Completion already signalled for this run");
        } else {
            debug!(node = %self.path, "Completion signalled");
        }
    }

    pub fn completion_signalled(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Register an agent under its own name, owned by the current node.
    pub async fn register_agent(&self, agent: Arc<dyn Agent>) -> Result<()> {
        let key = agent.name().to_string();
        self.register_agent_as(key, agent).await
    }

    pub async fn register_agent_as(&self, key: impl Into<String>, agent: Arc<dyn Agent>) -> Result<()> {
        let key = key.into();
        self.agents.write().await.insert(key.clone(), agent, &self.owner)?;
        debug!(agent = %key, owner = %self.owner, "Agent registered");
        Ok(())
    }

    pub async fn agent(&self, key: &str) -> Result<Arc<dyn Agent>> {
        self.agents
            .read()
            .await
            .get(key)
            .ok_or_else(|| StrandError::AgentNotFound(key.to_string()))
    }

    pub async fn agent_names(&self) -> Vec<String> {
        self.agents.read().await.names()
    }

    pub async fn agent_owner(&self, key: &str) -> Option<String> {
        self.agents.read().await.owner(key).map(str::to_string)
    }

    pub async fn remove_agent(&self, key: &str) -> Result<Arc<dyn Agent>> {
        self.agents.write().await.remove(key, &self.owner)
    }

    /// Hand an agent this node owns to `new_owner` (a node name).
    pub async fn transfer_agent(&self, key: &str, new_owner: &str) -> Result<()> {
        self.agents
            .write()
            .await
            .transfer(key, &self.owner, new_owner)
    }

    /// Sink that publishes agent progress as run events, tagged with this
    /// context's node path.
    pub fn progress_sink(&self, agent: &str) -> ProgressSink {
        let ctx = self.clone();
        let agent = agent.to_string();
        Arc::new(move |event| {
            ctx.publish(GraphEvent::Agent {
                run_id: ctx.run_id.clone(),
                node: ctx.path.clone(),
                agent: agent.clone(),
                event,
            })
        })
    }

    /// Invoke `agent` with this run's cancellation token, streaming its
    /// progress onto the event bus.
    pub async fn invoke_agent(&self, agent: &dyn Agent, request: AgentRequest) -> Result<AgentResponse> {
        if self.is_cancelled() {
            return Err(self.cancelled_error());
        }
        let sink = self.progress_sink(agent.name());
        agent
            .run_streaming(request, self.cancel.clone(), sink)
            .await
            .map_err(|e| match e {
                StrandError::Cancelled { node: None } => self.cancelled_error(),
                other => other,
            })
    }

    /// Look up a registered agent and invoke it.
    pub async fn invoke(&self, key: &str, request: AgentRequest) -> Result<AgentResponse> {
        let agent = self.agent(key).await?;
        self.invoke_agent(agent.as_ref(), request).await
    }

    pub(crate) fn cancelled_error(&self) -> StrandError {
        StrandError::Cancelled {
            node: (!self.path.is_empty()).then(|| self.path.clone()),
        }
    }

    pub fn tracing_enabled(&self) -> bool {
        self.trace.is_some()
    }

    pub(crate) fn record_step(&self, step: TraceStep) {
        if let Some(ref trace) = self.trace {
            if let Ok(mut trace) = trace.lock() {
                trace.push(step);
            }
        }
    }

    pub(crate) fn snapshot_trace(&self) -> Option<RunTrace> {
        self.trace
            .as_ref()
            .and_then(|t| t.lock().ok().map(|t| t.clone()))
    }
}

impl Default for ProcessContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessContext")
            .field("run_id", &self.run_id)
            .field("path", &self.path)
            .field("owner", &self.owner)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("completed", &self.completion_signalled())
            .field("tracing", &self.trace.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::types::AgentEvent;
    use strand_test_utils::ScriptedAgent;

    fn scripted(name: &str) -> Arc<dyn Agent> {
        Arc::new(ScriptedAgent::new(name, vec!["ok"]))
    }

    #[tokio::test]
    async fn later_node_reuses_agent_registered_earlier() {
        let ctx = ProcessContext::new();
        let plan = ctx.for_node("plan");
        plan.register_agent(scripted("writer")).await.unwrap();

        let review = ctx.for_node("review");
        let agent = review.agent("writer").await.unwrap();
        assert_eq!(agent.name(), "writer");
        assert_eq!(review.agent_owner("writer").await.as_deref(), Some("plan"));
    }

    #[tokio::test]
    async fn other_nodes_cannot_replace_or_remove() {
        let ctx = ProcessContext::new();
        ctx.for_node("plan")
            .register_agent(scripted("writer"))
            .await
            .unwrap();

        let review = ctx.for_node("review");
        let err = review.register_agent(scripted("writer")).await.unwrap_err();
        assert!(matches!(err, StrandError::AgentOwnership { owner, .. } if owner == "plan"));
        assert!(review.remove_agent("writer").await.is_err());
    }

    #[tokio::test]
    async fn transfer_hands_over_ownership() {
        let ctx = ProcessContext::new();
        let plan = ctx.for_node("plan");
        plan.register_agent(scripted("writer")).await.unwrap();
        plan.transfer_agent("writer", "review").await.unwrap();

        let review = ctx.for_node("review");
        review.register_agent(scripted("writer")).await.unwrap();
        assert!(review.remove_agent("writer").await.is_ok());
        assert!(matches!(
            review.agent("writer").await.err(),
            Some(StrandError::AgentNotFound(_))
        ));
    }

    #[test]
    fn child_paths_nest() {
        let ctx = ProcessContext::new().for_node("research");
        let child = ctx.child("query[2]");
        assert_eq!(child.node_path(), "research/query[2]");
        assert_eq!(child.child("retry").node_path(), "research/query[2]/retry");
        assert_eq!(ProcessContext::new().child("x").node_path(), "x");
    }

    #[test]
    fn children_share_cancellation_and_completion() {
        let ctx = ProcessContext::new().for_node("a");
        let child = ctx.child("sub");
        child.cancel();
        assert!(ctx.is_cancelled());
        child.complete_successfully();
        assert!(ctx.completion_signalled());
    }

    #[tokio::test]
    async fn invoke_streams_progress_tagged_with_path() {
        let ctx = ProcessContext::new().for_node("research").child("query[0]");
        let mut rx = ctx.events().subscribe();
        let agent = ScriptedAgent::new("researcher", vec!["found it"]);

        let response = ctx.invoke_agent(&agent, AgentRequest::new("look")).await.unwrap();
        assert_eq!(response.text(), "found it");

        match rx.recv().await.unwrap() {
            GraphEvent::Agent { node, agent, event, .. } => {
                assert_eq!(node, "research/query[0]");
                assert_eq!(agent, "researcher");
                assert!(matches!(event, AgentEvent::TextDelta { text } if text == "found it"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn invoke_after_cancel_names_the_node() {
        let ctx = ProcessContext::new().for_node("review");
        ctx.cancel();
        let agent = ScriptedAgent::new("critic", vec!["unused"]);
        let err = ctx.invoke_agent(&agent, AgentRequest::new("x")).await.unwrap_err();
        assert!(matches!(err, StrandError::Cancelled { node: Some(n) } if n == "review"));
        assert_eq!(agent.calls().load(Ordering::SeqCst), 0);
    }
}
