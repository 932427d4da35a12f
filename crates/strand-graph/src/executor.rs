use std::any::{type_name, TypeId};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strand_core::config::GraphConfig;
use strand_core::error::{GraphAssemblyError, Result, StrandError};
use strand_core::event::EventBus;
use strand_core::traits::Agent;
use strand_core::types::{GraphEvent, RunId, RunState};

use crate::context::ProcessContext;
use crate::graph::{Graph, Node, NodeId};
use crate::node::Value;
use crate::trace::{RunTrace, TraceStep};

/// Callback receiving every event of a run, in publication order.
pub type EventCallback = Arc<dyn Fn(&GraphEvent) + Send + Sync>;

/// Per-run settings for [`Graph::run`].
#[derive(Clone, Default)]
pub struct RunOptions {
    cancel: Option<CancellationToken>,
    events: Option<Arc<EventBus>>,
    subscriber: Option<EventCallback>,
    trace: bool,
    event_capacity: Option<usize>,
    agents: Vec<(String, Arc<dyn Agent>)>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &GraphConfig) -> Self {
        Self {
            trace: config.trace,
            event_capacity: Some(config.event_capacity),
            ..Self::default()
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Publish on a caller-owned bus instead of a fresh one.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Deliver every event of the run to `callback`. All events have been
    /// delivered by the time [`Graph::run`] returns.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(&GraphEvent) + Send + Sync + 'static,
    {
        self.subscriber = Some(Arc::new(callback));
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Make `agent` available to every node under its own name.
    pub fn with_agent(self, agent: Arc<dyn Agent>) -> Self {
        let key = agent.name().to_string();
        self.with_agent_as(key, agent)
    }

    pub fn with_agent_as(mut self, key: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        self.agents.push((key.into(), agent));
        self
    }
}

/// How a run ended.
///
/// A faulted run is still an outcome: the error, the node it happened at,
/// and whatever output was produced are kept for diagnosis.
pub struct RunOutcome {
    pub run_id: RunId,
    pub state: RunState,
    /// Last node executed.
    pub node: Option<String>,
    /// Output of the last node, for completed, dead-ended and unexpectedly
    /// stopped runs.
    pub output: Option<Value>,
    pub error: Option<StrandError>,
    pub trace: Option<RunTrace>,
    /// Number of node invocations.
    pub invocations: usize,
    pub elapsed_ms: u64,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self.state,
            RunState::CompletedSuccessfully | RunState::DeadEnded
        )
    }

    pub fn output_ref<T: 'static>(&self) -> Option<&T> {
        self.output.as_ref().and_then(|o| o.downcast_ref::<T>())
    }

    /// Take the output, or the error if the run faulted.
    pub fn into_output<T: 'static>(self) -> Result<T> {
        if let Some(error) = self.error {
            return Err(error);
        }
        self.output
            .and_then(|o| o.downcast::<T>().ok())
            .map(|o| *o)
            .ok_or(StrandError::OutputType {
                expected: type_name::<T>(),
            })
    }
}

impl fmt::Debug for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOutcome")
            .field("run_id", &self.run_id)
            .field("state", &self.state)
            .field("node", &self.node)
            .field("has_output", &self.output.is_some())
            .field("error", &self.error)
            .field("invocations", &self.invocations)
            .field("elapsed_ms", &self.elapsed_ms)
            .finish()
    }
}

struct Stop {
    state: RunState,
    node: Option<String>,
    output: Option<Value>,
    error: Option<StrandError>,
}

impl Stop {
    fn fault(node: Option<&str>, error: StrandError) -> Self {
        Self {
            state: RunState::Faulted,
            node: node.map(str::to_string),
            output: None,
            error: Some(error),
        }
    }
}

impl Graph {
    /// Run the graph from its entry node.
    pub async fn run<I: Send + 'static>(&self, input: I, options: RunOptions) -> RunOutcome {
        let capacity = options.event_capacity.unwrap_or(1024);
        let events = options
            .events
            .unwrap_or_else(|| Arc::new(EventBus::new(capacity)));
        let mut ctx = ProcessContext::new()
            .with_cancel(options.cancel.unwrap_or_default())
            .with_events(events);
        if options.trace {
            ctx = ctx.with_tracing();
        }

        let mut registration = Ok(());
        for (key, agent) in options.agents {
            registration = registration.and(ctx.register_agent_as(key, agent).await);
        }

        let Some(callback) = options.subscriber else {
            return match registration {
                Ok(()) => self.execute(ctx, input).await,
                Err(e) => self.finish(&ctx, Instant::now(), 0, Stop::fault(None, e)),
            };
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = ctx.with_subscriber(tx);
        let run_id = ctx.run_id().clone();
        let forward = async move {
            while let Some(event) = rx.recv().await {
                let last = matches!(
                    &event,
                    GraphEvent::RunFinished { run_id: id, .. } if *id == run_id
                );
                callback(&event);
                if last {
                    break;
                }
            }
        };
        let run = async {
            match registration {
                Ok(()) => self.execute(ctx, input).await,
                Err(e) => self.finish(&ctx, Instant::now(), 0, Stop::fault(None, e)),
            }
        };
        let (outcome, ()) = tokio::join!(run, forward);
        outcome
    }

    /// Run the graph with a caller-built context.
    pub async fn execute<I: Send + 'static>(&self, ctx: ProcessContext, input: I) -> RunOutcome {
        let start = Instant::now();
        let entry = match self.entry_for::<I>() {
            Ok(entry) => entry,
            Err(e) => return self.finish(&ctx, start, 0, Stop::fault(None, e)),
        };

        info!(run_id = %ctx.run_id(), entry = %entry.name(), "Run started");
        ctx.publish(GraphEvent::RunStarted {
            run_id: ctx.run_id().clone(),
            entry: entry.name().to_string(),
        });

        let mut node = entry;
        let mut value: Value = Box::new(input);
        let mut invocations = 0;

        loop {
            let name = node.name();
            if ctx.is_cancelled() {
                let error = StrandError::Cancelled {
                    node: Some(name.to_string()),
                };
                return self.finish(&ctx, start, invocations, Stop::fault(Some(name), error));
            }

            let node_ctx = ctx.for_node(name);
            debug!(run_id = %ctx.run_id(), node = %name, "Node started");
            ctx.publish(GraphEvent::NodeStarted {
                run_id: ctx.run_id().clone(),
                node: name.to_string(),
            });
            let started_at = Utc::now();
            let node_start = Instant::now();
            invocations += 1;

            let result = tokio::select! {
                biased;
                _ = ctx.cancel_token().cancelled() => Err(node_ctx.cancelled_error()),
                result = node.runnable.invoke(&node_ctx, value) => result,
            };
            let elapsed_ms = node_start.elapsed().as_millis() as u64;
            let mut step = TraceStep {
                index: 0,
                node: name.to_string(),
                started_at,
                elapsed_ms,
                output: None,
                next: None,
                error: None,
            };

            let output = match result {
                Ok(output) => output,
                Err(e) => {
                    let error = if e.is_cancelled() || ctx.is_cancelled() {
                        node_ctx.cancelled_error()
                    } else {
                        StrandError::NodeInvocation {
                            node: name.to_string(),
                            source: Box::new(e),
                        }
                    };
                    warn!(run_id = %ctx.run_id(), node = %name, error = %error, "Node failed");
                    ctx.publish(GraphEvent::NodeFailed {
                        run_id: ctx.run_id().clone(),
                        node: name.to_string(),
                        error: error.to_string(),
                    });
                    step.error = Some(error.to_string());
                    ctx.record_step(step);
                    return self.finish(&ctx, start, invocations, Stop::fault(Some(name), error));
                }
            };

            debug!(run_id = %ctx.run_id(), node = %name, elapsed_ms, "Node completed");
            ctx.publish(GraphEvent::NodeCompleted {
                run_id: ctx.run_id().clone(),
                node: name.to_string(),
                elapsed_ms,
            });
            if ctx.tracing_enabled() {
                step.output = Some(node.runnable.render(&*output));
            }

            if ctx.is_cancelled() {
                step.error = Some("cancelled".into());
                ctx.record_step(step);
                let error = node_ctx.cancelled_error();
                return self.finish(&ctx, start, invocations, Stop::fault(Some(name), error));
            }

            let stop_state = if ctx.completion_signalled() {
                Some(RunState::CompletedSuccessfully)
            } else if node.is_dead_end() {
                Some(RunState::DeadEnded)
            } else {
                None
            };
            if let Some(state) = stop_state {
                ctx.record_step(step);
                return self.finish(
                    &ctx,
                    start,
                    invocations,
                    Stop {
                        state,
                        node: Some(name.to_string()),
                        output: Some(output),
                        error: None,
                    },
                );
            }

            let Some(advancer) = node.transitions.iter().find(|t| t.accepts(&*output)) else {
                ctx.record_step(step);
                let stop = if node.allows_dead_end() {
                    Stop {
                        state: RunState::DeadEnded,
                        node: Some(name.to_string()),
                        output: Some(output),
                        error: None,
                    }
                } else {
                    let error = StrandError::UnexpectedStop {
                        node: name.to_string(),
                        output: node.runnable.render(&*output),
                    };
                    Stop {
                        state: RunState::Faulted,
                        node: Some(name.to_string()),
                        output: Some(output),
                        error: Some(error),
                    }
                };
                return self.finish(&ctx, start, invocations, stop);
            };

            let Some(next) = self.node(advancer.target()) else {
                let error = GraphAssemblyError::UnknownNode(advancer.target().to_string()).into();
                return self.finish(&ctx, start, invocations, Stop::fault(Some(name), error));
            };
            debug!(
                run_id = %ctx.run_id(),
                from = %name,
                to = %next.name(),
                label = advancer.label().unwrap_or(""),
                "Transition taken"
            );
            ctx.publish(GraphEvent::TransitionTaken {
                run_id: ctx.run_id().clone(),
                from: name.to_string(),
                to: next.name().to_string(),
                label: advancer.label().map(str::to_string),
            });
            step.next = Some(next.name().to_string());
            ctx.record_step(step);

            node = next;
            value = output;
        }
    }

    fn entry_for<I: 'static>(&self) -> Result<&Node> {
        let id: NodeId = self.entry().ok_or(GraphAssemblyError::MissingEntry)?;
        let node = self
            .node(id)
            .ok_or_else(|| GraphAssemblyError::UnknownNode(id.to_string()))?;
        if node.input_type() != TypeId::of::<I>() {
            return Err(GraphAssemblyError::InputTypeMismatch {
                node: node.name().to_string(),
                expected: node.input_type_name(),
                found: type_name::<I>(),
            }
            .into());
        }
        Ok(node)
    }

    fn finish(&self, ctx: &ProcessContext, start: Instant, invocations: usize, stop: Stop) -> RunOutcome {
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match stop.error {
            Some(ref error) => warn!(
                run_id = %ctx.run_id(),
                state = %stop.state,
                node = stop.node.as_deref().unwrap_or(""),
                invocations,
                elapsed_ms,
                error = %error,
                "Run finished"
            ),
            None => info!(
                run_id = %ctx.run_id(),
                state = %stop.state,
                node = stop.node.as_deref().unwrap_or(""),
                invocations,
                elapsed_ms,
                "Run finished"
            ),
        }
        ctx.publish(GraphEvent::RunFinished {
            run_id: ctx.run_id().clone(),
            state: stop.state,
            node: stop.node.clone(),
            invocations,
            elapsed_ms,
        });

        RunOutcome {
            run_id: ctx.run_id().clone(),
            state: stop.state,
            node: stop.node,
            output: stop.output,
            error: stop.error,
            trace: ctx.snapshot_trace(),
            invocations,
            elapsed_ms,
        }
    }
}
