//! Typed agent orchestration graph.
//!
//! A [`Graph`] owns typed nodes ([`Runnable`]) connected by guarded
//! transitions. A run starts at the entry node, feeds each node's output to
//! the first transition that accepts it, and stops when a node signals
//! completion, reaches a dead end, faults, or is cancelled.

pub mod builder;
pub mod context;
pub mod definition;
pub mod edge;
pub mod executor;
pub mod fan_out;
pub mod graph;
pub mod handoff;
pub mod node;
pub mod prompt;
pub mod repair;
pub mod run_log;
pub mod trace;

pub use builder::GraphBuilder;
pub use context::{AgentRegistry, ProcessContext};
pub use definition::{AgentDefinition, GraphDefinition};
pub use edge::{evaluate_condition, Advancer, Edge, EdgeCondition, Guard};
pub use executor::{EventCallback, RunOptions, RunOutcome};
pub use fan_out::FanOut;
pub use graph::{Graph, Node, NodeId};
pub use handoff::HandoffContext;
pub use node::{node_fn, FnNode, Runnable, Value};
pub use prompt::PromptNode;
pub use repair::{heuristic_repair, Parsed, RepairLoop};
pub use run_log::RunLogger;
pub use trace::{RunTrace, TraceStep};
