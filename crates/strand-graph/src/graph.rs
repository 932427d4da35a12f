use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use strand_core::error::{GraphAssemblyError, Result};

use crate::edge::{Advancer, Guard};
use crate::node::{Erased, ErasedRunnable, Runnable};

/// Index of a node within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A named runnable plus its outgoing transitions and stop flags.
pub struct Node {
    name: String,
    pub(crate) runnable: Box<dyn ErasedRunnable>,
    input_type: TypeId,
    input_name: &'static str,
    output_type: TypeId,
    output_name: &'static str,
    pub(crate) transitions: Vec<Advancer>,
    dead_end: bool,
    allow_dead_end: bool,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_type_name(&self) -> &'static str {
        self.input_name
    }

    pub fn output_type_name(&self) -> &'static str {
        self.output_name
    }

    pub(crate) fn input_type(&self) -> TypeId {
        self.input_type
    }

    pub fn transitions(&self) -> &[Advancer] {
        &self.transitions
    }

    /// The run stops here with `DeadEnded`, without evaluating transitions.
    ///
    /// Marking a node `dead_end` also makes stopping there a permitted
    /// outcome; it does not need [`Node::allows_dead_end`] as well.
    pub fn is_dead_end(&self) -> bool {
        self.dead_end
    }

    /// Stopping here because no transition accepts is a `DeadEnded` run
    /// rather than a fault.
    pub fn allows_dead_end(&self) -> bool {
        self.allow_dead_end
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("input", &self.input_name)
            .field("output", &self.output_name)
            .field("transitions", &self.transitions)
            .field("dead_end", &self.dead_end)
            .field("allow_dead_end", &self.allow_dead_end)
            .finish()
    }
}

/// Directed graph of typed nodes.
///
/// Nodes live in an arena addressed by [`NodeId`]; transitions are stored on
/// their source node in declaration order. Cycles are allowed. Transition
/// types are checked when the transition is declared, so a graph that
/// assembled successfully never hands a node an input of the wrong type.
#[derive(Default)]
pub struct Graph {
    nodes: Vec<Node>,
    names: HashMap<String, NodeId>,
    entry: Option<NodeId>,
    result: Option<NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node<R: Runnable>(&mut self, name: impl Into<String>, runnable: R) -> Result<NodeId> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(GraphAssemblyError::DuplicateNode(name).into());
        }
        let id = NodeId(self.nodes.len());
        debug!(node = %name, id = id.0, "Node added");
        self.names.insert(name.clone(), id);
        self.nodes.push(Node {
            name,
            runnable: Box::new(Erased(runnable)),
            input_type: TypeId::of::<R::Input>(),
            input_name: type_name::<R::Input>(),
            output_type: TypeId::of::<R::Output>(),
            output_name: type_name::<R::Output>(),
            transitions: Vec::new(),
            dead_end: false,
            allow_dead_end: false,
        });
        Ok(id)
    }

    /// Unconditional transition.
    pub fn add_transition(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        self.add_advancer(from, to, None, None)
    }

    /// Transition taken only when `guard` accepts the output of `from`.
    pub fn add_guarded_transition<O, F>(&mut self, from: NodeId, to: NodeId, guard: F) -> Result<()>
    where
        O: 'static,
        F: Fn(&O) -> bool + Send + Sync + 'static,
    {
        self.add_advancer(from, to, Some(Guard::new(guard)), None)
    }

    /// Append a transition to `from`, checking that the output of `from`
    /// is what both `to` and the guard expect.
    pub fn add_advancer(
        &mut self,
        from: NodeId,
        to: NodeId,
        guard: Option<Guard>,
        label: Option<String>,
    ) -> Result<()> {
        let source = self.checked(from)?;
        let target = self
            .nodes
            .get(to.0)
            .ok_or_else(|| GraphAssemblyError::DanglingTarget {
                from: source.name.clone(),
                to: to.to_string(),
            })?;

        if source.output_type != target.input_type {
            return Err(GraphAssemblyError::TypeMismatch {
                from: source.name.clone(),
                to: target.name.clone(),
                output: source.output_name,
                input: target.input_name,
            }
            .into());
        }
        if let Some(ref guard) = guard {
            if guard.type_id() != source.output_type {
                return Err(GraphAssemblyError::GuardTypeMismatch {
                    from: source.name.clone(),
                    to: target.name.clone(),
                    guard: guard.type_name(),
                    output: source.output_name,
                }
                .into());
            }
        }

        debug!(
            from = %source.name,
            to = %target.name,
            guarded = guard.is_some(),
            "Transition added"
        );
        self.nodes[from.0]
            .transitions
            .push(Advancer::new(to, guard, label));
        Ok(())
    }

    pub fn set_entry(&mut self, id: NodeId) -> Result<()> {
        self.checked(id)?;
        self.entry = Some(id);
        Ok(())
    }

    /// Designate the node whose output is the run's result. Reaching it
    /// without a completion signal stops the run as unexpected.
    pub fn set_result(&mut self, id: NodeId) -> Result<()> {
        self.checked(id)?;
        self.result = Some(id);
        Ok(())
    }

    pub fn mark_dead_end(&mut self, id: NodeId) -> Result<()> {
        self.checked_mut(id)?.dead_end = true;
        Ok(())
    }

    pub fn allow_dead_end(&mut self, id: NodeId) -> Result<()> {
        self.checked_mut(id)?.allow_dead_end = true;
        Ok(())
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn entry(&self) -> Option<NodeId> {
        self.entry
    }

    pub fn result(&self) -> Option<NodeId> {
        self.result
    }

    /// Check that the graph can be run.
    pub fn validate(&self) -> Result<()> {
        self.entry.ok_or(GraphAssemblyError::MissingEntry)?;
        Ok(())
    }

    /// Adjacency listing, one line per transition.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for (id, node) in self.nodes() {
            let mut flags = Vec::new();
            if Some(id) == self.entry {
                flags.push("entry");
            }
            if Some(id) == self.result {
                flags.push("result");
            }
            if node.dead_end {
                flags.push("dead_end");
            }
            if node.allow_dead_end {
                flags.push("allow_dead_end");
            }
            out.push_str(&format!(
                "{} ({} -> {})",
                node.name, node.input_name, node.output_name
            ));
            if !flags.is_empty() {
                out.push_str(&format!(" [{}]", flags.join(", ")));
            }
            out.push('\n');
            for t in &node.transitions {
                let target = &self.nodes[t.target().0].name;
                match (t.label(), t.is_guarded()) {
                    (Some(label), _) => out.push_str(&format!("  -> {} when {}\n", target, label)),
                    (None, true) => out.push_str(&format!("  -> {} (guarded)\n", target)),
                    (None, false) => out.push_str(&format!("  -> {}\n", target)),
                }
            }
        }
        out
    }

    fn checked(&self, id: NodeId) -> Result<&Node> {
        Ok(self
            .nodes
            .get(id.0)
            .ok_or_else(|| GraphAssemblyError::UnknownNode(id.to_string()))?)
    }

    fn checked_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        Ok(self
            .nodes
            .get_mut(id.0)
            .ok_or_else(|| GraphAssemblyError::UnknownNode(id.to_string()))?)
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.nodes)
            .field("entry", &self.entry)
            .field("result", &self.result)
            .finish()
    }
}
