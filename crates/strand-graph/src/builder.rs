use strand_core::error::{GraphAssemblyError, Result, StrandError};

use crate::edge::Guard;
use crate::graph::{Graph, NodeId};
use crate::node::Runnable;

struct PendingTransition {
    from: String,
    to: String,
    guard: Option<Guard>,
    label: Option<String>,
}

/// Name-based graph assembly.
///
/// Nodes and transitions can be declared in any order; names are resolved
/// and types checked in [`GraphBuilder::build`], which reports the first
/// problem found.
///
/// ```ignore
/// let graph = GraphBuilder::new()
///     .node("draft", draft)
///     .node("review", review)
///     .transition("draft", "review")
///     .guarded_transition("review", "draft", |v: &Verdict| !v.ok)
///     .entry("draft")
///     .build()?;
/// ```
#[derive(Default)]
pub struct GraphBuilder {
    graph: Graph,
    error: Option<StrandError>,
    transitions: Vec<PendingTransition>,
    entry: Option<String>,
    result: Option<String>,
    dead_ends: Vec<String>,
    allowed_dead_ends: Vec<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node<R: Runnable>(mut self, name: impl Into<String>, runnable: R) -> Self {
        if let Err(e) = self.graph.add_node(name, runnable) {
            self.error.get_or_insert(e);
        }
        self
    }

    pub fn transition(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.push(from.into(), to.into(), None)
    }

    pub fn guarded_transition<O, F>(
        self,
        from: impl Into<String>,
        to: impl Into<String>,
        guard: F,
    ) -> Self
    where
        O: 'static,
        F: Fn(&O) -> bool + Send + Sync + 'static,
    {
        self.push(from.into(), to.into(), Some(Guard::new(guard)))
    }

    /// Label the most recently declared transition.
    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        if let Some(last) = self.transitions.last_mut() {
            last.label = Some(label.into());
        }
        self
    }

    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    pub fn result(mut self, name: impl Into<String>) -> Self {
        self.result = Some(name.into());
        self
    }

    pub fn dead_end(mut self, name: impl Into<String>) -> Self {
        self.dead_ends.push(name.into());
        self
    }

    pub fn allow_dead_end(mut self, name: impl Into<String>) -> Self {
        self.allowed_dead_ends.push(name.into());
        self
    }

    pub fn build(self) -> Result<Graph> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let mut graph = self.graph;

        let entry = self.entry.ok_or(GraphAssemblyError::MissingEntry)?;
        let entry = resolve(&graph, &entry)?;
        graph.set_entry(entry)?;
        if let Some(ref result) = self.result {
            let result = resolve(&graph, result)?;
            graph.set_result(result)?;
        }

        for t in self.transitions {
            let from = resolve(&graph, &t.from)?;
            let to = graph
                .node_id(&t.to)
                .ok_or_else(|| GraphAssemblyError::DanglingTarget {
                    from: t.from.clone(),
                    to: t.to.clone(),
                })?;
            graph.add_advancer(from, to, t.guard, t.label)?;
        }

        for name in &self.dead_ends {
            let id = resolve(&graph, name)?;
            graph.mark_dead_end(id)?;
        }
        for name in &self.allowed_dead_ends {
            let id = resolve(&graph, name)?;
            graph.allow_dead_end(id)?;
        }

        Ok(graph)
    }

    fn push(mut self, from: String, to: String, guard: Option<Guard>) -> Self {
        self.transitions.push(PendingTransition {
            from,
            to,
            guard,
            label: None,
        });
        self
    }
}

fn resolve(graph: &Graph, name: &str) -> Result<NodeId> {
    Ok(graph
        .node_id(name)
        .ok_or_else(|| GraphAssemblyError::UnknownNode(name.to_string()))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RunOptions;
    use crate::node::{node_fn, FnNode};
    use strand_core::types::RunState;

    fn increment() -> impl Runnable<Input = u32, Output = u32> {
        node_fn(|_ctx, n: u32| async move { Ok(n + 1) })
    }

    fn assembly(result: Result<Graph>) -> GraphAssemblyError {
        match result {
            Err(StrandError::GraphAssembly(e)) => e,
            Err(other) => panic!("expected assembly error, got {:?}", other),
            Ok(_) => panic!("expected assembly error"),
        }
    }

    #[test]
    fn missing_entry() {
        let result = GraphBuilder::new().node("a", increment()).build();
        assert_eq!(assembly(result), GraphAssemblyError::MissingEntry);
    }

    #[test]
    fn dangling_target_names_both_ends() {
        let result = GraphBuilder::new()
            .node("a", increment())
            .transition("a", "ghost")
            .entry("a")
            .build();
        assert_eq!(
            assembly(result),
            GraphAssemblyError::DanglingTarget {
                from: "a".into(),
                to: "ghost".into()
            }
        );
    }

    #[test]
    fn unknown_names() {
        let result = GraphBuilder::new().node("a", increment()).entry("b").build();
        assert_eq!(assembly(result), GraphAssemblyError::UnknownNode("b".into()));

        let result = GraphBuilder::new()
            .node("a", increment())
            .entry("a")
            .dead_end("nope")
            .build();
        assert_eq!(assembly(result), GraphAssemblyError::UnknownNode("nope".into()));
    }

    #[test]
    fn duplicate_node_is_reported() {
        let result = GraphBuilder::new()
            .node("a", increment())
            .node("a", increment())
            .entry("a")
            .build();
        assert_eq!(assembly(result), GraphAssemblyError::DuplicateNode("a".into()));
    }

    #[test]
    fn type_mismatch_is_reported() {
        let to_text: FnNode<String, String, _> = node_fn(|_ctx, s: String| async move { Ok(s) });
        let result = GraphBuilder::new()
            .node("a", increment())
            .node("b", to_text)
            .transition("a", "b")
            .entry("a")
            .build();
        assert!(matches!(
            assembly(result),
            GraphAssemblyError::TypeMismatch { .. }
        ));
    }

    #[test]
    fn transitions_may_precede_nodes() {
        let graph = GraphBuilder::new()
            .transition("a", "b")
            .entry("a")
            .node("a", increment())
            .node("b", increment())
            .dead_end("b")
            .build()
            .unwrap();
        assert_eq!(graph.len(), 2);
        let a = graph.node_id("a").unwrap();
        assert_eq!(graph.node(a).unwrap().transitions().len(), 1);
    }

    #[test]
    fn label_applies_to_last_transition() {
        let graph = GraphBuilder::new()
            .node("a", increment())
            .transition("a", "a")
            .guarded_transition("a", "a", |n: &u32| *n > 5)
            .labeled("big")
            .entry("a")
            .build()
            .unwrap();
        let a = graph.node_id("a").unwrap();
        let labels: Vec<_> = graph
            .node(a)
            .unwrap()
            .transitions()
            .iter()
            .map(|t| t.label())
            .collect();
        assert_eq!(labels, vec![None, Some("big")]);
    }

    #[tokio::test]
    async fn builder_and_direct_assembly_behave_the_same() {
        let built = GraphBuilder::new()
            .node("count", increment())
            .node("done", increment())
            .guarded_transition("count", "count", |n: &u32| *n < 4)
            .transition("count", "done")
            .entry("count")
            .dead_end("done")
            .build()
            .unwrap();

        let mut direct = Graph::new();
        let count = direct.add_node("count", increment()).unwrap();
        let done = direct.add_node("done", increment()).unwrap();
        direct.add_guarded_transition(count, count, |n: &u32| *n < 4).unwrap();
        direct.add_transition(count, done).unwrap();
        direct.set_entry(count).unwrap();
        direct.mark_dead_end(done).unwrap();

        for input in [0u32, 3, 10] {
            let a = built.run(input, RunOptions::new().with_trace(true)).await;
            let b = direct.run(input, RunOptions::new().with_trace(true)).await;
            assert_eq!(a.state, RunState::DeadEnded);
            assert_eq!(a.state, b.state);
            assert_eq!(a.output_ref::<u32>(), b.output_ref::<u32>());
            assert_eq!(a.trace.unwrap().nodes(), b.trace.unwrap().nodes());
        }
    }
}
