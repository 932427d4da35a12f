use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use strand_core::config::{expand_env_vars, FanOutConfig, ModelConfig, RepairConfig};
use strand_core::error::{Result, StrandError};

use crate::builder::GraphBuilder;
use crate::edge::{evaluate_condition, Edge, EdgeCondition};
use crate::graph::Graph;
use crate::handoff::HandoffContext;
use crate::prompt::PromptNode;

/// Model settings for one agent named by the graph's nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentDefinition {
    #[serde(default)]
    pub instructions: Option<String>,
    /// Overrides the application's `[model]` section.
    #[serde(default)]
    pub model: Option<ModelConfig>,
}

/// A graph of prompt nodes declared in TOML.
///
/// ```toml
/// entry = "draft"
///
/// [[nodes]]
/// id = "draft"
/// prompt = "Write a haiku about {topic}."
/// input_keys = ["topic"]
/// output_keys = ["draft"]
///
/// [[edges]]
/// from = "draft"
/// to = "review"
/// condition = { type = "conditional", expr = "draft_visits < 3" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDefinition {
    #[serde(default)]
    pub name: Option<String>,
    pub entry: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub nodes: Vec<PromptNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentDefinition>,
}

impl GraphDefinition {
    /// Load a graph file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StrandError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| StrandError::Config(e.to_string()))
    }

    /// Every agent name some node asks for.
    pub fn agent_names(&self) -> BTreeSet<&str> {
        self.nodes.iter().map(PromptNode::agent_name).collect()
    }

    pub fn builder(&self) -> GraphBuilder {
        self.builder_with(&RepairConfig::default(), &FanOutConfig::default())
    }

    /// Builder whose prompt nodes parse and fan out with the given settings.
    pub fn builder_with(&self, repair: &RepairConfig, fan_out: &FanOutConfig) -> GraphBuilder {
        let mut builder = GraphBuilder::new();
        for node in &self.nodes {
            let prompt = node
                .clone()
                .with_repair(repair.clone())
                .with_fan_out(fan_out.clone());
            builder = builder.node(node.id.clone(), prompt);
            if node.dead_end {
                builder = builder.dead_end(node.id.clone());
            }
            if node.allow_dead_end {
                builder = builder.allow_dead_end(node.id.clone());
            }
        }

        for edge in &self.edges {
            builder = match &edge.condition {
                EdgeCondition::Always => builder.transition(edge.from.clone(), edge.to.clone()),
                EdgeCondition::Conditional { expr } => {
                    let expr = expr.clone();
                    builder.guarded_transition(
                        edge.from.clone(),
                        edge.to.clone(),
                        move |handoff: &HandoffContext| evaluate_condition(&expr, handoff.data()),
                    )
                }
            };
            if let Some(label) = edge.display_label() {
                builder = builder.labeled(label);
            }
        }

        builder = builder.entry(self.entry.clone());
        if let Some(ref result) = self.result {
            builder = builder.result(result.clone());
        }
        builder
    }

    pub fn build(&self) -> Result<Graph> {
        self.builder().build()
    }

    pub fn build_with(&self, repair: &RepairConfig, fan_out: &FanOutConfig) -> Result<Graph> {
        self.builder_with(repair, fan_out).build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use strand_core::error::GraphAssemblyError;
    use strand_core::types::RunState;
    use strand_test_utils::ScriptedAgent;

    use crate::executor::RunOptions;

    const REVIEW_LOOP: &str = r#"
name = "review-loop"
entry = "draft"
result = "publish"

[[nodes]]
id = "draft"
prompt = "Write a draft."
input_keys = ["topic", "feedback"]
output_keys = ["draft"]
agent = "writer"

[[nodes]]
id = "review"
prompt = "Review the draft."
input_keys = ["draft"]
output_keys = ["ok", "feedback"]
agent = "critic"

[[nodes]]
id = "publish"
prompt = "Polish and publish."
input_keys = ["draft"]
agent = "writer"
complete = true

[[edges]]
from = "draft"
to = "review"

[[edges]]
from = "review"
to = "publish"
condition = { type = "conditional", expr = "ok == true" }
label = "approved"

[[edges]]
from = "review"
to = "draft"
condition = { type = "conditional", expr = "draft_visits < 3" }

[agents.critic]
instructions = "Be strict."
"#;

    #[test]
    fn parses_nodes_edges_and_agents() {
        let def = GraphDefinition::from_toml(REVIEW_LOOP).unwrap();
        assert_eq!(def.name.as_deref(), Some("review-loop"));
        assert_eq!(def.nodes.len(), 3);
        assert_eq!(def.edges.len(), 3);
        assert!(def.nodes[2].complete);
        assert_eq!(
            def.agent_names().into_iter().collect::<Vec<_>>(),
            vec!["critic", "writer"]
        );
        assert_eq!(
            def.agents["critic"].instructions.as_deref(),
            Some("Be strict.")
        );
    }

    #[test]
    fn unknown_edge_target_fails_to_build() {
        let toml = r#"
entry = "a"
[[nodes]]
id = "a"
[[edges]]
from = "a"
to = "b"
"#;
        let err = GraphDefinition::from_toml(toml).unwrap().build().unwrap_err();
        assert!(matches!(
            err,
            StrandError::GraphAssembly(GraphAssemblyError::DanglingTarget { .. })
        ));
    }

    #[test]
    fn missing_entry_field_is_a_config_error() {
        let err = GraphDefinition::from_toml("[[nodes]]\nid = \"a\"\n").unwrap_err();
        assert!(matches!(err, StrandError::Config(_)));
    }

    #[tokio::test]
    async fn review_loop_runs_until_approved() {
        let writer = Arc::new(ScriptedAgent::new(
            "writer",
            vec![
                r#"{"draft": "first draft"}"#,
                r#"{"draft": "second draft"}"#,
                "published",
            ],
        ));
        let critic = Arc::new(ScriptedAgent::new(
            "critic",
            vec![
                r#"{"ok": false, "feedback": "too long"}"#,
                r#"{"ok": true, "feedback": "good"}"#,
            ],
        ));
        let writer_calls = writer.calls();
        let critic_calls = critic.calls();

        let graph = GraphDefinition::from_toml(REVIEW_LOOP).unwrap().build().unwrap();
        let outcome = graph
            .run(
                HandoffContext::from_pairs([("topic", "rivers")]),
                RunOptions::new()
                    .with_agent(writer)
                    .with_agent(critic)
                    .with_trace(true),
            )
            .await;

        assert_eq!(outcome.state, RunState::CompletedSuccessfully);
        assert_eq!(
            outcome.trace.as_ref().unwrap().nodes(),
            vec!["draft", "review", "draft", "review", "publish"]
        );
        assert_eq!(writer_calls.load(Ordering::SeqCst), 3);
        assert_eq!(critic_calls.load(Ordering::SeqCst), 2);

        let handoff = outcome.into_output::<HandoffContext>().unwrap();
        assert_eq!(handoff.get_str("draft"), Some("second draft"));
        assert_eq!(handoff.get_str("feedback"), Some("good"));
        assert_eq!(handoff.get_str("output"), Some("published"));
    }

    #[tokio::test]
    async fn loop_guard_exhaustion_is_an_unexpected_stop() {
        let writer = Arc::new(ScriptedAgent::repeating("writer", r#"{"draft": "d"}"#, 5));
        let critic = Arc::new(ScriptedAgent::repeating("critic", r#"{"ok": false}"#, 5));

        let graph = GraphDefinition::from_toml(REVIEW_LOOP).unwrap().build().unwrap();
        let outcome = graph
            .run(
                HandoffContext::new(),
                RunOptions::new().with_agent(writer).with_agent(critic),
            )
            .await;

        assert_eq!(outcome.state, RunState::Faulted);
        assert_eq!(outcome.node.as_deref(), Some("review"));
        assert_eq!(outcome.invocations, 6);
        assert!(matches!(outcome.error, Some(StrandError::UnexpectedStop { .. })));
    }

    #[tokio::test]
    async fn repair_settings_reach_prompt_nodes() {
        let writer = Arc::new(ScriptedAgent::repeating("writer", "just prose", 5));
        let writer_calls = writer.calls();
        let critic = Arc::new(ScriptedAgent::new("critic", vec![]));
        let repair = RepairConfig {
            max_retries: 0,
            heuristic_repair: false,
        };

        let graph = GraphDefinition::from_toml(REVIEW_LOOP)
            .unwrap()
            .build_with(&repair, &FanOutConfig::default())
            .unwrap();
        let outcome = graph
            .run(
                HandoffContext::new(),
                RunOptions::new().with_agent(writer).with_agent(critic),
            )
            .await;

        assert_eq!(outcome.state, RunState::Faulted);
        assert_eq!(outcome.node.as_deref(), Some("draft"));
        assert_eq!(writer_calls.load(Ordering::SeqCst), 1);
        match outcome.error {
            Some(StrandError::NodeInvocation { node, source }) => {
                assert_eq!(node, "draft");
                assert!(matches!(
                    *source,
                    StrandError::StructuredOutputParse { attempts: 1, .. }
                ));
            }
            other => panic!("expected NodeInvocation, got {:?}", other),
        }
    }

    #[test]
    fn for_each_parses_from_toml() {
        let def = GraphDefinition::from_toml(
            "entry = \"t\"\n[[nodes]]\nid = \"t\"\nfor_each = \"chapters\"\n",
        )
        .unwrap();
        assert_eq!(def.nodes[0].for_each.as_deref(), Some("chapters"));
    }
}
