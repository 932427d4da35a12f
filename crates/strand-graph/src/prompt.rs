use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use strand_core::config::{FanOutConfig, RepairConfig};
use strand_core::error::Result;
use strand_core::traits::Agent;
use strand_core::types::AgentRequest;

use crate::context::ProcessContext;
use crate::fan_out::FanOut;
use crate::handoff::HandoffContext;
use crate::node::Runnable;
use crate::repair::RepairLoop;

/// Agent used by prompt nodes that don't name one.
pub const DEFAULT_AGENT: &str = "default";

/// Handoff key each item is rendered under when a node fans out.
pub const ITEM_KEY: &str = "item";

fn default_task() -> String {
    "Complete the task.".to_string()
}

/// A node that renders a prompt from handoff data, asks an agent, and
/// stores the response back into the handoff.
///
/// With `output_keys` set, the response must be a JSON object. It goes
/// through a [`RepairLoop`] and the node fails with `StructuredOutputParse`
/// once the attempts run out. With `for_each` set, the prompt is asked once
/// per element of that handoff array and every output key collects an array
/// of per-item values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptNode {
    pub id: String,
    /// Task text appended after the context block.
    #[serde(default = "default_task")]
    pub prompt: String,
    #[serde(default)]
    pub instructions: Option<String>,
    /// Registered agent to ask; [`DEFAULT_AGENT`] when unset.
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub input_keys: Vec<String>,
    #[serde(default)]
    pub output_keys: Vec<String>,
    /// Handoff key holding an array to fan out over.
    #[serde(default)]
    pub for_each: Option<String>,
    /// Signal run completion after this node responds.
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub dead_end: bool,
    #[serde(default)]
    pub allow_dead_end: bool,
    #[serde(skip)]
    repair: RepairConfig,
    #[serde(skip)]
    fan_out: FanOutConfig,
}

impl PromptNode {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            instructions: None,
            agent: None,
            model: None,
            input_keys: vec![],
            output_keys: vec![],
            for_each: None,
            complete: false,
            dead_end: false,
            allow_dead_end: false,
            repair: RepairConfig::default(),
            fan_out: FanOutConfig::default(),
        }
    }

    pub fn with_inputs(mut self, keys: Vec<String>) -> Self {
        self.input_keys = keys;
        self
    }

    pub fn with_outputs(mut self, keys: Vec<String>) -> Self {
        self.output_keys = keys;
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn for_each(mut self, key: impl Into<String>) -> Self {
        self.for_each = Some(key.into());
        self
    }

    pub fn with_repair(mut self, repair: RepairConfig) -> Self {
        self.repair = repair;
        self
    }

    pub fn with_fan_out(mut self, fan_out: FanOutConfig) -> Self {
        self.fan_out = fan_out;
        self
    }

    pub fn completes(mut self) -> Self {
        self.complete = true;
        self
    }

    pub fn agent_name(&self) -> &str {
        self.agent.as_deref().unwrap_or(DEFAULT_AGENT)
    }

    /// Key of the per-node visit counter kept in the handoff.
    pub fn visits_key(&self) -> String {
        format!("{}_visits", self.id)
    }

    /// JSON schema sent with the request when the node expects fields.
    pub fn output_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .output_keys
            .iter()
            .map(|k| (k.clone(), json!({})))
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": self.output_keys,
        })
    }

    fn request(&self, handoff: &HandoffContext, input_keys: &[String]) -> AgentRequest {
        let mut request = AgentRequest::new(handoff.render_prompt(input_keys, &self.prompt));
        request.instructions = self.instructions.clone();
        request.model = self.model.clone();
        if !self.output_keys.is_empty() {
            request.output_schema = Some(self.output_schema());
        }
        request
    }

    /// One question to the agent: the raw response and, when output keys
    /// are set, the object it parsed into.
    async fn ask(
        &self,
        ctx: &ProcessContext,
        agent: &dyn Agent,
        request: AgentRequest,
    ) -> Result<(String, Option<Map<String, Value>>)> {
        if self.output_keys.is_empty() {
            let response = ctx.invoke_agent(agent, request).await?;
            return Ok((response.text(), None));
        }
        let parsed = RepairLoop::from_config(&self.repair)
            .run::<Map<String, Value>>(ctx, agent, request)
            .await?;
        if parsed.repaired || parsed.attempts > 1 {
            debug!(node = %self.id, attempts = parsed.attempts, repaired = parsed.repaired, "Prompt output repaired");
        }
        Ok((parsed.raw, Some(parsed.value)))
    }

    async fn ask_each(
        &self,
        ctx: &ProcessContext,
        agent: Arc<dyn Agent>,
        handoff: &mut HandoffContext,
        key: &str,
    ) -> Result<()> {
        let items = match handoff.get(key) {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None => vec![],
            Some(other) => vec![other.clone()],
        };
        let mut input_keys = self.input_keys.clone();
        input_keys.push(ITEM_KEY.to_string());

        let base = &*handoff;
        let results = FanOut::from_config(&self.fan_out)
            .with_label(ITEM_KEY)
            .run(ctx, items, |child, item| {
                let mut scoped = base.clone();
                scoped.set(ITEM_KEY, item);
                let request = self.request(&scoped, &input_keys);
                let agent = agent.clone();
                async move { self.ask(&child, agent.as_ref(), request).await }
            })
            .await?;

        let raw: Vec<Value> = results
            .iter()
            .map(|(text, _)| Value::String(text.clone()))
            .collect();
        handoff.record_output(Value::Array(raw));
        for key in &self.output_keys {
            let column = results
                .iter()
                .map(|(_, fields)| {
                    fields
                        .as_ref()
                        .and_then(|f| f.get(key).cloned())
                        .unwrap_or(Value::Null)
                })
                .collect();
            handoff.set(key.clone(), Value::Array(column));
        }
        Ok(())
    }
}

impl Runnable for PromptNode {
    type Input = HandoffContext;
    type Output = HandoffContext;

    fn invoke<'a>(
        &'a self,
        ctx: &'a ProcessContext,
        input: HandoffContext,
    ) -> BoxFuture<'a, Result<HandoffContext>> {
        Box::pin(async move {
            let mut handoff = input;
            let visits = handoff.increment(&self.visits_key());
            debug!(node = %self.id, agent = %self.agent_name(), visits, "Prompt node invoked");

            let agent = ctx.agent(self.agent_name()).await?;
            match self.for_each {
                Some(ref key) => self.ask_each(ctx, agent, &mut handoff, key).await?,
                None => {
                    let request = self.request(&handoff, &self.input_keys);
                    let (raw, fields) = self.ask(ctx, agent.as_ref(), request).await?;
                    handoff.record_output(Value::String(raw));
                    if let Some(fields) = fields {
                        handoff.ingest_fields(&self.output_keys, &fields);
                    }
                }
            }

            if self.complete {
                ctx.complete_successfully();
            }
            Ok(handoff)
        })
    }
}
